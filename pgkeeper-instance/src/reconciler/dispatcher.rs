//! Routing watch events to their handlers.

use super::cluster::{ClusterAction, reconcile_cluster};
use super::configmap::{ConfigMaterializer, ConfigOutcome};
use super::secret::{SecretMaterializer, SecretOutcome};
use crate::context::InstanceContext;
use crate::error::InstanceResult;
use crate::event::{ResourceEvent, ResourceKind};
use futures::{Stream, StreamExt};
use tracing::Instrument;

/// What handling one event led to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Handled by the cluster reconciler.
    Cluster(ClusterAction),
    /// Handled by the config materializer.
    ConfigMap(ConfigOutcome),
    /// Handled by the secret materializer.
    Secret(SecretOutcome),
    /// No handler for this kind.
    Ignored(String),
}

/// Hands events to their handler, one at a time.
pub struct Dispatcher {
    ctx: InstanceContext,
    handled: u64,
}

impl Dispatcher {
    /// Create a dispatcher over `ctx`.
    pub fn new(ctx: InstanceContext) -> Self {
        Self { ctx, handled: 0 }
    }

    /// Context handed to every handler.
    pub fn context(&self) -> &InstanceContext {
        &self.ctx
    }

    /// Number of events dispatched so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Handle one event.
    ///
    /// Handler errors are returned as they are; the event is not retried.
    pub async fn dispatch(&mut self, event: ResourceEvent) -> InstanceResult<DispatchOutcome> {
        self.handled += 1;
        let span = tracing::info_span!(
            "dispatch",
            seq = self.handled,
            kind = %event.kind,
            change = %event.change,
            name = event.name().unwrap_or_default(),
        );
        let ctx = &self.ctx;

        async move {
            tracing::debug!("Received event");
            match &event.kind {
                ResourceKind::Cluster => reconcile_cluster(ctx, &event)
                    .await
                    .map(DispatchOutcome::Cluster),
                ResourceKind::ConfigMap => ConfigMaterializer::new(ctx)
                    .reconcile(&event)
                    .await
                    .map(DispatchOutcome::ConfigMap),
                ResourceKind::Secret => SecretMaterializer::new(ctx)
                    .reconcile(&event)
                    .await
                    .map(DispatchOutcome::Secret),
                ResourceKind::Other(kind) => {
                    tracing::info!(kind = %kind, "Unknown event kind, ignoring");
                    Ok(DispatchOutcome::Ignored(kind.clone()))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Consume `events` one at a time until the stream ends, the context is
    /// cancelled, or a handler returns a fatal error.
    ///
    /// Non-fatal handler errors are logged and the loop moves on to the
    /// next event.
    pub async fn run<S>(&mut self, mut events: S) -> InstanceResult<()>
    where
        S: Stream<Item = ResourceEvent> + Unpin,
    {
        let cancel = self.ctx.cancel.clone();
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(handled = self.handled, "Shutdown requested, stopping event loop");
                    return Ok(());
                }
                event = events.next() => event,
            };

            let Some(event) = event else {
                tracing::warn!(handled = self.handled, "Event stream ended");
                return Ok(());
            };

            match self.dispatch(event).await {
                Ok(outcome) => tracing::debug!(outcome = ?outcome, "Event handled"),
                Err(err) if err.is_fatal() => {
                    tracing::error!(error = %err, "Fatal error, stopping event loop");
                    return Err(err);
                }
                Err(err) => tracing::error!(error = %err, "Error handling event"),
            }
        }
    }
}
