//! Materializing configuration from the cluster's ConfigMap.
//!
//! Every data entry is a PostgreSQL parameter, except `pg_hba`, which holds
//! host-based authentication rules written verbatim to `pg_hba.conf`.

use crate::context::InstanceContext;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{ChangeType, ResourceEvent};
use k8s_openapi::api::core::v1::ConfigMap;
use once_cell::sync::Lazy;
use pgkeeper_engine::OWNER_ONLY;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

/// ConfigMap key carrying host-based authentication rules.
pub const HBA_KEY: &str = "pg_hba";

macro_rules! static_regex {
    ($pattern:expr, $name:expr) => {
        Regex::new($pattern).unwrap_or_else(|_| {
            panic!(
                "Static regex '{}' failed to compile - this is a bug in the instance manager",
                $name
            )
        })
    };
}

/// Valid parameter names, including dotted extension parameters
/// (`auto_explain.log_min_duration`).
static PARAMETER_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    static_regex!(
        r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$",
        "PARAMETER_NAME_PATTERN"
    )
});

/// What to do after a configuration change has been reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Nothing is pending.
    None,
    /// Restart the instance now.
    RestartNow,
    /// A restart is needed but this primary must wait for a switchover.
    Defer,
}

/// Decide how to apply settings that only take effect after a restart.
///
/// A primary with replicas is never restarted in place: that would cause
/// downtime that a switchover avoids.
pub fn decide_restart(pending_restart: bool, is_primary: bool, instances: i32) -> RestartDecision {
    match (pending_restart, is_primary) {
        (false, _) => RestartDecision::None,
        (true, false) => RestartDecision::RestartNow,
        (true, true) if instances <= 1 => RestartDecision::RestartNow,
        (true, true) => RestartDecision::Defer,
    }
}

/// Render parameters in `postgresql.conf` syntax, one per line, sorted.
pub fn render_configuration(parameters: &BTreeMap<String, String>) -> InstanceResult<String> {
    let mut rendered = String::from("# Generated by the pgkeeper instance manager. Do not edit.\n");
    for (key, value) in parameters {
        if !PARAMETER_NAME_PATTERN.is_match(key) {
            return Err(InstanceError::InvalidConfiguration {
                key: key.clone(),
                reason: "not a valid parameter name".to_string(),
            });
        }
        if value.contains(['\n', '\r']) {
            return Err(InstanceError::InvalidConfiguration {
                key: key.clone(),
                reason: "values cannot span lines".to_string(),
            });
        }
        let escaped = value.replace('\\', "\\\\").replace('\'', "''");
        // Writing into a String cannot fail
        let _ = writeln!(rendered, "{key} = '{escaped}'");
    }
    Ok(rendered)
}

/// What a ConfigMap event led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOutcome {
    /// The event was an addition; configuration is written at bootstrap.
    Ignored,
    /// Configuration was written and reloaded.
    Applied(RestartDecision),
}

/// Writes configuration from ConfigMap events.
pub struct ConfigMaterializer<'a> {
    ctx: &'a InstanceContext,
}

impl<'a> ConfigMaterializer<'a> {
    /// Create a materializer bound to `ctx`.
    pub fn new(ctx: &'a InstanceContext) -> Self {
        Self { ctx }
    }

    /// Handle one ConfigMap event.
    pub async fn reconcile(&self, event: &ResourceEvent) -> InstanceResult<ConfigOutcome> {
        if event.change == ChangeType::Added {
            return Ok(ConfigOutcome::Ignored);
        }

        let configmap: ConfigMap = event.decode("configmap")?;
        let mut parameters = configmap.data.unwrap_or_default();
        let hba = parameters.remove(HBA_KEY);

        let rendered = render_configuration(&parameters)?;
        let hba = hba.map(|mut rules| {
            if !rules.ends_with('\n') {
                rules.push('\n');
            }
            rules
        });
        self.write(&rendered, hba.as_deref())?;

        let instance = &self.ctx.instance;
        instance
            .reload()
            .await
            .map_err(|e| InstanceError::engine("reloading configuration", e))?;

        let status = instance
            .status()
            .await
            .map_err(|e| InstanceError::engine("reading instance status", e))?;
        let cluster = self.ctx.status_store.get().await?;

        let decision = decide_restart(status.pending_restart, status.is_primary, cluster.instances());
        tracing::info!(
            parameters = parameters.len(),
            pending_restart = status.pending_restart,
            is_primary = status.is_primary,
            instances = cluster.instances(),
            decision = ?decision,
            "Configuration reloaded"
        );

        match decision {
            RestartDecision::None => {}
            RestartDecision::RestartNow => {
                tracing::info!("Restarting instance to apply configuration");
                instance
                    .shutdown()
                    .await
                    .map_err(|e| InstanceError::engine("restarting after configuration change", e))?;
            }
            RestartDecision::Defer => {
                tracing::info!(
                    "Primary needs a restart, waiting for a switchover to apply configuration"
                );
            }
        }

        Ok(ConfigOutcome::Applied(decision))
    }

    /// Replace the parameters file, and the HBA rules when present, together.
    fn write(&self, parameters: &str, hba: Option<&str>) -> InstanceResult<()> {
        let config = &self.ctx.config;
        let custom_conf = config.custom_conf_path();
        let hba_conf = config.hba_conf_path();

        let mut files: Vec<(&Path, &[u8])> = vec![(custom_conf.as_path(), parameters.as_bytes())];
        if let Some(rules) = hba {
            files.push((hba_conf.as_path(), rules.as_bytes()));
        }

        self.ctx
            .files
            .write_together(&files, OWNER_ONLY)
            .map_err(|source| InstanceError::Io {
                what: "configuration",
                path: custom_conf.display().to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ResourceKind;
    use crate::testing::{self, TestHarness};
    use pgkeeper_engine::MemoryFiles;
    use pgkeeper_engine::testing::{InstanceCall, MockInstance};
    use serde_json::json;

    fn configmap_event(change: ChangeType, data: serde_json::Value) -> ResourceEvent {
        ResourceEvent::new(
            ResourceKind::ConfigMap,
            change,
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": { "name": "db", "namespace": "default" },
                "data": data,
            }),
        )
    }

    fn params(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn restart_decision_table() {
        for primary in [false, true] {
            for instances in [1, 3] {
                assert_eq!(
                    decide_restart(false, primary, instances),
                    RestartDecision::None
                );
            }
        }
        assert_eq!(decide_restart(true, false, 1), RestartDecision::RestartNow);
        assert_eq!(decide_restart(true, false, 3), RestartDecision::RestartNow);
        assert_eq!(decide_restart(true, true, 1), RestartDecision::RestartNow);
        assert_eq!(decide_restart(true, true, 3), RestartDecision::Defer);
    }

    #[test]
    fn rendering_quotes_values() {
        let rendered = render_configuration(&params(&[
            ("shared_buffers", "128MB"),
            ("log_line_prefix", "it's %m"),
            ("archive_command", "copy C:\\wal"),
        ]))
        .unwrap();

        let lines: Vec<&str> = rendered.lines().skip(1).collect();
        assert_eq!(
            lines,
            vec![
                "archive_command = 'copy C:\\\\wal'",
                "log_line_prefix = 'it''s %m'",
                "shared_buffers = '128MB'",
            ]
        );
    }

    #[test]
    fn rendering_rejects_injection() {
        let err = render_configuration(&params(&[("work_mem", "4MB'\nfsync = 'off")])).unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfiguration { .. }));

        let err = render_configuration(&params(&[("fsync = off #", "x")])).unwrap_err();
        assert!(matches!(err, InstanceError::InvalidConfiguration { .. }));

        assert!(render_configuration(&params(&[("auto_explain.log_min_duration", "10s")])).is_ok());
    }

    #[tokio::test]
    async fn added_is_a_no_op() {
        let harness = TestHarness::new(MockInstance::replica());
        let ctx = harness.context();

        let outcome = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(ChangeType::Added, json!({ "work_mem": "4MB" })))
            .await
            .unwrap();

        assert_eq!(outcome, ConfigOutcome::Ignored);
        assert!(harness.files.is_empty());
        assert!(harness.instance.calls().is_empty());
    }

    #[tokio::test]
    async fn modified_writes_and_reloads() {
        let harness = TestHarness::new(MockInstance::replica());
        let ctx = harness.context();

        let outcome = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(
                ChangeType::Modified,
                json!({ "work_mem": "4MB", "pg_hba": "host all all 0.0.0.0/0 md5" }),
            ))
            .await
            .unwrap();

        assert_eq!(outcome, ConfigOutcome::Applied(RestartDecision::None));
        let conf = harness.files.read(&ctx.config.custom_conf_path()).unwrap();
        let conf = String::from_utf8(conf).unwrap();
        assert!(conf.contains("work_mem = '4MB'"));
        assert!(!conf.contains("pg_hba"));
        assert_eq!(
            harness.files.read(&ctx.config.hba_conf_path()).unwrap(),
            b"host all all 0.0.0.0/0 md5\n"
        );
        assert_eq!(harness.instance.reloads(), 1);
        assert_eq!(harness.instance.shutdowns(), 0);
    }

    #[tokio::test]
    async fn pending_replica_restarts_after_reload() {
        let harness = TestHarness::new(MockInstance::replica().with_pending_restart(true))
            .with_cluster(3, Some("db-2"));
        let ctx = harness.context();

        let outcome = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(ChangeType::Modified, json!({ "shared_buffers": "1GB" })))
            .await
            .unwrap();

        assert_eq!(outcome, ConfigOutcome::Applied(RestartDecision::RestartNow));
        let calls = harness.instance.calls();
        let reload = calls.iter().position(|c| *c == InstanceCall::Reload).unwrap();
        let shutdown = calls.iter().position(|c| *c == InstanceCall::Shutdown).unwrap();
        assert!(reload < shutdown);
    }

    #[tokio::test]
    async fn pending_primary_with_replicas_defers() {
        let harness = TestHarness::new(MockInstance::primary().with_pending_restart(true))
            .with_cluster(3, Some("db-1"));
        let ctx = harness.context();

        let outcome = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(ChangeType::Modified, json!({ "shared_buffers": "1GB" })))
            .await
            .unwrap();

        assert_eq!(outcome, ConfigOutcome::Applied(RestartDecision::Defer));
        assert_eq!(harness.instance.shutdowns(), 0);
        assert_eq!(harness.store.gets(), 1);
    }

    #[tokio::test]
    async fn invalid_entry_writes_nothing() {
        let harness = TestHarness::new(MockInstance::replica());
        let ctx = harness.context();

        let err = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(
                ChangeType::Modified,
                json!({ "work_mem": "1MB\nfsync = off" }),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, InstanceError::InvalidConfiguration { .. }));
        assert!(harness.files.is_empty());
        assert_eq!(harness.instance.reloads(), 0);
    }

    #[tokio::test]
    async fn failed_hba_write_keeps_parameters_unchanged() {
        let hba_conf = testing::default_config().hba_conf_path();
        let harness = TestHarness::new(MockInstance::replica())
            .with_files(MemoryFiles::new().failing_on(hba_conf));
        let ctx = harness.context();

        let err = ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(
                ChangeType::Modified,
                json!({ "work_mem": "4MB", "pg_hba": "host all all 0.0.0.0/0 md5" }),
            ))
            .await
            .unwrap_err();

        assert!(matches!(err, InstanceError::Io { what: "configuration", .. }));
        assert!(harness.files.read(&ctx.config.custom_conf_path()).is_none());
        assert!(harness.files.is_empty());
        assert_eq!(harness.instance.reloads(), 0);
    }

    #[tokio::test]
    async fn parameters_without_hba_leave_rules_alone() {
        let hba_conf = testing::default_config().hba_conf_path();
        let harness = TestHarness::new(MockInstance::replica())
            .with_files(MemoryFiles::new().failing_on(hba_conf));
        let ctx = harness.context();

        ConfigMaterializer::new(&ctx)
            .reconcile(&configmap_event(ChangeType::Modified, json!({ "work_mem": "4MB" })))
            .await
            .unwrap();

        assert_eq!(harness.files.paths(), vec![ctx.config.custom_conf_path()]);
        assert_eq!(harness.instance.reloads(), 1);
    }
}
