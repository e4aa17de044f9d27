//! Turning Kubernetes watches into [`ResourceEvent`]s.
//!
//! `kube::runtime::watcher` reports every object as an "apply", whether it
//! is new or changed, and replays the full list after each reconnect.
//! [`ChangeTracker`] remembers the resource version of every object it has
//! seen so it can tell first sightings (Added) from changes (Modified) and
//! drop unchanged objects replayed by a relist.

use crate::context::InstanceIdentity;
use crate::crd::Cluster;
use crate::event::{ChangeType, ResourceEvent};
use crate::reconciler::{CA_SECRET_SUFFIX, REPLICATION_SECRET_SUFFIX, SERVER_SECRET_SUFFIX};
use futures::stream::{self, BoxStream};
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;

/// Classifies watcher events into change types.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    seen: HashMap<String, String>,
    relisted: Option<HashSet<String>>,
}

impl ChangeTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of objects currently tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no objects are tracked.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Classify one watcher event, returning the object and what happened
    /// to it, or `None` when there is nothing to report.
    pub fn classify<K: Resource>(&mut self, event: watcher::Event<K>) -> Option<(ChangeType, K)> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                None
            }
            watcher::Event::InitApply(object) => {
                let key = key_of(&object);
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(key);
                }
                self.applied(object)
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    let before = self.seen.len();
                    self.seen.retain(|key, _| relisted.contains(key));
                    let vanished = before - self.seen.len();
                    if vanished > 0 {
                        tracing::info!(vanished, "Objects deleted while the watch was down");
                    }
                }
                None
            }
            watcher::Event::Apply(object) => self.applied(object),
            watcher::Event::Delete(object) => {
                self.seen.remove(&key_of(&object));
                Some((ChangeType::Deleted, object))
            }
        }
    }

    fn applied<K: Resource>(&mut self, object: K) -> Option<(ChangeType, K)> {
        let key = key_of(&object);
        let version = object.meta().resource_version.clone().unwrap_or_default();

        match self.seen.insert(key, version.clone()) {
            None => Some((ChangeType::Added, object)),
            Some(previous) if previous == version && !version.is_empty() => None,
            Some(_) => Some((ChangeType::Modified, object)),
        }
    }
}

fn key_of<K: Resource>(object: &K) -> String {
    let meta = object.meta();
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}

/// Watch `api`, yielding classified events for objects accepted by `filter`.
///
/// Watch errors are logged and retried with the watcher's default backoff.
pub fn resource_events<K, F>(
    api: Api<K>,
    config: Config,
    filter: F,
) -> BoxStream<'static, ResourceEvent>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + 'static,
    F: Fn(&K) -> bool + Send + 'static,
{
    let mut tracker = ChangeTracker::new();
    watcher(api, config)
        .default_backoff()
        .filter_map(move |event| {
            let classified = match event {
                Ok(event) => tracker.classify(event),
                Err(e) => {
                    tracing::warn!(kind = %K::kind(&()), error = %e, "Watch error");
                    None
                }
            };
            let event = classified
                .filter(|(_, object)| filter(object))
                .and_then(|(change, object)| {
                    ResourceEvent::from_object(change, &object)
                        .inspect_err(|e| {
                            tracing::warn!(
                                name = %object.name_any(),
                                error = %e,
                                "Dropping event that cannot be serialized"
                            );
                        })
                        .ok()
                });
            future::ready(event)
        })
        .boxed()
}

/// Names of the secrets carrying certificate material for `cluster_name`.
pub fn certificate_secret_names(cluster_name: &str) -> HashSet<String> {
    [SERVER_SECRET_SUFFIX, REPLICATION_SECRET_SUFFIX, CA_SECRET_SUFFIX]
        .iter()
        .map(|suffix| format!("{cluster_name}{suffix}"))
        .collect()
}

/// Every event relevant to this instance, merged into one stream.
///
/// Covers the `Cluster` resource, its ConfigMap, and its certificate
/// secrets. The stream only ends if every underlying watch ends.
pub fn instance_events(client: Client, identity: &InstanceIdentity) -> BoxStream<'static, ResourceEvent> {
    let by_name = Config::default().fields(&format!("metadata.name={}", identity.cluster_name));

    let clusters: Api<Cluster> = Api::namespaced(client.clone(), &identity.namespace);
    let configmaps: Api<ConfigMap> = Api::namespaced(client.clone(), &identity.namespace);
    let secrets: Api<Secret> = Api::namespaced(client, &identity.namespace);

    let secret_names = certificate_secret_names(&identity.cluster_name);

    stream::select_all([
        resource_events(clusters, by_name.clone(), |_| true),
        resource_events(configmaps, by_name, |_| true),
        resource_events(secrets, Config::default(), move |secret: &Secret| {
            secret_names.contains(&secret.name_any())
        }),
    ])
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn configmap(name: &str, version: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn change(result: Option<(ChangeType, ConfigMap)>) -> Option<ChangeType> {
        result.map(|(change, _)| change)
    }

    #[test]
    fn first_sighting_is_added_then_modified() {
        let mut tracker = ChangeTracker::new();

        assert_eq!(
            change(tracker.classify(watcher::Event::Apply(configmap("db", "1")))),
            Some(ChangeType::Added)
        );
        assert_eq!(
            change(tracker.classify(watcher::Event::Apply(configmap("db", "2")))),
            Some(ChangeType::Modified)
        );
        assert_eq!(
            change(tracker.classify(watcher::Event::Delete(configmap("db", "2")))),
            Some(ChangeType::Deleted)
        );
        assert!(tracker.is_empty());
    }

    #[test]
    fn initial_list_counts_as_added() {
        let mut tracker = ChangeTracker::new();

        assert_eq!(change(tracker.classify(watcher::Event::Init)), None);
        assert_eq!(
            change(tracker.classify(watcher::Event::InitApply(configmap("db", "5")))),
            Some(ChangeType::Added)
        );
        assert_eq!(change(tracker.classify(watcher::Event::InitDone)), None);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn relist_skips_unchanged_and_reports_changed() {
        let mut tracker = ChangeTracker::new();
        tracker.classify(watcher::Event::Apply(configmap("db", "1")));
        tracker.classify(watcher::Event::Apply(configmap("other", "1")));

        tracker.classify(watcher::Event::<ConfigMap>::Init);
        assert_eq!(
            change(tracker.classify(watcher::Event::InitApply(configmap("db", "1")))),
            None
        );
        assert_eq!(
            change(tracker.classify(watcher::Event::InitApply(configmap("db", "3")))),
            Some(ChangeType::Modified)
        );
        tracker.classify(watcher::Event::<ConfigMap>::InitDone);

        // "other" disappeared during the gap and is forgotten
        assert_eq!(tracker.len(), 1);
        assert_eq!(
            change(tracker.classify(watcher::Event::Apply(configmap("other", "9")))),
            Some(ChangeType::Added)
        );
    }

    #[test]
    fn secret_names_follow_cluster() {
        let names = certificate_secret_names("db");
        assert!(names.contains("db-server"));
        assert!(names.contains("db-replication"));
        assert!(names.contains("db-ca"));
        assert_eq!(names.len(), 3);
    }
}
