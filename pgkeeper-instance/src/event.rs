//! Orchestration events consumed by the reconciler.

use crate::error::{InstanceError, InstanceResult};
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// Kind of the resource an event refers to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A `Cluster` custom resource.
    Cluster,
    /// A `ConfigMap` carrying configuration parameters.
    ConfigMap,
    /// A `Secret` carrying certificate material.
    Secret,
    /// Anything else; carries the kind name for logging.
    Other(String),
}

impl ResourceKind {
    /// Map a Kubernetes kind name to a resource kind.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "Cluster" => ResourceKind::Cluster,
            "ConfigMap" => ResourceKind::ConfigMap,
            "Secret" => ResourceKind::Secret,
            other => ResourceKind::Other(other.to_string()),
        }
    }

    /// The Kubernetes kind name.
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::Cluster => "Cluster",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Other(kind) => kind,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// First time the resource was seen.
    Added,
    /// The resource changed after it was first seen.
    Modified,
    /// The resource was removed.
    Deleted,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeType::Added => "ADDED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
        };
        f.write_str(name)
    }
}

/// One event from the watch stream.
///
/// The payload is kept as JSON so every handler decodes exactly the shape
/// it needs and malformed payloads surface as decode errors in the handler
/// rather than in the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceEvent {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Change type.
    pub change: ChangeType,
    /// Snapshot of the resource.
    pub payload: serde_json::Value,
}

impl ResourceEvent {
    /// Build an event from a raw payload.
    pub fn new(kind: ResourceKind, change: ChangeType, payload: serde_json::Value) -> Self {
        Self {
            kind,
            change,
            payload,
        }
    }

    /// Build an event from a typed Kubernetes object.
    pub fn from_object<K>(change: ChangeType, object: &K) -> InstanceResult<Self>
    where
        K: Resource<DynamicType = ()> + Serialize,
    {
        let mut payload = serde_json::to_value(object)?;
        // Typed objects from the API client do not always carry TypeMeta
        if let Some(map) = payload.as_object_mut() {
            map.entry("apiVersion")
                .or_insert_with(|| K::api_version(&()).into_owned().into());
            map.entry("kind")
                .or_insert_with(|| K::kind(&()).into_owned().into());
        }
        Ok(Self::new(
            ResourceKind::from_kind(&K::kind(&())),
            change,
            payload,
        ))
    }

    /// `metadata.name` of the payload, if present.
    pub fn name(&self) -> Option<&str> {
        self.payload.pointer("/metadata/name")?.as_str()
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self, kind: &'static str) -> InstanceResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|source| InstanceError::Decode { kind, source })
    }
}
