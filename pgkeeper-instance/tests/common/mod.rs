//! Common test utilities for integration tests.

#![allow(dead_code)]

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use pgkeeper_instance::status::MemoryStatusStore;
use pgkeeper_instance::{ChangeType, ResourceEvent, ResourceKind};
use serde_json::json;

/// Event for the cluster as currently stored in `store`.
pub fn cluster_event(change: ChangeType, store: &MemoryStatusStore) -> ResourceEvent {
    ResourceEvent::from_object(change, &store.snapshot()).expect("cluster serializes")
}

/// Secret event with the given `data` entries (already base64).
pub fn secret_event(change: ChangeType, name: &str, data: serde_json::Value) -> ResourceEvent {
    ResourceEvent::new(
        ResourceKind::Secret,
        change,
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": name, "namespace": "default", "resourceVersion": "12" },
            "type": "kubernetes.io/tls",
            "data": data,
        }),
    )
}

/// ConfigMap event with the given `data` entries.
pub fn configmap_event(change: ChangeType, data: serde_json::Value) -> ResourceEvent {
    ResourceEvent::new(
        ResourceKind::ConfigMap,
        change,
        json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "db", "namespace": "default", "resourceVersion": "7" },
            "data": data,
        }),
    )
}

/// Base64 encode, the way the API server stores secret data.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// A PEM-looking certificate body.
pub fn pem(label: &str) -> Vec<u8> {
    format!("-----BEGIN {label}-----\nMIIB\n-----END {label}-----\n").into_bytes()
}
