//! Materializing TLS certificates from cluster secrets.
//!
//! Three secrets carry certificate material for an instance, told apart by
//! name suffix:
//!
//! - `<cluster>-server`: server certificate and key
//! - `<cluster>-replication`: client certificate and key of the
//!   streaming replication role
//! - `<cluster>-ca`: certificate authority bundle
//!
//! Pairs are decoded in full and then written together, so neither a
//! malformed key nor a failed write leaves a new certificate next to a
//! stale key.

use crate::context::InstanceContext;
use crate::error::{InstanceError, InstanceResult};
use crate::event::{ChangeType, ResourceEvent};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use kube::api::ObjectMeta;
use pgkeeper_engine::OWNER_ONLY;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Name suffix of the server certificate secret.
pub const SERVER_SECRET_SUFFIX: &str = "-server";
/// Name suffix of the replication client certificate secret.
pub const REPLICATION_SECRET_SUFFIX: &str = "-replication";
/// Name suffix of the certificate authority secret.
pub const CA_SECRET_SUFFIX: &str = "-ca";

/// Secret key holding a certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key holding a private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// Secret key holding the CA bundle.
pub const CA_CERT_KEY: &str = "ca.crt";

/// Which certificate material a secret carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateKind {
    /// Server certificate and key.
    Server,
    /// Streaming replication client certificate and key.
    Replication,
    /// Certificate authority.
    Ca,
}

impl CertificateKind {
    /// Classify a secret by name suffix.
    pub fn classify(secret_name: &str) -> Option<Self> {
        if secret_name.ends_with(SERVER_SECRET_SUFFIX) {
            Some(CertificateKind::Server)
        } else if secret_name.ends_with(REPLICATION_SECRET_SUFFIX) {
            Some(CertificateKind::Replication)
        } else if secret_name.ends_with(CA_SECRET_SUFFIX) {
            Some(CertificateKind::Ca)
        } else {
            None
        }
    }
}

/// What a secret event led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOutcome {
    /// The event was an addition; certificates are written at bootstrap.
    Ignored,
    /// The secret does not carry certificate material for this instance.
    Skipped,
    /// Material of the given kind was written and a reload requested.
    Refreshed(CertificateKind),
}

/// Raw secret shape; `data` values stay base64 so decoding is explicit.
#[derive(Debug, Deserialize)]
struct SecretPayload {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// Writes certificate material from secret events.
pub struct SecretMaterializer<'a> {
    ctx: &'a InstanceContext,
}

impl<'a> SecretMaterializer<'a> {
    /// Create a materializer bound to `ctx`.
    pub fn new(ctx: &'a InstanceContext) -> Self {
        Self { ctx }
    }

    /// Handle one secret event.
    pub async fn reconcile(&self, event: &ResourceEvent) -> InstanceResult<SecretOutcome> {
        if event.change == ChangeType::Added {
            return Ok(SecretOutcome::Ignored);
        }

        let secret: SecretPayload = event.decode("secret")?;
        let name = secret.metadata.name.as_deref().ok_or(InstanceError::MissingField {
            kind: "Secret",
            field: "metadata.name",
        })?;

        let Some(kind) = CertificateKind::classify(name) else {
            tracing::debug!(secret = %name, "Secret carries no certificate material, skipping");
            return Ok(SecretOutcome::Skipped);
        };

        let certificates = &self.ctx.config.certificates;
        match kind {
            CertificateKind::Server => self.refresh_pair(
                name,
                &secret.data,
                &certificates.server_certificate,
                &certificates.server_key,
            )?,
            CertificateKind::Replication => self.refresh_pair(
                name,
                &secret.data,
                &certificates.replication_certificate,
                &certificates.replication_key,
            )?,
            CertificateKind::Ca => {
                let ca = decode_entry(name, &secret.data, CA_CERT_KEY, "CA certificate")?;
                self.write(&certificates.ca_certificate, &ca, "CA certificate")?;
            }
        }

        tracing::info!(secret = %name, kind = ?kind, "Refreshed certificate material, reloading");
        self.ctx
            .instance
            .reload()
            .await
            .map_err(|e| InstanceError::engine("reloading after certificate change", e))?;

        Ok(SecretOutcome::Refreshed(kind))
    }

    fn refresh_pair(
        &self,
        secret: &str,
        data: &BTreeMap<String, String>,
        certificate_path: &Path,
        key_path: &Path,
    ) -> InstanceResult<()> {
        let certificate = decode_entry(secret, data, TLS_CERT_KEY, "certificate")?;
        let key = decode_entry(secret, data, TLS_PRIVATE_KEY_KEY, "private key")?;

        self.ctx
            .files
            .write_together(
                &[(certificate_path, certificate.as_slice()), (key_path, key.as_slice())],
                OWNER_ONLY,
            )
            .map_err(|source| InstanceError::Io {
                what: "certificate and private key",
                path: format!("{} and {}", certificate_path.display(), key_path.display()),
                source,
            })
    }

    fn write(&self, path: &Path, contents: &[u8], what: &'static str) -> InstanceResult<()> {
        self.ctx
            .files
            .write(path, contents, OWNER_ONLY)
            .map_err(|source| InstanceError::Io {
                what,
                path: path.display().to_string(),
                source,
            })
    }
}

fn decode_entry(
    secret: &str,
    data: &BTreeMap<String, String>,
    key: &'static str,
    field: &'static str,
) -> InstanceResult<Vec<u8>> {
    let encoded = data.get(key).ok_or(InstanceError::MissingField {
        kind: "Secret",
        field: key,
    })?;
    STANDARD
        .decode(encoded.trim())
        .map_err(|source| InstanceError::Base64 {
            field,
            secret: secret.to_string(),
            source,
        })
}
