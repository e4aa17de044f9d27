//! Instance manager configuration.

use crate::error::{InstanceError, InstanceResult};
use crate::retry::BackoffPolicy;
use pgkeeper_engine::PostgresSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default directory certificates are materialized into.
pub const DEFAULT_CERTIFICATES_DIR: &str = "/controller/certificates";

/// Name of the role used for streaming replication and `pg_rewind`.
pub const STREAMING_REPLICA_USER: &str = "streaming_replica";

/// Configuration for one instance manager process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Name of the pod this manager runs in.
    pub pod_name: String,

    /// Namespace of the cluster.
    pub namespace: String,

    /// Name of the `Cluster` resource this instance belongs to.
    pub cluster_name: String,

    /// PostgreSQL data directory.
    pub pgdata: PathBuf,

    /// Directory holding the server's Unix socket.
    pub socket_dir: PathBuf,

    /// Server port.
    pub port: u16,

    /// Path to the `pg_ctl` binary.
    pub pg_ctl: PathBuf,

    /// Role provisioned for streaming replication.
    pub replication_user: String,

    /// Where certificate material is written.
    pub certificates: CertificateLocations,

    /// Timing of waits and retries.
    pub timing: TimingConfig,
}

/// Destination paths for certificate material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateLocations {
    /// Server certificate.
    pub server_certificate: PathBuf,
    /// Server private key.
    pub server_key: PathBuf,
    /// Client certificate for the replication role.
    pub replication_certificate: PathBuf,
    /// Client key for the replication role.
    pub replication_key: PathBuf,
    /// Certificate authority bundle.
    pub ca_certificate: PathBuf,
}

impl CertificateLocations {
    /// Standard file names under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            server_certificate: dir.join("server.crt"),
            server_key: dir.join("server.key"),
            replication_certificate: dir.join("streaming_replica.crt"),
            replication_key: dir.join("streaming_replica.key"),
            ca_certificate: dir.join("ca.crt"),
        }
    }
}

impl Default for CertificateLocations {
    fn default() -> Self {
        Self::in_dir(DEFAULT_CERTIFICATES_DIR)
    }
}

/// Timing of waits and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Interval between replication-state polls during promotion.
    pub poll_interval_ms: u64,

    /// Upper bound on each promotion wait, unbounded when `None`.
    pub promotion_wait_max_secs: Option<u64>,

    /// Attempts at claiming the primary role before giving up.
    pub claim_attempts: u32,

    /// Delay between claim attempts.
    pub claim_interval_ms: u64,

    /// Interval between connection probes while the server starts.
    pub startup_probe_interval_ms: u64,

    /// Connection probes before giving up on server start.
    pub startup_probe_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            // Ten minutes is far longer than any healthy replay catch-up
            promotion_wait_max_secs: Some(600),
            claim_attempts: 5,
            claim_interval_ms: 10,
            startup_probe_interval_ms: 1_000,
            startup_probe_attempts: i32::MAX as u32,
        }
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            pod_name: String::new(),
            namespace: "default".to_string(),
            cluster_name: String::new(),
            pgdata: PathBuf::from("/var/lib/postgresql/data/pgdata"),
            socket_dir: PathBuf::from("/controller/run"),
            port: 5432,
            pg_ctl: PathBuf::from("pg_ctl"),
            replication_user: STREAMING_REPLICA_USER.to_string(),
            certificates: CertificateLocations::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load configuration from the process environment.
    ///
    /// Required:
    ///
    /// - `POD_NAME`, `NAMESPACE`, `CLUSTER_NAME`
    ///
    /// Optional:
    ///
    /// - `PGDATA`, `PGHOST` (socket directory), `PGPORT`
    /// - `PGKEEPER_PG_CTL`: path to `pg_ctl`
    /// - `PGKEEPER_CERTIFICATES_DIR`
    /// - `PGKEEPER_POLL_INTERVAL_MS`
    /// - `PGKEEPER_PROMOTION_WAIT_SECS` (`0` disables the limit)
    /// - `PGKEEPER_CLAIM_ATTEMPTS`
    pub fn from_env() -> InstanceResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> InstanceResult<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| InstanceError::Config(format!("{key} must be set")))
        };

        let mut config = Self {
            pod_name: required("POD_NAME")?,
            namespace: required("NAMESPACE")?,
            cluster_name: required("CLUSTER_NAME")?,
            ..Self::default()
        };

        if let Some(pgdata) = lookup("PGDATA") {
            config.pgdata = PathBuf::from(pgdata);
        }
        if let Some(host) = lookup("PGHOST") {
            config.socket_dir = PathBuf::from(host);
        }
        if let Some(port) = lookup("PGPORT") {
            config.port = parse_var("PGPORT", &port)?;
        }
        if let Some(pg_ctl) = lookup("PGKEEPER_PG_CTL") {
            config.pg_ctl = PathBuf::from(pg_ctl);
        }
        if let Some(dir) = lookup("PGKEEPER_CERTIFICATES_DIR") {
            config.certificates = CertificateLocations::in_dir(dir);
        }
        if let Some(ms) = lookup("PGKEEPER_POLL_INTERVAL_MS") {
            config.timing.poll_interval_ms = parse_var("PGKEEPER_POLL_INTERVAL_MS", &ms)?;
        }
        if let Some(secs) = lookup("PGKEEPER_PROMOTION_WAIT_SECS") {
            let secs: u64 = parse_var("PGKEEPER_PROMOTION_WAIT_SECS", &secs)?;
            config.timing.promotion_wait_max_secs = (secs > 0).then_some(secs);
        }
        if let Some(attempts) = lookup("PGKEEPER_CLAIM_ATTEMPTS") {
            config.timing.claim_attempts = parse_var("PGKEEPER_CLAIM_ATTEMPTS", &attempts)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> InstanceResult<()> {
        if self.pod_name.is_empty() {
            return Err(InstanceError::Config("pod_name is required".to_string()));
        }
        if self.cluster_name.is_empty() {
            return Err(InstanceError::Config("cluster_name is required".to_string()));
        }
        if self.replication_user.is_empty() {
            return Err(InstanceError::Config(
                "replication_user is required".to_string(),
            ));
        }
        if self.timing.poll_interval_ms == 0 {
            return Err(InstanceError::Config(
                "poll_interval_ms must be > 0".to_string(),
            ));
        }
        if self.timing.claim_attempts == 0 {
            return Err(InstanceError::Config(
                "claim_attempts must be > 0".to_string(),
            ));
        }
        if self.timing.startup_probe_attempts == 0 {
            return Err(InstanceError::Config(
                "startup_probe_attempts must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Connection settings for the local engine.
    pub fn postgres_settings(&self) -> PostgresSettings {
        PostgresSettings {
            pgdata: self.pgdata.clone(),
            socket_dir: self.socket_dir.clone(),
            port: self.port,
            pg_ctl: self.pg_ctl.clone(),
            ..PostgresSettings::default()
        }
    }

    /// Rendered configuration parameters.
    pub fn custom_conf_path(&self) -> PathBuf {
        self.pgdata.join("custom.conf")
    }

    /// Rendered host-based authentication rules.
    pub fn hba_conf_path(&self) -> PathBuf {
        self.pgdata.join("pg_hba.conf")
    }

    /// Policy for the replication waits during promotion.
    pub fn promotion_wait_policy(&self) -> BackoffPolicy {
        let policy = BackoffPolicy::fixed(Duration::from_millis(self.timing.poll_interval_ms));
        match self.timing.promotion_wait_max_secs {
            Some(secs) => policy.with_max_duration(Duration::from_secs(secs)),
            None => policy,
        }
    }

    /// Policy for claiming the primary role.
    pub fn claim_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::from_millis(self.timing.claim_interval_ms))
            .with_max_attempts(self.timing.claim_attempts)
    }

    /// Policy for waiting on the server to accept connections.
    pub fn startup_probe_policy(&self) -> BackoffPolicy {
        BackoffPolicy::fixed(Duration::from_millis(self.timing.startup_probe_interval_ms))
            .with_max_attempts(self.timing.startup_probe_attempts)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> InstanceResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| InstanceError::Config(format!("{key} has an invalid value: {value}")))
}

/// Builder for ManagerConfig.
#[derive(Debug, Default)]
pub struct ManagerConfigBuilder {
    config: ManagerConfig,
}

impl ManagerConfigBuilder {
    /// Set the pod name.
    pub fn pod_name(mut self, name: impl Into<String>) -> Self {
        self.config.pod_name = name.into();
        self
    }

    /// Set the namespace.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// Set the cluster name.
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    /// Set the data directory.
    pub fn pgdata(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pgdata = path.into();
        self
    }

    /// Set the socket directory.
    pub fn socket_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.socket_dir = path.into();
        self
    }

    /// Set the `pg_ctl` binary.
    pub fn pg_ctl(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pg_ctl = path.into();
        self
    }

    /// Set the replication role name.
    pub fn replication_user(mut self, user: impl Into<String>) -> Self {
        self.config.replication_user = user.into();
        self
    }

    /// Set the certificate directory.
    pub fn certificates_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config.certificates = CertificateLocations::in_dir(dir);
        self
    }

    /// Set the replication-state poll interval.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.timing.poll_interval_ms = ms;
        self
    }

    /// Bound each promotion wait, or lift the bound with `None`.
    pub fn promotion_wait_max_secs(mut self, secs: Option<u64>) -> Self {
        self.config.timing.promotion_wait_max_secs = secs;
        self
    }

    /// Set the claim attempt budget.
    pub fn claim_attempts(mut self, attempts: u32) -> Self {
        self.config.timing.claim_attempts = attempts;
        self
    }

    /// Set the startup probe budget.
    pub fn startup_probe(mut self, interval_ms: u64, attempts: u32) -> Self {
        self.config.timing.startup_probe_interval_ms = interval_ms;
        self.config.timing.startup_probe_attempts = attempts;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> InstanceResult<ManagerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
