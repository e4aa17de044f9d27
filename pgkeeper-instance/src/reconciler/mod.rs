//! Event handlers for the local instance.
//!
//! - [`Dispatcher`]: routes each watch event to one of the handlers below
//! - [`reconcile_cluster`]: promotes or demotes based on the target primary
//! - [`PromotionCoordinator`]: drains replication, promotes, claims primary
//! - [`demote_if_primary`]: stops a primary that lost its designation
//! - [`SecretMaterializer`]: writes certificate material and reloads
//! - [`ConfigMaterializer`]: writes configuration, reloads, maybe restarts
//! - [`PrivilegeProvisioner`]: bootstraps the replication role

mod cluster;
mod configmap;
mod demotion;
mod dispatcher;
mod permissions;
mod promotion;
mod secret;

pub use cluster::{ClusterAction, reconcile_cluster};
pub use configmap::{
    ConfigMaterializer, ConfigOutcome, HBA_KEY, RestartDecision, decide_restart,
    render_configuration,
};
pub use demotion::{DemotionOutcome, demote_if_primary};
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use permissions::{LAST_SUPERUSER_REWIND_VERSION, PrivilegeProvisioner, ProvisionReport};
pub use promotion::{PromotionCoordinator, PromotionOutcome, PromotionState};
pub use secret::{
    CA_CERT_KEY, CA_SECRET_SUFFIX, CertificateKind, REPLICATION_SECRET_SUFFIX,
    SERVER_SECRET_SUFFIX, SecretMaterializer, SecretOutcome, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
