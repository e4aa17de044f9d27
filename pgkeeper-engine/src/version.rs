//! Data directory version detection.

use crate::error::{EngineError, EngineResult};
use std::path::Path;

/// Name of the version marker PostgreSQL keeps at the root of PGDATA.
pub const VERSION_FILE: &str = "PG_VERSION";

/// Read the major version of the cluster stored in `pgdata`.
pub fn major_version(pgdata: &Path) -> EngineResult<u32> {
    let path = pgdata.join(VERSION_FILE);
    let contents = std::fs::read_to_string(&path).map_err(|e| EngineError::Version {
        path: path.clone(),
        reason: e.to_string(),
    })?;

    parse_major_version(&contents).ok_or_else(|| EngineError::Version {
        path,
        reason: format!("cannot parse {:?}", contents.trim()),
    })
}

/// Parse the contents of a `PG_VERSION` file.
///
/// Releases before 10 use a two-part major version (`9.6`); the first
/// component is returned, which is what the privilege logic compares on.
pub fn parse_major_version(contents: &str) -> Option<u32> {
    contents.trim().split('.').next()?.parse().ok()
}
