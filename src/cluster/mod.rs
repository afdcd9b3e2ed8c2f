//! Simulated clusters
//!
//! In-process, in-memory stand-ins for the management cluster's directory,
//! the data clusters' local tenant maps, and the backup service. Each public
//! operation is atomic under its cluster's state lock and plays the role of
//! one committed transaction; an optional fault injector makes foreground
//! directory operations fail with transient conflicts so the retry path is
//! exercised for real.

pub mod backup;
pub mod data;
pub mod management;

use std::future::Future;
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use uuid::Uuid;

use crate::error::{MetaclusterError, Result};

pub use backup::{BackupAgent, BackupLocation};
pub use data::DataCluster;
pub use management::ManagementCluster;

/// Upper bound on any tenant or group range scan. Exceeding it is a protocol
/// bug, not a runtime condition, and is asserted.
pub const MAX_TENANTS_PER_CLUSTER: usize = 100_000;

/// Smallest and largest tenant id prefix a metacluster may be created with
pub const TENANT_ID_PREFIX_MIN: i64 = 0;
pub const TENANT_ID_PREFIX_MAX: i64 = 32767;

/// Registration record written to every member of a metacluster.
///
/// The management cluster holds one without a cluster name; each data cluster
/// holds one naming itself. A data cluster whose record points at a different
/// metacluster id can only be joined with `force_join_new_metacluster`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaclusterRegistration {
    pub metacluster_id: Uuid,
    pub metacluster_name: String,
    pub cluster_name: Option<String>,
}

impl MetaclusterRegistration {
    pub fn management(name: &str) -> Self {
        Self {
            metacluster_id: Uuid::new_v4(),
            metacluster_name: name.to_string(),
            cluster_name: None,
        }
    }

    pub fn for_data_cluster(&self, cluster_name: &str) -> Self {
        Self {
            metacluster_id: self.metacluster_id,
            metacluster_name: self.metacluster_name.clone(),
            cluster_name: Some(cluster_name.to_string()),
        }
    }
}

/// Capacity metadata for a registered data cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataClusterEntry {
    /// Admission budget in allocation units (tenant groups plus ungrouped
    /// tenants). Elastic: grows mid-run, never shrinks.
    pub capacity: u32,
}

/// Injects transient transaction conflicts into foreground directory
/// operations with a configured probability.
#[derive(Debug)]
pub struct FaultInjector {
    probability: f64,
    rng: Mutex<StdRng>,
}

impl FaultInjector {
    pub fn disabled() -> Self {
        Self {
            probability: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn with_probability(probability: f64, seed: u64) -> Self {
        Self {
            probability,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Fails with a retryable conflict before the operation touches state.
    pub fn maybe_conflict(&self) -> Result<()> {
        if self.probability > 0.0 {
            let mut rng = self.rng.lock().expect("fault injector rng poisoned");
            if rng.gen_bool(self.probability) {
                return Err(MetaclusterError::TransactionConflict);
            }
        }
        Ok(())
    }
}

/// Runs an operation, transparently retrying transient errors.
///
/// The retry policy is unbounded, mirroring the commit/on-error loop of the
/// underlying transactional store; only errors whose `is_retryable()` is true
/// are absorbed here.
pub async fn with_retry<T, F, Fut>(logger: &Logger, op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match f().await {
            Err(e) if e.is_retryable() => {
                debug!(logger, "retrying transient error"; "op" => op, "error" => %e);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_logger() -> Logger {
        use slog::Drain;
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, slog::o!())
    }

    #[tokio::test]
    async fn test_with_retry_absorbs_conflicts() {
        let logger = test_logger();
        let injector = FaultInjector::with_probability(0.5, 17);
        let value = with_retry(&logger, "noop", || async {
            injector.maybe_conflict()?;
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_with_retry_propagates_fatal_errors() {
        let logger = test_logger();
        let result: Result<()> = with_retry(&logger, "noop", || async {
            Err(MetaclusterError::MetaclusterNoCapacity)
        })
        .await;
        assert!(matches!(result, Err(MetaclusterError::MetaclusterNoCapacity)));
    }
}
