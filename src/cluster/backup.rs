//! Simulated backup service.
//!
//! A backup captures a data cluster's full state at its cut point and files
//! it under a location id; restore replays the captured state wholesale,
//! metacluster registration included. The byte-stream mechanics of the real
//! service are out of scope; only the submit/wait/restore contract matters.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use slog::{info, Logger};
use uuid::Uuid;

use crate::cluster::DataCluster;
use crate::error::{MetaclusterError, Result};

/// Opaque handle to a completed backup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackupLocation(Uuid);

impl fmt::Display for BackupLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backup://{}", self.0)
    }
}

#[derive(Default)]
struct BackupRegistry {
    running: BTreeSet<String>,
    stored: HashMap<Uuid, Vec<u8>>,
}

pub struct BackupAgent {
    registry: Mutex<BackupRegistry>,
    logger: Logger,
}

impl BackupAgent {
    pub fn new(logger: Logger) -> Self {
        Self {
            registry: Mutex::new(BackupRegistry::default()),
            logger,
        }
    }

    /// Submit a continuous backup covering the cluster's tenant-data ranges.
    /// Fails with `BackupAlreadyRunning` if one is in flight; callers treat
    /// that as success.
    pub fn submit_backup(&self, cluster: &DataCluster) -> Result<()> {
        let mut registry = self.registry.lock().expect("backup registry poisoned");
        if !registry.running.insert(cluster.name().to_string()) {
            return Err(MetaclusterError::BackupAlreadyRunning {
                cluster: cluster.name().to_string(),
            });
        }
        info!(self.logger, "submitted backup"; "cluster" => cluster.name());
        Ok(())
    }

    /// Wait for the submitted backup to complete and return its restorable
    /// location. The cut point lands after `cut_delay`; mutations committed
    /// on either side of it are the source of during-backup indeterminacy.
    pub async fn wait_backup(
        &self,
        cluster: &DataCluster,
        cut_delay: Duration,
    ) -> Result<BackupLocation> {
        tokio::time::sleep(cut_delay).await;

        let state = cluster.export_state().await;
        let bytes = serde_json::to_vec(&state).map_err(|e| MetaclusterError::SerializationError {
            reason: e.to_string(),
        })?;

        let id = Uuid::new_v4();
        {
            let mut registry = self.registry.lock().expect("backup registry poisoned");
            registry.running.remove(cluster.name());
            registry.stored.insert(id, bytes);
        }

        let location = BackupLocation(id);
        info!(self.logger, "backup complete"; "cluster" => cluster.name(), "location" => %location);
        Ok(location)
    }

    /// Replay a stored backup into the cluster. The caller clears the target
    /// ranges first; replay reinstates the captured state as of the cut point.
    pub async fn restore(&self, cluster: &DataCluster, location: &BackupLocation) -> Result<()> {
        let bytes = {
            let registry = self.registry.lock().expect("backup registry poisoned");
            registry
                .stored
                .get(&location.0)
                .cloned()
                .ok_or_else(|| MetaclusterError::BackupNotFound {
                    location: location.to_string(),
                })?
        };
        let state = serde_json::from_slice(&bytes).map_err(|e| {
            MetaclusterError::SerializationError {
                reason: e.to_string(),
            }
        })?;
        cluster.import_state(state).await;
        info!(self.logger, "restored backup"; "cluster" => cluster.name(), "location" => %location);
        Ok(())
    }
}
