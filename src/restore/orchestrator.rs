//! The restore orchestrator: per-cluster backup submission and the two
//! restore modes.
//!
//! Data-cluster restore wipes the tenant-data ranges, replays the backup,
//! and optionally reattaches the cluster with the directory authoritative.
//! Management-cluster restore erases the directory and rebuilds it from each
//! data cluster's local tenant map in turn, resolving collisions between
//! attach attempts. Rebuilding the directory from a data cluster must never
//! mutate that data cluster's tenant map; that is asserted around every
//! attempt.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;
use slog::{info, Logger};
use tokio::sync::Mutex;

use crate::cluster::{
    BackupAgent, BackupLocation, DataCluster, ManagementCluster, TENANT_ID_PREFIX_MAX,
    TENANT_ID_PREFIX_MIN,
};
use crate::error::{MetaclusterError, Result};
use crate::model::{ClusterName, ReferenceModel};
use crate::restore::collision::{
    detect_collisions, resolve_group_collisions, resolve_tenant_collisions,
};

/// Longest delay before a backup's cut point lands
const MAX_BACKUP_CUT_DELAY_MS: u64 = 75;

pub struct RestoreOrchestrator {
    management: Arc<ManagementCluster>,
    data_clusters: BTreeMap<ClusterName, Arc<DataCluster>>,
    backup: Arc<BackupAgent>,
    model: Arc<Mutex<ReferenceModel>>,
    rng: Mutex<StdRng>,
    logger: Logger,
}

impl RestoreOrchestrator {
    pub fn new(
        management: Arc<ManagementCluster>,
        data_clusters: BTreeMap<ClusterName, Arc<DataCluster>>,
        backup: Arc<BackupAgent>,
        model: Arc<Mutex<ReferenceModel>>,
        rng: StdRng,
        logger: Logger,
    ) -> Self {
        Self {
            management,
            data_clusters,
            backup,
            model,
            rng: Mutex::new(rng),
            logger,
        }
    }

    async fn coinflip(&self) -> bool {
        self.rng.lock().await.gen_bool(0.5)
    }

    fn data_cluster(&self, name: &str) -> &Arc<DataCluster> {
        self.data_clusters
            .get(name)
            .unwrap_or_else(|| panic!("orchestrator has no handle for data cluster '{}'", name))
    }

    /// Submit and await a continuous backup of one data cluster.
    pub async fn backup_cluster(&self, name: &str) -> Result<BackupLocation> {
        let data = self.data_cluster(name);

        info!(self.logger, "submitting backup"; "cluster" => name);
        match self.backup.submit_backup(data) {
            Ok(()) | Err(MetaclusterError::BackupAlreadyRunning { .. }) => {}
            Err(e) => return Err(e),
        }

        let cut_delay =
            Duration::from_millis(self.rng.lock().await.gen_range(1..MAX_BACKUP_CUT_DELAY_MS));
        info!(self.logger, "waiting for backup"; "cluster" => name);
        let location = self.backup.wait_backup(data, cut_delay).await?;
        info!(self.logger, "backup complete"; "cluster" => name, "location" => %location);
        Ok(location)
    }

    /// Disaster-recover one data cluster from its backup: clear the
    /// tenant-data ranges, replay, and (optionally) reattach it to the
    /// metacluster with the directory authoritative. The reattach runs a
    /// discarded dry run first on a coinflip; messages from the real attach
    /// are retained as the lossy-recovery signal.
    pub async fn restore_data_cluster(
        &self,
        name: &str,
        location: &BackupLocation,
        add_to_metacluster: bool,
        force_join_new_metacluster: bool,
    ) -> Result<()> {
        let data = self.data_cluster(name);

        info!(self.logger, "clearing data cluster"; "cluster" => name);
        data.clear_all().await;

        info!(self.logger, "replaying backup into data cluster"; "cluster" => name);
        self.backup.restore(data, location).await?;

        let mut messages = Vec::new();
        if add_to_metacluster {
            if self.coinflip().await {
                info!(self.logger, "reattaching data cluster (dry run)"; "cluster" => name);
                let mut dry_run_messages = Vec::new();
                self.management
                    .restore_cluster(
                        name,
                        data,
                        true,
                        true,
                        force_join_new_metacluster,
                        &mut dry_run_messages,
                    )
                    .await?;
            }

            info!(self.logger, "reattaching data cluster"; "cluster" => name);
            self.management
                .restore_cluster(name, data, true, false, force_join_new_metacluster, &mut messages)
                .await?;
            info!(self.logger, "data cluster restore complete";
                  "cluster" => name, "messages" => messages.len());
        }

        self.model
            .lock()
            .await
            .mark_restored(name, !messages.is_empty());
        Ok(())
    }

    /// Erase the management directory, simulating loss of the management
    /// cluster.
    pub async fn reset_management_cluster(&self) {
        self.management.reset().await;
    }

    /// Rebuild the management directory from the data clusters' own tenant
    /// maps, one cluster at a time.
    pub async fn restore_management_cluster(&self) -> Result<()> {
        info!(self.logger, "restoring management cluster");
        let id_prefix = self
            .rng
            .lock()
            .await
            .gen_range(TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX);
        self.management
            .create_metacluster("management_cluster", id_prefix)
            .await?;

        for (name, data) in &self.data_clusters {
            info!(self.logger, "processing data cluster"; "cluster" => name.as_str());
            data.forget_metacluster().await;

            let (mut tenant_collisions, mut group_collisions) =
                detect_collisions(&self.management, data).await;

            let mut completed = false;
            while !completed {
                let before = data.snapshot_tenant_map().await?;
                let mut messages = Vec::new();

                let attempt = self
                    .attach_attempt(name, data, &mut messages)
                    .await;

                match attempt {
                    Ok(()) => {
                        assert!(
                            tenant_collisions.is_empty() && group_collisions.is_empty(),
                            "attach of data cluster '{}' succeeded with {} tenant and {} group \
                             collisions unresolved",
                            name,
                            tenant_collisions.len(),
                            group_collisions.len()
                        );
                        completed = true;
                    }
                    Err(e) => {
                        let collision_failure = matches!(
                            e,
                            MetaclusterError::TenantAlreadyExists { .. }
                        ) && !tenant_collisions.is_empty()
                            || matches!(
                                e,
                                MetaclusterError::InvalidTenantConfiguration { .. }
                            ) && !group_collisions.is_empty();
                        if !collision_failure {
                            return Err(e);
                        }

                        // Undo the partially-applied attach before resolving.
                        match self.management.remove_cluster(name).await {
                            Ok(()) => {
                                info!(self.logger, "removed partially-restored cluster";
                                      "cluster" => name.as_str());
                            }
                            Err(MetaclusterError::ClusterNotFound { .. }) => {}
                            Err(e) => return Err(e),
                        }
                    }
                }

                let after = data.snapshot_tenant_map().await?;
                assert_eq!(
                    before, after,
                    "management-cluster restore mutated the tenant map of data cluster '{}'",
                    name
                );

                if !completed {
                    assert!(
                        !messages.is_empty(),
                        "attach of data cluster '{}' failed without advisory messages",
                        name
                    );

                    resolve_tenant_collisions(
                        &self.model,
                        &self.management,
                        data,
                        &tenant_collisions,
                        &self.logger,
                    )
                    .await?;
                    resolve_group_collisions(
                        &self.model,
                        &self.management,
                        data,
                        &group_collisions,
                        &self.logger,
                    )
                    .await?;
                    tenant_collisions.clear();
                    group_collisions.clear();
                }
            }

            info!(self.logger, "rebuilt directory from data cluster"; "cluster" => name.as_str());
        }

        info!(self.logger, "management cluster restored");
        Ok(())
    }

    /// One attach attempt: coinflip dry run (messages discarded), then the
    /// real attach with the data cluster authoritative.
    async fn attach_attempt(
        &self,
        name: &str,
        data: &Arc<DataCluster>,
        messages: &mut Vec<String>,
    ) -> Result<()> {
        if self.coinflip().await {
            info!(self.logger, "rebuilding directory from data cluster (dry run)";
                  "cluster" => name);
            let mut dry_run_messages = Vec::new();
            let force = self.coinflip().await;
            self.management
                .restore_cluster(name, data, false, true, force, &mut dry_run_messages)
                .await?;
        }

        let force = self.coinflip().await;
        info!(self.logger, "rebuilding directory from data cluster"; "cluster" => name);
        self.management
            .restore_cluster(name, data, false, false, force, messages)
            .await
    }
}
