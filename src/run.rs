//! Top-level reconciliation run.
//!
//! Wires the components together and drives the three phases: `setup`
//! (metacluster creation, cluster registration, initial tenants), `execute`
//! (foreground mutations concurrent with backups, then restores), and
//! `verify` (the consistency check). Invoked as a library; the harness
//! supplies the data clusters and the seed.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slog::{info, Logger};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::check::ConsistencyChecker;
use crate::cluster::{
    BackupAgent, BackupLocation, DataCluster, ManagementCluster, TENANT_ID_PREFIX_MAX,
    TENANT_ID_PREFIX_MIN,
};
use crate::config::RunConfig;
use crate::driver::{BackupPhase, MutationDriver};
use crate::error::Result;
use crate::model::{ClusterName, ReferenceModel, TenantId, TenantMapEntry};
use crate::restore::RestoreOrchestrator;

pub struct ReconciliationRun {
    config: RunConfig,
    management: Arc<ManagementCluster>,
    data_clusters: BTreeMap<ClusterName, Arc<DataCluster>>,
    cluster_index: Vec<ClusterName>,
    model: Arc<Mutex<ReferenceModel>>,
    phase: Arc<BackupPhase>,
    orchestrator: Arc<RestoreOrchestrator>,
    driver: Option<MutationDriver>,
    management_tenants_before_restore: Vec<(TenantId, TenantMapEntry)>,
    rng: StdRng,
    logger: Logger,
}

impl ReconciliationRun {
    /// Build a run over the supplied data clusters.
    pub fn new(config: RunConfig, clusters: Vec<Arc<DataCluster>>, logger: Logger) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let fault_seed = rng.gen::<u64>();
        let driver_seed = rng.gen::<u64>();
        let orchestrator_seed = rng.gen::<u64>();

        let management = Arc::new(
            ManagementCluster::new(logger.clone())
                .with_fault_injection(config.conflict_probability, fault_seed),
        );
        let backup = Arc::new(BackupAgent::new(logger.clone()));

        let cluster_index: Vec<ClusterName> =
            clusters.iter().map(|c| c.name().to_string()).collect();
        let data_clusters: BTreeMap<ClusterName, Arc<DataCluster>> = clusters
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect();

        let model = Arc::new(Mutex::new(ReferenceModel::new(cluster_index.clone())));
        let phase = Arc::new(BackupPhase::new());

        let driver = MutationDriver::new(
            management.clone(),
            model.clone(),
            cluster_index.clone(),
            phase.clone(),
            StdRng::seed_from_u64(driver_seed),
            config.max_tenants,
            config.max_tenant_groups,
            config.initial_group_capacity(cluster_index.len()),
            logger.clone(),
        );

        let orchestrator = Arc::new(RestoreOrchestrator::new(
            management.clone(),
            data_clusters.clone(),
            backup,
            model.clone(),
            StdRng::seed_from_u64(orchestrator_seed),
            logger.clone(),
        ));

        Self {
            config,
            management,
            data_clusters,
            cluster_index,
            model,
            phase,
            orchestrator,
            driver: Some(driver),
            management_tenants_before_restore: Vec::new(),
            rng,
            logger,
        }
    }

    /// Build a run over `count` freshly created simulated data clusters.
    pub fn with_simulated_clusters(config: RunConfig, count: usize, logger: Logger) -> Self {
        let clusters = (0..count)
            .map(|i| Arc::new(DataCluster::new(&format!("cluster_{:08}", i), logger.clone())))
            .collect();
        Self::new(config, clusters, logger)
    }

    pub fn model(&self) -> Arc<Mutex<ReferenceModel>> {
        self.model.clone()
    }

    pub fn management(&self) -> Arc<ManagementCluster> {
        self.management.clone()
    }

    pub fn data_cluster(&self, name: &str) -> Option<Arc<DataCluster>> {
        self.data_clusters.get(name).cloned()
    }

    pub fn cluster_names(&self) -> &[ClusterName] {
        &self.cluster_index
    }

    /// Create the metacluster, register every data cluster, and populate the
    /// initial tenants (all stamped before-backup).
    pub async fn setup(&mut self) -> Result<()> {
        info!(self.logger, "setting up metacluster";
              "clusters" => self.cluster_index.len(),
              "initial_tenants" => self.config.initial_tenants);

        let id_prefix = self.rng.gen_range(TENANT_ID_PREFIX_MIN..=TENANT_ID_PREFIX_MAX);
        self.management
            .create_metacluster("management_cluster", id_prefix)
            .await?;

        let capacity = self.config.initial_group_capacity(self.cluster_index.len());
        for (name, handle) in &self.data_clusters {
            self.management
                .register_cluster(name, handle.clone(), capacity)
                .await?;
        }

        let driver = self
            .driver
            .as_mut()
            .expect("setup called after the run already executed");
        driver.create_initial_tenants(self.config.initial_tenants).await?;
        Ok(())
    }

    /// Run foreground mutations concurrently with backups, then apply the
    /// configured recovery mode.
    pub async fn execute(&mut self) -> Result<()> {
        info!(self.logger, "starting reconciliation run";
              "recover_management_cluster" => self.config.recover_management_cluster,
              "recover_data_clusters" => self.config.recover_data_clusters);

        // Pick the disaster set: each data cluster with low probability, and
        // at least one when data recovery is on at all.
        let mut clusters_to_restore: Vec<ClusterName> = Vec::new();
        if self.config.recover_data_clusters {
            for name in &self.cluster_index {
                if self.rng.gen_bool(0.1) {
                    clusters_to_restore.push(name.clone());
                }
            }
            if clusters_to_restore.is_empty() {
                let index = self.rng.gen_range(0..self.cluster_index.len());
                clusters_to_restore.push(self.cluster_index[index].clone());
            }
            for name in &clusters_to_restore {
                info!(self.logger, "chose cluster for restore"; "cluster" => name.as_str());
            }
        }

        let (deadline_tx, deadline_rx) = watch::channel(None);
        let driver = self
            .driver
            .take()
            .expect("execute called twice on the same run");
        let driver_handle = tokio::spawn(driver.run(deadline_rx));

        // Back up the disaster set concurrently; all backups must finish
        // before the access-time bucket flips.
        let mut backup_handles = Vec::new();
        for name in &clusters_to_restore {
            let orchestrator = self.orchestrator.clone();
            let name = name.clone();
            backup_handles.push(tokio::spawn(async move {
                let location = orchestrator.backup_cluster(&name).await?;
                Ok::<_, crate::error::MetaclusterError>((name, location))
            }));
        }
        let mut backups: BTreeMap<ClusterName, BackupLocation> = BTreeMap::new();
        for handle in backup_handles {
            let (name, location) = handle.await.expect("backup task panicked")?;
            backups.insert(name, location);
        }

        self.phase.mark_complete();
        let _ = deadline_tx.send(Some(Instant::now() + self.config.mutation_window));
        info!(self.logger, "backups complete, mutation window started";
              "window_ms" => self.config.mutation_window.as_millis() as u64);

        driver_handle.await.expect("mutation driver task panicked")?;
        info!(self.logger, "foreground operations complete");

        if self.config.recover_management_cluster {
            self.orchestrator.reset_management_cluster().await;
        } else {
            self.management_tenants_before_restore = self.management.scan_tenants().await;
        }

        // Restore the disaster set concurrently, reattaching immediately
        // unless the directory itself is gone.
        let add_to_metacluster = !self.config.recover_management_cluster;
        let mut restore_handles = Vec::new();
        for (name, location) in &backups {
            let orchestrator = self.orchestrator.clone();
            let name = name.clone();
            let location = location.clone();
            let force = self.rng.gen_bool(0.5);
            restore_handles.push(tokio::spawn(async move {
                orchestrator
                    .restore_data_cluster(&name, &location, add_to_metacluster, force)
                    .await
            }));
        }
        for handle in restore_handles {
            handle.await.expect("data cluster restore task panicked")?;
        }

        if self.config.recover_management_cluster {
            self.orchestrator.restore_management_cluster().await?;

            // Sometimes run the data restores again on top of the rebuilt
            // directory, simulating re-parenting into the new metacluster.
            if self.rng.gen_bool(0.5) {
                info!(self.logger, "running second data cluster restore round");
                let mut second_round = Vec::new();
                for (name, location) in &backups {
                    let orchestrator = self.orchestrator.clone();
                    let name = name.clone();
                    let location = location.clone();
                    second_round.push(tokio::spawn(async move {
                        orchestrator.restore_data_cluster(&name, &location, true, true).await
                    }));
                }
                for handle in second_round {
                    handle.await.expect("data cluster restore task panicked")?;
                }
            }
        }

        info!(self.logger, "reconciliation run complete");
        Ok(())
    }

    /// Run the consistency checker over the final state.
    pub async fn verify(&self) {
        let checker = ConsistencyChecker::new(
            self.management.clone(),
            self.data_clusters.clone(),
            self.config.recover_management_cluster,
            self.config.recover_data_clusters,
            self.logger.clone(),
        );
        let model = self.model.lock().await;
        checker
            .check(&model, &self.management_tenants_before_restore)
            .await;
    }

    /// All three phases in order.
    pub async fn run(mut self) -> Result<()> {
        self.setup().await?;
        self.execute().await?;
        self.verify().await;
        Ok(())
    }
}
