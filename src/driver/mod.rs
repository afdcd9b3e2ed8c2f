//! Mutation Driver
//!
//! Issues a stream of create/delete/rename/reconfigure operations against
//! the management directory while backups and restores run, applying the
//! matching reference-model mutation after each commit and stamping it with
//! the current access-time bucket. Capacity exhaustion is absorbed by an
//! autoscale-and-retry loop; any other failure aborts the run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use slog::{debug, info, Logger};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

use crate::auth::Caller;
use crate::cluster::{with_retry, ManagementCluster};
use crate::error::{MetaclusterError, Result};
use crate::model::{AccessTime, ClusterName, ReferenceModel};

/// How many candidate draws an operation makes against the name index before
/// giving up and no-oping. Bounds wasted work under low-cardinality name
/// collisions.
const NAME_DRAW_ATTEMPTS: usize = 10;

/// Growth factor applied to every cluster's group capacity when admission
/// fails.
const CAPACITY_GROWTH_FACTOR: f64 = 1.2;

/// Shared flag flipped once all cluster backups finish. Operations committed
/// before the flip land in the `DuringBackup` bucket, after it in
/// `AfterBackup`.
#[derive(Debug, Default)]
pub struct BackupPhase {
    complete: AtomicBool,
}

impl BackupPhase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn access_time(&self) -> AccessTime {
        if self.is_complete() {
            AccessTime::AfterBackup
        } else {
            AccessTime::DuringBackup
        }
    }
}

pub struct MutationDriver {
    management: Arc<ManagementCluster>,
    model: Arc<Mutex<ReferenceModel>>,
    cluster_index: Vec<ClusterName>,
    phase: Arc<BackupPhase>,
    caller: Caller,
    rng: StdRng,
    max_tenants: usize,
    max_tenant_groups: usize,
    group_capacity: u32,
    logger: Logger,
}

impl MutationDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        management: Arc<ManagementCluster>,
        model: Arc<Mutex<ReferenceModel>>,
        cluster_index: Vec<ClusterName>,
        phase: Arc<BackupPhase>,
        rng: StdRng,
        max_tenants: usize,
        max_tenant_groups: usize,
        group_capacity: u32,
        logger: Logger,
    ) -> Self {
        Self {
            management,
            model,
            cluster_index,
            phase,
            caller: Caller::trusted(),
            rng,
            max_tenants,
            max_tenant_groups,
            group_capacity,
            logger,
        }
    }

    fn random_tenant_name(&mut self) -> String {
        format!("tenant{:08}", self.rng.gen_range(0..self.max_tenants))
    }

    fn random_group_name(&mut self) -> String {
        format!("tenantgroup{:08}", self.rng.gen_range(0..self.max_tenant_groups))
    }

    /// Group choice for a fresh tenant: coinflip none, else any group name.
    fn choose_group_for_create(&mut self) -> Option<String> {
        if self.rng.gen_bool(0.5) {
            Some(self.random_group_name())
        } else {
            None
        }
    }

    /// Group choice for reconfiguration: coinflip between an existing group
    /// on the tenant's own cluster and a fresh unused name (while the group
    /// population is below its cap).
    async fn choose_group_for_configure(&mut self, cluster: &str) -> Option<String> {
        if !self.rng.gen_bool(0.5) {
            return None;
        }
        let (existing, group_count) = {
            let model = self.model.lock().await;
            (model.groups_on_cluster(cluster), model.group_count())
        };
        if self.rng.gen_bool(0.5) && !existing.is_empty() {
            existing.choose(&mut self.rng).cloned()
        } else if group_count < self.max_tenant_groups {
            loop {
                let group = self.random_group_name();
                if self.model.lock().await.group(&group).is_none() {
                    return Some(group);
                }
            }
        } else {
            None
        }
    }

    /// Draw a name currently in use, or `None` after the draw bound.
    async fn choose_existing_name(&mut self) -> Option<String> {
        for _ in 0..NAME_DRAW_ATTEMPTS {
            let name = self.random_tenant_name();
            if self.model.lock().await.name_in_use(&name) {
                return Some(name);
            }
        }
        None
    }

    /// Draw a name not currently in use, or `None` after the draw bound.
    async fn choose_unused_name(&mut self) -> Option<String> {
        for _ in 0..NAME_DRAW_ATTEMPTS {
            let name = self.random_tenant_name();
            if !self.model.lock().await.name_in_use(&name) {
                return Some(name);
            }
        }
        None
    }

    /// Grow every cluster's configured group capacity and keep going; used to
    /// spread tenants over the clusters instead of blocking on admission.
    async fn increase_capacity(&mut self) -> Result<()> {
        self.group_capacity = (f64::from(self.group_capacity) * CAPACITY_GROWTH_FACTOR).ceil() as u32;
        info!(self.logger, "increasing metacluster capacity"; "capacity" => self.group_capacity);
        for cluster in &self.cluster_index {
            self.management
                .update_cluster_capacity(cluster, self.group_capacity)
                .await?;
        }
        Ok(())
    }

    /// Create a tenant under a fresh name, autoscaling on admission failure.
    pub async fn create_tenant(&mut self, at: AccessTime) -> Result<()> {
        let name = match self.choose_unused_name().await {
            Some(name) => name,
            None => return Ok(()),
        };
        let tenant_group = self.choose_group_for_create();

        loop {
            let created = with_retry(&self.logger, "create_tenant", || {
                self.management.create_tenant(&name, tenant_group.as_deref())
            })
            .await;

            match created {
                Ok(entry) => {
                    let cluster = entry
                        .assigned_cluster
                        .as_deref()
                        .expect("directory returned a tenant entry with no assigned cluster");
                    debug!(self.logger, "created tenant"; "tenant" => &name,
                           "tenant_id" => entry.id, "cluster" => cluster, "access_time" => ?at);
                    self.model.lock().await.record_create(
                        entry.id,
                        &name,
                        cluster,
                        tenant_group.as_deref(),
                        at,
                    );
                    return Ok(());
                }
                Err(MetaclusterError::MetaclusterNoCapacity) => {
                    self.increase_capacity().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete a randomly chosen existing tenant.
    pub async fn delete_tenant(&mut self, at: AccessTime) -> Result<()> {
        let name = match self.choose_existing_name().await {
            Some(name) => name,
            None => return Ok(()),
        };
        let id = {
            let model = self.model.lock().await;
            model
                .tenant_id_by_name(&name)
                .expect("name index returned a name with no tenant id")
        };

        debug!(self.logger, "deleting tenant"; "tenant" => &name, "tenant_id" => id, "access_time" => ?at);
        with_retry(&self.logger, "delete_tenant", || {
            self.management.delete_tenant(&self.caller, &name)
        })
        .await?;

        self.model.lock().await.record_delete(id);
        Ok(())
    }

    /// Move a randomly chosen tenant into a different group (or out of any),
    /// autoscaling on admission failure.
    pub async fn configure_tenant(&mut self, at: AccessTime) -> Result<()> {
        let name = match self.choose_existing_name().await {
            Some(name) => name,
            None => return Ok(()),
        };
        let (id, cluster) = {
            let model = self.model.lock().await;
            let id = model
                .tenant_id_by_name(&name)
                .expect("name index returned a name with no tenant id");
            let cluster = model
                .tenant(id)
                .expect("tracked name points at an untracked tenant")
                .cluster
                .clone();
            (id, cluster)
        };
        let tenant_group = self.choose_group_for_configure(&cluster).await;

        loop {
            let configured = with_retry(&self.logger, "configure_tenant", || {
                self.management
                    .configure_tenant(&self.caller, &name, tenant_group.as_deref())
            })
            .await;

            match configured {
                Ok(()) => {
                    debug!(self.logger, "configured tenant"; "tenant" => &name,
                           "tenant_id" => id, "new_group" => ?tenant_group, "access_time" => ?at);
                    self.model
                        .lock()
                        .await
                        .record_regroup(id, tenant_group.as_deref(), at);
                    return Ok(());
                }
                Err(MetaclusterError::ClusterNoCapacity { .. }) => {
                    self.increase_capacity().await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Rename a randomly chosen tenant to a fresh name.
    pub async fn rename_tenant(&mut self, at: AccessTime) -> Result<()> {
        let old_name = match self.choose_existing_name().await {
            Some(name) => name,
            None => return Ok(()),
        };
        let new_name = match self.choose_unused_name().await {
            Some(name) => name,
            None => return Ok(()),
        };
        let id = {
            let model = self.model.lock().await;
            model
                .tenant_id_by_name(&old_name)
                .expect("name index returned a name with no tenant id")
        };

        debug!(self.logger, "renaming tenant"; "old" => &old_name, "new" => &new_name,
               "tenant_id" => id, "access_time" => ?at);
        with_retry(&self.logger, "rename_tenant", || {
            self.management.rename_tenant(&self.caller, &old_name, &new_name)
        })
        .await?;

        self.model.lock().await.record_rename(id, &new_name, at);
        Ok(())
    }

    /// Create tenants until the model tracks `count` of them, all stamped
    /// `BeforeBackup`. Collided name draws no-op and the loop continues.
    pub async fn create_initial_tenants(&mut self, count: usize) -> Result<()> {
        info!(self.logger, "creating initial tenants"; "count" => count);
        while self.model.lock().await.tenant_count() < count {
            self.create_tenant(AccessTime::BeforeBackup).await?;
        }
        info!(self.logger, "initial tenants created");
        Ok(())
    }

    /// Foreground loop: uniform choice among the four operations until the
    /// deadline (set once backups complete) passes.
    pub async fn run(mut self, deadline: watch::Receiver<Option<Instant>>) -> Result<()> {
        info!(self.logger, "mutation driver starting");
        loop {
            if let Some(end) = *deadline.borrow() {
                if Instant::now() >= end {
                    break;
                }
            }

            let at = self.phase.access_time();
            match self.rng.gen_range(0..4) {
                0 => self.create_tenant(at).await?,
                1 => self.delete_tenant(at).await?,
                2 => self.configure_tenant(at).await?,
                _ => self.rename_tenant(at).await?,
            }

            tokio::task::yield_now().await;
        }
        info!(self.logger, "mutation driver finished");
        Ok(())
    }
}
