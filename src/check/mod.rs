//! Consistency Checker
//!
//! Runs once, after all driving activity quiesces and restores settle.
//! Walks every data cluster and the management directory, verifying observed
//! state against the reference model under the access-time classification
//! rules. Violations are protocol bugs and stop the run immediately with
//! full context.

use std::collections::BTreeMap;
use std::sync::Arc;

use slog::{info, Logger};

use crate::cluster::{DataCluster, ManagementCluster};
use crate::model::{AccessTime, ClusterName, ReferenceModel, TenantId, TenantMapEntry, TenantState};

pub struct ConsistencyChecker {
    management: Arc<ManagementCluster>,
    data_clusters: BTreeMap<ClusterName, Arc<DataCluster>>,
    recover_management: bool,
    recover_data: bool,
    logger: Logger,
}

impl ConsistencyChecker {
    pub fn new(
        management: Arc<ManagementCluster>,
        data_clusters: BTreeMap<ClusterName, Arc<DataCluster>>,
        recover_management: bool,
        recover_data: bool,
        logger: Logger,
    ) -> Self {
        Self {
            management,
            data_clusters,
            recover_management,
            recover_data,
            logger,
        }
    }

    /// Run both passes: every data cluster, then the management directory.
    pub async fn check(
        &self,
        model: &ReferenceModel,
        management_tenants_before_restore: &[(TenantId, TenantMapEntry)],
    ) {
        for (name, data) in &self.data_clusters {
            self.check_data_cluster(model, name, data).await;
        }
        self.check_management_directory(model, management_tenants_before_restore)
            .await;
        info!(self.logger, "consistency check passed";
              "clusters" => self.data_clusters.len(),
              "tracked_tenants" => model.tenant_count());
    }

    /// Verify one data cluster's local state against the reference model.
    async fn check_data_cluster(&self, model: &ReferenceModel, name: &str, data: &DataCluster) {
        info!(self.logger, "checking data cluster"; "cluster" => name);

        let registration = data.registration().await;
        let management_registration = self
            .management
            .registration()
            .await
            .expect("management cluster lost its metacluster registration");
        match &registration {
            Some(registration) => assert_eq!(
                registration.metacluster_id, management_registration.metacluster_id,
                "data cluster '{}' is registered to a foreign metacluster",
                name
            ),
            None => panic!("data cluster '{}' has no metacluster registration", name),
        }

        let tenant_map: BTreeMap<TenantId, TenantMapEntry> =
            data.scan_tenants().await.into_iter().collect();
        let record = model.cluster(name);

        if !record.restored {
            // Never restored: the live tenant set must match exactly.
            assert_eq!(
                tenant_map.len(),
                record.tenants.len(),
                "unrestored data cluster '{}' has {} tenants, expected {}",
                name,
                tenant_map.len(),
                record.tenants.len()
            );
            for (id, entry) in &tenant_map {
                assert!(
                    record.tenants.contains(id),
                    "unrestored data cluster '{}' holds untracked tenant {}",
                    name,
                    id
                );
                let tracked = model
                    .tenant(*id)
                    .unwrap_or_else(|| panic!("cluster record lists untracked tenant {}", id));
                assert_eq!(
                    tracked.cluster, name,
                    "tenant {} tracked on cluster '{}' found on '{}'",
                    id, tracked.cluster, name
                );
                assert_eq!(
                    tracked.tenant_group, entry.tenant_group,
                    "tenant {} group mismatch on unrestored cluster '{}'",
                    id, name
                );
                assert_eq!(
                    tracked.name, entry.name,
                    "tenant {} name mismatch on unrestored cluster '{}'",
                    id, name
                );
            }
            return;
        }

        // Restored: classify every tracked tenant by its creation bucket.
        let mut expected_tenants = 0usize;
        for id in &record.tenants {
            let tracked = model
                .tenant(*id)
                .unwrap_or_else(|| panic!("cluster record lists untracked tenant {}", id));
            match tracked.create_time {
                AccessTime::BeforeBackup => {
                    expected_tenants += 1;
                    let entry = tenant_map.get(id).unwrap_or_else(|| {
                        panic!(
                            "tenant {} created before backup is missing from restored cluster '{}'",
                            id, name
                        )
                    });
                    assert_eq!(
                        tracked.cluster, name,
                        "tenant {} tracked on cluster '{}' found on '{}'",
                        id, tracked.cluster, name
                    );
                    // A post-backup regroup/rename can roll back on the data
                    // cluster when the directory itself was rebuilt; that
                    // lossy window is tolerated, nothing else is.
                    if !self.recover_management
                        || tracked.configure_time <= AccessTime::BeforeBackup
                    {
                        assert_eq!(
                            entry.tenant_group, tracked.tenant_group,
                            "tenant {} group mismatch on restored cluster '{}'",
                            id, name
                        );
                    }
                    if !self.recover_management || tracked.rename_time <= AccessTime::BeforeBackup
                    {
                        assert_eq!(
                            entry.name, tracked.name,
                            "tenant {} name mismatch on restored cluster '{}'",
                            id, name
                        );
                    }
                }
                AccessTime::AfterBackup => {
                    assert!(
                        !tenant_map.contains_key(id),
                        "tenant {} created after backup survived restore of cluster '{}'",
                        id,
                        name
                    );
                }
                // During-backup creations are indeterminate: present or
                // absent depending on the exact backup cut point.
                _ => {
                    if tenant_map.contains_key(id) {
                        expected_tenants += 1;
                    }
                }
            }
        }

        // Any untracked resident must be an undelete from overlapping
        // recovery of both the directory and the data cluster.
        let mut unexpected_tenants = 0usize;
        for id in tenant_map.keys() {
            if !record.tenants.contains(id) {
                assert!(
                    self.recover_management,
                    "untracked tenant {} on restored cluster '{}' without directory recovery",
                    id,
                    name
                );
                assert!(
                    model.is_tombstoned(*id),
                    "untracked tenant {} on restored cluster '{}' is not tombstoned",
                    id,
                    name
                );
                unexpected_tenants += 1;
            }
        }

        assert_eq!(
            tenant_map.len() - unexpected_tenants,
            expected_tenants,
            "restored cluster '{}' tenant count mismatch",
            name
        );
    }

    /// Verify the management directory against the reference model and, when
    /// the directory was not recovered, against its pre-restore snapshot.
    async fn check_management_directory(
        &self,
        model: &ReferenceModel,
        before_restore: &[(TenantId, TenantMapEntry)],
    ) {
        info!(self.logger, "checking management directory");
        let tenant_map: BTreeMap<TenantId, TenantMapEntry> =
            self.management.scan_tenants().await.into_iter().collect();

        // Every tenant present before the restore must still be present, and
        // unchanged except for tenants on restored clusters that fell into an
        // error state (the state and message are ignored for those).
        for (id, pre_entry) in before_restore {
            let entry = tenant_map.get(id).unwrap_or_else(|| {
                panic!("tenant {} vanished from the management directory", id)
            });
            let mut comparable = entry.clone();
            if comparable.state == TenantState::Error {
                let cluster = comparable
                    .assigned_cluster
                    .as_deref()
                    .unwrap_or_else(|| panic!("directory tenant {} has no assigned cluster", id));
                assert!(
                    model.cluster(cluster).restored,
                    "tenant {} is in error state but its cluster '{}' was never restored",
                    id,
                    cluster
                );
                comparable.state = pre_entry.state;
                comparable.error = pre_entry.error.clone();
            }
            assert_eq!(
                *pre_entry, comparable,
                "tenant {} changed in the management directory across restore",
                id
            );
        }
        if !before_restore.is_empty() {
            assert_eq!(
                before_restore.len(),
                tenant_map.len(),
                "management directory tenant count changed across restore"
            );
        }

        // Classify every tracked tenant.
        for (id, tracked) in model.tenants() {
            match tenant_map.get(&id) {
                None => {
                    // Only losable when both the directory and the tenant's
                    // cluster were recovered, and only for post-backup
                    // creations.
                    assert_ne!(
                        tracked.create_time,
                        AccessTime::BeforeBackup,
                        "tenant {} created before backup is missing from the directory",
                        id
                    );
                    assert!(
                        model.cluster(&tracked.cluster).restored && self.recover_management,
                        "tenant {} missing from the directory without double recovery",
                        id
                    );
                }
                Some(entry) => {
                    if tracked.create_time != AccessTime::BeforeBackup
                        && model.cluster(&tracked.cluster).restored
                    {
                        assert!(
                            entry.state == TenantState::Error
                                || (entry.state == TenantState::Ready
                                    && tracked.create_time == AccessTime::DuringBackup),
                            "tenant {} on restored cluster '{}' has unexpected state {:?}",
                            id,
                            tracked.cluster,
                            entry.state
                        );
                        if entry.state == TenantState::Error {
                            assert!(
                                model.cluster(&tracked.cluster).restore_has_messages,
                                "tenant {} is in error state but cluster '{}' restored cleanly",
                                id,
                                tracked.cluster
                            );
                        }
                    } else {
                        assert_eq!(
                            entry.state,
                            TenantState::Ready,
                            "tenant {} should be ready in the directory",
                            id
                        );
                    }
                }
            }
        }

        // Untracked directory entries must be undeletes from double recovery.
        for (id, entry) in &tenant_map {
            if !model.contains_tenant(*id) {
                assert!(
                    model.is_tombstoned(*id),
                    "directory tenant {} ('{}') was never tracked nor deleted",
                    id,
                    entry.name
                );
                assert!(
                    self.recover_management && self.recover_data,
                    "undeleted tenant {} in the directory without double recovery",
                    id
                );
            }
        }
    }
}
