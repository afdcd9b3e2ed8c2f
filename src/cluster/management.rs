//! Simulated management cluster: the authoritative tenant/group directory
//! plus cluster registration and capacity metadata.
//!
//! Every public operation is one committed transaction against the directory.
//! Tenant mutations write through to the assigned data cluster's mirror
//! entry, the way the real directory drives its two-phase tenant updates.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use slog::{debug, info, Logger};
use tokio::sync::Mutex;

use crate::auth::{Caller, StandardAccessPolicy, TenantAccessPolicy};
use crate::cluster::{
    DataCluster, DataClusterEntry, FaultInjector, MetaclusterRegistration,
    MAX_TENANTS_PER_CLUSTER,
};
use crate::error::{MetaclusterError, Result};
use crate::model::{ClusterName, TenantGroupName, TenantId, TenantMapEntry, TenantState};

/// Directory entry for a tenant group: the cluster its members co-reside on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantGroupEntry {
    pub assigned_cluster: ClusterName,
}

struct RegisteredCluster {
    entry: DataClusterEntry,
    handle: Arc<DataCluster>,
}

#[derive(Default)]
struct ManagementState {
    registration: Option<MetaclusterRegistration>,
    id_prefix: i64,
    next_counter: i64,
    tenants: BTreeMap<TenantId, TenantMapEntry>,
    name_index: BTreeMap<String, TenantId>,
    groups: BTreeMap<TenantGroupName, TenantGroupEntry>,
    group_index: BTreeMap<TenantGroupName, BTreeSet<TenantId>>,
    clusters: BTreeMap<ClusterName, RegisteredCluster>,
}

impl ManagementState {
    fn registration(&self) -> &MetaclusterRegistration {
        self.registration
            .as_ref()
            .expect("directory operation issued against a cluster with no metacluster registration")
    }

    fn allocate_id(&mut self) -> TenantId {
        let id = (self.id_prefix << 48) | self.next_counter;
        self.next_counter += 1;
        id
    }

    /// Allocation units consumed on a cluster: one per resident tenant group
    /// plus one per ungrouped tenant.
    fn allocation_units(&self, cluster: &str) -> u32 {
        let groups = self
            .groups
            .values()
            .filter(|g| g.assigned_cluster == cluster)
            .count();
        let ungrouped = self
            .tenants
            .values()
            .filter(|t| t.assigned_cluster.as_deref() == Some(cluster) && t.tenant_group.is_none())
            .count();
        (groups + ungrouped) as u32
    }

    fn spare_units(&self, cluster: &str) -> u32 {
        let capacity = self
            .clusters
            .get(cluster)
            .map(|c| c.entry.capacity)
            .unwrap_or(0);
        capacity.saturating_sub(self.allocation_units(cluster))
    }

    fn remove_tenant_entry(&mut self, id: TenantId) -> Option<TenantMapEntry> {
        let entry = self.tenants.remove(&id)?;
        self.name_index.remove(&entry.name);
        if let Some(group) = &entry.tenant_group {
            if let Some(members) = self.group_index.get_mut(group) {
                members.remove(&id);
                if members.is_empty() {
                    self.group_index.remove(group);
                    self.groups.remove(group);
                }
            }
        }
        Some(entry)
    }

    fn insert_tenant_entry(&mut self, entry: TenantMapEntry) {
        self.name_index.insert(entry.name.clone(), entry.id);
        if let Some(group) = &entry.tenant_group {
            let cluster = entry
                .assigned_cluster
                .clone()
                .expect("directory tenant entry missing an assigned cluster");
            self.groups
                .entry(group.clone())
                .or_insert_with(|| TenantGroupEntry {
                    assigned_cluster: cluster,
                });
            self.group_index.entry(group.clone()).or_default().insert(entry.id);
        }
        self.tenants.insert(entry.id, entry);
    }
}

pub struct ManagementCluster {
    state: Mutex<ManagementState>,
    policy: Arc<dyn TenantAccessPolicy>,
    faults: FaultInjector,
    logger: Logger,
}

impl ManagementCluster {
    pub fn new(logger: Logger) -> Self {
        Self {
            state: Mutex::new(ManagementState::default()),
            policy: Arc::new(StandardAccessPolicy),
            faults: FaultInjector::disabled(),
            logger,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn TenantAccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Enable transient-conflict injection on foreground tenant operations.
    pub fn with_fault_injection(mut self, probability: f64, seed: u64) -> Self {
        self.faults = FaultInjector::with_probability(probability, seed);
        self
    }

    /// Create the metacluster registration with a fresh id and the given
    /// tenant id prefix. Fails if a registration already exists.
    pub async fn create_metacluster(&self, name: &str, id_prefix: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.registration.is_some() {
            return Err(MetaclusterError::MetaclusterAlreadyExists);
        }
        info!(self.logger, "creating metacluster"; "name" => name, "id_prefix" => id_prefix);
        state.registration = Some(MetaclusterRegistration::management(name));
        state.id_prefix = id_prefix;
        state.next_counter = 0;
        Ok(())
    }

    pub async fn registration(&self) -> Option<MetaclusterRegistration> {
        self.state.lock().await.registration.clone()
    }

    /// Erase the whole directory, registration included.
    pub async fn reset(&self) {
        info!(self.logger, "erasing management cluster");
        *self.state.lock().await = ManagementState::default();
    }

    /// Register a data cluster and stamp its metacluster membership.
    pub async fn register_cluster(
        &self,
        name: &str,
        handle: Arc<DataCluster>,
        capacity: u32,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.clusters.contains_key(name) {
            return Err(MetaclusterError::ClusterAlreadyExists {
                name: name.to_string(),
            });
        }
        let registration = state.registration().for_data_cluster(name);
        info!(self.logger, "registering data cluster"; "cluster" => name, "capacity" => capacity);
        state.clusters.insert(
            name.to_string(),
            RegisteredCluster {
                entry: DataClusterEntry { capacity },
                handle: handle.clone(),
            },
        );
        handle.set_registration(registration).await;
        Ok(())
    }

    /// Raise a cluster's group-capacity budget. Capacity never shrinks.
    pub async fn update_cluster_capacity(&self, name: &str, capacity: u32) -> Result<()> {
        let mut state = self.state.lock().await;
        let cluster = state
            .clusters
            .get_mut(name)
            .ok_or_else(|| MetaclusterError::ClusterNotFound {
                name: name.to_string(),
            })?;
        cluster.entry.capacity = cluster.entry.capacity.max(capacity);
        Ok(())
    }

    pub async fn cluster_capacity(&self, name: &str) -> Result<u32> {
        let state = self.state.lock().await;
        state
            .clusters
            .get(name)
            .map(|c| c.entry.capacity)
            .ok_or_else(|| MetaclusterError::ClusterNotFound {
                name: name.to_string(),
            })
    }

    /// Remove a cluster and every directory entry attributed to it. Used to
    /// undo a partially-applied restore attempt.
    pub async fn remove_cluster(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.clusters.remove(name).is_none() {
            return Err(MetaclusterError::ClusterNotFound {
                name: name.to_string(),
            });
        }
        let ids: Vec<TenantId> = state
            .tenants
            .values()
            .filter(|t| t.assigned_cluster.as_deref() == Some(name))
            .map(|t| t.id)
            .collect();
        for id in ids {
            state.remove_tenant_entry(id);
        }
        info!(self.logger, "removed data cluster from directory"; "cluster" => name);
        Ok(())
    }

    /// Create a tenant, assigning it automatically to the data cluster with
    /// the most spare group capacity (or to its group's resident cluster).
    pub async fn create_tenant(&self, name: &str, tenant_group: Option<&str>) -> Result<TenantMapEntry> {
        self.faults.maybe_conflict()?;
        let mut state = self.state.lock().await;
        if state.name_index.contains_key(name) {
            return Err(MetaclusterError::TenantAlreadyExists {
                name: name.to_string(),
            });
        }

        let cluster = match tenant_group.and_then(|g| state.groups.get(g)) {
            // Joining an existing group consumes no new allocation unit.
            Some(group_entry) => group_entry.assigned_cluster.clone(),
            None => {
                let candidate = state
                    .clusters
                    .keys()
                    .map(|cluster| (cluster.clone(), state.spare_units(cluster)))
                    .filter(|(_, spare)| *spare > 0)
                    .max_by_key(|(_, spare)| *spare);
                match candidate {
                    Some((cluster, _)) => cluster,
                    None => return Err(MetaclusterError::MetaclusterNoCapacity),
                }
            }
        };

        let id = state.allocate_id();
        let entry = TenantMapEntry::new(id, name, tenant_group).assigned_to(&cluster);
        state.insert_tenant_entry(entry.clone());

        let handle = state
            .clusters
            .get(&cluster)
            .map(|c| c.handle.clone())
            .expect("tenant assigned to an unregistered cluster");
        let mut local = entry.clone();
        local.assigned_cluster = None;
        handle.create_local(local).await;

        debug!(self.logger, "created tenant"; "tenant" => name, "tenant_id" => id, "cluster" => &cluster);
        Ok(entry)
    }

    pub async fn get_tenant(&self, name: &str) -> Result<TenantMapEntry> {
        self.faults.maybe_conflict()?;
        let state = self.state.lock().await;
        state
            .name_index
            .get(name)
            .and_then(|id| state.tenants.get(id))
            .cloned()
            .ok_or_else(|| MetaclusterError::TenantNotFound {
                name: name.to_string(),
            })
    }

    /// Delete a tenant by name, mirroring the delete to its data cluster.
    pub async fn delete_tenant(&self, caller: &Caller, name: &str) -> Result<()> {
        self.faults.maybe_conflict()?;
        let mut state = self.state.lock().await;
        let id = *state
            .name_index
            .get(name)
            .ok_or_else(|| MetaclusterError::TenantNotFound {
                name: name.to_string(),
            })?;
        if !self.policy.allows(caller, id) {
            return Err(MetaclusterError::PermissionDenied { tenant: id });
        }
        self.delete_locked(&mut state, id).await;
        debug!(self.logger, "deleted tenant"; "tenant" => name, "tenant_id" => id);
        Ok(())
    }

    /// Delete a tenant by id; used by collision resolution where the name is
    /// ambiguous between two ids.
    pub async fn delete_tenant_by_id(&self, caller: &Caller, id: TenantId) -> Result<()> {
        self.faults.maybe_conflict()?;
        let mut state = self.state.lock().await;
        if !state.tenants.contains_key(&id) {
            return Err(MetaclusterError::TenantNotFound {
                name: format!("id {}", id),
            });
        }
        if !self.policy.allows(caller, id) {
            return Err(MetaclusterError::PermissionDenied { tenant: id });
        }
        self.delete_locked(&mut state, id).await;
        debug!(self.logger, "deleted tenant by id"; "tenant_id" => id);
        Ok(())
    }

    async fn delete_locked(&self, state: &mut ManagementState, id: TenantId) {
        if let Some(entry) = state.remove_tenant_entry(id) {
            let handle = entry
                .assigned_cluster
                .as_ref()
                .and_then(|c| state.clusters.get(c))
                .map(|c| c.handle.clone());
            if let Some(handle) = handle {
                handle.delete_tenant_system(id).await;
            }
        }
    }

    /// Rename a tenant, mirroring the rename to its data cluster.
    pub async fn rename_tenant(&self, caller: &Caller, old_name: &str, new_name: &str) -> Result<()> {
        self.faults.maybe_conflict()?;
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let id = *state
            .name_index
            .get(old_name)
            .ok_or_else(|| MetaclusterError::TenantNotFound {
                name: old_name.to_string(),
            })?;
        if state.name_index.contains_key(new_name) {
            return Err(MetaclusterError::TenantAlreadyExists {
                name: new_name.to_string(),
            });
        }
        if !self.policy.allows(caller, id) {
            return Err(MetaclusterError::PermissionDenied { tenant: id });
        }

        state.name_index.remove(old_name);
        state.name_index.insert(new_name.to_string(), id);
        let handle = {
            let entry = state
                .tenants
                .get_mut(&id)
                .expect("name index pointed at a missing tenant entry");
            entry.name = new_name.to_string();
            entry
                .assigned_cluster
                .as_ref()
                .and_then(|c| state.clusters.get(c))
                .map(|c| c.handle.clone())
        };
        if let Some(handle) = handle {
            handle.rename_local(id, new_name).await;
        }
        debug!(self.logger, "renamed tenant"; "old" => old_name, "new" => new_name, "tenant_id" => id);
        Ok(())
    }

    /// Change a tenant's group, mirroring the change to its data cluster.
    ///
    /// The new group must not live on another cluster; a configuration that
    /// needs a fresh allocation unit on a full cluster fails with
    /// `ClusterNoCapacity`.
    pub async fn configure_tenant(
        &self,
        caller: &Caller,
        name: &str,
        new_group: Option<&str>,
    ) -> Result<()> {
        self.faults.maybe_conflict()?;
        let mut state = self.state.lock().await;
        let state = &mut *state;
        let id = *state
            .name_index
            .get(name)
            .ok_or_else(|| MetaclusterError::TenantNotFound {
                name: name.to_string(),
            })?;
        if !self.policy.allows(caller, id) {
            return Err(MetaclusterError::PermissionDenied { tenant: id });
        }

        let (cluster, old_group) = {
            let entry = state
                .tenants
                .get(&id)
                .expect("name index pointed at a missing tenant entry");
            if entry.tenant_group.as_deref() == new_group {
                return Ok(());
            }
            (
                entry
                    .assigned_cluster
                    .clone()
                    .expect("directory tenant entry missing an assigned cluster"),
                entry.tenant_group.clone(),
            )
        };

        if let Some(group) = new_group {
            if let Some(group_entry) = state.groups.get(group) {
                if group_entry.assigned_cluster != cluster {
                    return Err(MetaclusterError::InvalidTenantConfiguration {
                        reason: format!(
                            "tenant group '{}' is assigned to cluster '{}'",
                            group, group_entry.assigned_cluster
                        ),
                    });
                }
            }
        }

        // Units freed by leaving the old assignment, units needed by the new.
        let freed: u32 = match &old_group {
            None => 1,
            Some(group) => {
                let last_member = state
                    .group_index
                    .get(group)
                    .map(|members| members.len() == 1)
                    .unwrap_or(false);
                if last_member {
                    1
                } else {
                    0
                }
            }
        };
        let needed: u32 = match new_group {
            None => 1,
            Some(group) => {
                if state.groups.contains_key(group) {
                    0
                } else {
                    1
                }
            }
        };
        if needed > freed && needed - freed > state.spare_units(&cluster) {
            return Err(MetaclusterError::ClusterNoCapacity { cluster });
        }

        if let Some(group) = &old_group {
            if let Some(members) = state.group_index.get_mut(group) {
                members.remove(&id);
                if members.is_empty() {
                    state.group_index.remove(group);
                    state.groups.remove(group);
                }
            }
        }
        if let Some(group) = new_group {
            state
                .groups
                .entry(group.to_string())
                .or_insert_with(|| TenantGroupEntry {
                    assigned_cluster: cluster.clone(),
                });
            state.group_index.entry(group.to_string()).or_default().insert(id);
        }
        let handle = {
            let entry = state
                .tenants
                .get_mut(&id)
                .expect("name index pointed at a missing tenant entry");
            entry.tenant_group = new_group.map(str::to_string);
            entry
                .assigned_cluster
                .as_ref()
                .and_then(|c| state.clusters.get(c))
                .map(|c| c.handle.clone())
        };
        if let Some(handle) = handle {
            handle.set_group_local(id, new_group).await;
        }
        debug!(self.logger, "configured tenant"; "tenant" => name, "tenant_id" => id,
               "old_group" => ?old_group, "new_group" => ?new_group);
        Ok(())
    }

    /// Range scan of the directory's tenant map, sorted by id.
    pub async fn scan_tenants(&self) -> Vec<(TenantId, TenantMapEntry)> {
        let state = self.state.lock().await;
        let results: Vec<_> = state.tenants.iter().map(|(id, e)| (*id, e.clone())).collect();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "directory tenant map scan exceeded {} entries",
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Range scan of the directory's tenant name index.
    pub async fn scan_name_index(&self) -> Vec<(String, TenantId)> {
        let state = self.state.lock().await;
        let results: Vec<_> = state.name_index.iter().map(|(n, id)| (n.clone(), *id)).collect();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "directory name index scan exceeded {} entries",
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Range scan of the directory's tenant group map.
    pub async fn scan_groups(&self) -> Vec<(TenantGroupName, TenantGroupEntry)> {
        let state = self.state.lock().await;
        state
            .groups
            .iter()
            .map(|(name, entry)| (name.clone(), entry.clone()))
            .collect()
    }

    /// Members of a group, via the directory's group-to-tenant index.
    pub async fn tenants_in_group(&self, group: &str) -> Vec<TenantId> {
        let state = self.state.lock().await;
        let results: Vec<_> = state
            .group_index
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "directory group index scan exceeded {} entries",
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Attach a data cluster during restore.
    ///
    /// With `apply_management_updates` the directory is authoritative: the
    /// data cluster's local map is reconciled to match it, and tenants the
    /// directory expected but the cluster lost are marked `Error` with an
    /// advisory message. Without it, the data cluster is authoritative: its
    /// local map is imported into the directory, failing on the first name or
    /// group collision and leaving the data cluster untouched.
    ///
    /// A dry run reports the same advisory messages without committing.
    pub async fn restore_cluster(
        &self,
        cluster_name: &str,
        data: &Arc<DataCluster>,
        apply_management_updates: bool,
        dry_run: bool,
        force_join_new_metacluster: bool,
        messages: &mut Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let registration = state.registration().clone();

        if let Some(data_registration) = data.registration().await {
            if data_registration.metacluster_id != registration.metacluster_id
                && !force_join_new_metacluster
            {
                return Err(MetaclusterError::ClusterAlreadyRegistered {
                    name: cluster_name.to_string(),
                });
            }
        }

        info!(self.logger, "restoring cluster into metacluster";
              "cluster" => cluster_name,
              "apply_management_updates" => apply_management_updates,
              "dry_run" => dry_run,
              "force_join_new_metacluster" => force_join_new_metacluster);

        if apply_management_updates {
            self.reattach_data_cluster(&mut state, cluster_name, data, dry_run, messages)
                .await?;
        } else {
            self.import_data_cluster(&mut state, cluster_name, data, dry_run, messages)
                .await?;
        }

        if !dry_run {
            data.set_registration(registration.for_data_cluster(cluster_name)).await;
        }
        Ok(())
    }

    /// Directory-authoritative reattachment of a restored data cluster.
    async fn reattach_data_cluster(
        &self,
        state: &mut ManagementState,
        cluster_name: &str,
        data: &Arc<DataCluster>,
        dry_run: bool,
        messages: &mut Vec<String>,
    ) -> Result<()> {
        if !state.clusters.contains_key(cluster_name) {
            return Err(MetaclusterError::ClusterNotFound {
                name: cluster_name.to_string(),
            });
        }

        let local: BTreeMap<TenantId, TenantMapEntry> =
            data.scan_tenants().await.into_iter().collect();

        let expected: Vec<TenantId> = state
            .tenants
            .values()
            .filter(|t| t.assigned_cluster.as_deref() == Some(cluster_name))
            .map(|t| t.id)
            .collect();

        for id in expected {
            let (name, group) = {
                let entry = &state.tenants[&id];
                (entry.name.clone(), entry.tenant_group.clone())
            };
            match local.get(&id) {
                None => {
                    messages.push(format!(
                        "tenant '{}' (id {}) was not found on data cluster '{}'",
                        name, id, cluster_name
                    ));
                    if !dry_run {
                        let entry = state
                            .tenants
                            .get_mut(&id)
                            .expect("expected tenant vanished mid-restore");
                        entry.state = TenantState::Error;
                        entry.error =
                            format!("tenant not found on data cluster '{}'", cluster_name);
                    }
                }
                Some(local_entry) => {
                    if (local_entry.name != name || local_entry.tenant_group != group) && !dry_run {
                        data.overwrite_local(id, &name, group.as_deref()).await;
                    }
                }
            }
        }

        for (id, local_entry) in &local {
            let expected_here = state
                .tenants
                .get(id)
                .map(|t| t.assigned_cluster.as_deref() == Some(cluster_name))
                .unwrap_or(false);
            if !expected_here {
                messages.push(format!(
                    "tenant '{}' (id {}) on data cluster '{}' is not part of the metacluster",
                    local_entry.name, id, cluster_name
                ));
                if !dry_run {
                    data.delete_tenant_system(*id).await;
                }
            }
        }

        Ok(())
    }

    /// Data-authoritative import of a cluster's tenant map into a rebuilt
    /// directory. Reads only; a collision aborts the import, leaving partial
    /// directory state for the caller to remove.
    async fn import_data_cluster(
        &self,
        state: &mut ManagementState,
        cluster_name: &str,
        data: &Arc<DataCluster>,
        dry_run: bool,
        messages: &mut Vec<String>,
    ) -> Result<()> {
        if state.clusters.contains_key(cluster_name) {
            return Err(MetaclusterError::ClusterAlreadyExists {
                name: cluster_name.to_string(),
            });
        }

        let local = data.scan_tenants().await;
        let local_groups = data.scan_groups().await;

        if dry_run {
            for (id, entry) in &local {
                if let Some(&existing) = state.name_index.get(&entry.name) {
                    if existing != *id {
                        messages.push(format!(
                            "tenant '{}' already exists in the metacluster with id {}",
                            entry.name, existing
                        ));
                    }
                }
            }
            for group in &local_groups {
                if let Some(group_entry) = state.groups.get(group) {
                    if group_entry.assigned_cluster != cluster_name {
                        messages.push(format!(
                            "tenant group '{}' already exists in the metacluster on cluster '{}'",
                            group, group_entry.assigned_cluster
                        ));
                    }
                }
            }
            return Ok(());
        }

        // Tenants and groups found locally occupy exactly the cluster's
        // allocation budget at attach time; the budget only grows from here.
        let ungrouped = local
            .iter()
            .filter(|(_, entry)| entry.tenant_group.is_none())
            .count();
        let capacity = (local_groups.len() + ungrouped) as u32;
        state.clusters.insert(
            cluster_name.to_string(),
            RegisteredCluster {
                entry: DataClusterEntry { capacity },
                handle: data.clone(),
            },
        );

        for (id, local_entry) in local {
            if let Some(&existing) = state.name_index.get(&local_entry.name) {
                if existing != id {
                    messages.push(format!(
                        "tenant '{}' already exists in the metacluster with id {}",
                        local_entry.name, existing
                    ));
                    return Err(MetaclusterError::TenantAlreadyExists {
                        name: local_entry.name,
                    });
                }
                continue;
            }
            if let Some(group) = &local_entry.tenant_group {
                if let Some(group_entry) = state.groups.get(group) {
                    if group_entry.assigned_cluster != cluster_name {
                        messages.push(format!(
                            "tenant group '{}' already exists in the metacluster on cluster '{}'",
                            group, group_entry.assigned_cluster
                        ));
                        return Err(MetaclusterError::InvalidTenantConfiguration {
                            reason: format!(
                                "tenant group '{}' is assigned to cluster '{}'",
                                group, group_entry.assigned_cluster
                            ),
                        });
                    }
                }
            }

            let entry = TenantMapEntry {
                id,
                name: local_entry.name,
                tenant_group: local_entry.tenant_group,
                assigned_cluster: Some(cluster_name.to_string()),
                state: TenantState::Ready,
                error: String::new(),
            };
            state.insert_tenant_entry(entry);
        }

        Ok(())
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

    async fn metacluster_with_capacity(capacity: u32) -> (ManagementCluster, Arc<DataCluster>) {
        let logger = test_logger();
        let management = ManagementCluster::new(logger.clone());
        management.create_metacluster("management_cluster", 7).await.unwrap();
        let data = Arc::new(DataCluster::new("cluster_00000000", logger));
        management
            .register_cluster("cluster_00000000", data.clone(), capacity)
            .await
            .unwrap();
        (management, data)
    }

    #[tokio::test]
    async fn test_create_assigns_cluster_and_mirrors() {
        let (management, data) = metacluster_with_capacity(4).await;

        let entry = management.create_tenant("tenant00000001", Some("group1")).await.unwrap();
        assert_eq!(entry.assigned_cluster.as_deref(), Some("cluster_00000000"));
        assert_eq!(entry.state, TenantState::Ready);

        let local = data.scan_tenants().await;
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].1.name, "tenant00000001");
        assert_eq!(local[0].1.assigned_cluster, None);
    }

    #[tokio::test]
    async fn test_create_exhausts_capacity() {
        let (management, _data) = metacluster_with_capacity(1).await;

        management.create_tenant("tenant00000001", None).await.unwrap();
        let err = management.create_tenant("tenant00000002", None).await;
        assert!(matches!(err, Err(MetaclusterError::MetaclusterNoCapacity)));

        // Joining the existing group of a grouped tenant needs no new unit.
        management
            .update_cluster_capacity("cluster_00000000", 2)
            .await
            .unwrap();
        management.create_tenant("tenant00000002", Some("group1")).await.unwrap();
        management.create_tenant("tenant00000003", Some("group1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_rename_and_configure_mirror_to_data_cluster() {
        let (management, data) = metacluster_with_capacity(4).await;
        let caller = Caller::trusted();

        let entry = management.create_tenant("tenant00000001", None).await.unwrap();
        management
            .rename_tenant(&caller, "tenant00000001", "tenant00000009")
            .await
            .unwrap();
        management
            .configure_tenant(&caller, "tenant00000009", Some("group1"))
            .await
            .unwrap();

        let local: BTreeMap<_, _> = data.scan_tenants().await.into_iter().collect();
        let local_entry = &local[&entry.id];
        assert_eq!(local_entry.name, "tenant00000009");
        assert_eq!(local_entry.tenant_group.as_deref(), Some("group1"));
    }

    #[tokio::test]
    async fn test_mutations_respect_access_policy() {
        let (management, _data) = metacluster_with_capacity(4).await;
        let entry = management.create_tenant("tenant00000001", None).await.unwrap();

        let stranger = Caller::for_tenant(entry.id + 1);
        let err = management.delete_tenant(&stranger, "tenant00000001").await;
        assert!(matches!(err, Err(MetaclusterError::PermissionDenied { .. })));

        let owner = Caller::for_tenant(entry.id);
        management.delete_tenant(&owner, "tenant00000001").await.unwrap();
    }

    #[tokio::test]
    async fn test_configure_rejects_group_on_other_cluster() {
        let logger = test_logger();
        let management = ManagementCluster::new(logger.clone());
        management.create_metacluster("management_cluster", 7).await.unwrap();
        let data_a = Arc::new(DataCluster::new("cluster_a", logger.clone()));
        let data_b = Arc::new(DataCluster::new("cluster_b", logger));
        management.register_cluster("cluster_a", data_a, 1).await.unwrap();
        management.register_cluster("cluster_b", data_b, 1).await.unwrap();

        // Pin one group per cluster.
        management.create_tenant("tenant00000001", Some("group1")).await.unwrap();
        let second = management.create_tenant("tenant00000002", Some("group2")).await.unwrap();
        assert_ne!(
            second.assigned_cluster,
            management.get_tenant("tenant00000001").await.unwrap().assigned_cluster
        );

        let err = management
            .configure_tenant(&Caller::trusted(), "tenant00000002", Some("group1"))
            .await;
        assert!(matches!(err, Err(MetaclusterError::InvalidTenantConfiguration { .. })));
    }

    #[tokio::test]
    async fn test_remove_cluster_drops_its_directory_entries() {
        let (management, data) = metacluster_with_capacity(4).await;
        management.create_tenant("tenant00000001", Some("group1")).await.unwrap();

        management.remove_cluster("cluster_00000000").await.unwrap();
        assert!(management.scan_tenants().await.is_empty());
        assert!(management.scan_groups().await.is_empty());

        // Cleanup of a cluster that was never added is reported as not found.
        let err = management.remove_cluster("cluster_00000000").await;
        assert!(matches!(err, Err(MetaclusterError::ClusterNotFound { .. })));

        // The data cluster's local map is not touched by directory removal.
        assert_eq!(data.scan_tenants().await.len(), 1);
    }
}
