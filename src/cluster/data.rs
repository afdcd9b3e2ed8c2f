//! Simulated data cluster: the local mirror of the tenants assigned to it.
//!
//! Holds a tenant map keyed by id, a name index, a group-to-members index,
//! and the metacluster registration record. Tenant mutations arrive either as
//! mirror writes from the management directory or as local deletes during
//! collision resolution.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use slog::{debug, Logger};
use tokio::sync::Mutex;

use crate::auth::{Caller, StandardAccessPolicy, TenantAccessPolicy};
use crate::cluster::{MetaclusterRegistration, MAX_TENANTS_PER_CLUSTER};
use crate::error::{MetaclusterError, Result};
use crate::model::{TenantGroupName, TenantId, TenantMapEntry};

/// Full local state of a data cluster. Backups capture this wholesale and
/// restore replays it, registration record included.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataClusterState {
    pub registration: Option<MetaclusterRegistration>,
    pub tenants: BTreeMap<TenantId, TenantMapEntry>,
    pub name_index: BTreeMap<String, TenantId>,
    pub groups: BTreeMap<TenantGroupName, BTreeSet<TenantId>>,
}

pub struct DataCluster {
    name: String,
    state: Mutex<DataClusterState>,
    policy: Arc<dyn TenantAccessPolicy>,
    logger: Logger,
}

impl DataCluster {
    pub fn new(name: &str, logger: Logger) -> Self {
        Self::with_policy(name, Arc::new(StandardAccessPolicy), logger)
    }

    pub fn with_policy(name: &str, policy: Arc<dyn TenantAccessPolicy>, logger: Logger) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(DataClusterState::default()),
            policy,
            logger,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn registration(&self) -> Option<MetaclusterRegistration> {
        self.state.lock().await.registration.clone()
    }

    pub async fn set_registration(&self, registration: MetaclusterRegistration) {
        self.state.lock().await.registration = Some(registration);
    }

    /// Forget the old metacluster membership (cluster-side removal).
    /// Clears only the registration record; the tenant map is untouched.
    pub async fn forget_metacluster(&self) {
        debug!(self.logger, "forgetting metacluster registration"; "cluster" => &self.name);
        self.state.lock().await.registration = None;
    }

    /// Mirror write: insert a tenant entry created by the management cluster.
    pub async fn create_local(&self, entry: TenantMapEntry) {
        let mut state = self.state.lock().await;
        state.name_index.insert(entry.name.clone(), entry.id);
        if let Some(group) = &entry.tenant_group {
            state.groups.entry(group.clone()).or_default().insert(entry.id);
        }
        state.tenants.insert(entry.id, entry);
    }

    /// Mirror write: apply a committed rename.
    pub async fn rename_local(&self, id: TenantId, new_name: &str) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.tenants.get_mut(&id) {
            let old_name = std::mem::replace(&mut entry.name, new_name.to_string());
            state.name_index.remove(&old_name);
            state.name_index.insert(new_name.to_string(), id);
        }
    }

    /// Mirror write: apply a committed tenant-group change.
    pub async fn set_group_local(&self, id: TenantId, new_group: Option<&str>) {
        let mut state = self.state.lock().await;
        let old_group = match state.tenants.get_mut(&id) {
            Some(entry) => {
                std::mem::replace(&mut entry.tenant_group, new_group.map(str::to_string))
            }
            None => return,
        };
        if let Some(group) = old_group {
            if let Some(members) = state.groups.get_mut(&group) {
                members.remove(&id);
                if members.is_empty() {
                    state.groups.remove(&group);
                }
            }
        }
        if let Some(group) = new_group {
            state.groups.entry(group.to_string()).or_default().insert(id);
        }
    }

    /// Reattachment sync: overwrite a local entry's name and group with the
    /// management directory's authoritative values.
    pub async fn overwrite_local(&self, id: TenantId, name: &str, tenant_group: Option<&str>) {
        self.rename_local(id, name).await;
        self.set_group_local(id, tenant_group).await;
    }

    /// Local tenant deletion, subject to the authorization predicate.
    pub async fn delete_tenant(&self, caller: &Caller, name: &str, id: TenantId) -> Result<()> {
        if !self.policy.allows(caller, id) {
            return Err(MetaclusterError::PermissionDenied { tenant: id });
        }
        let mut state = self.state.lock().await;
        match state.tenants.get(&id) {
            Some(entry) if entry.name == name => {}
            _ => {
                return Err(MetaclusterError::TenantNotFound {
                    name: name.to_string(),
                })
            }
        }
        Self::remove_entry(&mut state, id);
        debug!(self.logger, "deleted local tenant"; "cluster" => &self.name, "tenant" => name, "tenant_id" => id);
        Ok(())
    }

    /// System-level deletion, bypassing the authorization predicate.
    /// Tolerates an absent tenant as a no-op (cleanup semantics).
    pub async fn delete_tenant_system(&self, id: TenantId) {
        let mut state = self.state.lock().await;
        if state.tenants.contains_key(&id) {
            Self::remove_entry(&mut state, id);
            debug!(self.logger, "system-deleted local tenant"; "cluster" => &self.name, "tenant_id" => id);
        }
    }

    fn remove_entry(state: &mut DataClusterState, id: TenantId) {
        if let Some(entry) = state.tenants.remove(&id) {
            state.name_index.remove(&entry.name);
            if let Some(group) = &entry.tenant_group {
                if let Some(members) = state.groups.get_mut(group) {
                    members.remove(&id);
                    if members.is_empty() {
                        state.groups.remove(group);
                    }
                }
            }
        }
    }

    /// Range scan of the local tenant map, sorted by id.
    pub async fn scan_tenants(&self) -> Vec<(TenantId, TenantMapEntry)> {
        let state = self.state.lock().await;
        let results: Vec<_> = state.tenants.iter().map(|(id, e)| (*id, e.clone())).collect();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "tenant map scan on data cluster '{}' exceeded {} entries",
            self.name,
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Range scan of the local name index.
    pub async fn scan_name_index(&self) -> Vec<(String, TenantId)> {
        let state = self.state.lock().await;
        let results: Vec<_> = state.name_index.iter().map(|(n, id)| (n.clone(), *id)).collect();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "name index scan on data cluster '{}' exceeded {} entries",
            self.name,
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Range scan of the local group index.
    pub async fn scan_groups(&self) -> Vec<TenantGroupName> {
        self.state.lock().await.groups.keys().cloned().collect()
    }

    /// Members of a local group, via the group-to-tenant index.
    pub async fn tenants_in_group(&self, group: &str) -> Vec<TenantId> {
        let state = self.state.lock().await;
        let results: Vec<_> = state
            .groups
            .get(group)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();
        assert!(
            results.len() <= MAX_TENANTS_PER_CLUSTER,
            "group index scan on data cluster '{}' exceeded {} entries",
            self.name,
            MAX_TENANTS_PER_CLUSTER
        );
        results
    }

    /// Canonical serialized form of the local tenant map, used for the
    /// before/after equality assertion during management-cluster restore.
    pub async fn snapshot_tenant_map(&self) -> Result<Vec<u8>> {
        let state = self.state.lock().await;
        serde_json::to_vec(&state.tenants).map_err(|e| MetaclusterError::SerializationError {
            reason: e.to_string(),
        })
    }

    /// Full state export for backup.
    pub async fn export_state(&self) -> DataClusterState {
        self.state.lock().await.clone()
    }

    /// Clear the tenant-data key ranges ahead of a restore.
    pub async fn clear_all(&self) {
        debug!(self.logger, "clearing data cluster state"; "cluster" => &self.name);
        *self.state.lock().await = DataClusterState::default();
    }

    /// Replay a backup into the cluster.
    pub async fn import_state(&self, state: DataClusterState) {
        *self.state.lock().await = state;
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
    async fn test_local_delete_checks_policy() {
        let cluster = DataCluster::new("cluster_a", test_logger());
        cluster.create_local(TenantMapEntry::new(1, "tenant00000001", None)).await;

        let denied = cluster
            .delete_tenant(&Caller::anonymous(), "tenant00000001", 1)
            .await;
        assert!(matches!(denied, Err(MetaclusterError::PermissionDenied { tenant: 1 })));

        cluster
            .delete_tenant(&Caller::for_tenant(1), "tenant00000001", 1)
            .await
            .unwrap();
        assert!(cluster.scan_tenants().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_index_follows_mirror_writes() {
        let cluster = DataCluster::new("cluster_a", test_logger());
        cluster
            .create_local(TenantMapEntry::new(1, "tenant00000001", Some("group1")))
            .await;
        cluster
            .create_local(TenantMapEntry::new(2, "tenant00000002", Some("group1")))
            .await;
        assert_eq!(cluster.tenants_in_group("group1").await, vec![1, 2]);

        cluster.set_group_local(1, Some("group2")).await;
        assert_eq!(cluster.tenants_in_group("group1").await, vec![2]);
        assert_eq!(cluster.tenants_in_group("group2").await, vec![1]);

        cluster.delete_tenant_system(2).await;
        assert!(cluster.scan_groups().await.contains(&"group2".to_string()));
        assert!(!cluster.scan_groups().await.contains(&"group1".to_string()));
    }

    #[tokio::test]
    async fn test_snapshot_is_deterministic() {
        let cluster = DataCluster::new("cluster_a", test_logger());
        cluster.create_local(TenantMapEntry::new(2, "tenant00000002", None)).await;
        cluster.create_local(TenantMapEntry::new(1, "tenant00000001", None)).await;

        let first = cluster.snapshot_tenant_map().await.unwrap();
        let second = cluster.snapshot_tenant_map().await.unwrap();
        assert_eq!(first, second);
    }
}
