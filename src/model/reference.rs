//! The reference model aggregate.
//!
//! A single owned aggregate passed by exclusive reference into each
//! component; all cross-references are tenant ids and names resolved through
//! the aggregate's indices rather than embedded pointers.

use std::collections::{BTreeMap, BTreeSet};

use crate::model::types::{
    AccessTime, ClusterName, DataClusterRecord, TenantGroupName, TenantGroupRecord, TenantId,
    TenantRecord,
};

/// Expected global state of the metacluster, maintained by whichever task
/// most recently committed a mutation against the management directory.
#[derive(Debug, Default)]
pub struct ReferenceModel {
    tenants: BTreeMap<TenantId, TenantRecord>,
    name_index: BTreeMap<String, TenantId>,
    groups: BTreeMap<TenantGroupName, TenantGroupRecord>,
    clusters: BTreeMap<ClusterName, DataClusterRecord>,
    tombstones: BTreeSet<TenantId>,
}

impl ReferenceModel {
    pub fn new<I, S>(cluster_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClusterName>,
    {
        let mut model = Self::default();
        for name in cluster_names {
            model.clusters.insert(name.into(), DataClusterRecord::default());
        }
        model
    }

    /// Record a committed tenant creation.
    pub fn record_create(
        &mut self,
        id: TenantId,
        name: &str,
        cluster: &str,
        tenant_group: Option<&str>,
        at: AccessTime,
    ) {
        self.tenants
            .insert(id, TenantRecord::new(name, cluster, tenant_group, at));
        self.name_index.insert(name.to_string(), id);

        let cluster_record = self
            .clusters
            .get_mut(cluster)
            .unwrap_or_else(|| panic!("reference model has no cluster record for '{}'", cluster));
        cluster_record.tenants.insert(id);

        if let Some(group) = tenant_group {
            let group_record = self.groups.entry(group.to_string()).or_default();
            group_record.cluster = cluster.to_string();
            group_record.tenants.insert(id);
            cluster_record.tenant_groups.insert(group.to_string());
        }
    }

    /// Record a committed tenant deletion, retaining the id as a tombstone.
    pub fn record_delete(&mut self, id: TenantId) {
        let record = match self.tenants.remove(&id) {
            Some(record) => record,
            None => return,
        };

        self.name_index.remove(&record.name);
        let cluster_record = self
            .clusters
            .get_mut(&record.cluster)
            .unwrap_or_else(|| panic!("reference model has no cluster record for '{}'", record.cluster));
        cluster_record.tenants.remove(&id);

        if let Some(group) = &record.tenant_group {
            if let Some(group_record) = self.groups.get_mut(group) {
                group_record.tenants.remove(&id);
                if group_record.tenants.is_empty() {
                    self.groups.remove(group);
                    cluster_record.tenant_groups.remove(group);
                }
            }
        }

        self.tombstones.insert(id);
    }

    /// Record a committed rename, keeping the name index in step.
    pub fn record_rename(&mut self, id: TenantId, new_name: &str, at: AccessTime) {
        let record = self
            .tenants
            .get_mut(&id)
            .unwrap_or_else(|| panic!("rename recorded for untracked tenant {}", id));
        self.name_index.remove(&record.name);
        self.name_index.insert(new_name.to_string(), id);
        record.name = new_name.to_string();
        record.rename_time = at;
    }

    /// Record a committed tenant-group change. A no-op (and no access-time
    /// update) when the group is unchanged.
    pub fn record_regroup(&mut self, id: TenantId, new_group: Option<&str>, at: AccessTime) {
        let record = match self.tenants.get_mut(&id) {
            Some(record) => record,
            None => panic!("regroup recorded for untracked tenant {}", id),
        };
        if record.tenant_group.as_deref() == new_group {
            return;
        }

        let cluster = record.cluster.clone();
        let old_group = record.tenant_group.take();
        record.tenant_group = new_group.map(str::to_string);
        record.configure_time = at;

        let cluster_record = self
            .clusters
            .get_mut(&cluster)
            .unwrap_or_else(|| panic!("reference model has no cluster record for '{}'", cluster));

        if let Some(group) = old_group {
            if let Some(group_record) = self.groups.get_mut(&group) {
                group_record.tenants.remove(&id);
                if group_record.tenants.is_empty() {
                    self.groups.remove(&group);
                    cluster_record.tenant_groups.remove(&group);
                }
            }
        }

        if let Some(group) = new_group {
            let group_record = self.groups.entry(group.to_string()).or_default();
            group_record.cluster = cluster.clone();
            group_record.tenants.insert(id);
            cluster_record.tenant_groups.insert(group.to_string());
        }
    }

    /// Stop tracking a tenant that restore decided must not survive.
    ///
    /// Cascades removal from its cluster and group sets and moves the id to
    /// the tombstone set. The name index is left untouched: only the driver
    /// maintains it, and the driver has quiesced by the time restore runs.
    pub fn remove_tracked_tenant(&mut self, id: TenantId) {
        let record = match self.tenants.remove(&id) {
            Some(record) => record,
            None => return,
        };
        self.tombstones.insert(id);
        if let Some(cluster_record) = self.clusters.get_mut(&record.cluster) {
            cluster_record.tenants.remove(&id);
        }
        if let Some(group) = &record.tenant_group {
            if let Some(group_record) = self.groups.get_mut(group) {
                group_record.tenants.remove(&id);
            }
        }
    }

    /// Mark a cluster as restored and record the lossy-recovery signal.
    pub fn mark_restored(&mut self, cluster: &str, has_messages: bool) {
        let cluster_record = self
            .clusters
            .get_mut(cluster)
            .unwrap_or_else(|| panic!("reference model has no cluster record for '{}'", cluster));
        cluster_record.restored = true;
        cluster_record.restore_has_messages = has_messages;
    }

    pub fn tenant(&self, id: TenantId) -> Option<&TenantRecord> {
        self.tenants.get(&id)
    }

    pub fn contains_tenant(&self, id: TenantId) -> bool {
        self.tenants.contains_key(&id)
    }

    pub fn tenants(&self) -> impl Iterator<Item = (TenantId, &TenantRecord)> {
        self.tenants.iter().map(|(id, record)| (*id, record))
    }

    pub fn tenant_count(&self) -> usize {
        self.tenants.len()
    }

    pub fn tenant_id_by_name(&self, name: &str) -> Option<TenantId> {
        self.name_index.get(name).copied()
    }

    pub fn name_in_use(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    pub fn group(&self, name: &str) -> Option<&TenantGroupRecord> {
        self.groups.get(name)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Members of a tracked group
    pub fn tenants_in_group(&self, name: &str) -> Vec<TenantId> {
        self.groups
            .get(name)
            .map(|record| record.tenants.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Last-known resident cluster of a tracked group
    pub fn cluster_for_group(&self, name: &str) -> Option<&str> {
        self.groups.get(name).map(|record| record.cluster.as_str())
    }

    pub fn cluster(&self, name: &str) -> &DataClusterRecord {
        self.clusters
            .get(name)
            .unwrap_or_else(|| panic!("reference model has no cluster record for '{}'", name))
    }

    pub fn clusters(&self) -> impl Iterator<Item = (&str, &DataClusterRecord)> {
        self.clusters.iter().map(|(name, record)| (name.as_str(), record))
    }

    pub fn groups_on_cluster(&self, cluster: &str) -> Vec<TenantGroupName> {
        self.cluster(cluster).tenant_groups.iter().cloned().collect()
    }

    pub fn is_tombstoned(&self, id: TenantId) -> bool {
        self.tombstones.contains(&id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ReferenceModel {
        ReferenceModel::new(["cluster_a", "cluster_b"])
    }

    #[test]
    fn test_create_updates_all_indices() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", Some("group1"), AccessTime::BeforeBackup);

        assert_eq!(m.tenant_id_by_name("tenant00000001"), Some(1));
        assert!(m.cluster("cluster_a").tenants.contains(&1));
        assert!(m.cluster("cluster_a").tenant_groups.contains("group1"));
        assert_eq!(m.cluster_for_group("group1"), Some("cluster_a"));
        assert_eq!(m.tenants_in_group("group1"), vec![1]);
    }

    #[test]
    fn test_delete_tombstones_and_drops_empty_group() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", Some("group1"), AccessTime::BeforeBackup);
        m.record_delete(1);

        assert!(!m.contains_tenant(1));
        assert!(m.is_tombstoned(1));
        assert!(!m.name_in_use("tenant00000001"));
        assert!(m.group("group1").is_none());
        assert!(!m.cluster("cluster_a").tenant_groups.contains("group1"));
    }

    #[test]
    fn test_rename_moves_name_index_atomically() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", None, AccessTime::BeforeBackup);
        m.record_rename(1, "tenant00000002", AccessTime::DuringBackup);

        assert_eq!(m.tenant_id_by_name("tenant00000002"), Some(1));
        assert!(!m.name_in_use("tenant00000001"));
        assert_eq!(m.tenant(1).unwrap().rename_time, AccessTime::DuringBackup);
    }

    #[test]
    fn test_regroup_moves_membership_between_groups() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", Some("group1"), AccessTime::BeforeBackup);
        m.record_create(2, "tenant00000002", "cluster_a", Some("group1"), AccessTime::BeforeBackup);
        m.record_regroup(1, Some("group2"), AccessTime::AfterBackup);

        assert_eq!(m.tenants_in_group("group1"), vec![2]);
        assert_eq!(m.tenants_in_group("group2"), vec![1]);
        assert_eq!(m.tenant(1).unwrap().configure_time, AccessTime::AfterBackup);
        assert_eq!(m.cluster_for_group("group2"), Some("cluster_a"));
    }

    #[test]
    fn test_regroup_same_group_does_not_stamp_time() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", Some("group1"), AccessTime::BeforeBackup);
        m.record_regroup(1, Some("group1"), AccessTime::AfterBackup);

        assert_eq!(m.tenant(1).unwrap().configure_time, AccessTime::None);
    }

    #[test]
    fn test_remove_tracked_tenant_cascades_but_keeps_name_index() {
        let mut m = model();
        m.record_create(1, "tenant00000001", "cluster_a", Some("group1"), AccessTime::BeforeBackup);
        m.remove_tracked_tenant(1);

        assert!(!m.contains_tenant(1));
        assert!(m.is_tombstoned(1));
        assert!(!m.cluster("cluster_a").tenants.contains(&1));
        assert!(m.tenants_in_group("group1").is_empty());
        // Only full deletes maintain the name index.
        assert!(m.name_in_use("tenant00000001"));
    }

    #[test]
    fn test_access_time_ordering() {
        assert!(AccessTime::None < AccessTime::BeforeBackup);
        assert!(AccessTime::BeforeBackup < AccessTime::DuringBackup);
        assert!(AccessTime::DuringBackup < AccessTime::AfterBackup);
    }
}
