//! Core tenant metadata types shared by the model, the simulated clusters,
//! and the consistency checker.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Process-unique tenant id assigned by the management cluster; never reused
pub type TenantId = i64;

pub type ClusterName = String;
pub type TenantGroupName = String;

/// When, relative to backup completion, a tenant mutation occurred.
///
/// The ordering is load-bearing: checker rules compare buckets, e.g. a rename
/// with access time `> BeforeBackup` falls inside the tolerated lossy window
/// when the management directory was rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AccessTime {
    None,
    BeforeBackup,
    DuringBackup,
    AfterBackup,
}

/// Lifecycle state of a tenant in the management directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TenantState {
    Ready,
    Error,
}

/// One tenant entry as stored in a cluster's tenant map.
///
/// `assigned_cluster` is populated on the management side only; data clusters
/// hold a mirror entry keyed by the same id. `error` carries the advisory
/// message when `state` is `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantMapEntry {
    pub id: TenantId,
    pub name: String,
    pub tenant_group: Option<TenantGroupName>,
    pub assigned_cluster: Option<ClusterName>,
    pub state: TenantState,
    pub error: String,
}

impl TenantMapEntry {
    pub fn new(id: TenantId, name: &str, tenant_group: Option<&str>) -> Self {
        Self {
            id,
            name: name.to_string(),
            tenant_group: tenant_group.map(str::to_string),
            assigned_cluster: None,
            state: TenantState::Ready,
            error: String::new(),
        }
    }

    pub fn assigned_to(mut self, cluster: &str) -> Self {
        self.assigned_cluster = Some(cluster.to_string());
        self
    }
}

/// Tracked state of one tenant in the reference model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantRecord {
    pub name: String,
    pub cluster: ClusterName,
    pub tenant_group: Option<TenantGroupName>,
    pub create_time: AccessTime,
    pub rename_time: AccessTime,
    pub configure_time: AccessTime,
}

impl TenantRecord {
    pub fn new(name: &str, cluster: &str, tenant_group: Option<&str>, create_time: AccessTime) -> Self {
        Self {
            name: name.to_string(),
            cluster: cluster.to_string(),
            tenant_group: tenant_group.map(str::to_string),
            create_time,
            rename_time: AccessTime::None,
            configure_time: AccessTime::None,
        }
    }
}

/// Tracked state of one tenant group: its resident cluster and members
#[derive(Debug, Clone, Default)]
pub struct TenantGroupRecord {
    pub cluster: ClusterName,
    pub tenants: BTreeSet<TenantId>,
}

/// Tracked state of one registered data cluster
#[derive(Debug, Clone, Default)]
pub struct DataClusterRecord {
    /// Tenant ids currently believed resident
    pub tenants: BTreeSet<TenantId>,

    /// Group names currently believed resident
    pub tenant_groups: BTreeSet<TenantGroupName>,

    /// Set once restore has been applied to this cluster in this run
    pub restored: bool,

    /// Whether the last reattachment produced advisory messages (lossy recovery)
    pub restore_has_messages: bool,
}
