//! Collision detection and resolution.
//!
//! A collision is a tenant name or tenant-group name present both in the
//! incoming data cluster's local map and in the management directory.
//! Resolution deletes the non-authoritative side: for names, tracked-state
//! precedence wins; for groups, whichever side the reference model last
//! placed the group on wins, and the losing side's members are deleted as a
//! whole group.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use slog::{debug, info, Logger};
use tokio::sync::Mutex;

use crate::auth::Caller;
use crate::cluster::{DataCluster, ManagementCluster};
use crate::error::Result;
use crate::model::{ClusterName, ReferenceModel, TenantGroupName, TenantId};

/// Tenant name → (data-cluster-side id, management-side id)
pub type TenantCollisions = BTreeMap<String, (TenantId, TenantId)>;

/// Group names present on both sides
pub type GroupCollisions = BTreeSet<TenantGroupName>;

/// Which side owns a colliding tenant group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAuthority {
    Management,
    DataCluster(ClusterName),
}

/// Compare the management directory against a data cluster's local state and
/// report every name and group clash.
pub async fn detect_collisions(
    management: &ManagementCluster,
    data: &DataCluster,
) -> (TenantCollisions, GroupCollisions) {
    let management_names: BTreeMap<String, TenantId> =
        management.scan_name_index().await.into_iter().collect();
    let management_groups: BTreeSet<TenantGroupName> = management
        .scan_groups()
        .await
        .into_iter()
        .map(|(name, _)| name)
        .collect();

    let mut tenant_collisions = TenantCollisions::new();
    for (name, data_id) in data.scan_name_index().await {
        if let Some(&management_id) = management_names.get(&name) {
            tenant_collisions.insert(name, (data_id, management_id));
        }
    }

    let mut group_collisions = GroupCollisions::new();
    for group in data.scan_groups().await {
        if management_groups.contains(&group) {
            group_collisions.insert(group);
        }
    }

    (tenant_collisions, group_collisions)
}

/// Delete the non-authoritative side of every tenant name collision.
///
/// If the data-cluster side's id is one this run expects to exist, the
/// management-side duplicate goes; otherwise the data-cluster side goes.
/// Each victim is untracked before the underlying delete is issued.
pub async fn resolve_tenant_collisions(
    model: &Arc<Mutex<ReferenceModel>>,
    management: &ManagementCluster,
    data: &DataCluster,
    collisions: &TenantCollisions,
    logger: &Logger,
) -> Result<()> {
    info!(logger, "resolving tenant name collisions";
          "cluster" => data.name(), "collisions" => collisions.len());
    let caller = Caller::trusted();

    for (name, (data_id, management_id)) in collisions {
        let data_side_expected = model.lock().await.contains_tenant(*data_id);
        if data_side_expected {
            debug!(logger, "deleting management-side tenant collision";
                   "tenant" => name, "tenant_id" => management_id);
            model.lock().await.remove_tracked_tenant(*management_id);
            management.delete_tenant_by_id(&caller, *management_id).await?;
        } else {
            debug!(logger, "deleting data-side tenant collision";
                   "tenant" => name, "tenant_id" => data_id);
            model.lock().await.remove_tracked_tenant(*data_id);
            data.delete_tenant(&caller, name, *data_id).await?;
        }
    }

    Ok(())
}

/// Delete the non-authoritative side of every group collision, a whole group
/// at a time.
pub async fn resolve_group_collisions(
    model: &Arc<Mutex<ReferenceModel>>,
    management: &ManagementCluster,
    data: &DataCluster,
    collisions: &GroupCollisions,
    logger: &Logger,
) -> Result<()> {
    info!(logger, "resolving tenant group collisions";
          "cluster" => data.name(), "collisions" => collisions.len());
    let caller = Caller::trusted();

    for group in collisions {
        let authority = {
            let model = model.lock().await;
            match model.cluster_for_group(group) {
                Some(cluster) if cluster == data.name() => {
                    GroupAuthority::DataCluster(cluster.to_string())
                }
                _ => GroupAuthority::Management,
            }
        };

        match authority {
            GroupAuthority::DataCluster(_) => {
                // The data cluster's copy is what this run expects; delete
                // the management directory's impostor group wholesale.
                debug!(logger, "deleting group collision from management cluster"; "group" => group);
                for id in management.tenants_in_group(group).await {
                    model.lock().await.remove_tracked_tenant(id);
                    management.delete_tenant_by_id(&caller, id).await?;
                }
            }
            GroupAuthority::Management => {
                // The directory's copy is authoritative; force-delete the
                // group's members from the data cluster directly.
                debug!(logger, "deleting group collision from data cluster";
                       "group" => group, "cluster" => data.name());
                for id in data.tenants_in_group(group).await {
                    model.lock().await.remove_tracked_tenant(id);
                    data.delete_tenant_system(id).await;
                }
            }
        }
    }

    Ok(())
}
