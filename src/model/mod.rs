//! Reference Model
//!
//! In-memory shadow of the expected global state of the metacluster:
//! tenants, groups, per-cluster membership, deletion history, and per-tenant
//! access-time classification. The driver and the restore orchestrator apply
//! mutations here only after the corresponding directory transaction has
//! committed, so model state never precedes committed state.

pub mod reference;
pub mod types;

pub use reference::ReferenceModel;
pub use types::{
    AccessTime, ClusterName, DataClusterRecord, TenantGroupName, TenantGroupRecord, TenantId,
    TenantMapEntry, TenantRecord, TenantState,
};
