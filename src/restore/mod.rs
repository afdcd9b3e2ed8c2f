//! Backup/Restore Orchestrator and Collision Resolver
//!
//! Drives per-cluster backup submission and both restore modes, invoking the
//! collision resolver inside the management-rebuild retry loop.

pub mod collision;
pub mod orchestrator;

pub use collision::{
    detect_collisions, resolve_group_collisions, resolve_tenant_collisions, GroupAuthority,
    GroupCollisions, TenantCollisions,
};
pub use orchestrator::RestoreOrchestrator;
