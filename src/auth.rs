//! Caller identity and the tenant authorization predicate
//!
//! Token validation itself lives outside this crate; the core only consumes
//! the resulting yes/no answer. Every tenant mutation path checks the policy
//! and surfaces `PermissionDenied` when it says no.

use crate::model::TenantId;

/// Identity presented with each tenant mutation.
///
/// A trusted caller is an internal peer (the orchestrator, the driver, the
/// collision resolver). Untrusted callers carry at most one tenant id for
/// which their token validated.
#[derive(Debug, Clone)]
pub struct Caller {
    trusted: bool,
    authorized_tenant: Option<TenantId>,
}

impl Caller {
    /// An internal, fully trusted peer
    pub fn trusted() -> Self {
        Self {
            trusted: true,
            authorized_tenant: None,
        }
    }

    /// An external caller whose token validated for a single tenant
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            trusted: false,
            authorized_tenant: Some(tenant),
        }
    }

    /// An external caller with no valid token
    pub fn anonymous() -> Self {
        Self {
            trusted: false,
            authorized_tenant: None,
        }
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn authorized_tenant(&self) -> Option<TenantId> {
        self.authorized_tenant
    }
}

/// Per-request trust check consumed by every tenant mutation path
pub trait TenantAccessPolicy: Send + Sync {
    /// Whether the caller may act on the given tenant
    fn allows(&self, caller: &Caller, tenant: TenantId) -> bool;
}

/// Default policy: trusted peers may act on any tenant, untrusted callers
/// only on the tenant their token validated for.
#[derive(Debug, Default)]
pub struct StandardAccessPolicy;

impl TenantAccessPolicy for StandardAccessPolicy {
    fn allows(&self, caller: &Caller, tenant: TenantId) -> bool {
        caller.is_trusted() || caller.authorized_tenant() == Some(tenant)
    }
}
