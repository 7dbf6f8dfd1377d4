//! Tenant resolution and membership enforcement.
//!
//! A tenant context is a per-request value type; `None` means personal mode
//! (no org scoping, no billing gate). The org invariant is enforced here:
//! every accepted tenant's org id is one the identity is a member of.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::identity::ResolvedIdentity;
use hanzo_core::tenant_state_dir;

pub const TENANT_ORG_NOT_MEMBER: &str = "tenant_org_not_member";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TenantAccessError {
    #[error("tenant_org_not_member")]
    OrgNotMember,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// Optional tenant parameters supplied on connect or per request.
pub struct ConnectTenantParams {
    pub org_id: Option<String>,
    pub project_id: Option<String>,
    pub env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// `(org, project?, user)` scope for state paths and billing.
pub struct TenantContext {
    pub org_id: String,
    pub project_id: Option<String>,
    pub user_id: String,
    pub user_name: Option<String>,
    pub env: Option<String>,
}

impl TenantContext {
    /// State directory scoped to this tenant under `state_dir`.
    pub fn state_dir(&self, state_dir: &Path) -> PathBuf {
        tenant_state_dir(state_dir, &self.org_id, self.project_id.as_deref())
    }
}

/// Org selection priority: explicit connect parameter, then the identity's
/// current org claim, then the first org membership. `None` when the
/// identity belongs to no org (personal mode).
pub fn resolve_tenant_org(
    identity: &ResolvedIdentity,
    requested_org_id: Option<&str>,
) -> Option<String> {
    if let Some(requested) = requested_org_id.map(str::trim).filter(|org| !org.is_empty()) {
        return Some(requested.to_string());
    }
    if let Some(current) = identity.current_org_id.as_deref() {
        return Some(current.to_string());
    }
    identity.org_ids.first().cloned()
}

/// Rejects org ids the identity is not a member of.
pub fn validate_tenant_access(
    identity: &ResolvedIdentity,
    org_id: &str,
) -> Result<(), TenantAccessError> {
    if identity.org_ids.iter().any(|org| org == org_id) {
        Ok(())
    } else {
        Err(TenantAccessError::OrgNotMember)
    }
}

/// Resolves and validates the full tenant context for an identity. Returns
/// `Ok(None)` in personal mode.
pub fn resolve_tenant_context(
    identity: &ResolvedIdentity,
    params: &ConnectTenantParams,
) -> Result<Option<TenantContext>, TenantAccessError> {
    let Some(org_id) = resolve_tenant_org(identity, params.org_id.as_deref()) else {
        return Ok(None);
    };
    validate_tenant_access(identity, &org_id)?;
    Ok(Some(TenantContext {
        org_id,
        project_id: params.project_id.clone(),
        user_id: identity.user_id.clone(),
        user_name: identity.display_name.clone(),
        env: params.env.clone(),
    }))
}
