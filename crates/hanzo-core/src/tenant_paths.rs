//! Tenant slug sanitation and tenant-scoped state directory layout.

use std::path::{Path, PathBuf};

const TENANT_SLUG_MAX_CHARS: usize = 128;
const DEFAULT_PROJECT_SEGMENT: &str = "default";

/// Returns true when `raw` is already a safe tenant path segment: a leading
/// ASCII alphanumeric followed by up to 127 characters from `[A-Za-z0-9._-]`.
pub fn tenant_slug_is_valid(raw: &str) -> bool {
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphanumeric() {
        return false;
    }
    if raw.chars().count() > TENANT_SLUG_MAX_CHARS {
        return false;
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-'))
}

/// Sanitizes an arbitrary tenant identifier into a filesystem-safe slug.
///
/// Valid slugs pass through unchanged. Anything else is percent-escaped
/// byte-wise with `%` rewritten to `_`, given a leading `0` when the escape
/// leaves no leading alphanumeric, and truncated to the slug length cap.
/// The transformation is idempotent.
pub fn sanitize_tenant_slug(raw: &str) -> String {
    if tenant_slug_is_valid(raw) {
        return raw.to_string();
    }

    let mut escaped = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("_{byte:02X}"));
        }
    }
    if !escaped
        .chars()
        .next()
        .is_some_and(|ch| ch.is_ascii_alphanumeric())
    {
        escaped.insert(0, '0');
    }
    escaped.truncate(TENANT_SLUG_MAX_CHARS);
    escaped
}

/// Resolves the on-disk state directory scoped to a tenant.
///
/// Layout: `{state_dir}/tenants/{org_slug}/{project_slug}`; the project
/// segment falls back to `default` when the tenant has no project.
pub fn tenant_state_dir(state_dir: &Path, org_id: &str, project_id: Option<&str>) -> PathBuf {
    let project_segment = project_id
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_PROJECT_SEGMENT);
    state_dir
        .join("tenants")
        .join(sanitize_tenant_slug(org_id))
        .join(sanitize_tenant_slug(project_segment))
}
