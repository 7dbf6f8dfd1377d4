//! Foundational low-level utilities shared across Hanzo gateway crates.
//!
//! Provides time helpers used by cache expiry and session bookkeeping, plus
//! tenant slug sanitation and the tenant-scoped state directory layout.

pub mod tenant_paths;
pub mod time_utils;

pub use tenant_paths::{sanitize_tenant_slug, tenant_slug_is_valid, tenant_state_dir};
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms, is_expired_unix_ms};
