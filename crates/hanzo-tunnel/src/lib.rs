//! Egress-tunnel supervision for the gateway.
//!
//! Starts one of several tunnel provider processes, watches its stdout and
//! stderr for the published public URL, and exposes a handle that converts
//! the URL for WebSocket use and stops the child on demand. A missing
//! provider binary is not an error: the gateway simply runs without a
//! public URL.

pub mod providers;
pub mod supervisor;

pub use providers::{
    build_provider_argv, extract_public_url, provider_one_time_auth_argv, TunnelProvider,
};
pub use supervisor::{
    autodetect_tunnel_provider, derive_public_origin, derive_ws_url, probe_provider_available,
    start_tunnel, TunnelConfig, TunnelError, TunnelHandle, TunnelOriginHooks,
};
