//! Access-control primitives for the Hanzo gateway.
//!
//! Provides the browser origin policy, `kms://` secret resolution, auth-mode
//! resolution, identity-token validation against provider JWKS, the
//! identity-provider OAuth client, tenant resolution, and the per-connection
//! authorizer shared by the HTTP and WebSocket surfaces.

pub mod auth_config;
pub mod connection_auth;
pub mod identity;
pub mod identity_client;
pub mod origin_policy;
pub mod secrets;
pub mod tenant;

pub use auth_config::*;
pub use connection_auth::*;
pub use identity::*;
pub use identity_client::*;
pub use origin_policy::*;
pub use secrets::*;
pub use tenant::*;
