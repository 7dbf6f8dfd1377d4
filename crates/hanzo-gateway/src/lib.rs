//! HTTP/WebSocket gateway surface for Hanzo Bot.
//!
//! Routes OpenAI-compatible chat-completion traffic into agent runs, fronts
//! the identity provider's OAuth endpoints, and speaks the node/operator
//! WebSocket connect protocol, with billing admission and usage reporting
//! on the request path.

pub mod gateway_http;
pub mod gateway_ws_protocol;

pub use gateway_http::*;
pub use gateway_ws_protocol::*;
