use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use hanzo_access::GatewayAuthMode;
use hanzo_tunnel::TunnelProvider;

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CliAuthMode {
    Token,
    Password,
    Identity,
    Mesh,
}

impl CliAuthMode {
    pub(crate) fn as_gateway_auth_mode(self) -> GatewayAuthMode {
        match self {
            Self::Token => GatewayAuthMode::Token,
            Self::Password => GatewayAuthMode::Password,
            Self::Identity => GatewayAuthMode::Identity,
            Self::Mesh => GatewayAuthMode::Mesh,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum CliTunnelProvider {
    None,
    Auto,
    Cloudflared,
    Ngrok,
    Localxpose,
    Zrok,
}

impl CliTunnelProvider {
    /// `None` disables the tunnel entirely; `Auto` probes the provider set.
    pub(crate) fn selection(self) -> Option<Option<TunnelProvider>> {
        match self {
            Self::None => None,
            Self::Auto => Some(None),
            Self::Cloudflared => Some(Some(TunnelProvider::Cloudflared)),
            Self::Ngrok => Some(Some(TunnelProvider::Ngrok)),
            Self::Localxpose => Some(Some(TunnelProvider::Localxpose)),
            Self::Zrok => Some(Some(TunnelProvider::Zrok)),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "hanzod", about = "Hanzo Bot multi-tenant agent gateway", version)]
pub(crate) struct HanzodArgs {
    /// Address the gateway listens on.
    #[arg(long, default_value = "127.0.0.1:18789")]
    pub(crate) bind: String,

    /// Directory for gateway state, scoped per tenant under `tenants/`.
    #[arg(long, env = "HANZO_GATEWAY_STATE_DIR", default_value = ".hanzo-gateway")]
    pub(crate) state_dir: PathBuf,

    /// Connection authentication mode.
    #[arg(long, value_enum, default_value = "token")]
    pub(crate) auth_mode: CliAuthMode,

    /// Shared bearer token; accepts a literal or a `kms://NAME` reference.
    #[arg(long, env = "HANZO_GATEWAY_TOKEN")]
    pub(crate) auth_token: Option<String>,

    /// Shared password; accepts a literal or a `kms://NAME` reference.
    #[arg(long, env = "HANZO_GATEWAY_PASSWORD")]
    pub(crate) auth_password: Option<String>,

    /// Accept mesh-conveyed identity when the peer is mesh-resident.
    #[arg(long)]
    pub(crate) allow_mesh_identity: bool,

    /// Origin allowed to call the gateway from a browser; repeatable.
    #[arg(long = "allowed-origin")]
    pub(crate) allowed_origins: Vec<String>,

    /// Maximum accepted request body size in bytes.
    #[arg(long, default_value_t = 1_048_576, value_parser = parse_positive_usize)]
    pub(crate) max_body_bytes: usize,

    /// Agent id exposed as an OpenAI model; repeatable. The first entry is
    /// the default unless --default-agent-id overrides it.
    #[arg(long = "agent-id", default_values_t = vec!["default".to_string()])]
    pub(crate) agent_ids: Vec<String>,

    #[arg(long, default_value = "default")]
    pub(crate) default_agent_id: String,

    /// Sliding-window size for per-source rate limiting.
    #[arg(long, default_value_t = 60)]
    pub(crate) rate_limit_window_seconds: u64,

    /// Attempts allowed per window; 0 disables rate limiting.
    #[arg(long, default_value_t = 30)]
    pub(crate) rate_limit_max_attempts: usize,

    /// Identity provider issuer URL (enables identity mode validation).
    #[arg(long, env = "IAM_ISSUER")]
    pub(crate) iam_issuer: Option<String>,

    /// Audience expected in identity tokens.
    #[arg(long, default_value = "hanzo-gateway")]
    pub(crate) iam_audience: String,

    #[arg(long, env = "IAM_CLIENT_ID")]
    pub(crate) iam_client_id: Option<String>,

    #[arg(long, env = "IAM_CLIENT_SECRET", hide_env_values = true)]
    pub(crate) iam_client_secret: Option<String>,

    /// Commerce back end base URL; enables billing and usage reporting.
    #[arg(long, env = "COMMERCE_API_URL")]
    pub(crate) commerce_api_url: Option<String>,

    #[arg(long, env = "COMMERCE_SERVICE_TOKEN", hide_env_values = true)]
    pub(crate) commerce_service_token: Option<String>,

    /// Secret back end base URL; enables `kms://` reference resolution.
    #[arg(long, env = "HANZO_SECRETS_URL")]
    pub(crate) secrets_url: Option<String>,

    #[arg(long, env = "HANZO_SECRETS_CLIENT_ID")]
    pub(crate) secrets_client_id: Option<String>,

    #[arg(long, env = "HANZO_SECRETS_CLIENT_SECRET", hide_env_values = true)]
    pub(crate) secrets_client_secret: Option<String>,

    /// Egress tunnel provider.
    #[arg(long, value_enum, default_value = "none")]
    pub(crate) tunnel: CliTunnelProvider,

    #[arg(long, env = "HANZO_TUNNEL_AUTH_TOKEN", hide_env_values = true)]
    pub(crate) tunnel_auth_token: Option<String>,

    /// Custom domain/subdomain forwarded to providers that support one.
    #[arg(long)]
    pub(crate) tunnel_domain: Option<String>,
}
