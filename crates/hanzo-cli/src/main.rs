mod bootstrap_helpers;
mod cli_args;
mod detached_engine;

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{info, warn};

use cli_args::HanzodArgs;
use detached_engine::DetachedAgentEngine;
use hanzo_access::{
    resolve_gateway_auth, GatewayAuthConfig, GatewayAuthMode, IdentityClientConfig,
    IdentityProviderClient, IdentityTokenValidator, IdentityValidatorConfig, RuntimeOriginAllowSet,
    SecretBackendConfig, SecretResolver,
};
use hanzo_billing::{BillingClient, BillingClientConfig, UsageReporter, UsageSinkConfig};
use hanzo_events::AgentEventBus;
use hanzo_gateway::{
    serve_gateway, GatewayCollaborators, GatewayServerConfig, GatewayServerState,
    RateLimitSettings,
};
use hanzo_tunnel::{start_tunnel, TunnelConfig, TunnelHandle, TunnelOriginHooks};

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_SECRET_RESOLUTION_FAILURE: u8 = 2;
const EXIT_BIND_FAILURE: u8 = 3;

struct DaemonFailure {
    exit_code: u8,
    source: anyhow::Error,
}

impl DaemonFailure {
    fn config(source: anyhow::Error) -> Self {
        Self {
            exit_code: EXIT_CONFIG_ERROR,
            source,
        }
    }

    fn secrets(source: anyhow::Error) -> Self {
        Self {
            exit_code: EXIT_SECRET_RESOLUTION_FAILURE,
            source,
        }
    }

    fn bind(source: anyhow::Error) -> Self {
        Self {
            exit_code: EXIT_BIND_FAILURE,
            source,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    bootstrap_helpers::init_tracing();
    let args = HanzodArgs::parse();
    match run_gateway_daemon(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(failure) => {
            eprintln!("hanzod: {:#}", failure.source);
            ExitCode::from(failure.exit_code)
        }
    }
}

async fn run_gateway_daemon(args: HanzodArgs) -> Result<(), DaemonFailure> {
    let bind_addr = args
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid --bind address '{}'", args.bind))
        .map_err(DaemonFailure::config)?;

    let secret_resolver = build_secret_resolver(&args).map_err(DaemonFailure::config)?;
    let auth_config = GatewayAuthConfig {
        mode: args.auth_mode.as_gateway_auth_mode(),
        token: args.auth_token.clone(),
        password: args.auth_password.clone(),
        allow_mesh_identity: args.allow_mesh_identity
            || args.auth_mode.as_gateway_auth_mode() == GatewayAuthMode::Mesh,
    };
    let resolved_auth = resolve_gateway_auth(&auth_config, secret_resolver.as_ref())
        .await
        .context("failed to resolve gateway auth secrets")
        .map_err(DaemonFailure::secrets)?;

    if resolved_auth.mode == GatewayAuthMode::Identity && args.iam_issuer.is_none() {
        return Err(DaemonFailure::config(anyhow!(
            "identity auth mode requires --iam-issuer"
        )));
    }
    let identity_validator = args.iam_issuer.as_ref().map(|issuer| {
        Arc::new(IdentityTokenValidator::new(IdentityValidatorConfig {
            issuer: issuer.clone(),
            audience: args.iam_audience.clone(),
        }))
    });
    let identity_client = match (
        args.iam_issuer.as_ref(),
        args.iam_client_id.as_ref(),
        args.iam_client_secret.as_ref(),
    ) {
        (Some(issuer), Some(client_id), Some(client_secret)) => {
            Some(Arc::new(IdentityProviderClient::new(IdentityClientConfig {
                issuer: issuer.clone(),
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
            })))
        }
        _ => None,
    };

    let billing = args.commerce_api_url.as_ref().map(|base_url| {
        Arc::new(BillingClient::new(BillingClientConfig {
            base_url: base_url.clone(),
            service_token: args.commerce_service_token.clone(),
            basic_credentials: None,
        }))
    });
    let usage_reporter = match args.commerce_api_url.as_ref() {
        Some(base_url) => UsageReporter::new(Some(UsageSinkConfig {
            base_url: base_url.clone(),
            service_token: args.commerce_service_token.clone(),
        })),
        None => UsageReporter::disabled(),
    };

    let event_bus = Arc::new(AgentEventBus::new());
    let engine = Arc::new(DetachedAgentEngine::new(Arc::clone(&event_bus)));
    let runtime_origins = Arc::new(RuntimeOriginAllowSet::new());

    let mut config =
        GatewayServerConfig::new(args.bind.clone(), args.state_dir.clone(), resolved_auth);
    config.allowed_origins = args.allowed_origins.clone();
    config.max_body_bytes = args.max_body_bytes;
    config.agent_ids = args.agent_ids.clone();
    config.default_agent_id = args.default_agent_id.clone();
    if args.rate_limit_max_attempts > 0 {
        config.rate_limit = Some(RateLimitSettings {
            window_ms: args.rate_limit_window_seconds.saturating_mul(1_000),
            max_attempts: args.rate_limit_max_attempts,
        });
    }

    let state = Arc::new(GatewayServerState::new(
        config,
        GatewayCollaborators {
            engine,
            event_bus,
            identity_validator,
            identity_client,
            billing,
            usage_reporter,
            runtime_origins: Arc::clone(&runtime_origins),
        },
    ));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {bind_addr}"))
        .map_err(DaemonFailure::bind)?;
    let local_port = listener
        .local_addr()
        .context("failed to resolve bound gateway address")
        .map_err(DaemonFailure::bind)?
        .port();

    let tunnel_handle = start_configured_tunnel(&args, local_port, &runtime_origins).await;

    let serve_result = serve_gateway(listener, Arc::clone(&state)).await;

    if let Some(handle) = tunnel_handle.as_ref() {
        handle.stop().await;
    }
    serve_result.map_err(DaemonFailure::config)
}

fn build_secret_resolver(args: &HanzodArgs) -> anyhow::Result<Option<SecretResolver>> {
    let Some(base_url) = args.secrets_url.as_ref() else {
        return Ok(None);
    };
    let (Some(client_id), Some(client_secret)) = (
        args.secrets_client_id.as_ref(),
        args.secrets_client_secret.as_ref(),
    ) else {
        return Err(anyhow!(
            "--secrets-url requires --secrets-client-id and --secrets-client-secret"
        ));
    };
    Ok(Some(SecretResolver::new(SecretBackendConfig {
        base_url: base_url.clone(),
        client_id: client_id.clone(),
        client_secret: client_secret.clone(),
    })))
}

/// Starts the configured tunnel; failures are logged and the gateway keeps
/// serving without a public URL.
async fn start_configured_tunnel(
    args: &HanzodArgs,
    local_port: u16,
    runtime_origins: &Arc<RuntimeOriginAllowSet>,
) -> Option<TunnelHandle> {
    let selection = args.tunnel.selection()?;
    let mut tunnel_config = TunnelConfig::new(local_port);
    tunnel_config.provider = selection;
    tunnel_config.auth_token = args.tunnel_auth_token.clone();
    tunnel_config.domain = args.tunnel_domain.clone();

    let register_origins = Arc::clone(runtime_origins);
    let clear_origins = Arc::clone(runtime_origins);
    let hooks = TunnelOriginHooks {
        register: Arc::new(move |origin: &str| register_origins.add(origin)),
        clear: Arc::new(move |origin: &str| clear_origins.remove(origin)),
    };

    match start_tunnel(&tunnel_config, Some(hooks)).await {
        Ok(Some(handle)) => {
            info!(
                provider = handle.provider.as_str(),
                public_url = handle.public_url,
                public_origin = handle.public_origin,
                "tunnel ready"
            );
            Some(handle)
        }
        Ok(None) => None,
        Err(error) => {
            warn!("tunnel startup failed; continuing without a tunnel: {error}");
            None
        }
    }
}
