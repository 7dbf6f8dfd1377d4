//! Tunnel child-process lifecycle: probe, spawn, URL discovery, stop.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::providers::{
    build_provider_argv, extract_public_url, provider_one_time_auth_argv, TunnelProvider,
    TUNNEL_PROVIDER_AUTODETECT_ORDER,
};

pub const TUNNEL_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const TUNNEL_STOP_GRACE: Duration = Duration::from_secs(3);
const PROVIDER_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to spawn {provider}: {source}")]
    Spawn {
        provider: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{provider} startup timed out (30s)")]
    StartupTimedOut { provider: &'static str },
    #[error("{provider} exited before publishing a url")]
    ExitedBeforeUrl { provider: &'static str },
}

#[derive(Debug, Clone)]
/// Tunnel launch parameters; `provider: None` autodetects.
pub struct TunnelConfig {
    pub provider: Option<TunnelProvider>,
    pub port: u16,
    pub auth_token: Option<String>,
    pub domain: Option<String>,
    pub startup_timeout: Duration,
}

impl TunnelConfig {
    pub fn new(port: u16) -> Self {
        Self {
            provider: None,
            port,
            auth_token: None,
            domain: None,
            startup_timeout: TUNNEL_STARTUP_TIMEOUT,
        }
    }
}

#[derive(Clone)]
/// Callbacks wiring the tunnel's public origin into the runtime allow-set.
pub struct TunnelOriginHooks {
    pub register: Arc<dyn Fn(&str) + Send + Sync>,
    pub clear: Arc<dyn Fn(&str) + Send + Sync>,
}

/// A running tunnel: its public addresses and the owned child process.
pub struct TunnelHandle {
    pub provider: TunnelProvider,
    pub public_url: String,
    pub public_origin: String,
    child: Mutex<Option<Child>>,
    hooks: Option<TunnelOriginHooks>,
}

impl fmt::Debug for TunnelHandle {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("TunnelHandle")
            .field("provider", &self.provider.as_str())
            .field("public_url", &self.public_url)
            .field("public_origin", &self.public_origin)
            .finish_non_exhaustive()
    }
}

impl TunnelHandle {
    /// Sends SIGTERM and waits up to three seconds; a child that ignores the
    /// signal is abandoned, not killed. Idempotent.
    pub async fn stop(&self) {
        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        if let Some(pid) = child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        if tokio::time::timeout(TUNNEL_STOP_GRACE, child.wait())
            .await
            .is_err()
        {
            warn!(
                provider = self.provider.as_str(),
                "tunnel child ignored SIGTERM; abandoning"
            );
        }
        if let Some(hooks) = self.hooks.as_ref() {
            (hooks.clear)(&self.public_origin);
        }
    }
}

/// Runs `<binary> --version` to confirm the provider is installed.
pub async fn probe_provider_available(binary: &str) -> bool {
    let mut command = Command::new(binary);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.spawn() {
        Ok(mut child) => {
            if tokio::time::timeout(PROVIDER_PROBE_TIMEOUT, child.wait())
                .await
                .is_err()
            {
                let _ = child.start_kill();
            }
            true
        }
        Err(_) => false,
    }
}

/// First installed provider in preference order.
pub async fn autodetect_tunnel_provider() -> Option<TunnelProvider> {
    for provider in TUNNEL_PROVIDER_AUTODETECT_ORDER {
        if probe_provider_available(provider.binary_name()).await {
            return Some(*provider);
        }
    }
    None
}

/// Starts the configured tunnel. `Ok(None)` means no provider is available;
/// the gateway keeps serving without a public URL.
pub async fn start_tunnel(
    config: &TunnelConfig,
    hooks: Option<TunnelOriginHooks>,
) -> Result<Option<TunnelHandle>, TunnelError> {
    let provider = match config.provider {
        Some(provider) => {
            if !probe_provider_available(provider.binary_name()).await {
                info!(
                    provider = provider.as_str(),
                    "tunnel provider not installed; continuing without a tunnel"
                );
                return Ok(None);
            }
            provider
        }
        None => match autodetect_tunnel_provider().await {
            Some(provider) => provider,
            None => {
                info!("no tunnel provider installed; continuing without a tunnel");
                return Ok(None);
            }
        },
    };

    run_one_time_provider_auth(provider, config.auth_token.as_deref()).await;

    let argv = build_provider_argv(provider, config.port, config.domain.as_deref());
    let mut command = Command::new(provider.binary_name());
    command
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|source| TunnelError::Spawn {
        provider: provider.as_str(),
        source,
    })?;

    let url = await_public_url(&mut child, provider, config.startup_timeout).await?;
    let public_origin = derive_public_origin(&url);
    let public_url = derive_ws_url(&url);
    info!(
        provider = provider.as_str(),
        public_url, public_origin, "tunnel established"
    );
    if let Some(hooks) = hooks.as_ref() {
        (hooks.register)(&public_origin);
    }

    Ok(Some(TunnelHandle {
        provider,
        public_url,
        public_origin,
        child: Mutex::new(Some(child)),
        hooks,
    }))
}

/// One-time credential setup (`ngrok config add-authtoken`, `loclx account
/// login`); failures are logged and the tunnel attempt continues.
async fn run_one_time_provider_auth(provider: TunnelProvider, auth_token: Option<&str>) {
    let Some(argv) = provider_one_time_auth_argv(provider, auth_token) else {
        return;
    };
    let mut command = Command::new(provider.binary_name());
    command
        .args(&argv)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    match command.status().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            warn!(
                provider = provider.as_str(),
                code = status.code(),
                "tunnel provider credential setup exited non-zero"
            );
        }
        Err(error) => {
            warn!(
                provider = provider.as_str(),
                "tunnel provider credential setup failed: {error}"
            );
        }
    }
}

/// Watches the child's stdout and stderr until the provider pattern yields a
/// URL, the process exits, or the startup deadline passes.
pub(crate) async fn await_public_url(
    child: &mut Child,
    provider: TunnelProvider,
    startup_timeout: Duration,
) -> Result<String, TunnelError> {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        let line_tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let line_tx = line_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        });
    }
    drop(line_tx);

    let discovered = tokio::time::timeout(startup_timeout, async {
        while let Some(line) = line_rx.recv().await {
            if let Some(url) = extract_public_url(provider, &line) {
                return Some(url);
            }
        }
        None
    })
    .await;

    match discovered {
        Ok(Some(url)) => Ok(url),
        Ok(None) => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            Err(TunnelError::ExitedBeforeUrl {
                provider: provider.as_str(),
            })
        }
        Err(_) => {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(1), child.wait()).await;
            Err(TunnelError::StartupTimedOut {
                provider: provider.as_str(),
            })
        }
    }
}

/// `https://` becomes `wss://`, `http://` becomes `ws://`; trailing slashes
/// are stripped.
pub fn derive_ws_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if let Some(rest) = url.strip_prefix("https://") {
        return format!("wss://{rest}");
    }
    if let Some(rest) = url.strip_prefix("http://") {
        return format!("ws://{rest}");
    }
    url.to_string()
}

/// The HTTP(S) origin form of the discovered URL.
pub fn derive_public_origin(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
