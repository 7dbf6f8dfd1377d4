//! Tunnel provider inventory: binaries, argv tables, and the per-provider
//! URL patterns parsed out of startup output.
//!
//! Providers change their log formats across releases; every pattern lives
//! here and nowhere else.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Enumerates supported tunnel providers.
pub enum TunnelProvider {
    Cloudflared,
    Ngrok,
    Localxpose,
    Zrok,
}

/// Autodetect preference order.
pub const TUNNEL_PROVIDER_AUTODETECT_ORDER: &[TunnelProvider] = &[
    TunnelProvider::Cloudflared,
    TunnelProvider::Ngrok,
    TunnelProvider::Localxpose,
    TunnelProvider::Zrok,
];

impl TunnelProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloudflared => "cloudflared",
            Self::Ngrok => "ngrok",
            Self::Localxpose => "localxpose",
            Self::Zrok => "zrok",
        }
    }

    /// Executable name; localxpose ships as `loclx`.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::Cloudflared => "cloudflared",
            Self::Ngrok => "ngrok",
            Self::Localxpose => "loclx",
            Self::Zrok => "zrok",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cloudflared" => Some(Self::Cloudflared),
            "ngrok" => Some(Self::Ngrok),
            "localxpose" | "loclx" => Some(Self::Localxpose),
            "zrok" => Some(Self::Zrok),
            _ => None,
        }
    }
}

/// Main tunnel argv for a provider, pointing at the local gateway port.
pub fn build_provider_argv(
    provider: TunnelProvider,
    port: u16,
    domain: Option<&str>,
) -> Vec<String> {
    let mut argv = match provider {
        TunnelProvider::Cloudflared => vec![
            "tunnel".to_string(),
            "--url".to_string(),
            format!("http://localhost:{port}"),
        ],
        TunnelProvider::Ngrok => vec![
            "http".to_string(),
            port.to_string(),
            "--log".to_string(),
            "stdout".to_string(),
            "--log-format".to_string(),
            "json".to_string(),
        ],
        TunnelProvider::Localxpose => vec![
            "tunnel".to_string(),
            "http".to_string(),
            "--to".to_string(),
            format!("localhost:{port}"),
        ],
        TunnelProvider::Zrok => vec![
            "share".to_string(),
            "public".to_string(),
            format!("http://localhost:{port}"),
        ],
    };
    if let Some(domain) = domain.map(str::trim).filter(|domain| !domain.is_empty()) {
        match provider {
            TunnelProvider::Cloudflared => {
                argv.push("--hostname".to_string());
                argv.push(domain.to_string());
            }
            TunnelProvider::Ngrok => {
                argv.push("--domain".to_string());
                argv.push(domain.to_string());
            }
            TunnelProvider::Localxpose => {
                argv.push("--subdomain".to_string());
                argv.push(domain.to_string());
            }
            TunnelProvider::Zrok => {}
        }
    }
    argv
}

/// One-time credential setup argv run before the tunnel itself, when the
/// provider needs it and an auth token is configured.
pub fn provider_one_time_auth_argv(
    provider: TunnelProvider,
    auth_token: Option<&str>,
) -> Option<Vec<String>> {
    let auth_token = auth_token.map(str::trim).filter(|token| !token.is_empty())?;
    match provider {
        TunnelProvider::Ngrok => Some(vec![
            "config".to_string(),
            "add-authtoken".to_string(),
            auth_token.to_string(),
        ]),
        TunnelProvider::Localxpose => Some(vec![
            "account".to_string(),
            "login".to_string(),
            "--token".to_string(),
            auth_token.to_string(),
        ]),
        TunnelProvider::Cloudflared | TunnelProvider::Zrok => None,
    }
}

fn cloudflared_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https://[a-z0-9-]+\.trycloudflare\.com").expect("cloudflared url pattern")
    })
}

fn localxpose_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"https?://[^\s]+\.loclx\.io").expect("localxpose url pattern")
    })
}

fn zrok_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"https?://[^\s]+\.zrok\.[^\s]+").expect("zrok url pattern"))
}

/// Scans one line of provider output for the published public URL.
pub fn extract_public_url(provider: TunnelProvider, line: &str) -> Option<String> {
    match provider {
        TunnelProvider::Cloudflared => cloudflared_url_pattern()
            .find(line)
            .map(|found| found.as_str().to_string()),
        TunnelProvider::Ngrok => {
            let record = serde_json::from_str::<Value>(line.trim()).ok()?;
            let url = record.get("url")?.as_str()?;
            if url.starts_with("http://") || url.starts_with("https://") {
                Some(url.to_string())
            } else {
                None
            }
        }
        TunnelProvider::Localxpose => localxpose_url_pattern()
            .find(line)
            .map(|found| found.as_str().to_string()),
        TunnelProvider::Zrok => zrok_url_pattern()
            .find(line)
            .map(|found| found.as_str().trim_end_matches(['.', ',']).to_string()),
    }
}
