//! Browser origin and host admission policy.
//!
//! Decides whether a browser peer's `Origin` may talk to the gateway. The
//! configured allow-list is static; the runtime allow-set is populated when
//! an egress tunnel comes up and cleared when it stops.

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Mutex;

pub const ORIGIN_DENIED_MISSING: &str = "origin missing or invalid";
pub const ORIGIN_DENIED_NOT_ALLOWED: &str = "origin not allowed";

#[derive(Debug, Clone, PartialEq, Eq)]
/// Outcome of an origin-policy evaluation.
pub enum OriginDecision {
    Allowed,
    Denied { reason: &'static str },
}

impl OriginDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Mutable set of origins granted at runtime (tunnel public origins).
#[derive(Debug, Default)]
pub struct RuntimeOriginAllowSet {
    origins: Mutex<BTreeSet<String>>,
}

impl RuntimeOriginAllowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, origin: &str) {
        if let Some(normalized) = normalize_origin(origin) {
            let mut origins = self.origins.lock().unwrap_or_else(|poison| poison.into_inner());
            origins.insert(normalized.ascii_lowercase);
        }
    }

    pub fn remove(&self, origin: &str) {
        if let Some(normalized) = normalize_origin(origin) {
            let mut origins = self.origins.lock().unwrap_or_else(|poison| poison.into_inner());
            origins.remove(&normalized.ascii_lowercase);
        }
    }

    pub fn clear(&self) {
        let mut origins = self.origins.lock().unwrap_or_else(|poison| poison.into_inner());
        origins.clear();
    }

    pub fn contains(&self, normalized_origin: &str) -> bool {
        let origins = self.origins.lock().unwrap_or_else(|poison| poison.into_inner());
        origins.contains(normalized_origin)
    }

    pub fn snapshot(&self) -> Vec<String> {
        let origins = self.origins.lock().unwrap_or_else(|poison| poison.into_inner());
        origins.iter().cloned().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NormalizedOrigin {
    ascii_lowercase: String,
    authority: String,
    hostname: String,
}

/// Evaluates the origin rules in order; the first matching rule decides.
pub fn evaluate_origin_policy(
    request_host: &str,
    origin: Option<&str>,
    allowed_origins: &[String],
    runtime_origins: &RuntimeOriginAllowSet,
) -> OriginDecision {
    let Some(normalized) = origin.and_then(normalize_origin) else {
        return OriginDecision::Denied {
            reason: ORIGIN_DENIED_MISSING,
        };
    };

    if allowed_origins
        .iter()
        .filter_map(|allowed| normalize_origin(allowed))
        .any(|allowed| allowed.ascii_lowercase == normalized.ascii_lowercase)
    {
        return OriginDecision::Allowed;
    }

    if runtime_origins.contains(&normalized.ascii_lowercase) {
        return OriginDecision::Allowed;
    }

    let request_authority = normalize_host_authority(request_host);
    if !request_authority.is_empty() && normalized.authority == request_authority {
        return OriginDecision::Allowed;
    }

    let request_hostname = hostname_of_authority(&request_authority);
    if hostname_is_loopback(&normalized.hostname) && hostname_is_loopback(&request_hostname) {
        return OriginDecision::Allowed;
    }

    OriginDecision::Denied {
        reason: ORIGIN_DENIED_NOT_ALLOWED,
    }
}

/// Parses an `Origin` header value into its lowercased scheme+authority form.
/// Returns `None` for absent, empty, literal `null`, or malformed values.
fn normalize_origin(raw: &str) -> Option<NormalizedOrigin> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        return None;
    }
    let (scheme, rest) = trimmed.split_once("://")?;
    if scheme.is_empty()
        || !scheme
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '+' | '-' | '.'))
    {
        return None;
    }
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .trim();
    if authority.is_empty() {
        return None;
    }
    let scheme = scheme.to_ascii_lowercase();
    let authority = authority.to_ascii_lowercase();
    let hostname = hostname_of_authority(&authority);
    if hostname.is_empty() {
        return None;
    }
    Some(NormalizedOrigin {
        ascii_lowercase: format!("{scheme}://{authority}"),
        authority,
        hostname,
    })
}

fn normalize_host_authority(raw: &str) -> String {
    raw.trim().trim_end_matches('/').to_ascii_lowercase()
}

/// Extracts the hostname from a `host[:port]` authority, unwrapping
/// bracketed IPv6 literals.
pub(crate) fn hostname_of_authority(authority: &str) -> String {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        return rest
            .split_once(']')
            .map(|(host, _)| host.to_string())
            .unwrap_or_default();
    }
    authority
        .split_once(':')
        .map(|(host, _)| host)
        .unwrap_or(authority)
        .to_string()
}

/// Loopback means IPv4 127/8, IPv6 `::1`, or the `localhost` name.
fn hostname_is_loopback(hostname: &str) -> bool {
    if hostname.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match hostname.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => addr.octets()[0] == 127,
        Ok(IpAddr::V6(addr)) => addr.is_loopback(),
        Err(_) => false,
    }
}
