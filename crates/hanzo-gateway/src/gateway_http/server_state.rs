//! Shared gateway server state threaded through every handler.

use super::*;

#[derive(Debug, Clone, Copy)]
/// Sliding-window limits applied per source ip before credential checks.
pub struct RateLimitSettings {
    pub window_ms: u64,
    pub max_attempts: usize,
}

#[derive(Debug, Clone)]
/// Static configuration for one gateway process.
pub struct GatewayServerConfig {
    pub bind: String,
    pub state_dir: PathBuf,
    pub auth: ResolvedGatewayAuth,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub agent_ids: Vec<String>,
    pub default_agent_id: String,
    pub rate_limit: Option<RateLimitSettings>,
}

impl GatewayServerConfig {
    pub fn new(bind: impl Into<String>, state_dir: PathBuf, auth: ResolvedGatewayAuth) -> Self {
        Self {
            bind: bind.into(),
            state_dir,
            auth,
            allowed_origins: Vec::new(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            agent_ids: vec![DEFAULT_AGENT_ID.to_string()],
            default_agent_id: DEFAULT_AGENT_ID.to_string(),
            rate_limit: None,
        }
    }
}

/// External collaborators the gateway drives but does not own.
pub struct GatewayCollaborators {
    pub engine: Arc<dyn AgentEngine>,
    pub event_bus: Arc<AgentEventBus>,
    pub identity_validator: Option<Arc<IdentityTokenValidator>>,
    pub identity_client: Option<Arc<IdentityProviderClient>>,
    pub billing: Option<Arc<BillingClient>>,
    pub usage_reporter: UsageReporter,
    pub runtime_origins: Arc<RuntimeOriginAllowSet>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Registered WebSocket session; lives until the socket closes.
pub struct GatewaySessionInfo {
    pub connection_id: String,
    pub role: &'static str,
    pub method: &'static str,
    pub user: Option<String>,
    pub tenant_org: Option<String>,
    pub presence_key: Option<String>,
    pub client_ip: Option<String>,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
}

/// Mutable gateway runtime: session registry, counters, collaborators.
pub struct GatewayServerState {
    pub config: GatewayServerConfig,
    pub engine: Arc<dyn AgentEngine>,
    pub event_bus: Arc<AgentEventBus>,
    pub identity_validator: Option<Arc<IdentityTokenValidator>>,
    pub identity_client: Option<Arc<IdentityProviderClient>>,
    pub billing: Option<Arc<BillingClient>>,
    pub usage_reporter: UsageReporter,
    pub runtime_origins: Arc<RuntimeOriginAllowSet>,
    pub rate_limiter: Option<SlidingWindowRateLimiter>,
    pub(super) sessions: Mutex<HashMap<String, GatewaySessionInfo>>,
    pub(super) auth_failures: AtomicU64,
    pub(super) rate_limited_requests: AtomicU64,
    started: Instant,
}

impl GatewayServerState {
    pub fn new(config: GatewayServerConfig, collaborators: GatewayCollaborators) -> Self {
        let rate_limiter = config
            .rate_limit
            .map(|settings| SlidingWindowRateLimiter::new(settings.window_ms, settings.max_attempts));
        Self {
            config,
            engine: collaborators.engine,
            event_bus: collaborators.event_bus,
            identity_validator: collaborators.identity_validator,
            identity_client: collaborators.identity_client,
            billing: collaborators.billing,
            usage_reporter: collaborators.usage_reporter,
            runtime_origins: collaborators.runtime_origins,
            rate_limiter,
            sessions: Mutex::new(HashMap::new()),
            auth_failures: AtomicU64::new(0),
            rate_limited_requests: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn session_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .len()
    }

    pub(super) fn register_session(&self, session: GatewaySessionInfo) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        sessions.insert(session.connection_id.clone(), session);
    }

    pub(super) fn remove_session(&self, connection_id: &str) {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        sessions.remove(connection_id);
    }

    pub(super) fn note_auth_failure(&self, reason: &AuthRejectionReason) {
        if matches!(reason, AuthRejectionReason::RateLimited) {
            self.rate_limited_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn auth_failure_count(&self) -> u64 {
        self.auth_failures.load(Ordering::Relaxed)
    }

    pub fn rate_limited_count(&self) -> u64 {
        self.rate_limited_requests.load(Ordering::Relaxed)
    }

    pub(super) fn mint_run_id(&self) -> String {
        format!("chatcmpl_{}", Uuid::new_v4())
    }

    pub(super) fn mint_connection_id(&self) -> String {
        format!("conn_{}", Uuid::new_v4())
    }
}
