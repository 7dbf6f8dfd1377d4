//! TTL-cached subscription, plan, and balance lookups against commerce.
//!
//! Cache keys include the caller token so per-viewer permissions never leak
//! across callers. Entries expire after 60 seconds and are evicted lazily on
//! read; a plan 404 is cached as null to prevent stampedes. Concurrent
//! misses for one key collapse into a single outbound request.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

use hanzo_core::current_unix_timestamp_ms;

pub const BILLING_CACHE_TTL_MS: u64 = 60_000;
const COMMERCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("commerce request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("commerce returned status {status} during {operation}")]
    Status { status: u16, operation: &'static str },
}

#[derive(Debug, Clone)]
/// Commerce back-end location and process-level credentials.
pub struct BillingClientConfig {
    pub base_url: String,
    pub service_token: Option<String>,
    pub basic_credentials: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
/// Subscription view assembled for the billing gate.
pub struct SubscriptionStatus {
    pub active: bool,
    pub subscription: Option<Value>,
    pub plan: Option<Value>,
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_unix_ms: u64,
}

#[derive(Debug, Default)]
struct BillingCaches {
    subscriptions: StdMutex<HashMap<String, CacheEntry<SubscriptionStatus>>>,
    plans: StdMutex<HashMap<String, CacheEntry<Option<Value>>>>,
    balances: StdMutex<HashMap<String, CacheEntry<i64>>>,
}

/// Client for the commerce back end with per-key single-flight caching.
#[derive(Debug)]
pub struct BillingClient {
    http: reqwest::Client,
    config: BillingClientConfig,
    cache_ttl_ms: u64,
    caches: BillingCaches,
    flights: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl BillingClient {
    pub fn new(config: BillingClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            cache_ttl_ms: BILLING_CACHE_TTL_MS,
            caches: BillingCaches::default(),
            flights: AsyncMutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn with_cache_ttl_ms(config: BillingClientConfig, cache_ttl_ms: u64) -> Self {
        let mut client = Self::new(config);
        client.cache_ttl_ms = cache_ttl_ms;
        client
    }

    /// Prepaid balance in integer cents for `user_id`.
    pub async fn get_balance(
        &self,
        user_id: &str,
        token: Option<&str>,
    ) -> Result<i64, BillingError> {
        let cache_key = scoped_cache_key(user_id, token);
        if let Some(balance) = cache_read(&self.caches.balances, &cache_key) {
            return Ok(balance);
        }
        let _flight = self.single_flight("balance", &cache_key).await;
        if let Some(balance) = cache_read(&self.caches.balances, &cache_key) {
            return Ok(balance);
        }

        let url = format!(
            "{}/v1/users/{user_id}/balance",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .authorized_get(&url, token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BillingError::Status {
                status: response.status().as_u16(),
                operation: "balance lookup",
            });
        }
        let payload = response.json::<Value>().await?;
        let balance = payload
            .get("balance")
            .and_then(Value::as_i64)
            .unwrap_or_default();
        cache_write(&self.caches.balances, &cache_key, balance, self.cache_ttl_ms);
        Ok(balance)
    }

    /// Plan record for `plan_id`; a commerce 404 is a cacheable `None`.
    pub async fn get_plan(
        &self,
        plan_id: &str,
        token: Option<&str>,
    ) -> Result<Option<Value>, BillingError> {
        let cache_key = scoped_cache_key(plan_id, token);
        if let Some(plan) = cache_read(&self.caches.plans, &cache_key) {
            return Ok(plan);
        }
        let _flight = self.single_flight("plan", &cache_key).await;
        if let Some(plan) = cache_read(&self.caches.plans, &cache_key) {
            return Ok(plan);
        }

        let url = format!(
            "{}/v1/plans/{plan_id}",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .authorized_get(&url, token)
            .send()
            .await?;
        let plan = if response.status().as_u16() == 404 {
            None
        } else if !response.status().is_success() {
            return Err(BillingError::Status {
                status: response.status().as_u16(),
                operation: "plan lookup",
            });
        } else {
            Some(response.json::<Value>().await?)
        };
        cache_write(
            &self.caches.plans,
            &cache_key,
            plan.clone(),
            self.cache_ttl_ms,
        );
        Ok(plan)
    }

    /// Subscription status for `org_id`; active means commerce reports a
    /// subscription in state `active` or `trialing`.
    pub async fn get_subscription_status(
        &self,
        org_id: &str,
        token: Option<&str>,
    ) -> Result<SubscriptionStatus, BillingError> {
        let cache_key = scoped_cache_key(org_id, token);
        if let Some(status) = cache_read(&self.caches.subscriptions, &cache_key) {
            return Ok(status);
        }
        let _flight = self.single_flight("subscription", &cache_key).await;
        if let Some(status) = cache_read(&self.caches.subscriptions, &cache_key) {
            return Ok(status);
        }

        let url = format!(
            "{}/v1/orgs/{org_id}/subscription",
            self.config.base_url.trim_end_matches('/')
        );
        let response = self
            .authorized_get(&url, token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BillingError::Status {
                status: response.status().as_u16(),
                operation: "subscription lookup",
            });
        }
        let payload = response.json::<Value>().await?;
        let subscription = match payload.get("subscription") {
            Some(Value::Null) | None => None,
            Some(record) => Some(record.clone()),
        };
        let active = subscription
            .as_ref()
            .and_then(subscription_state)
            .map(|state| matches!(state.as_str(), "active" | "trialing"))
            .unwrap_or(false);
        let plan = match subscription
            .as_ref()
            .and_then(|record| record.get("plan_id"))
            .and_then(Value::as_str)
        {
            Some(plan_id) => self.get_plan(plan_id, token).await?,
            None => None,
        };

        let status = SubscriptionStatus {
            active,
            subscription,
            plan,
        };
        cache_write(
            &self.caches.subscriptions,
            &cache_key,
            status.clone(),
            self.cache_ttl_ms,
        );
        Ok(status)
    }

    /// Authorization precedence: caller bearer, then the process service
    /// token, then basic credentials.
    fn authorized_get(&self, url: &str, caller_token: Option<&str>) -> reqwest::RequestBuilder {
        let builder = self.http.get(url).timeout(COMMERCE_TIMEOUT);
        if let Some(token) = caller_token.map(str::trim).filter(|token| !token.is_empty()) {
            return builder.bearer_auth(token);
        }
        if let Some(service_token) = self
            .config
            .service_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            return builder.bearer_auth(service_token);
        }
        if let Some((user, password)) = self.config.basic_credentials.as_ref() {
            return builder.basic_auth(user, Some(password));
        }
        builder
    }

    /// Acquires the per-key flight guard; the guard is dropped by the caller
    /// once its fetch has populated the cache.
    async fn single_flight(&self, domain: &str, cache_key: &str) -> SingleFlightGuard {
        let flight_key = format!("{domain}:{cache_key}");
        let guard = {
            let mut flights = self.flights.lock().await;
            // Drop flight locks nobody is holding so token-scoped keys do
            // not accumulate.
            flights.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(
                flights
                    .entry(flight_key)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        SingleFlightGuard {
            _permit: guard.lock_owned().await,
        }
    }
}

struct SingleFlightGuard {
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

fn subscription_state(record: &Value) -> Option<String> {
    record
        .get("status")
        .or_else(|| record.get("state"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Cache keys carry the caller token so results are scoped per viewer.
fn scoped_cache_key(id: &str, token: Option<&str>) -> String {
    format!("{id}:{}", token.unwrap_or("-"))
}

fn cache_read<V: Clone>(
    cache: &StdMutex<HashMap<String, CacheEntry<V>>>,
    key: &str,
) -> Option<V> {
    let mut cache = cache.lock().unwrap_or_else(|poison| poison.into_inner());
    let now_unix_ms = current_unix_timestamp_ms();
    match cache.get(key) {
        Some(entry) if entry.expires_unix_ms > now_unix_ms => Some(entry.value.clone()),
        Some(_) => {
            cache.remove(key);
            None
        }
        None => None,
    }
}

fn cache_write<V>(
    cache: &StdMutex<HashMap<String, CacheEntry<V>>>,
    key: &str,
    value: V,
    ttl_ms: u64,
) {
    let mut cache = cache.lock().unwrap_or_else(|poison| poison.into_inner());
    cache.insert(
        key.to_string(),
        CacheEntry {
            value,
            expires_unix_ms: current_unix_timestamp_ms().saturating_add(ttl_ms),
        },
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct MockCommerce {
        balance_requests: AtomicUsize,
        plan_requests: AtomicUsize,
        subscription_requests: AtomicUsize,
    }

    async fn start_mock_commerce(state: Arc<MockCommerce>) -> String {
        async fn handle_balance(
            State(state): State<Arc<MockCommerce>>,
            Path(user_id): Path<String>,
        ) -> Json<Value> {
            state.balance_requests.fetch_add(1, Ordering::SeqCst);
            let balance = if user_id == "rich-user" { 12_345 } else { 0 };
            Json(json!({ "balance": balance }))
        }

        async fn handle_plan(
            State(state): State<Arc<MockCommerce>>,
            Path(plan_id): Path<String>,
        ) -> axum::response::Response {
            state.plan_requests.fetch_add(1, Ordering::SeqCst);
            if plan_id == "missing-plan" {
                return StatusCode::NOT_FOUND.into_response();
            }
            Json(json!({ "id": plan_id, "name": "Pro" })).into_response()
        }

        async fn handle_subscription(
            State(state): State<Arc<MockCommerce>>,
            Path(org_id): Path<String>,
        ) -> Json<Value> {
            state.subscription_requests.fetch_add(1, Ordering::SeqCst);
            match org_id.as_str() {
                "active-org" => Json(json!({
                    "subscription": { "id": "sub-1", "status": "active", "plan_id": "pro" }
                })),
                "trial-org" => Json(json!({
                    "subscription": { "id": "sub-2", "status": "trialing" }
                })),
                "lapsed-org" => Json(json!({
                    "subscription": { "id": "sub-3", "status": "canceled" }
                })),
                _ => Json(json!({ "subscription": null })),
            }
        }

        let app = Router::new()
            .route("/v1/users/{user_id}/balance", get(handle_balance))
            .route("/v1/plans/{plan_id}", get(handle_plan))
            .route("/v1/orgs/{org_id}/subscription", get(handle_subscription))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn client_for(base_url: String) -> BillingClient {
        BillingClient::new(BillingClientConfig {
            base_url,
            service_token: Some("svc-token".to_string()),
            basic_credentials: None,
        })
    }

    #[tokio::test]
    async fn balance_lookups_hit_the_cache_within_ttl() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = client_for(base_url);

        assert_eq!(client.get_balance("rich-user", None).await.expect("balance"), 12_345);
        assert_eq!(client.get_balance("rich-user", None).await.expect("balance"), 12_345);
        assert_eq!(commerce.balance_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_keys_are_scoped_by_caller_token() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = client_for(base_url);

        client.get_balance("rich-user", Some("viewer-a")).await.expect("a");
        client.get_balance("rich-user", Some("viewer-b")).await.expect("b");
        assert_eq!(commerce.balance_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_refetched() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = BillingClient::with_cache_ttl_ms(
            BillingClientConfig {
                base_url,
                service_token: None,
                basic_credentials: None,
            },
            1,
        );

        client.get_balance("rich-user", None).await.expect("first");
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.get_balance("rich-user", None).await.expect("second");
        assert_eq!(commerce.balance_requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn plan_404_is_cached_as_null() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = client_for(base_url);

        assert_eq!(client.get_plan("missing-plan", None).await.expect("plan"), None);
        assert_eq!(client.get_plan("missing-plan", None).await.expect("plan"), None);
        assert_eq!(commerce.plan_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscription_status_reports_active_and_trialing() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = client_for(base_url);

        let status = client
            .get_subscription_status("active-org", None)
            .await
            .expect("status");
        assert!(status.active);
        assert_eq!(
            status.plan.as_ref().and_then(|plan| plan["name"].as_str()),
            Some("Pro")
        );

        let status = client
            .get_subscription_status("trial-org", None)
            .await
            .expect("status");
        assert!(status.active);
        assert_eq!(status.plan, None);

        let status = client
            .get_subscription_status("lapsed-org", None)
            .await
            .expect("status");
        assert!(!status.active);

        let status = client
            .get_subscription_status("no-sub-org", None)
            .await
            .expect("status");
        assert!(!status.active);
        assert_eq!(status.subscription, None);
    }

    #[tokio::test]
    async fn concurrent_misses_collapse_into_one_fetch() {
        let commerce = Arc::new(MockCommerce::default());
        let base_url = start_mock_commerce(Arc::clone(&commerce)).await;
        let client = Arc::new(client_for(base_url));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = Arc::clone(&client);
            handles.push(tokio::spawn(async move {
                client.get_balance("rich-user", None).await.expect("balance")
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.expect("join"), 12_345);
        }
        assert_eq!(commerce.balance_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_failures_surface_as_errors() {
        let client = client_for("http://127.0.0.1:9".to_string());
        assert!(matches!(
            client.get_balance("rich-user", None).await,
            Err(BillingError::Http(_))
        ));
    }
}
