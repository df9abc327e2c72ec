//! Resilient fetch pipeline
//!
//! [`ResilientFetcher::request`] composes the components in a fixed order:
//!
//! 1. derive the cache key (method included)
//! 2. reads go through [`TieredCache::swr`], whose network leg is
//!    `scheduler.deduplicate(key, || breaker.execute_with_fallback(endpoint, fetch, cache_fallback))`
//! 3. the cache fallback only answers an open circuit, and only from a cached
//!    value; that value is tagged [`Fetched::Fallback`] so it is never written back
//! 4. mutations skip cache and deduplication, and run through the breaker without fallback

use crate::cache::{
    CacheKey, CacheKeyBuilder, CacheOptions, EndpointClassifier, Fetched, KeyRequest, MemoryStore,
    PersistentStore, TieredCache,
};
use crate::circuit::{CircuitBreaker, CircuitState};
use crate::config::FetchConfig;
use crate::error::{FetchError, Result};
use crate::scheduler::{Priority, RequestScheduler};
use crate::telemetry::{NoopTelemetry, RequestOutcome, TelemetrySink};
use crate::transport::{Headers, HttpMethod, Transport, TransportRequest};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: HttpMethod,

    /// Request headers; these participate in the cache key
    pub headers: Headers,

    pub body: Option<String>,

    /// Overrides the fetcher's session principal for key scoping
    pub principal_id: Option<String>,

    pub priority: Priority,

    pub cache: CacheOptions,

    /// Bypass the cache for this read (still deduplicated and circuit-guarded)
    pub no_cache: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get() -> Self {
        Self::new()
    }

    pub fn post() -> Self {
        Self::new().method(HttpMethod::Post)
    }

    pub fn method(mut self, method: HttpMethod) -> Self {
        self.method = method;
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `payload` as the JSON body
    pub fn json<T: Serialize>(self, payload: &T) -> Result<Self> {
        let body = serde_json::to_string(payload)?;
        Ok(self.body(body).header("Content-Type", "application/json"))
    }

    pub fn principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn no_cache(mut self, no_cache: bool) -> Self {
        self.no_cache = no_cache;
        self
    }
}

#[derive(Debug, Default)]
struct Session {
    auth_token: Option<String>,
    principal_id: Option<String>,
}

struct FetcherInner {
    base_url: String,
    transport: Arc<dyn Transport>,
    cache: TieredCache,
    breaker: CircuitBreaker,
    scheduler: RequestScheduler<Fetched<Value>>,
    key_builder: CacheKeyBuilder,
    telemetry: Arc<dyn TelemetrySink>,
    default_headers: Headers,
    session: RwLock<Session>,
}

/// Entry point for every outbound API call
///
/// Cheap to clone; clones share cache, circuits and in-flight requests.
#[derive(Clone)]
pub struct ResilientFetcher {
    inner: Arc<FetcherInner>,
}

impl ResilientFetcher {
    pub fn builder() -> ResilientFetcherBuilder {
        ResilientFetcherBuilder::default()
    }

    /// Fetch `endpoint` and decode the JSON response into `T`
    pub async fn request<T: DeserializeOwned>(&self, endpoint: &str, options: RequestOptions) -> Result<T> {
        let value = self.request_value(endpoint, options).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch `endpoint` and return the raw JSON response
    ///
    /// Non-JSON bodies come back as a string value and empty bodies as `null`.
    pub async fn request_value(&self, endpoint: &str, options: RequestOptions) -> Result<Value> {
        let started = Instant::now();
        let key = self.cache_key(endpoint, &options).await;

        let result = if !options.method.is_read() {
            debug!("Mutation {} {}", options.method, endpoint);
            self.inner
                .breaker
                .execute(endpoint, || self.do_fetch(endpoint, &options))
                .await
        } else if options.no_cache {
            self.network_call(endpoint, &key, &options, false)
                .await
                .map(Fetched::into_inner)
        } else {
            let fetcher = self.clone();
            let network_endpoint = endpoint.to_string();
            let network_key = key.clone();
            let network_options = options.clone();
            let network = move || async move {
                fetcher
                    .network_call(&network_endpoint, &network_key, &network_options, true)
                    .await
            };
            self.inner.cache.swr_fetched(&key, network, &options.cache).await
        };

        let outcome = match &result {
            Ok(_) => RequestOutcome::Success,
            Err(e) if e.is_circuit_open() => RequestOutcome::ShortCircuited,
            Err(_) => RequestOutcome::Failure,
        };
        self.inner
            .telemetry
            .record_request(endpoint, started.elapsed(), outcome);

        result
    }

    /// Cache key the fetcher would use for this call
    pub async fn cache_key(&self, endpoint: &str, options: &RequestOptions) -> CacheKey {
        let session_principal = self.inner.session.read().await.principal_id.clone();
        let principal = options.principal_id.clone().or(session_principal);

        let mut request = KeyRequest::new().method(options.method.as_str());
        if !options.headers.is_empty() {
            request = request.headers(&options.headers);
        }
        if let Some(body) = options.body.as_deref() {
            request = request.body(body);
        }

        self.inner
            .key_builder
            .build_key(endpoint, &request, principal.as_deref())
    }

    /// Drop one cached entry from both tiers
    pub async fn invalidate(&self, key: &str) {
        self.inner.cache.remove(key).await;
    }

    /// Drop every cached entry whose key starts with `prefix`, e.g. an endpoint path
    pub async fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.inner.cache.remove_by_prefix(prefix).await
    }

    pub async fn set_auth_token(&self, token: Option<String>) {
        let mut session = self.inner.session.write().await;
        session.auth_token = token;
    }

    /// Principal used to scope keys of principal-specific endpoints
    pub async fn set_principal(&self, principal_id: Option<String>) {
        let mut session = self.inner.session.write().await;
        if session.principal_id != principal_id {
            info!("Switching cache principal");
        }
        session.principal_id = principal_id;
    }

    pub async fn circuit_state(&self, endpoint: &str) -> CircuitState {
        self.inner.breaker.state(endpoint).await
    }

    pub async fn reset_circuit(&self, endpoint: &str) {
        self.inner.breaker.reset(endpoint).await;
    }

    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    pub fn scheduler(&self) -> &RequestScheduler<Fetched<Value>> {
        &self.inner.scheduler
    }

    pub fn key_builder(&self) -> &CacheKeyBuilder {
        &self.inner.key_builder
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    /// Deduplicated, circuit-guarded network leg of a read
    async fn network_call(
        &self,
        endpoint: &str,
        key: &str,
        options: &RequestOptions,
        with_cache_fallback: bool,
    ) -> Result<Fetched<Value>> {
        let fetcher = self.clone();
        let endpoint = endpoint.to_string();
        let owned_key = key.to_string();
        let options_for_call = options.clone();

        self.inner
            .scheduler
            .deduplicate(key, options.priority, move || async move {
                let breaker = &fetcher.inner.breaker;
                let fetch = || async {
                    fetcher
                        .do_fetch(&endpoint, &options_for_call)
                        .await
                        .map(Fetched::Fresh)
                };
                if with_cache_fallback {
                    breaker
                        .execute_with_fallback(&endpoint, fetch, |e| fetcher.cache_fallback(&owned_key, e))
                        .await
                } else {
                    breaker.execute(&endpoint, fetch).await
                }
            })
            .await
    }

    /// Serve a cached value when the circuit is open; anything else re-raises
    async fn cache_fallback(&self, key: &str, error: FetchError) -> Result<Fetched<Value>> {
        if !error.is_circuit_open() {
            return Err(error);
        }

        match self.inner.cache.get::<Value>(key, &CacheOptions::default()).await {
            Some(value) => {
                warn!("Serving cached value for {} while circuit is open: {}", key, error);
                Ok(Fetched::Fallback(value))
            }
            None => Err(error),
        }
    }

    async fn do_fetch(&self, endpoint: &str, options: &RequestOptions) -> Result<Value> {
        let mut headers = self.inner.default_headers.clone();
        headers.extend(options.headers.clone());

        if let Some(token) = self.inner.session.read().await.auth_token.as_ref() {
            headers.insert("Authorization".to_string(), format!("Bearer {}", token));
        }
        if options.method.is_read() {
            headers.insert("Cache-Control".to_string(), "no-cache".to_string());
        }
        headers.insert("X-Request-Id".to_string(), Uuid::new_v4().to_string());

        let request = TransportRequest {
            url: self.url_for(endpoint),
            method: options.method,
            headers,
            body: options.body.clone(),
        };

        debug!("{} {}", request.method, request.url);
        let response = self.inner.transport.send(request).await?;

        if !response.is_success() {
            return Err(FetchError::Http {
                status: response.status,
                body: response.text(),
            });
        }

        if response.body.is_empty() {
            return Ok(Value::Null);
        }
        match serde_json::from_slice(&response.body) {
            Ok(value) => Ok(value),
            Err(_) => Ok(Value::String(response.text())),
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }

        let base = self.inner.base_url.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{}{}", base, endpoint)
        } else {
            format!("{}/{}", base, endpoint)
        }
    }
}

/// Builder for [`ResilientFetcher`]; only the transport is required
#[derive(Default)]
pub struct ResilientFetcherBuilder {
    config: Option<FetchConfig>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn PersistentStore>>,
    classifier: Option<EndpointClassifier>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    default_headers: Headers,
    auth_token: Option<String>,
    principal_id: Option<String>,
}

impl ResilientFetcherBuilder {
    pub fn config(mut self, config: FetchConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Backing store for the persistent tier (defaults to in-process memory)
    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn classifier(mut self, classifier: EndpointClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn principal(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn build(self) -> Result<ResilientFetcher> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let transport = self
            .transport
            .ok_or_else(|| FetchError::ConfigError("a transport is required".to_string()))?;
        let telemetry = self.telemetry.unwrap_or_else(|| Arc::new(NoopTelemetry));
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let cache = TieredCache::new(config.cache, store).with_telemetry(telemetry.clone());
        let breaker = CircuitBreaker::new(config.circuit).with_telemetry(telemetry.clone());
        let scheduler = RequestScheduler::new(config.scheduler);
        let key_builder = CacheKeyBuilder::new(self.classifier.unwrap_or_default());

        info!("Resilient fetcher ready (base url: {:?})", config.base_url);

        Ok(ResilientFetcher {
            inner: Arc::new(FetcherInner {
                base_url: config.base_url,
                transport,
                cache,
                breaker,
                scheduler,
                key_builder,
                telemetry,
                default_headers: self.default_headers,
                session: RwLock::new(Session {
                    auth_token: self.auth_token,
                    principal_id: self.principal_id,
                }),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportResponse;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<TransportRequest>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
            self.requests.lock().unwrap().push(request);
            Ok(TransportResponse::new(200, r#"{"ok":true}"#))
        }
    }

    fn fetcher(transport: Arc<RecordingTransport>) -> ResilientFetcher {
        ResilientFetcher::builder()
            .config(FetchConfig::builder().base_url("https://api.example.com/").build())
            .transport(transport)
            .default_header("Accept", "application/json")
            .auth_token("secret")
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_transport() {
        let result = ResilientFetcher::builder().build();
        assert!(matches!(result, Err(FetchError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_read_headers_and_url() {
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = fetcher(transport.clone());

        let value = fetcher.request_value("/api/feed", RequestOptions::get()).await.unwrap();
        assert_eq!(value, serde_json::json!({"ok": true}));

        let requests = transport.requests.lock().unwrap();
        let sent = &requests[0];
        assert_eq!(sent.url, "https://api.example.com/api/feed");
        assert_eq!(sent.headers["Authorization"], "Bearer secret");
        assert_eq!(sent.headers["Cache-Control"], "no-cache");
        assert_eq!(sent.headers["Accept"], "application/json");
        assert!(Uuid::parse_str(&sent.headers["X-Request-Id"]).is_ok());
    }

    #[tokio::test]
    async fn test_mutation_has_no_cache_control() {
        let transport = Arc::new(RecordingTransport::default());
        let fetcher = fetcher(transport.clone());
        fetcher.set_auth_token(None).await;

        let options = RequestOptions::post().json(&serde_json::json!({"text": "hi"})).unwrap();
        fetcher.request_value("/api/posts", options).await.unwrap();

        let requests = transport.requests.lock().unwrap();
        assert!(!requests[0].headers.contains_key("Cache-Control"));
        assert!(!requests[0].headers.contains_key("Authorization"));
        assert_eq!(requests[0].body.as_deref(), Some(r#"{"text":"hi"}"#));
    }

    #[tokio::test]
    async fn test_cache_key_uses_session_principal() {
        let fetcher = fetcher(Arc::new(RecordingTransport::default()));

        let anonymous = fetcher.cache_key("/api/me", &RequestOptions::get()).await;
        fetcher.set_principal(Some("u1".to_string())).await;
        let scoped = fetcher.cache_key("/api/me", &RequestOptions::get()).await;
        let overridden = fetcher
            .cache_key("/api/me", &RequestOptions::get().principal("u2"))
            .await;

        assert_eq!(anonymous, "/api/me|method:GET");
        assert_eq!(scoped, "/api/me|principal:u1|method:GET");
        assert_eq!(overridden, "/api/me|principal:u2|method:GET");
    }

    #[test]
    fn test_url_for_absolute_and_relative() {
        let fetcher = fetcher(Arc::new(RecordingTransport::default()));
        assert_eq!(fetcher.url_for("api/feed"), "https://api.example.com/api/feed");
        assert_eq!(fetcher.url_for("https://cdn.example.com/x"), "https://cdn.example.com/x");
    }
}
