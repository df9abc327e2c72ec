//! Deterministic cache key derivation
//!
//! A key concatenates, in fixed order, the endpoint, an optional
//! `principal:<id>` tag, `method:<METHOD>`, `headers:<k:v,...>` sorted by
//! header name, and `body:<...>` with JSON bodies canonicalized so that
//! semantically identical payloads collapse to the same key.

use crate::cache::types::CacheKey;
use crate::error::FetchError;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const SEGMENT_SEPARATOR: &str = "|";

/// Decides which endpoints get a `principal:` segment
///
/// Public endpoints bypass principal tagging, principal-specific endpoints
/// force it, and anything unlisted is treated as principal-specific so one
/// user's responses can never be served to another.
#[derive(Debug, Clone, Default)]
pub struct EndpointClassifier {
    public: Vec<String>,
    principal_specific: Vec<String>,
}

impl EndpointClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an endpoint (or path prefix) whose responses are identical for every principal
    pub fn public(mut self, pattern: impl Into<String>) -> Self {
        self.public.push(pattern.into());
        self
    }

    /// Add an endpoint (or path prefix) whose responses depend on the principal
    pub fn principal_specific(mut self, pattern: impl Into<String>) -> Self {
        self.principal_specific.push(pattern.into());
        self
    }

    /// Whether keys for `endpoint` must carry the principal id
    pub fn is_principal_specific(&self, endpoint: &str) -> bool {
        let path = endpoint.split('?').next().unwrap_or(endpoint);

        if self.principal_specific.iter().any(|p| matches_pattern(path, p)) {
            return true;
        }
        !self.public.iter().any(|p| matches_pattern(path, p))
    }
}

/// Exact match, or prefix match on a path-segment boundary
fn matches_pattern(path: &str, pattern: &str) -> bool {
    if path == pattern {
        return true;
    }
    match path.strip_prefix(pattern) {
        Some(rest) => pattern.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

/// The request attributes that participate in a key
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyRequest<'a> {
    method: Option<&'a str>,
    headers: Option<&'a HashMap<String, String>>,
    body: Option<&'a str>,
}

impl<'a> KeyRequest<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: &'a str) -> Self {
        self.method = Some(method);
        self
    }

    pub fn headers(mut self, headers: &'a HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn body(mut self, body: &'a str) -> Self {
        self.body = Some(body);
        self
    }
}

/// Builds cache keys; pure and infallible
#[derive(Debug, Clone, Default)]
pub struct CacheKeyBuilder {
    classifier: EndpointClassifier,
}

impl CacheKeyBuilder {
    pub fn new(classifier: EndpointClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &EndpointClassifier {
        &self.classifier
    }

    /// Build the cache key for a request
    pub fn build_key(
        &self,
        endpoint: &str,
        request: &KeyRequest<'_>,
        principal_id: Option<&str>,
    ) -> CacheKey {
        let mut segments: Vec<String> = vec![endpoint.to_string()];

        if let Some(id) = principal_id {
            if self.classifier.is_principal_specific(endpoint) {
                segments.push(format!("principal:{}", id));
            }
        }

        let method = request
            .method
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "GET".to_string());
        segments.push(format!("method:{}", method));

        if let Some(headers) = request.headers {
            if !headers.is_empty() {
                segments.push(format!("headers:{}", header_segment(headers)));
            }
        }

        if let Some(body) = request.body {
            segments.push(format!("body:{}", body_segment(body)));
        }

        segments.join(SEGMENT_SEPARATOR)
    }
}

/// `k:v` pairs sorted by lower-cased header name
fn header_segment(headers: &HashMap<String, String>) -> String {
    let sorted: BTreeMap<String, &str> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.as_str()))
        .collect();

    sorted
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn body_segment(body: &str) -> String {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(_) => return body.to_string(),
    };

    match serde_json::to_string(&canonicalize(parsed)) {
        Ok(canonical) => canonical,
        Err(e) => {
            let err = FetchError::KeyBuild(format!("body canonicalization failed: {}", e));
            debug!("{}; using raw body", err);
            body.to_string()
        }
    }
}

/// Rebuild a JSON value with object keys in sorted order at every depth
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
