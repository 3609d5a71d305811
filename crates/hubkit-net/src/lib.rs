//! # HubKit Net
//!
//! Request/response model and network access for the HubKit offline worker.
//!
//! ## Design Goals
//!
//! 1. **One seam for the network**: everything that talks to the network goes
//!    through the [`Fetcher`] trait, so worker policies can run against a fake.
//! 2. **Clonable responses**: bodies are fully buffered [`Bytes`], so one copy
//!    can go to the caller while another is written to a cache.
//! 3. **Replayable options**: [`FetchOptions`] serializes, so a failed request
//!    can be stored and replayed later.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hubkit_common::HubKitError;
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod origin;
pub mod pattern;

pub use origin::Origin;
pub use pattern::{PatternSet, PatternType, UrlPattern};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Network unreachable: {0}")]
    Offline(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid request option: {0}")]
    InvalidOption(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

impl NetError {
    /// True when the request never produced a response (offline, DNS, timeout).
    pub fn is_network_failure(&self) -> bool {
        match self {
            NetError::Offline(_) | NetError::Timeout(_) => true,
            NetError::HttpError(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            NetError::RequestFailed(_) | NetError::InvalidUrl(_) | NetError::InvalidOption(_) => {
                false
            }
        }
    }
}

impl From<NetError> for HubKitError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::Timeout(d) => HubKitError::Timeout(d),
            NetError::InvalidUrl(msg) | NetError::InvalidOption(msg) => {
                HubKitError::InvalidArgument(msg)
            }
            other => HubKitError::network("fetch failed", other),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Credentials mode for requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    /// Never send cookies.
    Omit,
    /// Send cookies only for same-origin requests.
    #[default]
    SameOrigin,
    /// Always send cookies.
    Include,
}

/// Request mode, as seen by the intercepting worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level document load.
    Navigate,
    SameOrigin,
    NoCors,
    #[default]
    Cors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
    pub credentials: CredentialsMode,
    pub mode: RequestMode,
}

impl Request {
    /// Create a request with the given method.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            credentials: CredentialsMode::SameOrigin,
            mode: RequestMode::Cors,
        }
    }

    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Create a top-level navigation request accepting HTML.
    pub fn navigate(url: Url) -> Self {
        let mut request = Self::get(url).header(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,*/*;q=0.8"),
        );
        request.mode = RequestMode::Navigate;
        request
    }

    /// Build a request from a stored options bag.
    pub fn from_options(url: Url, options: &FetchOptions) -> Result<Self, NetError> {
        let method = match options.method.as_deref() {
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|e| NetError::InvalidOption(format!("method {}: {}", m, e)))?,
            None => Method::GET,
        };

        let mut request = Self::new(method, url);
        for (name, value) in &options.headers {
            let n = HeaderName::try_from(name.as_str())
                .map_err(|e| NetError::InvalidOption(format!("header {}: {}", name, e)))?;
            let v = HeaderValue::try_from(value.as_str())
                .map_err(|e| NetError::InvalidOption(format!("header {}: {}", name, e)))?;
            request.headers.insert(n, v);
        }
        request.body = options.body.clone();
        request.credentials = options.credentials.unwrap_or_default();
        request.mode = options.mode.unwrap_or_default();
        Ok(request)
    }

    /// Snapshot this request as a replayable options bag.
    pub fn to_options(&self) -> FetchOptions {
        FetchOptions {
            method: Some(self.method.to_string()),
            headers: self
                .headers
                .iter()
                .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
                .collect(),
            body: self.body.clone(),
            credentials: Some(self.credentials),
            mode: Some(self.mode),
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// The `Accept` header, if any.
    pub fn accept(&self) -> Option<&str> {
        self.headers.get(ACCEPT).and_then(|v| v.to_str().ok())
    }

    /// True when the caller accepts an HTML document.
    pub fn accepts_html(&self) -> bool {
        self.accept().is_some_and(|a| a.contains("text/html"))
    }
}

/// How a response relates to the origin that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Same-origin response.
    #[default]
    Basic,
    /// Cross-origin response.
    Cors,
    /// Cross-origin response with hidden status and body.
    Opaque,
    /// Network error placeholder.
    Error,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: Option<RequestId>,
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    /// Whether at least one redirect was followed.
    pub redirected: bool,
    body: Bytes,
}

impl Response {
    /// Create an empty same-origin response.
    pub fn new(status: StatusCode) -> Self {
        Self {
            request_id: None,
            url: None,
            status,
            headers: HeaderMap::new(),
            response_type: ResponseType::Basic,
            redirected: false,
            body: Bytes::new(),
        }
    }

    /// Create a response synthesized by the worker.
    pub fn synthetic(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static(content_type))
            .with_body(body)
    }

    /// Set a header.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Set the response type.
    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    /// Set the final URL.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    /// Mark the response as having followed redirects.
    pub fn with_redirected(mut self, redirected: bool) -> Self {
        self.redirected = redirected;
        self
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Body bytes. Cloning is cheap.
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// Body as UTF-8 text (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed Content-Type header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// Options bag for a fetch, in the shape a page would pass to `fetch()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    /// Stored as a string when it is UTF-8, otherwise as `{"base64": ...}`.
    #[serde(with = "stored_body", skip_serializing_if = "Option::is_none")]
    pub body: Option<Bytes>,
    pub credentials: Option<CredentialsMode>,
    pub mode: Option<RequestMode>,
}

impl FetchOptions {
    /// Options for a JSON POST.
    pub fn post_json(body: &serde_json::Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            method: Some("POST".to_string()),
            headers,
            body: Some(Bytes::from(body.to_string())),
            ..Default::default()
        }
    }
}

mod stored_body {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Stored {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S: Serializer>(body: &Option<Bytes>, serializer: S) -> Result<S::Ok, S::Error> {
        match body {
            None => serializer.serialize_none(),
            Some(bytes) => {
                let stored = match std::str::from_utf8(bytes) {
                    Ok(text) => Stored::Text(text.to_string()),
                    Err(_) => Stored::Binary {
                        base64: STANDARD.encode(bytes),
                    },
                };
                serializer.serialize_some(&stored)
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Bytes>, D::Error> {
        match Option::<Stored>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Stored::Text(text)) => Ok(Some(Bytes::from(text))),
            Some(Stored::Binary { base64 }) => STANDARD
                .decode(base64)
                .map(|raw| Some(Bytes::from(raw)))
                .map_err(|e| de::Error::custom(format!("body base64: {}", e))),
        }
    }
}

/// Anything that can perform a network fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request and buffer the full response.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

/// Resource loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout applied when the request sets none.
    pub default_timeout: Option<Duration>,
    /// Maximum redirects.
    pub max_redirects: usize,
    /// Enable cookies.
    pub cookies_enabled: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("HubKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "en-US,en;q=0.9".to_string(),
            connect_timeout: Duration::from_secs(10),
            default_timeout: None,
            max_redirects: 10,
            cookies_enabled: true,
        }
    }
}

/// reqwest-backed [`Fetcher`].
pub struct ResourceLoader {
    client: Client,
    config: LoaderConfig,
}

impl ResourceLoader {
    /// Create a new resource loader.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .cookie_store(config.cookies_enabled);
        if let Some(timeout) = config.default_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(user_agent = %config.user_agent, "ResourceLoader initialized");

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    fn classify(err: reqwest::Error, timeout: Option<Duration>) -> NetError {
        if err.is_timeout() {
            NetError::Timeout(timeout.unwrap_or_default())
        } else if err.is_connect() {
            NetError::Offline(err.to_string())
        } else {
            NetError::HttpError(err)
        }
    }
}

#[async_trait]
impl Fetcher for ResourceLoader {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let requested_url = request.url.clone();
        let timeout = request.timeout.or(self.config.default_timeout);

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .header("Accept-Language", &self.config.accept_language);

        if let Some(body) = request.body {
            req_builder = req_builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder
            .send()
            .await
            .map_err(|e| Self::classify(e, timeout))?;

        let status = response.status();
        let headers = response.headers().clone();
        let final_url = response.url().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| Self::classify(e, timeout))?;

        let response_type = if Origin::from_url(&requested_url).contains(&final_url) {
            ResponseType::Basic
        } else {
            ResponseType::Cors
        };
        let redirected = final_url != requested_url;

        trace!(
            url = %final_url,
            status = %status,
            ?response_type,
            redirected,
            body_len = body.len(),
            "Response received"
        );

        Ok(Response {
            request_id: Some(request.id),
            url: Some(final_url),
            status,
            headers,
            response_type,
            redirected,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_request_builder() {
        let request = Request::get(url("https://hub.example.com/api/programs"))
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .timeout(Duration::from_secs(10));

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.accept(), Some("application/json"));
        assert!(!request.accepts_html());
        assert_eq!(request.timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_navigate_accepts_html() {
        let request = Request::navigate(url("https://hub.example.com/programs"));
        assert!(request.accepts_html());
        assert_eq!(request.mode, RequestMode::Navigate);
    }

    #[test]
    fn test_request_id_uniqueness() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn test_options_roundtrip_through_request() {
        let options = FetchOptions::post_json(&serde_json::json!({"email": "founder@example.com"}));
        let request =
            Request::from_options(url("https://hub.example.com/api/applications"), &options)
                .unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(
            request.headers.get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            request.body.as_deref(),
            Some(br#"{"email":"founder@example.com"}"#.as_slice())
        );

        let back = request.to_options();
        assert_eq!(back.method.as_deref(), Some("POST"));
        assert_eq!(back.body, options.body);
    }

    #[test]
    fn test_binary_body_survives_storage() {
        let upload = Bytes::from_static(&[0xff, 0x00, 0xfe, 0x80]);
        let request = Request::post(url("https://hub.example.com/api/uploads"), upload.clone());

        let stored = serde_json::to_value(request.to_options()).unwrap();
        assert_eq!(stored["body"], serde_json::json!({"base64": "/wD+gA=="}));

        let options: FetchOptions = serde_json::from_value(stored).unwrap();
        let replayed = Request::from_options(request.url.clone(), &options).unwrap();
        assert_eq!(replayed.body, Some(upload));
    }

    #[test]
    fn test_text_body_stored_as_string() {
        let options = FetchOptions::post_json(&serde_json::json!({"rating": 5}));
        let stored = serde_json::to_value(&options).unwrap();
        assert_eq!(stored["body"], r#"{"rating":5}"#);

        let legacy: FetchOptions =
            serde_json::from_str(r#"{"method":"POST","body":"name=Acme"}"#).unwrap();
        assert_eq!(legacy.body.as_deref(), Some(b"name=Acme".as_slice()));
    }

    #[test]
    fn test_options_reject_bad_header() {
        let mut options = FetchOptions::default();
        options
            .headers
            .insert("bad header".to_string(), "x".to_string());
        let err = Request::from_options(url("https://hub.example.com/"), &options).unwrap_err();
        assert!(matches!(err, NetError::InvalidOption(_)));
        assert!(!err.is_network_failure());
    }

    #[test]
    fn test_options_deserialize_partial() {
        let options: FetchOptions = serde_json::from_str(r#"{"method":"PUT"}"#).unwrap();
        assert_eq!(options.method.as_deref(), Some("PUT"));
        assert!(options.headers.is_empty());
        assert_eq!(options.credentials, None);
    }

    #[test]
    fn test_synthetic_response() {
        let response = Response::synthetic(
            StatusCode::SERVICE_UNAVAILABLE,
            "application/json",
            r#"{"error":"you are offline"}"#,
        );
        assert!(!response.ok());
        assert_eq!(response.content_type().unwrap().essence_str(), "application/json");
        let body: serde_json::Value = response.json().unwrap();
        assert_eq!(body["error"], "you are offline");
    }

    #[test]
    fn test_response_clone_shares_body() {
        let response = Response::new(StatusCode::OK).with_body("console.log(1)");
        let copy = response.clone();
        assert_eq!(response.text(), copy.text());
        assert_eq!(copy.response_type, ResponseType::Basic);
    }

    #[test]
    fn test_net_error_into_hubkit_error() {
        let err: HubKitError = NetError::Offline("dns".into()).into();
        assert_eq!(err.category(), "network");
        let err: HubKitError = NetError::Timeout(Duration::from_secs(3)).into();
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_loader_config_default() {
        let config = LoaderConfig::default();
        assert!(config.user_agent.starts_with("HubKit/"));
        assert!(config.cookies_enabled);
        assert_eq!(config.default_timeout, None);
    }
}
