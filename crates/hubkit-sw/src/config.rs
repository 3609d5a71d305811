//! Worker configuration

use std::path::Path;
use std::time::Duration;

use hubkit_common::RetryConfig;
use hubkit_net::{Origin, PatternSet};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Offline worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker controls, e.g. `https://hub.example`
    pub origin: String,

    /// Cache name prefix
    pub cache_prefix: String,

    /// Cache version; bumping it supersedes every older cache on activation
    pub cache_version: String,

    /// App shell paths fetched on install
    pub manifest: Vec<String>,

    /// URL segments that mark a request as API traffic
    pub api_prefixes: Vec<String>,

    /// Path suffixes that static responses must carry to be cached
    pub cacheable_extensions: Vec<String>,

    /// Background sync tag that triggers a queue drain
    pub sync_tag: String,

    /// Backoff for failed sync replays
    pub sync_retry: RetryPolicy,

    /// Retries per manifest entry during install
    pub install_retry: RetryPolicy,

    /// Per-request network timeout; unbounded when absent
    pub network_timeout_ms: Option<u64>,

    /// Push notification settings
    pub notifications: NotificationSettings,
}

/// Serializable form of [`RetryConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    /// Notification title
    pub title: String,

    /// Body used when a push carries no payload
    pub default_body: String,

    pub icon: String,
    pub badge: String,

    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            cache_prefix: "entrepreneurship-hub".to_string(),
            cache_version: "v1".to_string(),
            manifest: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/static/js/bundle.js".to_string(),
            ],
            api_prefixes: vec!["/api/".to_string()],
            cacheable_extensions: [".js", ".css", ".png", ".jpg", ".ico"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            sync_tag: "sync-pending-requests".to_string(),
            sync_retry: RetryPolicy::sync_default(),
            install_retry: RetryPolicy::none(),
            network_timeout_ms: None,
            notifications: NotificationSettings::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sync_default()
    }
}

impl RetryPolicy {
    /// Up to five replays, starting 30s apart and capped at an hour.
    pub fn sync_default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 30_000,
            max_delay_ms: 3_600_000,
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            title: "Entrepreneurship Hub".to_string(),
            default_body: "New update from Entrepreneurship Hub".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/badge-72x72.png".to_string(),
            vibrate: vec![100, 50, 100],
        }
    }
}

impl WorkerConfig {
    /// Configuration for the given origin with every other value defaulted.
    pub fn for_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            ..Default::default()
        }
    }

    /// Load a JSON configuration file and validate it.
    pub fn load(path: &Path) -> Result<Self, ServiceWorkerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServiceWorkerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|e| {
            ServiceWorkerError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would otherwise fail later at runtime.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        let origin = self.origin()?;
        if origin.is_opaque() {
            return Err(ServiceWorkerError::Config(format!(
                "Origin {} has no host",
                self.origin
            )));
        }
        if self.cache_version.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_version must not be empty".to_string(),
            ));
        }
        if self.sync_tag.is_empty() {
            return Err(ServiceWorkerError::Config(
                "sync_tag must not be empty".to_string(),
            ));
        }
        if self.network_timeout_ms == Some(0) {
            return Err(ServiceWorkerError::Config(
                "network_timeout_ms must be positive".to_string(),
            ));
        }
        for path in &self.manifest {
            self.resolve(path)?;
        }
        Ok(())
    }

    /// Name of the cache owned by this version.
    pub fn cache_name(&self) -> String {
        if self.cache_prefix.is_empty() {
            self.cache_version.clone()
        } else {
            format!("{}-{}", self.cache_prefix, self.cache_version)
        }
    }

    pub fn origin(&self) -> Result<Origin, ServiceWorkerError> {
        Origin::parse(&self.origin)
            .map_err(|e| ServiceWorkerError::Config(format!("Invalid origin {}: {}", self.origin, e)))
    }

    /// Root URL of the origin.
    pub fn origin_url(&self) -> Result<Url, ServiceWorkerError> {
        self.origin()?
            .root_url()
            .ok_or_else(|| ServiceWorkerError::Config(format!("Origin {} has no host", self.origin)))
    }

    /// Resolve a path (or absolute URL) against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin_url()?
            .join(path)
            .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{}: {}", path, e)))
    }

    pub fn api_patterns(&self) -> PatternSet {
        PatternSet::contains_any(&self.api_prefixes)
    }

    pub fn cacheable_patterns(&self) -> PatternSet {
        PatternSet::extensions(&self.cacheable_extensions)
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_ms.map(Duration::from_millis)
    }
}
