//! Versioned response caches.

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use hubkit_net::{Request, Response, ResponseType};
use serde::{Deserialize, Serialize};
use url::Url;

// ==================== Cache Entry ====================

/// A stored response snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL (fragment stripped).
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Bytes,

    pub response_type: ResponseType,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response for `request`.
    pub fn new(request: &Request, response: &Response, cached_at: i64) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(n, v)| v.to_str().ok().map(|v| (n.to_string(), v.to_string())))
            .collect();

        Self {
            url: normalize_url(&request.url),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.bytes(),
            response_type: response.response_type,
            cached_at,
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        let mut response = Response::new(status)
            .with_body(self.body.clone())
            .with_type(self.response_type);
        response.headers = headers;
        if let Ok(url) = Url::parse(&self.url) {
            response = response.with_url(url);
        }
        response
    }

    /// Key under which this entry is stored.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}

/// Request identity: method plus URL without fragment.
pub fn request_key(method: &Method, url: &Url) -> String {
    format!("{} {}", method, normalize_url(url))
}

fn normalize_url(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

// ==================== Cache ====================

/// A cache instance.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.entries.get(&request_key(&request.method, &request.url))
    }

    /// Store (or overwrite) the response for a request.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Delete entry.
    pub fn delete(&mut self, request: &Request) -> bool {
        self.entries
            .remove(&request_key(&request.method, &request.url))
            .is_some()
    }

    /// Cached URLs, sorted.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.entries.values().map(|e| e.url.as_str()).collect();
        keys.sort_unstable();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ==================== Cache Storage ====================

/// All caches of the origin.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Get a cache mutably without creating it.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cache> {
        self.caches.get_mut(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Match a request in the named cache.
    pub fn match_in(&self, name: &str, request: &Request) -> Option<CacheEntry> {
        self.caches
            .get(name)
            .and_then(|cache| cache.match_request(request))
            .cloned()
    }
}
