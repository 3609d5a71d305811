//! Decides which policy handles an intercepted request.

use http::Method;
use hubkit_net::{Origin, PatternSet, Request};

/// Where a request goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Cross-origin; not intercepted.
    Passthrough,
    /// Same-origin non-GET; forwarded to the network, never cached.
    Network,
    /// API traffic; stale-while-revalidate.
    Api,
    /// Everything else; cache-first.
    Static,
}

/// Request router.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Origin,
    api: PatternSet,
}

impl Router {
    pub fn new(origin: Origin, api: PatternSet) -> Self {
        Self { origin, api }
    }

    pub fn route(&self, request: &Request) -> Route {
        if !self.origin.contains(&request.url) {
            Route::Passthrough
        } else if request.method != Method::GET {
            Route::Network
        } else if self.api.matches(&request.url) {
            Route::Api
        } else {
            Route::Static
        }
    }
}
