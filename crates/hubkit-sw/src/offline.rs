//! Responses synthesized when the network is unreachable.

use http::StatusCode;
use hubkit_net::Response;

/// Body of the API fallback.
pub const OFFLINE_JSON: &str = r#"{"error":"you are offline"}"#;

/// Page served for navigations that fail without a cached copy.
pub const OFFLINE_HTML: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>Offline</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; min-height: 100vh; margin: 0; text-align: center; }
    button { margin-top: 1rem; padding: 0.6rem 1.4rem; font-size: 1rem; cursor: pointer; }
  </style>
</head>
<body>
  <main>
    <h1>You're offline</h1>
    <p>Check your internet connection and try again.</p>
    <button onclick="location.reload()">Retry</button>
  </main>
</body>
</html>
"#;

/// 503 JSON response for API requests with no cached copy.
pub fn api_offline() -> Response {
    Response::synthetic(
        StatusCode::SERVICE_UNAVAILABLE,
        "application/json",
        OFFLINE_JSON,
    )
}

/// Offline HTML page.
pub fn offline_page() -> Response {
    Response::synthetic(StatusCode::OK, "text/html; charset=utf-8", OFFLINE_HTML)
}
