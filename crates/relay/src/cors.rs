// CORS for the relay's read-only HTTP surface (`/healthz`, `/metrics`).
//
// Browser editors open the WebSocket directly, which CORS does not govern;
// this layer only matters for dashboards polling the HTTP routes.

use std::time::Duration;

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Origins allowed when no list is configured.
const DEFAULT_DEV_ORIGINS: &[&str] =
    &["http://localhost:3000", "http://localhost:5173", "http://127.0.0.1:3000", "http://127.0.0.1:5173"];

/// Build a [`CorsLayer`] from the configured origin list.
///
/// `"*"` allows any origin, a comma-separated list allows exactly those, and
/// `None` falls back to the local development origins.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([REQUEST_ID_HEADER])
        .expose_headers([REQUEST_ID_HEADER])
        .max_age(Duration::from_secs(3600));

    match origins.map(str::trim) {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(list) => base.allow_origin(parse_origins(list.split(','))),
        None => base.allow_origin(parse_origins(DEFAULT_DEV_ORIGINS.iter().copied())),
    }
}

fn parse_origins<'a>(origins: impl Iterator<Item = &'a str>) -> Vec<HeaderValue> {
    origins
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get, Router};
    use tower::ServiceExt;

    fn test_app(origins: Option<&str>) -> Router {
        Router::new().route("/metrics", get(|| async { "ok" })).layer(cors_layer(origins))
    }

    fn preflight(origin: &str) -> Request<Body> {
        Request::builder()
            .method(Method::OPTIONS)
            .uri("/metrics")
            .header("origin", origin)
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn default_origins_cover_local_dev_servers() {
        let response = test_app(None).oneshot(preflight("http://localhost:5173")).await.unwrap();
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "http://localhost:5173");
    }

    #[tokio::test]
    async fn unknown_origin_gets_no_allow_header() {
        let response = test_app(None).oneshot(preflight("https://evil.example.com")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn configured_list_replaces_defaults() {
        let app = test_app(Some("https://flows.example.com, https://staging.example.com"));
        let response = app.clone().oneshot(preflight("https://staging.example.com")).await.unwrap();
        assert_eq!(
            response.headers().get("access-control-allow-origin").unwrap(),
            "https://staging.example.com"
        );

        let response = app.oneshot(preflight("http://localhost:3000")).await.unwrap();
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn wildcard_allows_any_origin() {
        let response = test_app(Some("*")).oneshot(preflight("https://anything.example.com")).await.unwrap();
        assert_eq!(response.headers().get("access-control-allow-origin").unwrap(), "*");
    }
}
