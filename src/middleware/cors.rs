use axum::http::{header, HeaderValue, Method};
use tower_http::cors::CorsLayer;
use tracing::warn;

/// CORS for the operator API. Webhooks are server-to-server and never
/// need it; with no configured origins, cross-origin requests are refused.
pub fn create_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("⚠️ Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT])
        .max_age(std::time::Duration::from_secs(60 * 60)) // 1 hour
}
