// Module: http
// Router, static files and the signaling WebSocket

pub mod health;
pub mod websocket;

use axum::{
    extract::{ws::rejection::WebSocketUpgradeRejection, State, WebSocketUpgrade},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use sfurelay_core::Config;
use sfurelay_sfu::SfuManager;

use crate::signaling::SignalingRouter;

/// Gateway limits and timings, taken from `server` and `gateway` config
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub max_message_size: usize,
    pub heartbeat_interval: Duration,
    /// `None` disables the per-ping deadline
    pub pong_timeout: Option<Duration>,
    pub outbound_buffer: usize,
}

impl GatewaySettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_message_size: config.server.max_message_size,
            heartbeat_interval: config.gateway.heartbeat_interval(),
            pong_timeout: config.gateway.pong_timeout(),
            outbound_buffer: config.gateway.outbound_buffer,
        }
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SfuManager>,
    pub signaling: Arc<SignalingRouter>,
    pub gateway: GatewaySettings,
}

impl AppState {
    #[must_use]
    pub fn new(manager: Arc<SfuManager>, gateway: GatewaySettings) -> Self {
        Self {
            signaling: Arc::new(SignalingRouter::new(Arc::clone(&manager))),
            manager,
            gateway,
        }
    }
}

/// Create the HTTP router with all routes
///
/// `/` and `/ws` accept the signaling WebSocket; a plain `GET /` redirects to
/// the static client.
pub fn create_router(state: AppState, config: &Config) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route("/ws", get(websocket::websocket_handler))
        .merge(health::create_health_router());

    if let Some(dir) = &config.server.static_dir {
        let static_files = ServiceBuilder::new()
            .layer(SetResponseHeaderLayer::if_not_present(
                header::CACHE_CONTROL,
                HeaderValue::from_static("public, max-age=3600"),
            ))
            .service(ServeDir::new(dir));
        router = router.fallback_service(static_files);
    }

    let router = router
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=31536000; includeSubDomains"),
        ))
        .layer(cors_layer(&config.server.allowed_origins))
        .layer(TraceLayer::new_for_http());

    // Apply state to all routes (must be last)
    router.with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
}

async fn root_handler(
    State(state): State<AppState>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => websocket::upgrade(ws, state),
        Err(_) => Redirect::temporary("/index.html").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use sfurelay_sfu::test_helpers::MockTransportFactory;
    use sfurelay_sfu::SfuConfig;
    use tower::ServiceExt;

    fn app(config: &Config) -> Router {
        let manager = SfuManager::new(SfuConfig::default(), MockTransportFactory::new());
        create_router(AppState::new(manager, GatewaySettings::from_config(config)), config)
    }

    #[tokio::test]
    async fn test_root_redirects_to_index() {
        let response = app(&Config::default())
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "/index.html");
    }

    #[tokio::test]
    async fn test_security_headers_on_every_response() {
        let response = app(&Config::default())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let headers = response.headers();
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::X_XSS_PROTECTION], "1; mode=block");
        assert_eq!(
            headers[header::STRICT_TRANSPORT_SECURITY],
            "max-age=31536000; includeSubDomains"
        );
    }

    #[tokio::test]
    async fn test_static_files_are_cached() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<html></html>").unwrap();

        let mut config = Config::default();
        config.server.static_dir = Some(dir.path().to_string_lossy().into_owned());

        let response = app(&config)
            .oneshot(Request::builder().uri("/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "public, max-age=3600");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"<html></html>");
    }

    #[tokio::test]
    async fn test_cors_restricted_origins() {
        let mut config = Config::default();
        config.server.allowed_origins = vec!["https://app.example.com".to_string()];

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "https://app.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "https://app.example.com"
        );

        let response = app(&config)
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header(header::ORIGIN, "https://evil.example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
    }
}
