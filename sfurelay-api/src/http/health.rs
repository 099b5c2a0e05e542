//! Health check and stats endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::http::AppState;

/// Health check router
pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Current connection statistics
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.stats_snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use sfurelay_sfu::test_helpers::MockTransportFactory;
    use sfurelay_sfu::{SfuConfig, SfuManager};
    use tower::ServiceExt;

    use crate::http::GatewaySettings;

    fn app() -> Router {
        let manager = SfuManager::new(SfuConfig::default(), MockTransportFactory::new());
        create_health_router().with_state(AppState::new(manager, GatewaySettings::default()))
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = app()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let response = app()
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["current_sessions"], 0);
        assert_eq!(stats["peak_sessions"], 0);
        assert_eq!(stats["consumers"], 0);
    }
}
