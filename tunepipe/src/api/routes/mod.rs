//! API route modules.

pub mod events;
pub mod health;
pub mod media;

use axum::Router;

use crate::api::server::AppState;

/// Create the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/api", media::router().merge(events::router()))
        .nest("/health", health::router())
        .with_state(state)
}


#[cfg(all(test, unix))]
mod tests {
    use super::test_support::*;
    use crate::resolver::search::MockSearchProvider;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_routes() {
        let dir = tempfile::tempdir().unwrap();

        let response = get(router(&dir, MockSearchProvider::new()), "/health").await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));

        let response = get(router(&dir, MockSearchProvider::new()), "/health/live").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "alive");
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let response = get(router(&dir, MockSearchProvider::new()), "/api/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
