//! burrow relay server
//!
//! Public HTTP surface (control plane + reverse proxy) and the WebSocket
//! transport endpoint agents dial into.

pub mod api;
pub mod config;
pub mod connect;
pub mod error;
pub mod models;
pub mod proxy;
pub mod sweep;

use axum::{
    middleware,
    routing::{any, delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use config::{ConfigError, ServerConfig};

use burrow_control::{Clock, SystemClock, TunnelRegistry};
use burrow_proto::FrameCodec;

/// Application state shared across handlers
pub struct AppState {
    pub config: ServerConfig,
    pub registry: TunnelRegistry,
    pub codec: FrameCodec,
}

impl AppState {
    pub fn new(config: ServerConfig, clock: Arc<dyn Clock>) -> Self {
        let registry = TunnelRegistry::new(config.registry_config(), clock);
        let codec = FrameCodec::new(config.max_frame_bytes);
        Self {
            config,
            registry,
            codec,
        }
    }
}

/// Build the full router: info routes, operator API, transport endpoint,
/// and the proxy catch-all
pub fn build_router(state: Arc<AppState>) -> Router {
    let operator_api = Router::new()
        .route("/create", post(api::create_tunnel))
        .route("/list", get(api::list_tunnels))
        .route("/{tunnel_id}/status", get(api::tunnel_status))
        .route("/{tunnel_id}", delete(api::delete_tunnel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_operator,
        ));

    Router::new()
        .route("/", get(api::root))
        .route("/health", get(api::health))
        .route("/api", get(api::api_info))
        .route("/api/tunnel/connect/{tunnel_id}", get(connect::tunnel_connect))
        .nest("/api/tunnels", operator_api)
        .route("/{*path}", any(proxy::proxy_request))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the server until interrupted
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::new(config.bind_addr, config.api_port);
    let state = Arc::new(AppState::new(config, Arc::new(SystemClock)));

    sweep::spawn_sweeper(state.clone());

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "burrow server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use burrow_control::{SessionConfig, TunnelSpec};
    use crate::error::ErrorBody;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let config = ServerConfig {
            api_key: "operator-key".to_string(),
            admin_key: Some("admin-key".to_string()),
            ..Default::default()
        };
        Arc::new(AppState::new(config, Arc::new(SystemClock)))
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = build_router(test_state());

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let health: models::HealthResponse = body_json(response).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.name, "burrow");
    }

    #[tokio::test]
    async fn test_api_info_is_public() {
        let app = build_router(test_state());

        let response = app
            .oneshot(Request::get("/api").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_root_returns_json_404() {
        let app = build_router(test_state());

        let response = app
            .oneshot(Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_operator_auth_missing_key_is_401() {
        let app = build_router(test_state());

        let response = app
            .oneshot(Request::get("/api/tunnels/list").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "UNAUTHORIZED");
    }

    #[tokio::test]
    async fn test_operator_auth_wrong_key_is_403() {
        let app = build_router(test_state());

        let response = app
            .oneshot(
                Request::get("/api/tunnels/list")
                    .header("x-api-key", "nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_operator_auth_accepts_both_keys() {
        for key in ["operator-key", "admin-key"] {
            let app = build_router(test_state());
            let response = app
                .oneshot(
                    Request::get("/api/tunnels/list")
                        .header("x-api-key", key)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_create_list_delete_flow() {
        let state = test_state();

        let response = build_router(state.clone())
            .oneshot(
                Request::post("/api/tunnels/create")
                    .header("x-api-key", "operator-key")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"web","local_port":3000}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let created: models::CreateTunnelResponse = body_json(response).await;
        assert!(created.url.ends_with(&created.tunnel_id));
        assert_eq!(created.auth_token.len(), 43);

        let response = build_router(state.clone())
            .oneshot(
                Request::get("/api/tunnels/list")
                    .header("x-api-key", "operator-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let listed: models::TunnelListResponse = body_json(response).await;
        assert_eq!(listed.total, 1);
        assert_eq!(listed.tunnels[0].tunnel_id, created.tunnel_id);
        assert!(!listed.tunnels[0].connected);

        let response = build_router(state.clone())
            .oneshot(
                Request::get(format!("/api/tunnels/{}/status", created.tunnel_id))
                    .header("x-api-key", "operator-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = build_router(state.clone())
            .oneshot(
                Request::delete(format!("/api/tunnels/{}", created.tunnel_id))
                    .header("x-api-key", "operator-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        // second delete: the tunnel is already gone
        let response = build_router(state)
            .oneshot(
                Request::delete(format!("/api/tunnels/{}", created.tunnel_id))
                    .header("x-api-key", "operator-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_unknown_tunnel_is_404() {
        let app = build_router(test_state());

        let response = app
            .oneshot(
                Request::get("/api/tunnels/doesnotexist1/status")
                    .header("x-api-key", "operator-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_unknown_tunnel_is_404() {
        let app = build_router(test_state());

        let response = app
            .oneshot(Request::get("/zzzznotatunnel/index.html").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "TUNNEL_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_proxy_unattached_tunnel_is_503() {
        let state = test_state();
        let created = state.registry.create(TunnelSpec::default()).await.unwrap();

        let response = build_router(state)
            .oneshot(
                Request::get(format!("/{}/", created.tunnel_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "TUNNEL_NOT_CONNECTED");
    }

    #[tokio::test]
    async fn test_proxy_reserved_prefix_never_resolves() {
        let app = build_router(test_state());

        // an unrouted /api subpath falls through to the proxy handler and
        // must not be treated as a tunnel id
        let response = app
            .oneshot(Request::get("/api/unknown/route").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_proxy_oversized_declared_body_is_413() {
        let state = Arc::new(AppState::new(
            ServerConfig {
                api_key: "k".to_string(),
                max_body_bytes: 1024,
                ..Default::default()
            },
            Arc::new(SystemClock),
        ));
        let created = state.registry.create(TunnelSpec::default()).await.unwrap();
        let (session, _rx) = burrow_control::Session::new(
            created.tunnel_id.clone(),
            SessionConfig::default(),
        );
        state
            .registry
            .attach(&created.tunnel_id, &created.auth_token, session)
            .await
            .unwrap();

        let response = build_router(state.clone())
            .oneshot(
                Request::post(format!("/{}/upload", created.tunnel_id))
                    .header("content-length", "4096")
                    .body(Body::from(vec![0u8; 4096]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "PAYLOAD_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_proxy_busy_session_is_503() {
        let state = Arc::new(AppState::new(
            ServerConfig {
                api_key: "k".to_string(),
                max_in_flight: 0,
                ..Default::default()
            },
            Arc::new(SystemClock),
        ));
        let created = state.registry.create(TunnelSpec::default()).await.unwrap();
        let (session, _rx) = burrow_control::Session::new(
            created.tunnel_id.clone(),
            state.config.session_config(),
        );
        state
            .registry
            .attach(&created.tunnel_id, &created.auth_token, session)
            .await
            .unwrap();

        let response = build_router(state.clone())
            .oneshot(
                Request::get(format!("/{}/", created.tunnel_id))
                    .extension(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9999))))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: ErrorBody = body_json(response).await;
        assert_eq!(body.error, "TUNNEL_BUSY");
    }
}
