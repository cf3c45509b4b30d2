// Web服务器模块

pub mod handlers;
pub mod state;
pub mod websocket;

pub use handlers::{ApiError, ApiResponse, ApiResult};
pub use state::AppState;

use axum::{
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// 构建完整路由
///
/// - `/api/v1/cache/...` 缓存控制 API
/// - `/api/v1/ws` 快照推送
/// - `/health` 健康检查
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors);

    let api_routes = Router::new()
        .route(
            "/cache/:manager",
            get(handlers::get_entry).delete(handlers::evict_entry),
        )
        .route("/cache/:manager/entries", get(handlers::list_entries))
        .route("/cache/:manager/download", post(handlers::download_entry))
        .route("/cache/:manager/pause", post(handlers::pause_entry))
        .route("/cache/:manager/resume", post(handlers::resume_entry))
        .route("/cache/:manager/all", delete(handlers::evict_namespace))
        .route("/cache/:manager/file", get(handlers::serve_file))
        // 🔥 WebSocket 路由
        .route("/ws", get(websocket::handle_websocket))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health_check))
        .layer(middleware)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("忽略无效的 CORS 源 {}: {}", origin, e);
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
}
