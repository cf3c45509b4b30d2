// 缓存 API 处理器

use axum::{
    body::Body,
    extract::{Path, Query, Request, State},
    response::{Json, Response},
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};

use super::{ApiError, ApiResponse, ApiResult};
use crate::cache::{CacheKey, EntrySnapshot};
use crate::server::AppState;

/// `?uri=` 查询参数
#[derive(Debug, Deserialize)]
pub struct UriQuery {
    pub uri: String,
}

/// 控制操作请求体
#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub uri: String,
}

/// 命名空间清理结果
#[derive(Debug, Serialize, Deserialize)]
pub struct EvictNamespaceResponse {
    pub manager: String,
    pub evicted: usize,
}

fn cache_key(manager: String, uri: String) -> Result<CacheKey, ApiError> {
    if uri.trim().is_empty() {
        return Err(ApiError::bad_request("uri 不能为空"));
    }
    Ok(CacheKey::new(manager, uri))
}

/// GET /api/v1/cache/:manager?uri=
/// 获取条目快照（首次访问时创建条目）
pub async fn get_entry(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Query(query): Query<UriQuery>,
) -> ApiResult<EntrySnapshot> {
    let key = cache_key(manager, query.uri)?;
    let snapshot = state.cache.get_or_create(&key).await;
    Ok(Json(ApiResponse::success(snapshot)))
}

/// GET /api/v1/cache/:manager/entries
/// 列出命名空间下的所有条目
pub async fn list_entries(
    State(state): State<AppState>,
    Path(manager): Path<String>,
) -> ApiResult<Vec<EntrySnapshot>> {
    let entries = state.cache.list(&manager).await?;
    Ok(Json(ApiResponse::success(entries)))
}

/// POST /api/v1/cache/:manager/download
pub async fn download_entry(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<EntrySnapshot> {
    let key = cache_key(manager, req.uri)?;
    state.cache.download(&key).await.map_err(|e| {
        warn!("下载请求被拒绝: {}, 错误: {}", key, e);
        ApiError::from(e)
    })?;
    info!("API: 开始下载 {}", key);
    Ok(Json(ApiResponse::success(state.cache.get_or_create(&key).await)))
}

/// POST /api/v1/cache/:manager/pause
pub async fn pause_entry(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<EntrySnapshot> {
    let key = cache_key(manager, req.uri)?;
    state.cache.pause(&key).await?;
    info!("API: 已暂停 {}", key);
    Ok(Json(ApiResponse::success(state.cache.get_or_create(&key).await)))
}

/// POST /api/v1/cache/:manager/resume
pub async fn resume_entry(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Json(req): Json<ControlRequest>,
) -> ApiResult<EntrySnapshot> {
    let key = cache_key(manager, req.uri)?;
    state.cache.resume(&key).await?;
    info!("API: 已恢复 {}", key);
    Ok(Json(ApiResponse::success(state.cache.get_or_create(&key).await)))
}

/// DELETE /api/v1/cache/:manager?uri=
/// 驱逐单个条目
pub async fn evict_entry(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Query(query): Query<UriQuery>,
) -> ApiResult<EntrySnapshot> {
    let key = cache_key(manager, query.uri)?;
    state.cache.evict(&key).await?;
    info!("API: 已驱逐 {}", key);
    Ok(Json(ApiResponse::success(state.cache.get_or_create(&key).await)))
}

/// DELETE /api/v1/cache/:manager/all
/// 驱逐整个命名空间
pub async fn evict_namespace(
    State(state): State<AppState>,
    Path(manager): Path<String>,
) -> ApiResult<EvictNamespaceResponse> {
    let evicted = state.cache.evict_namespace(&manager).await?;
    Ok(Json(ApiResponse::success(EvictNamespaceResponse {
        manager,
        evicted,
    })))
}

/// GET /api/v1/cache/:manager/file?uri=
/// 读取已完成条目的文件内容（支持 Range）
pub async fn serve_file(
    State(state): State<AppState>,
    Path(manager): Path<String>,
    Query(query): Query<UriQuery>,
    request: Request,
) -> Result<Response, ApiError> {
    let key = cache_key(manager, query.uri)?;
    let snapshot = state.cache.get_or_create(&key).await;
    let path = snapshot
        .renderable_path()
        .map(|p| p.to_path_buf())
        .ok_or_else(|| ApiError::conflict(format!("条目尚未完成: {}", snapshot.status)))?;

    match ServeFile::new(path).oneshot(request).await {
        Ok(response) => Ok(response.map(Body::new)),
        Err(never) => match never {},
    }
}
