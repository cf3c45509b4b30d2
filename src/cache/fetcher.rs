//! 远端资源拉取
//!
//! [`RemoteFetcher`] 把一次（可能带 Range 的）GET 抽象为「起点 + 总大小 + 字节流」，
//! 下载控制器只依赖这个 trait，测试时可以替换为内存实现

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_RANGE, LAST_MODIFIED, RANGE};
use reqwest::{Client, StatusCode};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use super::error::CacheError;

/// 响应体字节流
pub type ByteStream = BoxStream<'static, Result<Bytes, CacheError>>;

/// 拉取请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub uri: String,
    /// 续传偏移，0 表示从头开始
    pub offset: u64,
    /// 上次记录的 ETag / Last-Modified，续传时作为 If-Range 发送
    pub validator: Option<String>,
}

impl FetchRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            offset: 0,
            validator: None,
        }
    }

    pub fn resume_from(mut self, offset: u64, validator: Option<String>) -> Self {
        self.offset = offset;
        self.validator = validator;
        self
    }
}

/// 拉取响应
pub struct FetchResponse {
    /// 响应体第一个字节在完整资源中的偏移
    pub start: u64,
    /// 完整资源大小（未知时为 None）
    pub total: Option<u64>,
    /// ETag / Last-Modified
    pub validator: Option<String>,
    pub body: ByteStream,
}

impl fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchResponse")
            .field("start", &self.start)
            .field("total", &self.total)
            .field("validator", &self.validator)
            .finish_non_exhaustive()
    }
}

/// 远端拉取接口
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, CacheError>;
}

/// HTTP 客户端参数
#[derive(Debug, Clone)]
pub struct FetcherSettings {
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for FetcherSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            user_agent: concat!("file-cache-rust/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// 基于 reqwest 的实现
///
/// 不设置整体超时：大文件的传输时长不可预估，空闲超时由下载控制器逐块控制
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(settings: &FetcherSettings) -> Result<Self, CacheError> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(settings.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| CacheError::Network(format!("创建 HTTP 客户端失败: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, CacheError> {
        let url = reqwest::Url::parse(&request.uri)
            .map_err(|e| CacheError::Malformed(format!("无效的 URI {}: {}", request.uri, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CacheError::Malformed(format!(
                "不支持的协议: {}",
                url.scheme()
            )));
        }

        let mut builder = self.client.get(url);
        if request.offset > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.offset));
            if let Some(validator) = &request.validator {
                builder = builder.header(IF_RANGE, validator.as_str());
            }
        }

        debug!(
            "发起请求: {} (offset={}, validator={:?})",
            request.uri, request.offset, request.validator
        );
        let response = builder.send().await?;
        let status = response.status();
        debug!("📡 响应状态: {} ({})", status, request.uri);

        let headers = response.headers();
        let validator = header_str(headers, ETAG)
            .or_else(|| header_str(headers, LAST_MODIFIED))
            .map(str::to_string);

        let (start, total) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let raw = header_str(headers, CONTENT_RANGE).ok_or_else(|| {
                    CacheError::Malformed("206 响应缺少 Content-Range".to_string())
                })?;
                let range = parse_content_range(raw).ok_or_else(|| {
                    CacheError::Malformed(format!("无法解析 Content-Range: {}", raw))
                })?;
                (range.start, range.total)
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(CacheError::CorruptResume(format!(
                    "服务端拒绝续传区间 bytes={}-",
                    request.offset
                )));
            }
            s if s.is_success() => {
                let total = header_str(headers, CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
                (0, total)
            }
            s => {
                return Err(CacheError::Network(format!("HTTP错误: {}", s)));
            }
        };

        let body = response
            .bytes_stream()
            .map_err(CacheError::from)
            .boxed();

        Ok(FetchResponse {
            start,
            total,
            validator,
            body,
        })
    }
}

fn header_str(headers: &reqwest::header::HeaderMap, name: reqwest::header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// 解析后的 Content-Range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

/// 解析 `bytes 0-32767/1234567` 或 `bytes 0-32767/*`
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    if let Some(total) = total {
        if end >= total {
            return None;
        }
    }
    Some(ContentRange { start, end, total })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderMap, StatusCode as AxumStatus};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;

    const ETAG_VALUE: &str = "\"v1\"";

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    async fn serve_image(headers: HeaderMap) -> Response {
        let data = payload();
        let range_start = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.strip_suffix('-'))
            .and_then(|v| v.parse::<usize>().ok());
        let if_range_ok = headers
            .get(header::IF_RANGE)
            .map(|v| v.to_str().ok() == Some(ETAG_VALUE))
            .unwrap_or(true);

        match range_start {
            Some(start) if start >= data.len() => AxumStatus::RANGE_NOT_SATISFIABLE.into_response(),
            Some(start) if if_range_ok => (
                AxumStatus::PARTIAL_CONTENT,
                [
                    (header::ETAG, ETAG_VALUE.to_string()),
                    (
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", start, data.len() - 1, data.len()),
                    ),
                ],
                data[start..].to_vec(),
            )
                .into_response(),
            _ => (
                AxumStatus::OK,
                [(header::ETAG, ETAG_VALUE.to_string())],
                data,
            )
                .into_response(),
        }
    }

    async fn spawn_server() -> String {
        let app = Router::new()
            .route("/img.png", get(serve_image))
            .route("/missing.png", get(|| async { AxumStatus::NOT_FOUND }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn collect(body: ByteStream) -> Vec<u8> {
        body.try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    async fn spawn_static_server(dir: &std::path::Path) -> String {
        let app = Router::new().nest_service("/static", tower_http::services::ServeDir::new(dir));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/static", addr)
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-32767/1234567"),
            Some(ContentRange {
                start: 0,
                end: 32767,
                total: Some(1234567)
            })
        );
        assert_eq!(
            parse_content_range("bytes 400-999/*"),
            Some(ContentRange {
                start: 400,
                end: 999,
                total: None
            })
        );
        assert!(parse_content_range("bytes */1000").is_none());
        assert!(parse_content_range("bytes 10-5/100").is_none());
        assert!(parse_content_range("bytes 0-100/100").is_none());
        assert!(parse_content_range("items 0-1/2").is_none());
    }

    #[tokio::test]
    async fn test_full_fetch() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(&FetcherSettings::default()).unwrap();

        let response = fetcher
            .fetch(FetchRequest::new(format!("{}/img.png", base)))
            .await
            .unwrap();
        assert_eq!(response.start, 0);
        assert_eq!(response.total, Some(1000));
        assert_eq!(response.validator.as_deref(), Some(ETAG_VALUE));
        assert_eq!(collect(response.body).await, payload());
    }

    #[tokio::test]
    async fn test_range_fetch() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(&FetcherSettings::default()).unwrap();

        let request = FetchRequest::new(format!("{}/img.png", base))
            .resume_from(400, Some(ETAG_VALUE.to_string()));
        let response = fetcher.fetch(request).await.unwrap();
        assert_eq!(response.start, 400);
        assert_eq!(response.total, Some(1000));
        assert_eq!(collect(response.body).await, payload()[400..].to_vec());
    }

    #[tokio::test]
    async fn test_stale_validator_gets_full_body() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(&FetcherSettings::default()).unwrap();

        let request = FetchRequest::new(format!("{}/img.png", base))
            .resume_from(400, Some("\"old\"".to_string()));
        let response = fetcher.fetch(request).await.unwrap();
        assert_eq!(response.start, 0);
        assert_eq!(response.total, Some(1000));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let base = spawn_server().await;
        let fetcher = HttpFetcher::new(&FetcherSettings::default()).unwrap();

        let err = fetcher
            .fetch(FetchRequest::new(format!("{}/missing.png", base)))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Network(_)));

        let err = fetcher
            .fetch(FetchRequest::new(format!("{}/img.png", base)).resume_from(5000, None))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CorruptResume(_)));

        let err = fetcher
            .fetch(FetchRequest::new("not a uri"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Malformed(_)));

        let err = fetcher
            .fetch(FetchRequest::new("ftp://host/a.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_static_file_server_range() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("tile.jpg"), payload()).unwrap();
        let base = spawn_static_server(temp_dir.path()).await;
        let fetcher = HttpFetcher::new(&FetcherSettings::default()).unwrap();
        let uri = format!("{}/tile.jpg", base);

        let full = fetcher.fetch(FetchRequest::new(uri.clone())).await.unwrap();
        assert_eq!(full.start, 0);
        assert_eq!(full.total, Some(1000));
        // 静态文件服务只提供 Last-Modified
        assert!(full.validator.is_some());
        assert_eq!(collect(full.body).await, payload());

        let partial = fetcher
            .fetch(FetchRequest::new(uri).resume_from(300, None))
            .await
            .unwrap();
        assert_eq!(partial.start, 300);
        assert_eq!(partial.total, Some(1000));
        assert_eq!(collect(partial.body).await, payload()[300..].to_vec());
    }
}
