//! 测试用的内存拉取实现

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::time::Duration;

use super::error::CacheError;
use super::fetcher::{ByteStream, FetchRequest, FetchResponse, RemoteFetcher};

/// 可在运行中调整的服务端行为
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub chunk_size: usize,
    /// 是否支持 Range（不支持时总是返回完整内容）
    pub supports_range: bool,
    /// 是否在响应中给出总大小
    pub announce_total: bool,
    pub validator: Option<String>,
    /// 传到该绝对偏移时连接报错
    pub fail_after: Option<u64>,
    /// 传到该绝对偏移时连接正常关闭（短读）
    pub end_after: Option<u64>,
    /// 传到该绝对偏移时挂起，不再产出数据
    pub hold_after: Option<u64>,
    /// 请求本身直接失败
    pub reject_requests: bool,
    pub chunk_delay: Duration,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            supports_range: true,
            announce_total: true,
            validator: Some("\"v1\"".to_string()),
            fail_after: None,
            end_after: None,
            hold_after: None,
            reject_requests: false,
            chunk_delay: Duration::ZERO,
        }
    }
}

enum Tail {
    End,
    Fail,
    Hold,
}

#[derive(Debug)]
pub struct MockFetcher {
    data: Mutex<Vec<u8>>,
    behavior: Mutex<MockBehavior>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl MockFetcher {
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_behavior(data, MockBehavior::default())
    }

    pub fn with_behavior(data: Vec<u8>, behavior: MockBehavior) -> Self {
        Self {
            data: Mutex::new(data),
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    pub fn replace_data(&self, data: Vec<u8>) {
        *self.data.lock() = data;
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

/// 可预测的测试数据
pub fn sample_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[async_trait]
impl RemoteFetcher for MockFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, CacheError> {
        self.requests.lock().push(request.clone());
        let behavior = self.behavior.lock().clone();
        let data = self.data.lock().clone();

        if behavior.reject_requests {
            return Err(CacheError::Network("连接被拒绝".to_string()));
        }

        let len = data.len() as u64;
        let range_honored = request.offset > 0
            && behavior.supports_range
            && match (&request.validator, &behavior.validator) {
                (Some(sent), Some(current)) => sent == current,
                (Some(_), None) => false,
                (None, _) => true,
            };
        let start = if range_honored { request.offset } else { 0 };
        if start > len {
            return Err(CacheError::CorruptResume(format!(
                "请求偏移 {} 超出资源长度 {}",
                start, len
            )));
        }

        // 在 start 之后最先到达的边界决定流的结尾
        let mut stop = len;
        let mut tail = Tail::End;
        for (boundary, kind) in [
            (behavior.fail_after, Tail::Fail),
            (behavior.end_after, Tail::End),
            (behavior.hold_after, Tail::Hold),
        ] {
            if let Some(at) = boundary {
                if at > start && at < stop {
                    stop = at;
                    tail = kind;
                }
            }
        }

        let chunk_size = behavior.chunk_size.max(1);
        let items: Vec<Result<Bytes, CacheError>> = data[start as usize..stop as usize]
            .chunks(chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();

        let delay = behavior.chunk_delay;
        let head = stream::iter(items);
        let head: ByteStream = if delay.is_zero() {
            head.boxed()
        } else {
            head.then(move |item| async move {
                tokio::time::sleep(delay).await;
                item
            })
            .boxed()
        };

        let body: ByteStream = match tail {
            Tail::End => head,
            Tail::Fail => head
                .chain(stream::once(async {
                    Err(CacheError::Network("连接被重置".to_string()))
                }))
                .boxed(),
            Tail::Hold => head.chain(stream::pending()).boxed(),
        };

        Ok(FetchResponse {
            start,
            total: behavior.announce_total.then_some(len),
            validator: behavior.validator.clone(),
            body,
        })
    }
}
