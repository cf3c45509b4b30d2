//! 缓存错误类型
//!
//! 控制操作只会向调用方返回 [`CacheError::InvalidState`]，
//! 其余错误都在下载控制器内部捕获，并以 `Failed` 快照的形式推送给订阅者

use serde::{Deserialize, Serialize};
use std::io;

use super::entry::CacheStatus;

/// 缓存错误
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// 在非法状态下调用了控制操作
    #[error("操作 {operation} 在状态 {status} 下无效")]
    InvalidState {
        operation: &'static str,
        status: CacheStatus,
    },

    /// 网络错误（可通过再次调用 download 重试）
    #[error("网络错误: {0}")]
    Network(String),

    /// 存储错误（磁盘满、无权限等）
    #[error("存储错误: {0}")]
    Storage(#[from] io::Error),

    /// 续传区间与服务端不一致
    #[error("续传数据不一致: {0}")]
    CorruptResume(String),

    /// URI 或响应格式错误
    #[error("格式错误: {0}")]
    Malformed(String),
}

impl CacheError {
    pub fn invalid_state(operation: &'static str, status: CacheStatus) -> Self {
        Self::InvalidState { operation, status }
    }

    /// 错误分类
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::InvalidState { .. } => ErrorKind::InvalidState,
            CacheError::Network(_) => ErrorKind::Network,
            CacheError::Storage(_) => ErrorKind::Storage,
            CacheError::CorruptResume(_) => ErrorKind::CorruptResume,
            CacheError::Malformed(_) => ErrorKind::Malformed,
        }
    }

    /// 是否值得由上层重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::CorruptResume | ErrorKind::Malformed
        )
    }
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            CacheError::Malformed(e.to_string())
        } else {
            CacheError::Network(e.to_string())
        }
    }
}

/// 可序列化的错误分类，随快照下发给观察者
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidState,
    Network,
    Storage,
    CorruptResume,
    Malformed,
}

/// 最近一次失败的描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&CacheError> for FailureInfo {
    fn from(e: &CacheError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}
