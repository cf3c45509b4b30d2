use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{CacheError, FailureInfo};
use crate::persistence::{ManifestRecord, PersistedStatus};

/// 缓存键：命名空间（manager）+ 资源 URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// 命名空间
    pub manager: String,
    /// 资源 URI
    pub uri: String,
}

impl CacheKey {
    pub fn new(manager: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            manager: manager.into(),
            uri: uri.into(),
        }
    }

    /// 稳定的存储 ID（SHA-256 十六进制）
    ///
    /// 对 manager 做长度前缀，保证 ("a", "bc") 与 ("ab", "c") 不会碰撞
    pub fn storage_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update((self.manager.len() as u64).to_le_bytes());
        hasher.update(self.manager.as_bytes());
        hasher.update(self.uri.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.manager, self.uri)
    }
}

/// 缓存条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    /// 等待下载
    Pending,
    /// 下载中
    Progress,
    /// 已暂停
    Pause,
    /// 已完成
    Complete,
    /// 失败
    Failed,
}

impl CacheStatus {
    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: CacheStatus) -> bool {
        use CacheStatus::*;
        matches!(
            (self, next),
            (Pending, Progress)
                | (Progress, Pause)
                | (Progress, Complete)
                | (Progress, Failed)
                | (Pause, Progress)
                | (Failed, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Pending => "pending",
            CacheStatus::Progress => "progress",
            CacheStatus::Pause => "pause",
            CacheStatus::Complete => "complete",
            CacheStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 根据字节数计算整数百分比
///
/// 总大小未知时恒为 0
pub fn compute_progress(received: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => {
            let pct = (received as u128 * 100) / total as u128;
            pct.min(100) as u8
        }
        _ => 0,
    }
}

/// 推送给观察者的条目快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub manager: String,
    pub uri: String,
    pub status: CacheStatus,
    pub progress: u8,
    pub path: Option<PathBuf>,
    pub ready: bool,
    pub received_bytes: u64,
    pub total_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
}

impl EntrySnapshot {
    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    /// 只有完成后 path 才可用于渲染
    pub fn renderable_path(&self) -> Option<&Path> {
        if self.status == CacheStatus::Complete {
            self.path.as_deref()
        } else {
            None
        }
    }
}

/// 缓存条目
///
/// 字段只读；所有修改都经过下载控制器调用的校验型 setter
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key: CacheKey,
    status: CacheStatus,
    progress: u8,
    path: Option<PathBuf>,
    received_bytes: u64,
    total_bytes: Option<u64>,
    validator: Option<String>,
    error: Option<FailureInfo>,
    ready: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            status: CacheStatus::Pending,
            progress: 0,
            path: None,
            received_bytes: 0,
            total_bytes: None,
            validator: None,
            error: None,
            ready: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// 从清单记录恢复
    ///
    /// 持久化的 Pause 保持 Pause，进度由字节数重新计算
    pub(crate) fn from_record(record: ManifestRecord) -> Self {
        let key = CacheKey::new(record.manager, record.uri);
        let status = match record.status {
            PersistedStatus::Pending => CacheStatus::Pending,
            PersistedStatus::Pause => CacheStatus::Pause,
            PersistedStatus::Complete => CacheStatus::Complete,
            PersistedStatus::Failed => CacheStatus::Failed,
        };
        let progress = if status == CacheStatus::Complete {
            100
        } else {
            compute_progress(record.received_bytes, record.total_bytes)
        };
        Self {
            key,
            status,
            progress,
            path: record.path,
            received_bytes: record.received_bytes,
            total_bytes: record.total_bytes,
            validator: record.validator,
            error: record.error,
            ready: false,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// 转换为清单记录（Progress 作为瞬态写成 Pause）
    pub(crate) fn to_record(&self) -> ManifestRecord {
        let status = match self.status {
            CacheStatus::Pending => PersistedStatus::Pending,
            CacheStatus::Progress | CacheStatus::Pause => PersistedStatus::Pause,
            CacheStatus::Complete => PersistedStatus::Complete,
            CacheStatus::Failed => PersistedStatus::Failed,
        };
        ManifestRecord {
            manager: self.key.manager.clone(),
            uri: self.key.uri.clone(),
            status,
            progress: self.progress,
            path: self.path.clone(),
            total_bytes: self.total_bytes,
            received_bytes: self.received_bytes,
            validator: self.validator.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn status(&self) -> CacheStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn validator(&self) -> Option<&str> {
        self.validator.as_deref()
    }

    pub fn error(&self) -> Option<&FailureInfo> {
        self.error.as_ref()
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            manager: self.key.manager.clone(),
            uri: self.key.uri.clone(),
            status: self.status,
            progress: self.progress,
            path: self.path.clone(),
            ready: self.ready,
            received_bytes: self.received_bytes,
            total_bytes: self.total_bytes,
            error: self.error.clone(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn transition(&mut self, operation: &'static str, next: CacheStatus) -> Result<(), CacheError> {
        if !self.status.can_transition_to(next) {
            return Err(CacheError::invalid_state(operation, self.status));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub(crate) fn mark_ready(&mut self) {
        self.ready = true;
    }

    /// Pending/Pause -> Progress，写入本地路径
    pub(crate) fn mark_progress(&mut self, path: PathBuf) -> Result<(), CacheError> {
        self.transition("download", CacheStatus::Progress)?;
        self.path = Some(path);
        self.error = None;
        Ok(())
    }

    /// Progress -> Pause，进度冻结
    pub(crate) fn mark_paused(&mut self) -> Result<(), CacheError> {
        self.transition("pause", CacheStatus::Pause)
    }

    /// Progress -> Complete，进度固定为 100
    pub(crate) fn mark_complete(&mut self) -> Result<(), CacheError> {
        self.transition("complete", CacheStatus::Complete)?;
        if self.total_bytes.is_none() {
            self.total_bytes = Some(self.received_bytes);
        }
        self.progress = 100;
        self.error = None;
        Ok(())
    }

    /// Progress -> Failed，保留已接收字节
    pub(crate) fn mark_failed(&mut self, error: &CacheError) -> Result<(), CacheError> {
        self.transition("fail", CacheStatus::Failed)?;
        self.error = Some(FailureInfo::from(error));
        Ok(())
    }

    /// Failed -> Pending（重试）
    pub(crate) fn mark_pending_for_retry(&mut self) -> Result<(), CacheError> {
        self.transition("retry", CacheStatus::Pending)
    }

    /// 记录新到达的字节，返回百分比是否变化
    pub(crate) fn record_bytes(&mut self, n: u64) -> bool {
        debug_assert_eq!(self.status, CacheStatus::Progress);
        self.received_bytes += n;
        self.refresh_progress()
    }

    /// 记录远端总大小与校验值，返回百分比是否变化
    pub(crate) fn set_remote_meta(&mut self, total: Option<u64>, validator: Option<String>) -> bool {
        if total.is_some() {
            self.total_bytes = total;
        }
        if validator.is_some() {
            self.validator = validator;
        }
        self.refresh_progress()
    }

    /// 丢弃已下载的部分（续传不一致时）
    pub(crate) fn discard_partial(&mut self) {
        self.received_bytes = 0;
        self.total_bytes = None;
        self.validator = None;
        self.progress = 0;
        self.touch();
    }

    /// 按磁盘上实际的文件长度截断计数
    pub(crate) fn clamp_received(&mut self, len: u64) {
        if self.received_bytes > len {
            self.received_bytes = len;
            self.progress = compute_progress(len, self.total_bytes);
            self.touch();
        }
    }

    /// 重置为全新的 Pending 条目（驱逐、或恢复时发现文件损坏）
    pub(crate) fn reset(&mut self) {
        self.status = CacheStatus::Pending;
        self.path = None;
        self.error = None;
        self.discard_partial();
    }

    fn refresh_progress(&mut self) -> bool {
        // 同一轮 Progress 内只增不减
        let next = compute_progress(self.received_bytes, self.total_bytes).max(self.progress);
        if next != self.progress {
            self.progress = next;
            self.touch();
            true
        } else {
            false
        }
    }
}
