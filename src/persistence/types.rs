//! 清单记录类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::cache::FailureInfo;

/// 持久化状态
///
/// 不包含瞬态的 Progress：写盘时下载中的条目记为 Pause，
/// 重启后由调用方 resume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistedStatus {
    Pending,
    Pause,
    Complete,
    Failed,
}

impl PersistedStatus {
    /// 是否有未完成的本地数据需要校验
    pub fn has_partial_data(&self) -> bool {
        matches!(self, Self::Pause | Self::Failed | Self::Pending)
    }
}

/// 单个缓存键的清单记录
///
/// 以 JSON 格式保存在 `{root}/{namespace}/{storage_id}.meta`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRecord {
    /// 命名空间
    pub manager: String,

    /// 资源 URI
    pub uri: String,

    /// 状态
    pub status: PersistedStatus,

    /// 百分比进度
    pub progress: u8,

    /// 本地文件路径
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// 远端总大小
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,

    /// 已写入本地的字节数
    #[serde(default)]
    pub received_bytes: u64,

    /// ETag / Last-Modified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,

    /// 最近一次失败
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,

    /// 创建时间
    pub created_at: DateTime<Utc>,

    /// 最后更新时间
    pub updated_at: DateTime<Utc>,
}
