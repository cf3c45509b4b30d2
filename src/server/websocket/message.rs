//! WebSocket 消息类型定义

use crate::cache::EntrySnapshot;
use serde::{Deserialize, Serialize};

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsClientMessage {
    /// 心跳 Ping
    Ping {
        /// 客户端时间戳（毫秒）
        #[serde(default)]
        timestamp: Option<i64>,
    },
    /// 开始下载
    Download,
    /// 暂停
    Pause,
    /// 恢复
    Resume,
}

impl WsClientMessage {
    pub fn action(&self) -> &'static str {
        match self {
            WsClientMessage::Ping { .. } => "ping",
            WsClientMessage::Download => "download",
            WsClientMessage::Pause => "pause",
            WsClientMessage::Resume => "resume",
        }
    }
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsServerMessage {
    /// 连接成功
    Connected {
        /// 连接 ID
        connection_id: String,
        manager: String,
        uri: String,
        /// 服务端时间戳
        timestamp: i64,
    },
    /// 条目快照
    Snapshot { entry: EntrySnapshot },
    /// 控制操作已受理
    Ack { action: String },
    /// 心跳 Pong
    Pong {
        /// 服务端时间戳（毫秒）
        timestamp: i64,
        /// 回显客户端时间戳（用于计算延迟）
        client_timestamp: Option<i64>,
    },
    /// 错误消息
    Error {
        /// 错误码
        code: String,
        /// 错误信息
        message: String,
    },
}

impl WsServerMessage {
    /// 创建 Connected 消息
    pub fn connected(connection_id: String, manager: String, uri: String) -> Self {
        Self::Connected {
            connection_id,
            manager,
            uri,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// 创建 Pong 消息
    pub fn pong(client_timestamp: Option<i64>) -> Self {
        Self::Pong {
            timestamp: chrono::Utc::now().timestamp_millis(),
            client_timestamp,
        }
    }

    pub fn ack(action: &str) -> Self {
        Self::Ack {
            action: action.to_string(),
        }
    }

    /// 创建错误消息
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}
