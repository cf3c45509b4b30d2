//! WebSocket 模块
//!
//! 提供条目快照的实时推送与控制指令

mod handler;
mod message;

pub use handler::{handle_websocket, WsQuery};
pub use message::{WsClientMessage, WsServerMessage};
