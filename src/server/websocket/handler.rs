//! WebSocket 路由处理器

use crate::cache::{CacheError, CacheHandle, CacheKey, ErrorKind, SubscribeOptions};
use crate::server::websocket::message::{WsClientMessage, WsServerMessage};
use crate::server::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 连接参数
#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    pub manager: String,
    pub uri: String,
    /// 覆盖默认 ready 延迟
    pub ready_delay_ms: Option<u64>,
}

/// WebSocket 路由处理器
///
/// 每个连接订阅一个缓存条目，推送快照并接受控制指令
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    if query.uri.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "uri 不能为空").into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// 回复队列容量，写满时接收任务等待发送任务
const REPLY_CHANNEL_CAPACITY: usize = 32;

type WsSender = SplitSink<WebSocket, Message>;

/// 处理 WebSocket 连接
///
/// 快照走句柄的 watch 通道（只保留最新值），回复走有界队列，
/// 客户端读得慢时两者都不会无限堆积
async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let connection_id = Uuid::new_v4().to_string();
    let key = CacheKey::new(query.manager.clone(), query.uri.clone());
    info!("新的 WebSocket 连接: {} -> {}", connection_id, key);

    let options = SubscribeOptions {
        ready_delay: query.ready_delay_ms.map(Duration::from_millis),
    };
    let handle = state
        .cache
        .open(query.manager.clone(), query.uri.clone(), options)
        .await;
    let mut updates = handle.watch();

    let (mut sender, mut receiver) = socket.split();

    // Connected 必须排在初始快照之前
    let connected = WsServerMessage::connected(connection_id.clone(), query.manager, query.uri);
    let initial = WsServerMessage::Snapshot {
        entry: updates.borrow_and_update().clone(),
    };
    if !send_message(&mut sender, &connected, &connection_id).await
        || !send_message(&mut sender, &initial, &connection_id).await
    {
        info!("WebSocket 连接已关闭: {}", connection_id);
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::channel::<WsServerMessage>(REPLY_CHANNEL_CAPACITY);

    // 启动发送任务
    let send_conn_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
                changed = updates.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let entry = updates.borrow_and_update().clone();
                    WsServerMessage::Snapshot { entry }
                }
            };
            if !send_message(&mut sender, &message, &send_conn_id).await {
                break;
            }
        }
    });

    // 启动接收任务，句柄随任务结束释放，订阅随之退订
    let recv_conn_id = connection_id.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(_) => continue,
                },
                Message::Ping(_) | Message::Pong(_) => {
                    debug!("收到心跳帧: {}", recv_conn_id);
                    continue;
                }
                Message::Close(_) => {
                    info!("收到关闭消息: {}", recv_conn_id);
                    break;
                }
            };
            let reply = handle_client_message(&handle, &recv_conn_id, &text).await;
            if reply_tx.send(reply).await.is_err() {
                break;
            }
        }
        handle.close();
    });

    // 等待任一任务结束
    let (send_abort, recv_abort) = (send_task.abort_handle(), recv_task.abort_handle());
    tokio::select! {
        _ = send_task => {
            debug!("发送任务结束: {}", connection_id);
            recv_abort.abort();
        }
        _ = recv_task => {
            debug!("接收任务结束: {}", connection_id);
            send_abort.abort();
        }
    }

    info!("WebSocket 连接已关闭: {}", connection_id);
}

/// 序列化并发送，返回连接是否仍然可用
async fn send_message(sender: &mut WsSender, message: &WsServerMessage, connection_id: &str) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => {
            if sender.send(Message::Text(json)).await.is_err() {
                debug!("发送失败，连接已断开: {}", connection_id);
                return false;
            }
            true
        }
        Err(e) => {
            error!("序列化消息失败: {}", e);
            true
        }
    }
}

/// 处理客户端消息，返回需要回复的消息
async fn handle_client_message(
    handle: &CacheHandle,
    connection_id: &str,
    text: &str,
) -> WsServerMessage {
    let message = match serde_json::from_str::<WsClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("解析客户端消息失败: {} - {}", connection_id, e);
            return WsServerMessage::error("PARSE_ERROR", format!("消息解析失败: {}", e));
        }
    };

    let result = match message {
        WsClientMessage::Ping { timestamp } => return WsServerMessage::pong(timestamp),
        WsClientMessage::Download => handle.download().await,
        WsClientMessage::Pause => handle.pause().await,
        WsClientMessage::Resume => handle.resume().await,
    };

    match result {
        Ok(()) => {
            debug!("{} 执行 {}: {}", connection_id, message.action(), handle.key());
            WsServerMessage::ack(message.action())
        }
        Err(e) => {
            warn!("{} 执行 {} 失败: {}", connection_id, message.action(), e);
            WsServerMessage::error(error_code(&e), e.to_string())
        }
    }
}

fn error_code(e: &CacheError) -> &'static str {
    match e.kind() {
        ErrorKind::InvalidState => "INVALID_STATE",
        ErrorKind::Network => "NETWORK",
        ErrorKind::Storage => "STORAGE",
        ErrorKind::CorruptResume => "CORRUPT_RESUME",
        ErrorKind::Malformed => "MALFORMED",
    }
}
