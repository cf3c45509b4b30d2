//! 订阅与句柄
//!
//! - [`Subscription`]：一次订阅，drop 即退订
//! - [`CacheHandle`]：面向调用方的控制面，持有一个订阅并通过 watch 通道暴露最新快照

use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use super::entry::{CacheKey, CacheStatus, EntrySnapshot};
use super::error::CacheError;
use super::manager::{FileCacheManager, ManagerInner};
use super::store::CacheSlot;

/// 订阅选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// ready 延迟；None 时使用配置中的默认值
    pub ready_delay: Option<Duration>,
}

impl SubscribeOptions {
    pub fn with_ready_delay(delay: Duration) -> Self {
        Self {
            ready_delay: Some(delay),
        }
    }

    /// 不延迟，立即可用
    pub fn immediate() -> Self {
        Self::with_ready_delay(Duration::ZERO)
    }
}

/// 一次订阅
///
/// drop 或调用 [`Subscription::unsubscribe`] 后不再收到通知
pub struct Subscription {
    id: u64,
    slot: Arc<CacheSlot>,
    manager: Weak<ManagerInner>,
    attached: bool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("key", self.slot.key())
            .field("attached", &self.attached)
            .finish()
    }
}

impl Subscription {
    pub(crate) fn new(id: u64, slot: Arc<CacheSlot>, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            slot,
            manager,
            attached: true,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        self.slot.key()
    }

    /// ready 延迟是否已到期
    pub fn is_ready_gate_open(&self) -> bool {
        self.slot.subscribers().is_gate_open(self.id)
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if !self.attached {
            return;
        }
        self.attached = false;

        let remaining = self.slot.subscribers().remove(self.id);
        debug!(
            "退订: {} (id={}, 剩余观察者={:?})",
            self.slot.key(),
            self.id,
            remaining
        );
        if remaining == Some(0) {
            if let Some(manager) = self.manager.upgrade() {
                manager.on_last_detach(self.slot.clone());
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

/// 缓存句柄
///
/// 提供 `ready/status/path/progress` 读取以及 `download/pause/resume` 控制，
/// drop 时自动退订
pub struct CacheHandle {
    manager: FileCacheManager,
    slot: Arc<CacheSlot>,
    updates: watch::Receiver<EntrySnapshot>,
    subscription: Subscription,
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", self.slot.key())
            .field("snapshot", &*self.updates.borrow())
            .finish()
    }
}

impl CacheHandle {
    pub(crate) fn new(
        manager: FileCacheManager,
        slot: Arc<CacheSlot>,
        updates: watch::Receiver<EntrySnapshot>,
        subscription: Subscription,
    ) -> Self {
        Self {
            manager,
            slot,
            updates,
            subscription,
        }
    }

    pub fn key(&self) -> &CacheKey {
        self.slot.key()
    }

    pub fn subscription_id(&self) -> u64 {
        self.subscription.id()
    }

    /// 最近一次收到的快照
    pub fn snapshot(&self) -> EntrySnapshot {
        self.updates.borrow().clone()
    }

    pub fn ready(&self) -> bool {
        self.updates.borrow().ready
    }

    pub fn status(&self) -> CacheStatus {
        self.updates.borrow().status
    }

    pub fn progress(&self) -> u8 {
        self.updates.borrow().progress
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.updates.borrow().path.clone()
    }

    /// 只有完成后才返回路径
    pub fn renderable_path(&self) -> Option<PathBuf> {
        self.updates
            .borrow()
            .renderable_path()
            .map(|p| p.to_path_buf())
    }

    /// 快照通道（会合并中间状态，只保证看到最新值）
    pub fn watch(&self) -> watch::Receiver<EntrySnapshot> {
        self.updates.clone()
    }

    /// 等待满足条件的快照；句柄对应的订阅被关闭时返回 None
    pub async fn wait_for<F>(&self, predicate: F) -> Option<EntrySnapshot>
    where
        F: FnMut(&EntrySnapshot) -> bool,
    {
        let mut updates = self.updates.clone();
        let result = updates.wait_for(predicate).await;
        result.ok().map(|snapshot| snapshot.clone())
    }

    pub async fn download(&self) -> Result<(), CacheError> {
        self.manager.download(self.slot.key()).await
    }

    pub async fn pause(&self) -> Result<(), CacheError> {
        self.manager.pause(self.slot.key()).await
    }

    pub async fn resume(&self) -> Result<(), CacheError> {
        self.manager.resume(self.slot.key()).await
    }

    pub async fn evict(&self) -> Result<(), CacheError> {
        self.manager.evict(self.slot.key()).await
    }

    /// 显式关闭（等价于 drop）
    pub fn close(self) {}
}
