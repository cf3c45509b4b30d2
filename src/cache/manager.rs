//! 文件缓存管理器
//!
//! 组合 [`CacheStore`]、[`DownloadController`] 与订阅表，对外提供按
//! (manager, uri) 寻址的统一入口

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::controller::DownloadController;
use super::entry::{CacheKey, CacheStatus, EntrySnapshot};
use super::error::CacheError;
use super::fetcher::{HttpFetcher, RemoteFetcher};
use super::handle::{CacheHandle, SubscribeOptions, Subscription};
use super::store::{CacheSlot, CacheStore};
use crate::config::CacheConfig;
use crate::events::SnapshotCallback;
use crate::persistence::RecoveryReport;

/// [`FileCacheManager::subscribe_channel`] 的通道容量
pub const SNAPSHOT_CHANNEL_CAPACITY: usize = 256;

/// 订阅相关参数
#[derive(Debug, Clone, Default)]
pub struct ManagerSettings {
    /// 未指定时使用的 ready 延迟
    pub default_ready_delay: Duration,
    /// 最后一个观察者离开时暂停下载
    pub abort_on_last_detach: bool,
}

pub(crate) struct ManagerInner {
    store: CacheStore,
    controller: DownloadController,
    settings: ManagerSettings,
}

impl ManagerInner {
    /// 最后一个观察者退订：按配置暂停下载，然后尝试释放空闲槽位
    pub(crate) fn on_last_detach(self: Arc<Self>, slot: Arc<CacheSlot>) {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => return,
        };
        runtime.spawn(async move {
            let key = slot.key().clone();
            // 期间可能又有新的观察者加入
            if self.settings.abort_on_last_detach
                && slot.observer_count() == 0
                && slot.snapshot().await.status == CacheStatus::Progress
            {
                match self.controller.pause(&slot).await {
                    Ok(()) => info!("最后一个观察者已离开，暂停下载: {}", slot.key()),
                    Err(e) => debug!("自动暂停未执行: {}, 原因: {}", slot.key(), e),
                }
            }
            drop(slot);
            // 让退订方先释放它持有的引用
            tokio::task::yield_now().await;
            self.store.release_if_idle(&key);
        });
    }

    async fn attach(
        self: &Arc<Self>,
        slot: Arc<CacheSlot>,
        options: SubscribeOptions,
        callback: SnapshotCallback,
    ) -> Subscription {
        let delay = options
            .ready_delay
            .unwrap_or(self.settings.default_ready_delay);
        let gated = !delay.is_zero();

        let id = {
            let state = slot.lock().await;
            let id = slot.subscribers().add(callback.clone(), !gated);
            // 订阅时立即推送一次当前状态
            let snapshot = state.entry.snapshot();
            let ready = snapshot.ready && !gated;
            callback(&snapshot.with_ready(ready));
            id
        };
        debug!(
            "订阅: {} (id={}, ready_delay={:?}, 观察者={})",
            slot.key(),
            id,
            delay,
            slot.observer_count()
        );

        if gated {
            let gate_slot = slot.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let state = gate_slot.lock().await;
                if let Some(callback) = gate_slot.subscribers().open_gate(id) {
                    callback(&state.entry.snapshot());
                }
            });
        }

        Subscription::new(id, slot, Arc::downgrade(self))
    }
}

/// 文件缓存管理器
///
/// 可廉价克隆，所有克隆共享同一份状态
#[derive(Clone)]
pub struct FileCacheManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for FileCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileCacheManager")
            .field("root", &self.inner.store.root())
            .field("slots", &self.inner.store.len())
            .finish()
    }
}

impl FileCacheManager {
    /// 使用 HTTP 拉取创建管理器
    pub fn new(config: &CacheConfig) -> Result<Self, CacheError> {
        let fetcher = HttpFetcher::new(&config.fetcher_settings())?;
        Self::with_fetcher(config, Arc::new(fetcher))
    }

    /// 使用自定义拉取实现创建管理器
    pub fn with_fetcher(
        config: &CacheConfig,
        fetcher: Arc<dyn RemoteFetcher>,
    ) -> Result<Self, CacheError> {
        let store = CacheStore::open(&config.root_dir)?;
        let controller = DownloadController::new(fetcher, config.controller_settings());
        Ok(Self {
            inner: Arc::new(ManagerInner {
                store,
                controller,
                settings: config.manager_settings(),
            }),
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    /// 获取（必要时创建）键对应的槽位
    pub fn slot(&self, key: &CacheKey) -> Arc<CacheSlot> {
        self.inner.store.get_or_create(key)
    }

    /// 获取或创建条目，返回当前快照
    ///
    /// 无人持有的全新条目不会留在内存中，下次访问时重新创建
    pub async fn get_or_create(&self, key: &CacheKey) -> EntrySnapshot {
        let snapshot = self.slot(key).snapshot().await;
        self.inner.store.release_if_idle(key);
        snapshot
    }

    pub async fn download(&self, key: &CacheKey) -> Result<(), CacheError> {
        let slot = self.slot(key);
        self.inner.controller.download(&slot).await
    }

    pub async fn pause(&self, key: &CacheKey) -> Result<(), CacheError> {
        let slot = self.slot(key);
        let result = self.inner.controller.pause(&slot).await;
        drop(slot);
        self.inner.store.release_if_idle(key);
        result
    }

    pub async fn resume(&self, key: &CacheKey) -> Result<(), CacheError> {
        let slot = self.slot(key);
        let result = self.inner.controller.resume(&slot).await;
        drop(slot);
        self.inner.store.release_if_idle(key);
        result
    }

    /// 立即把条目当前状态写入清单
    pub async fn persist(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.inner.store.persist(key).await
    }

    /// 驱逐单个条目
    pub async fn evict(&self, key: &CacheKey) -> Result<(), CacheError> {
        let slot = self.slot(key);
        let result = self.inner.controller.evict(&slot).await;
        drop(slot);
        self.inner.store.release_if_idle(key);
        result
    }

    /// 驱逐整个命名空间，返回处理的条目数
    pub async fn evict_namespace(&self, manager: &str) -> Result<usize, CacheError> {
        let uris = self.known_uris(manager)?;
        for uri in &uris {
            self.evict(&CacheKey::new(manager, uri.as_str())).await?;
        }

        let dir = self.inner.store.namespace_dir(manager);
        if let Err(e) = std::fs::remove_dir(&dir) {
            debug!("命名空间目录未删除 {:?}: {}", dir, e);
        }
        info!("🗑 已清空命名空间: {} ({} 个条目)", manager, uris.len());
        Ok(uris.len())
    }

    /// 列出命名空间下的条目（已持久化的与内存中的）
    pub async fn list(&self, manager: &str) -> Result<Vec<EntrySnapshot>, CacheError> {
        let mut snapshots = Vec::new();
        for uri in self.known_uris(manager)? {
            snapshots.push(self.get_or_create(&CacheKey::new(manager, uri)).await);
        }
        Ok(snapshots)
    }

    fn known_uris(&self, manager: &str) -> Result<BTreeSet<String>, CacheError> {
        let mut uris: BTreeSet<String> = self
            .inner
            .store
            .list(manager)?
            .into_iter()
            .map(|record| record.uri)
            .collect();
        uris.extend(
            self.inner
                .store
                .slots_in(manager)
                .into_iter()
                .map(|slot| slot.key().uri.clone()),
        );
        Ok(uris)
    }

    /// 启动恢复扫描
    pub fn recover(&self) -> Result<RecoveryReport, CacheError> {
        self.inner.store.recover()
    }

    /// 订阅条目变化，返回的 [`Subscription`] 被 drop 时自动退订
    pub async fn subscribe<F>(
        &self,
        key: &CacheKey,
        options: SubscribeOptions,
        callback: F,
    ) -> Subscription
    where
        F: Fn(&EntrySnapshot) + Send + Sync + 'static,
    {
        let slot = self.slot(key);
        self.inner.attach(slot, options, Arc::new(callback)).await
    }

    /// 订阅并把快照转发到通道，保留每一次通知
    ///
    /// 通道容量为 [`SNAPSHOT_CHANNEL_CAPACITY`]
    pub async fn subscribe_channel(
        &self,
        key: &CacheKey,
        options: SubscribeOptions,
    ) -> (Subscription, mpsc::Receiver<EntrySnapshot>) {
        self.subscribe_channel_with_capacity(key, options, SNAPSHOT_CHANNEL_CAPACITY)
            .await
    }

    /// 订阅并转发到指定容量的通道
    ///
    /// 通道写满时丢弃新快照并记录警告，发布方从不等待接收方；
    /// 接收方落后时可通过 [`CacheSlot::snapshot`] 取得最新状态
    pub async fn subscribe_channel_with_capacity(
        &self,
        key: &CacheKey,
        options: SubscribeOptions,
        capacity: usize,
    ) -> (Subscription, mpsc::Receiver<EntrySnapshot>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscription = self
            .subscribe(key, options, move |snapshot: &EntrySnapshot| {
                if let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(snapshot.clone())
                {
                    warn!(
                        "⚠️ 订阅通道已满，丢弃快照: {}:{} ({:?} {}%)",
                        dropped.manager, dropped.uri, dropped.status, dropped.progress
                    );
                }
            })
            .await;
        (subscription, rx)
    }

    /// 打开句柄
    pub async fn open(
        &self,
        manager: impl Into<String>,
        uri: impl Into<String>,
        options: SubscribeOptions,
    ) -> CacheHandle {
        let key = CacheKey::new(manager, uri);
        let slot = self.slot(&key);
        let initial = slot.snapshot().await.with_ready(false);
        let (tx, rx) = watch::channel(initial);
        let subscription = self
            .inner
            .attach(
                slot.clone(),
                options,
                Arc::new(move |snapshot: &EntrySnapshot| {
                    tx.send_replace(snapshot.clone());
                }),
            )
            .await;
        CacheHandle::new(self.clone(), slot, rx, subscription)
    }

    /// 关闭前暂停所有进行中的下载，保证已接收字节写入清单
    pub async fn shutdown(&self) {
        let mut paused = 0;
        for slot in self.inner.store.all_slots() {
            if slot.snapshot().await.status != CacheStatus::Progress {
                continue;
            }
            match self.inner.controller.pause(&slot).await {
                Ok(()) => paused += 1,
                Err(e) => warn!("关闭时暂停失败: {}, 错误: {}", slot.key(), e),
            }
        }
        info!("缓存管理器已关闭，暂停了 {} 个下载", paused);
    }
}
