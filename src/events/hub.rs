//! 订阅表
//!
//! 每个缓存键一个 [`SubscriberSet`]，按引用计数管理观察者。
//! 回调在条目状态锁内被调用，保证通知顺序与状态迁移顺序一致；
//! 回调本身必须是非阻塞的

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::EntrySnapshot;

/// 快照回调
pub type SnapshotCallback = Arc<dyn Fn(&EntrySnapshot) + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: SnapshotCallback,
    /// ready 延迟是否已到期
    gate_open: bool,
}

/// 单个键的观察者集合
#[derive(Default)]
pub struct SubscriberSet {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl std::fmt::Debug for SubscriberSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberSet")
            .field("count", &self.len())
            .finish()
    }
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册观察者，返回订阅 ID
    pub fn add(&self, callback: SnapshotCallback, gate_open: bool) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscribers.lock().push(Subscriber {
            id,
            callback,
            gate_open,
        });
        id
    }

    /// 移除观察者，返回剩余数量；ID 不存在时返回 None
    pub fn remove(&self, id: u64) -> Option<usize> {
        let mut subscribers = self.subscribers.lock();
        let index = subscribers.iter().position(|s| s.id == id)?;
        subscribers.remove(index);
        Some(subscribers.len())
    }

    /// 打开 ready 闸门，返回该观察者的回调
    pub fn open_gate(&self, id: u64) -> Option<SnapshotCallback> {
        let mut subscribers = self.subscribers.lock();
        let subscriber = subscribers.iter_mut().find(|s| s.id == id)?;
        subscriber.gate_open = true;
        Some(subscriber.callback.clone())
    }

    pub fn is_gate_open(&self, id: u64) -> bool {
        self.subscribers
            .lock()
            .iter()
            .any(|s| s.id == id && s.gate_open)
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向全部观察者推送快照
    ///
    /// 闸门未打开的观察者收到 `ready = false` 的版本
    pub fn publish(&self, snapshot: &EntrySnapshot) {
        // 先复制回调列表再调用，回调里可以安全地增删订阅
        let targets: Vec<(SnapshotCallback, bool)> = self
            .subscribers
            .lock()
            .iter()
            .map(|s| (s.callback.clone(), s.gate_open))
            .collect();

        if targets.is_empty() {
            return;
        }

        let gated = snapshot.clone().with_ready(false);
        for (callback, gate_open) in targets {
            if gate_open {
                callback(snapshot);
            } else {
                callback(&gated);
            }
        }
    }
}
