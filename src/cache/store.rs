//! 缓存存储
//!
//! 每个缓存键在进程内同一时刻只有一个 [`CacheSlot`]；首次访问时从清单恢复，
//! 之后的所有读写都经过这个槽位。没有任何持有者、也没有磁盘状态的空闲槽位
//! 会从表中移除（见 [`CacheStore::release_if_idle`]），下次访问时重新加载

use dashmap::DashMap;
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::entry::{CacheEntry, CacheKey, CacheStatus, EntrySnapshot};
use super::error::CacheError;
use crate::events::SubscriberSet;
use crate::persistence::{
    delete_manifest, load_manifest, manifest_path, reconcile_record, save_manifest,
    scan_cache_root, scan_manifests, ManifestRecord, ReconcileOutcome, RecoveryReport,
    MANIFEST_EXTENSION,
};

/// 无法从 URI 推断扩展名时使用
const FALLBACK_EXTENSION: &str = "bin";

/// 正在运行的传输任务
pub(crate) struct ActiveTransfer {
    pub(crate) generation: u64,
    pub(crate) token: CancellationToken,
    pub(crate) handle: JoinHandle<()>,
}

/// 槽位内受锁保护的状态
pub(crate) struct SlotState {
    pub(crate) entry: CacheEntry,
    pub(crate) active: Option<ActiveTransfer>,
    generation: u64,
}

impl SlotState {
    /// 为新的传输分配代号，旧任务随即失效
    pub(crate) fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// 任务是否仍是当前传输
    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.active
            .as_ref()
            .map(|a| a.generation == generation)
            .unwrap_or(false)
    }

    /// 取出当前传输并发出取消信号
    pub(crate) fn cancel_active(&mut self) -> Option<ActiveTransfer> {
        let active = self.active.take()?;
        active.token.cancel();
        Some(active)
    }
}

/// 单个缓存键的槽位
pub struct CacheSlot {
    key: CacheKey,
    data_path: PathBuf,
    manifest_path: PathBuf,
    state: Mutex<SlotState>,
    /// 数据文件的独占写锁，同一时刻只有一个传输任务持有
    writer: Arc<Mutex<()>>,
    subscribers: SubscriberSet,
}

impl std::fmt::Debug for CacheSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSlot")
            .field("key", &self.key)
            .field("data_path", &self.data_path)
            .finish_non_exhaustive()
    }
}

impl CacheSlot {
    fn new(key: CacheKey, data_path: PathBuf, manifest_path: PathBuf, entry: CacheEntry) -> Self {
        Self {
            key,
            data_path,
            manifest_path,
            state: Mutex::new(SlotState {
                entry,
                active: None,
                generation: 0,
            }),
            writer: Arc::new(Mutex::new(())),
            subscribers: SubscriberSet::new(),
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// 数据文件路径（下载开始后写入条目的 path）
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn subscribers(&self) -> &SubscriberSet {
        &self.subscribers
    }

    /// 当前观察者数量
    pub fn observer_count(&self) -> usize {
        self.subscribers.len()
    }

    pub async fn snapshot(&self) -> EntrySnapshot {
        self.state.lock().await.entry.snapshot()
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().await
    }

    pub(crate) fn writer(&self) -> Arc<Mutex<()>> {
        self.writer.clone()
    }

    /// 向观察者推送当前状态，调用方必须持有状态锁
    pub(crate) fn publish(&self, state: &SlotState) {
        self.subscribers.publish(&state.entry.snapshot());
    }

    /// 写清单
    pub(crate) fn persist(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        save_manifest(&self.manifest_path, &entry.to_record())?;
        Ok(())
    }

    /// 写清单，失败只记录日志
    ///
    /// 仅用于尽力而为的写入（暂停、开始下载、记录失败）；传输过程中的写入失败必须上报
    pub(crate) fn persist_logged(&self, entry: &CacheEntry) {
        if let Err(e) = self.persist(entry) {
            warn!("写入清单失败: {}, 错误: {}", self.key, e);
        }
    }

    /// 删除清单和数据文件
    pub(crate) fn remove_files(&self) -> io::Result<()> {
        delete_manifest(&self.manifest_path)?;
        match fs::remove_file(&self.data_path) {
            Ok(()) => {
                debug!("已删除数据文件: {:?}", self.data_path);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// 缓存存储
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    slots: DashMap<CacheKey, Arc<CacheSlot>>,
}

impl CacheStore {
    /// 打开缓存根目录（不存在时创建）
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = dunce::canonicalize(&root)?;
        info!("缓存根目录: {:?}", root);
        Ok(Self {
            root,
            slots: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 命名空间目录
    pub fn namespace_dir(&self, manager: &str) -> PathBuf {
        self.root.join(namespace_dir_name(manager))
    }

    /// 获取或创建槽位
    ///
    /// 同一个键总是返回同一个槽位；首次访问时读取清单并与磁盘文件核对
    pub fn get_or_create(&self, key: &CacheKey) -> Arc<CacheSlot> {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(self.load_slot(key)))
            .value()
            .clone()
    }

    /// 只查询内存中已有的槽位
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheSlot>> {
        self.slots.get(key).map(|slot| slot.value().clone())
    }

    /// 移除空闲槽位，返回是否移除
    ///
    /// 空闲：表是唯一持有者、没有观察者与传输任务，且条目是没有清单的全新 Pending。
    /// 判断在分片写锁内完成，期间 `get_or_create` 无法取得该槽位
    pub fn release_if_idle(&self, key: &CacheKey) -> bool {
        let removed = self
            .slots
            .remove_if(key, |_, slot| Self::is_disposable(slot))
            .is_some();
        if removed {
            debug!("释放空闲槽位: {}", key);
        }
        removed
    }

    fn is_disposable(slot: &Arc<CacheSlot>) -> bool {
        if Arc::strong_count(slot) != 1 || !slot.subscribers.is_empty() {
            return false;
        }
        match slot.state.try_lock() {
            Ok(state) => {
                state.active.is_none()
                    && state.entry.status() == CacheStatus::Pending
                    && state.entry.received_bytes() == 0
                    && !slot.manifest_path.exists()
            }
            Err(_) => false,
        }
    }

    /// 内存中的槽位数量
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 内存中属于某个命名空间的槽位
    pub fn slots_in(&self, manager: &str) -> Vec<Arc<CacheSlot>> {
        self.slots
            .iter()
            .filter(|item| item.key().manager == manager)
            .map(|item| item.value().clone())
            .collect()
    }

    /// 内存中的全部槽位
    pub fn all_slots(&self) -> Vec<Arc<CacheSlot>> {
        self.slots.iter().map(|item| item.value().clone()).collect()
    }

    /// 立即把槽位当前状态写入清单
    pub async fn persist(&self, key: &CacheKey) -> Result<(), CacheError> {
        let slot = self.get_or_create(key);
        let state = slot.lock().await;
        slot.persist(&state.entry)
    }

    /// 列出命名空间下已持久化的记录
    pub fn list(&self, manager: &str) -> Result<Vec<ManifestRecord>, CacheError> {
        let mut records = scan_manifests(&self.namespace_dir(manager))?;
        records.retain(|r| r.manager == manager);
        records.sort_by(|a, b| a.uri.cmp(&b.uri));
        Ok(records)
    }

    /// 启动时扫描整个缓存目录
    pub fn recover(&self) -> Result<RecoveryReport, CacheError> {
        Ok(scan_cache_root(&self.root)?)
    }

    fn load_slot(&self, key: &CacheKey) -> CacheSlot {
        let storage_id = key.storage_id();
        let dir = self.namespace_dir(&key.manager);
        let manifest = manifest_path(&dir, &storage_id);
        let data_path = dir.join(format!("{}.{}", storage_id, extension_for(&key.uri)));

        let mut entry = match load_manifest(&manifest) {
            Some(record) if record.manager != key.manager || record.uri != key.uri => {
                warn!(
                    "清单内容与缓存键不符，忽略: {:?} (期望 {}, 实际 {}:{})",
                    manifest, key, record.manager, record.uri
                );
                CacheEntry::new(key.clone())
            }
            Some(mut record) => match reconcile_record(&mut record) {
                ReconcileOutcome::Reset => {
                    if let Err(e) = delete_manifest(&manifest) {
                        warn!("删除失效清单失败 {:?}: {}", manifest, e);
                    }
                    let _ = fs::remove_file(&data_path);
                    CacheEntry::new(key.clone())
                }
                outcome => {
                    let entry = CacheEntry::from_record(record);
                    if let ReconcileOutcome::Clamped { from, to } = outcome {
                        info!("按磁盘文件修正已接收字节: {} {} -> {}", key, from, to);
                        if let Err(e) = save_manifest(&manifest, &entry.to_record()) {
                            warn!("回写修正后的清单失败 {:?}: {}", manifest, e);
                        }
                    }
                    debug!("从清单恢复条目: {} status={}", key, entry.status());
                    entry
                }
            },
            None => CacheEntry::new(key.clone()),
        };

        entry.mark_ready();
        CacheSlot::new(key.clone(), data_path, manifest, entry)
    }
}

/// 命名空间目录名：只保留安全字符
pub fn namespace_dir_name(manager: &str) -> String {
    static UNSAFE: OnceLock<Option<Regex>> = OnceLock::new();
    let sanitized = match UNSAFE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]").ok()) {
        Some(re) => re.replace_all(manager, "_").into_owned(),
        None => manager
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "._-".contains(c) { c } else { '_' })
            .collect(),
    };
    match sanitized.as_str() {
        "" => "_default".to_string(),
        "." | ".." => sanitized.replace('.', "_"),
        _ => sanitized,
    }
}

/// 从 URI 的最后一段路径推断扩展名
pub fn extension_for(uri: &str) -> String {
    static EXTENSION: OnceLock<Option<Regex>> = OnceLock::new();
    let path = uri.split(['?', '#']).next().unwrap_or(uri);
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let last_segment = match path.split_once('/') {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or(""),
        None => "",
    };

    EXTENSION
        .get_or_init(|| Regex::new(r"\.([A-Za-z0-9]{1,8})$").ok())
        .as_ref()
        .and_then(|re| re.captures(last_segment))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        // 避免与清单文件同名
        .filter(|ext| ext != MANIFEST_EXTENSION)
        .unwrap_or_else(|| FALLBACK_EXTENSION.to_string())
}
