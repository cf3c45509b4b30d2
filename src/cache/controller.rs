//! 下载控制器
//!
//! 负责驱动条目状态机：
//! - `download`：Pending/Failed -> Progress，启动传输任务
//! - `pause`：Progress -> Pause，取消传输并等待写入方退出
//! - `resume`：Pause -> Progress，从已接收字节处续传
//!
//! ## 并发约束
//!
//! - 每个槽位同一时刻最多一个传输任务（`SlotState::active`）
//! - 数据文件由独占写锁保护，新任务必须等旧任务完全退出才能写入
//! - 任务持有代号，被暂停/驱逐后代号失效，之后的任何结果都被丢弃
//! - 所有状态变更与通知都在槽位状态锁内完成，观察者看到的顺序即迁移顺序

use futures::StreamExt;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::entry::CacheStatus;
use super::error::CacheError;
use super::fetcher::{ByteStream, FetchRequest, FetchResponse, RemoteFetcher};
use super::store::{ActiveTransfer, CacheSlot, SlotState};
use crate::events::ProgressThrottler;

/// 控制器参数
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// 下载中清单写盘的最小间隔
    pub persist_interval: Duration,
    /// 两个数据块之间允许的最长空闲
    pub idle_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// 下载控制器
#[derive(Clone)]
pub struct DownloadController {
    fetcher: Arc<dyn RemoteFetcher>,
    settings: ControllerSettings,
}

impl std::fmt::Debug for DownloadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadController")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DownloadController {
    pub fn new(fetcher: Arc<dyn RemoteFetcher>, settings: ControllerSettings) -> Self {
        Self { fetcher, settings }
    }

    /// 开始下载
    ///
    /// - Progress / Complete：无操作
    /// - Failed：先回到 Pending 再开始（从已接收字节续传）
    /// - Pause：必须使用 resume
    pub async fn download(&self, slot: &Arc<CacheSlot>) -> Result<(), CacheError> {
        let mut state = slot.lock().await;
        match state.entry.status() {
            CacheStatus::Progress | CacheStatus::Complete => {
                debug!(
                    "忽略重复的下载请求: {} (status={})",
                    slot.key(),
                    state.entry.status()
                );
                return Ok(());
            }
            CacheStatus::Pause => {
                return Err(CacheError::invalid_state("download", CacheStatus::Pause));
            }
            CacheStatus::Failed => {
                state.entry.mark_pending_for_retry()?;
                slot.publish(&state);
                info!(
                    "重试下载: {} (从 {} bytes 继续)",
                    slot.key(),
                    state.entry.received_bytes()
                );
            }
            CacheStatus::Pending => {}
        }
        self.begin(slot, &mut state)
    }

    /// 暂停下载
    ///
    /// 已暂停时为无操作；返回时传输任务已退出，不会再写入数据文件
    pub async fn pause(&self, slot: &Arc<CacheSlot>) -> Result<(), CacheError> {
        let previous = {
            let mut state = slot.lock().await;
            match state.entry.status() {
                CacheStatus::Pause => return Ok(()),
                CacheStatus::Progress => {}
                other => return Err(CacheError::invalid_state("pause", other)),
            }
            state.entry.mark_paused()?;
            let previous = state.cancel_active();
            slot.persist_logged(&state.entry);
            slot.publish(&state);
            info!(
                "⏸ 已暂停: {} ({}%, {} bytes)",
                slot.key(),
                state.entry.progress(),
                state.entry.received_bytes()
            );
            previous
        };

        join_transfer(slot, previous).await;
        Ok(())
    }

    /// 继续下载
    ///
    /// 下载中时为无操作
    pub async fn resume(&self, slot: &Arc<CacheSlot>) -> Result<(), CacheError> {
        let mut state = slot.lock().await;
        match state.entry.status() {
            CacheStatus::Progress => return Ok(()),
            CacheStatus::Pause => {}
            other => return Err(CacheError::invalid_state("resume", other)),
        }
        info!(
            "▶ 继续下载: {} (从 {} bytes 继续)",
            slot.key(),
            state.entry.received_bytes()
        );
        self.begin(slot, &mut state)
    }

    /// 驱逐：停止传输，删除清单与数据文件，条目回到全新的 Pending
    ///
    /// 文件在旧任务完全退出后才删除，避免旧任务重新创建数据文件
    pub async fn evict(&self, slot: &Arc<CacheSlot>) -> Result<(), CacheError> {
        let previous = {
            let mut state = slot.lock().await;
            let previous = state.cancel_active();
            state.entry.reset();
            slot.publish(&state);
            previous
        };

        join_transfer(slot, previous).await;

        let state = slot.lock().await;
        if state.active.is_some() {
            // 等待期间已有新的下载开始，文件归新任务所有
            debug!("驱逐后已重新开始下载，保留文件: {}", slot.key());
        } else {
            slot.remove_files()?;
        }
        drop(state);
        info!("🗑 已驱逐缓存: {}", slot.key());
        Ok(())
    }

    fn begin(&self, slot: &Arc<CacheSlot>, state: &mut SlotState) -> Result<(), CacheError> {
        state.entry.mark_progress(slot.data_path().to_path_buf())?;
        let generation = state.next_generation();
        slot.persist_logged(&state.entry);
        slot.publish(state);

        let token = CancellationToken::new();
        let task = TransferTask {
            controller: self.clone(),
            slot: slot.clone(),
            generation,
            token: token.clone(),
        };
        let handle = tokio::spawn(task.run());
        state.active = Some(ActiveTransfer {
            generation,
            token,
            handle,
        });

        debug!("🚀 传输任务已启动: {} (generation={})", slot.key(), generation);
        Ok(())
    }
}

async fn join_transfer(slot: &CacheSlot, previous: Option<ActiveTransfer>) {
    if let Some(active) = previous {
        if let Err(e) = active.handle.await {
            warn!("传输任务异常退出: {}, 错误: {}", slot.key(), e);
        }
    }
}

/// 传输结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferEnd {
    /// 收齐全部字节
    Finished,
    /// 被暂停或驱逐
    Cancelled,
}

/// 续传响应的处理方式
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResumePlan {
    /// 响应从续传偏移开始
    Continue,
    /// 服务端返回完整内容但校验值一致，跳过已有前缀
    SkipPrefix,
    /// 已下载数据不可用，必须从头开始
    Restart(String),
}

fn plan_resume(
    offset: u64,
    stored_total: Option<u64>,
    stored_validator: Option<&str>,
    response: &FetchResponse,
) -> ResumePlan {
    let start = response.start;
    if offset == 0 {
        return if start == 0 {
            ResumePlan::Continue
        } else {
            ResumePlan::Restart(format!("请求从 0 开始，但响应从 {} 开始", start))
        };
    }

    if let (Some(before), Some(now)) = (stored_total, response.total) {
        if before != now {
            return ResumePlan::Restart(format!("远端大小已变化: {} -> {}", before, now));
        }
    }
    if let (Some(before), Some(now)) = (stored_validator, response.validator.as_deref()) {
        if before != now {
            return ResumePlan::Restart(format!("远端校验值已变化: {} -> {}", before, now));
        }
    }

    if start == offset {
        return ResumePlan::Continue;
    }
    if start == 0 {
        return match (stored_validator, response.validator.as_deref()) {
            (Some(before), Some(now)) if before == now => ResumePlan::SkipPrefix,
            _ => ResumePlan::Restart("服务端不支持续传且无法确认已下载数据".to_string()),
        };
    }
    ResumePlan::Restart(format!("响应起点 {} 与续传偏移 {} 不一致", start, offset))
}

struct TransferTask {
    controller: DownloadController,
    slot: Arc<CacheSlot>,
    generation: u64,
    token: CancellationToken,
}

impl TransferTask {
    async fn run(self) {
        let writer = self.slot.writer();
        let _writer_guard = tokio::select! {
            guard = writer.lock_owned() => guard,
            _ = self.token.cancelled() => {
                debug!("传输在获得写锁前被取消: {}", self.slot.key());
                return;
            }
        };

        let outcome = self.transfer().await;

        let mut state = self.slot.lock().await;
        if !state.is_current(self.generation) {
            debug!("传输已被暂停或驱逐，丢弃结果: {}", self.slot.key());
            return;
        }
        state.active = None;

        let outcome = match outcome {
            Ok(TransferEnd::Finished) => self.commit_complete(&mut state),
            other => other,
        };
        match outcome {
            Ok(TransferEnd::Finished) => {
                self.slot.publish(&state);
                info!(
                    "✓ 缓存完成: {} ({} bytes)",
                    self.slot.key(),
                    state.entry.received_bytes()
                );
            }
            Ok(TransferEnd::Cancelled) => {
                debug!("传输已取消: {}", self.slot.key());
            }
            Err(e) => {
                warn!("✗ 缓存下载失败: {}, 错误: {}", self.slot.key(), e);
                if state.entry.mark_failed(&e).is_ok() {
                    self.slot.persist_logged(&state.entry);
                    self.slot.publish(&state);
                }
            }
        }
    }

    /// 清单写入成功后才把条目切换为 Complete
    fn commit_complete(&self, state: &mut SlotState) -> Result<TransferEnd, CacheError> {
        let mut completed = state.entry.clone();
        completed.mark_complete()?;
        self.slot.persist(&completed)?;
        state.entry = completed;
        Ok(TransferEnd::Finished)
    }

    async fn transfer(&self) -> Result<TransferEnd, CacheError> {
        let (uri, mut offset, mut stored_total, mut stored_validator) = {
            let state = self.slot.lock().await;
            if !state.is_current(self.generation) {
                return Ok(TransferEnd::Cancelled);
            }
            let entry = &state.entry;
            (
                entry.key().uri.clone(),
                entry.received_bytes(),
                entry.total_bytes(),
                entry.validator().map(str::to_string),
            )
        };
        let path = self.slot.data_path().to_path_buf();

        if offset > 0 {
            let on_disk = file_len(&path).await;
            let reason = match stored_total {
                Some(total) if offset > total => {
                    Some(format!("已接收 {} 字节超过总大小 {}", offset, total))
                }
                _ if on_disk < offset => Some(format!(
                    "本地文件长度 {} 小于已记录的 {} 字节",
                    on_disk, offset
                )),
                _ => None,
            };
            if let Some(reason) = reason {
                if !self.discard(reason).await? {
                    return Ok(TransferEnd::Cancelled);
                }
                offset = 0;
                stored_total = None;
                stored_validator = None;
            } else if stored_total == Some(offset) {
                // 上次已收齐全部字节，只差标记完成
                verify_length(&path, offset).await?;
                return Ok(TransferEnd::Finished);
            }
        }

        let mut restarts_left = 1u32;
        loop {
            let request = FetchRequest::new(uri.clone()).resume_from(
                offset,
                if offset > 0 { stored_validator.clone() } else { None },
            );

            let fetched = tokio::select! {
                fetched = self.controller.fetcher.fetch(request) => fetched,
                _ = self.token.cancelled() => return Ok(TransferEnd::Cancelled),
            };
            let response = match fetched {
                Ok(response) => response,
                Err(CacheError::CorruptResume(reason)) if offset > 0 && restarts_left > 0 => {
                    restarts_left -= 1;
                    if !self.discard(reason).await? {
                        return Ok(TransferEnd::Cancelled);
                    }
                    offset = 0;
                    stored_total = None;
                    stored_validator = None;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let (write_from, skip) =
                match plan_resume(offset, stored_total, stored_validator.as_deref(), &response) {
                    ResumePlan::Continue => (offset, 0),
                    ResumePlan::SkipPrefix => {
                        debug!("服务端忽略了 Range，跳过 {} 字节前缀: {}", offset, uri);
                        (offset, offset)
                    }
                    ResumePlan::Restart(reason) => {
                        if !self.discard(reason.clone()).await? {
                            return Ok(TransferEnd::Cancelled);
                        }
                        offset = 0;
                        stored_total = None;
                        stored_validator = None;
                        if response.start != 0 {
                            if restarts_left == 0 {
                                return Err(CacheError::CorruptResume(reason));
                            }
                            restarts_left -= 1;
                            continue;
                        }
                        (0, 0)
                    }
                };

            return self.stream_body(response, write_from, skip, &path).await;
        }
    }

    /// 丢弃已下载部分：Progress -> Failed -> Pending -> Progress（字节清零）
    ///
    /// 返回 false 表示任务已失效
    async fn discard(&self, reason: String) -> Result<bool, CacheError> {
        let mut state = self.slot.lock().await;
        if !state.is_current(self.generation) {
            return Ok(false);
        }

        let error = CacheError::CorruptResume(reason);
        warn!("⚠️ 续传数据不可用，从头下载: {}, 原因: {}", self.slot.key(), error);

        state.entry.mark_failed(&error)?;
        self.slot.publish(&state);
        state.entry.mark_pending_for_retry()?;
        state.entry.discard_partial();
        self.slot.publish(&state);
        state
            .entry
            .mark_progress(self.slot.data_path().to_path_buf())?;
        self.slot.publish(&state);
        self.slot.persist(&state.entry)?;
        Ok(true)
    }

    async fn stream_body(
        &self,
        response: FetchResponse,
        write_from: u64,
        skip: u64,
        path: &Path,
    ) -> Result<TransferEnd, CacheError> {
        let FetchResponse {
            total,
            validator,
            mut body,
            ..
        } = response;

        {
            let mut state = self.slot.lock().await;
            if !state.is_current(self.generation) {
                return Ok(TransferEnd::Cancelled);
            }
            if state.entry.set_remote_meta(total, validator) {
                self.slot.publish(&state);
            }
            self.slot.persist(&state.entry)?;
        }

        let mut file = open_at(path, write_from).await?;
        let pumped = self.pump(&mut body, &mut file, skip).await;
        // 无论结果如何都先让已写入的数据落盘，下一个写入方会按文件长度续传
        let flushed = file.flush().await;
        let end = pumped?;
        flushed?;
        if end == TransferEnd::Cancelled {
            return Ok(end);
        }
        file.sync_all().await?;

        let received = {
            let state = self.slot.lock().await;
            if !state.is_current(self.generation) {
                return Ok(TransferEnd::Cancelled);
            }
            match state.entry.total_bytes() {
                Some(total) if state.entry.received_bytes() < total => {
                    return Err(CacheError::Network(format!(
                        "连接提前关闭: 已接收 {} / {} bytes",
                        state.entry.received_bytes(),
                        total
                    )));
                }
                _ => state.entry.received_bytes(),
            }
        };

        verify_length(path, received).await?;
        Ok(TransferEnd::Finished)
    }

    /// 把响应体写入文件，直到流结束或任务被取消
    async fn pump(
        &self,
        body: &mut ByteStream,
        file: &mut File,
        mut skip: u64,
    ) -> Result<TransferEnd, CacheError> {
        let persist_throttle = ProgressThrottler::new(self.controller.settings.persist_interval);
        persist_throttle.force_emit();
        let idle = self.controller.settings.idle_timeout;

        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Ok(TransferEnd::Cancelled),
                next = tokio::time::timeout(idle, body.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(CacheError::Network(format!(
                        "{} 秒内未收到数据",
                        idle.as_secs()
                    )));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            let mut data = &chunk[..];
            if skip > 0 {
                let n = skip.min(data.len() as u64) as usize;
                data = &data[n..];
                skip -= n as u64;
                if data.is_empty() {
                    continue;
                }
            }

            file.write_all(data).await?;

            let mut state = self.slot.lock().await;
            if !state.is_current(self.generation) {
                return Ok(TransferEnd::Cancelled);
            }
            let changed = state.entry.record_bytes(data.len() as u64);
            if let Some(total) = state.entry.total_bytes() {
                if state.entry.received_bytes() > total {
                    return Err(CacheError::Malformed(format!(
                        "响应体超出声明的长度 {} bytes",
                        total
                    )));
                }
            }
            if changed {
                self.slot.publish(&state);
            }
            if persist_throttle.should_emit() {
                // 清单记录的字节数不能超过已落盘的数据
                file.flush().await?;
                self.slot.persist(&state.entry)?;
            }
        }

        if skip > 0 {
            return Err(CacheError::CorruptResume(
                "响应体短于已下载的前缀".to_string(),
            ));
        }
        Ok(TransferEnd::Finished)
    }
}

/// 打开数据文件并定位到写入起点，截掉未确认的尾部
async fn open_at(path: &Path, offset: u64) -> Result<File, CacheError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await?;
    file.set_len(offset).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    Ok(file)
}

async fn file_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

async fn verify_length(path: &Path, expected: u64) -> Result<(), CacheError> {
    let actual = fs::metadata(path).await?.len();
    if actual != expected {
        return Err(CacheError::Storage(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "数据文件长度 {} 与预期 {} 不符: {:?}",
                actual,
                expected,
                PathBuf::from(path)
            ),
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::{sample_bytes, MockBehavior, MockFetcher};
    use crate::cache::{CacheKey, CacheStore, EntrySnapshot, ErrorKind};
    use futures::future::join_all;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        _temp_dir: TempDir,
        store: CacheStore,
        controller: DownloadController,
        fetcher: Arc<MockFetcher>,
    }

    fn harness(data: Vec<u8>, behavior: MockBehavior) -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let store = CacheStore::open(temp_dir.path()).unwrap();
        let fetcher = Arc::new(MockFetcher::with_behavior(data, behavior));
        let controller = DownloadController::new(fetcher.clone(), ControllerSettings::default());
        Harness {
            _temp_dir: temp_dir,
            store,
            controller,
            fetcher,
        }
    }

    fn key() -> CacheKey {
        CacheKey::new("imgs", "https://img.example.com/a.png")
    }

    fn record(slot: &CacheSlot) -> mpsc::UnboundedReceiver<EntrySnapshot> {
        let (tx, rx) = mpsc::unbounded_channel();
        slot.subscribers().add(
            Arc::new(move |s: &EntrySnapshot| {
                let _ = tx.send(s.clone());
            }),
            true,
        );
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EntrySnapshot>) -> Vec<EntrySnapshot> {
        let mut out = Vec::new();
        while let Ok(s) = rx.try_recv() {
            out.push(s);
        }
        out
    }

    fn statuses(events: &[EntrySnapshot]) -> Vec<CacheStatus> {
        let mut out: Vec<CacheStatus> = Vec::new();
        for s in events {
            if out.last() != Some(&s.status) {
                out.push(s.status);
            }
        }
        out
    }

    async fn wait_until<F>(slot: &CacheSlot, predicate: F) -> EntrySnapshot
    where
        F: Fn(&EntrySnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = slot.snapshot().await;
                if predicate(&snapshot) {
                    return snapshot;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("等待条目状态超时")
    }

    #[tokio::test]
    async fn test_download_to_complete() {
        let data = sample_bytes(1000);
        let h = harness(data.clone(), MockBehavior::default());
        let slot = h.store.get_or_create(&key());
        let mut rx = record(&slot);

        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;

        assert_eq!(done.progress, 100);
        assert_eq!(done.total_bytes, Some(1000));
        let path = done.renderable_path().unwrap().to_path_buf();
        assert_eq!(std::fs::read(path).unwrap(), data);

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![CacheStatus::Progress, CacheStatus::Complete]
        );
        let progress: Vec<u8> = events.iter().map(|s| s.progress).collect();
        assert!(progress.windows(2).all(|w| w[0] <= w[1]));
        assert!(events
            .iter()
            .filter(|s| s.status == CacheStatus::Progress)
            .all(|s| s.path.is_some() && s.renderable_path().is_none()));
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_from_offset() {
        let data = sample_bytes(1000);
        let h = harness(
            data.clone(),
            MockBehavior {
                hold_after: Some(400),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.progress == 40).await;

        h.controller.pause(&slot).await.unwrap();
        let paused = slot.snapshot().await;
        assert_eq!(paused.status, CacheStatus::Pause);
        assert_eq!(paused.progress, 40);
        assert_eq!(paused.received_bytes, 400);

        h.fetcher.update(|b| b.hold_after = None);
        h.controller.resume(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;

        let requests = h.fetcher.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].offset, 0);
        assert_eq!(requests[1].offset, 400);
        assert_eq!(requests[1].validator.as_deref(), Some("\"v1\""));
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), data);
    }

    #[tokio::test]
    async fn test_failure_then_retry_resumes() {
        let data = sample_bytes(1000);
        let h = harness(
            data.clone(),
            MockBehavior {
                fail_after: Some(250),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());
        let mut rx = record(&slot);

        h.controller.download(&slot).await.unwrap();
        let failed = wait_until(&slot, |s| s.status == CacheStatus::Failed).await;
        assert_eq!(failed.progress, 25);
        assert_eq!(failed.error.as_ref().map(|e| e.kind), Some(ErrorKind::Network));
        assert!(failed.renderable_path().is_none());

        h.fetcher.update(|b| b.fail_after = None);
        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert!(done.error.is_none());
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), data);

        assert_eq!(h.fetcher.requests()[1].offset, 250);
        assert_eq!(
            statuses(&drain(&mut rx)),
            vec![
                CacheStatus::Progress,
                CacheStatus::Failed,
                CacheStatus::Pending,
                CacheStatus::Progress,
                CacheStatus::Complete
            ]
        );
    }

    #[tokio::test]
    async fn test_concurrent_downloads_issue_one_request() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                chunk_delay: Duration::from_millis(2),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        let calls = (0..10).map(|_| h.controller.download(&slot));
        for result in join_all(calls).await {
            result.unwrap();
        }
        wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(h.fetcher.request_count(), 1);

        // 已完成时 download 为无操作
        h.controller.download(&slot).await.unwrap();
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn test_double_pause_is_silent() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                hold_after: Some(500),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());
        let mut rx = record(&slot);

        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.progress == 50).await;

        h.controller.pause(&slot).await.unwrap();
        h.controller.pause(&slot).await.unwrap();

        let pauses = drain(&mut rx)
            .into_iter()
            .filter(|s| s.status == CacheStatus::Pause)
            .count();
        assert_eq!(pauses, 1);
    }

    #[tokio::test]
    async fn test_invalid_state_operations() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                hold_after: Some(300),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        let err = h.controller.pause(&slot).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::InvalidState {
                operation: "pause",
                status: CacheStatus::Pending
            }
        ));
        assert!(matches!(
            h.controller.resume(&slot).await,
            Err(CacheError::InvalidState { .. })
        ));

        h.controller.download(&slot).await.unwrap();
        // 下载中时 resume 为无操作
        h.controller.resume(&slot).await.unwrap();
        wait_until(&slot, |s| s.progress == 30).await;
        h.controller.pause(&slot).await.unwrap();

        assert!(matches!(
            h.controller.download(&slot).await,
            Err(CacheError::InvalidState {
                status: CacheStatus::Pause,
                ..
            })
        ));
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn test_changed_validator_restarts_from_zero() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                hold_after: Some(400),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());
        let mut rx = record(&slot);

        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.progress == 40).await;
        h.controller.pause(&slot).await.unwrap();

        let replacement: Vec<u8> = sample_bytes(800).into_iter().rev().collect();
        h.fetcher.replace_data(replacement.clone());
        h.fetcher.update(|b| {
            b.hold_after = None;
            b.validator = Some("\"v2\"".to_string());
        });
        drain(&mut rx);

        h.controller.resume(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(done.total_bytes, Some(800));
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), replacement);

        let events = drain(&mut rx);
        assert_eq!(
            statuses(&events),
            vec![
                CacheStatus::Progress,
                CacheStatus::Failed,
                CacheStatus::Pending,
                CacheStatus::Progress,
                CacheStatus::Complete
            ]
        );
        let failed = events
            .iter()
            .find(|s| s.status == CacheStatus::Failed)
            .unwrap();
        assert_eq!(
            failed.error.as_ref().map(|e| e.kind),
            Some(ErrorKind::CorruptResume)
        );
        // If-Range 不匹配时复用完整响应，不再额外请求
        assert_eq!(h.fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn test_server_without_range_skips_prefix() {
        let data = sample_bytes(1000);
        let h = harness(
            data.clone(),
            MockBehavior {
                fail_after: Some(600),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.status == CacheStatus::Failed).await;

        h.fetcher.update(|b| {
            b.fail_after = None;
            b.supports_range = false;
        });
        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(done.received_bytes, 1000);
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), data);
    }

    #[tokio::test]
    async fn test_unknown_total_completes_at_stream_end() {
        let data = sample_bytes(700);
        let h = harness(
            data.clone(),
            MockBehavior {
                announce_total: false,
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(done.total_bytes, Some(700));
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn test_short_body_fails_with_network_error() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                end_after: Some(900),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        let failed = wait_until(&slot, |s| s.status == CacheStatus::Failed).await;
        assert_eq!(failed.received_bytes, 900);
        assert_eq!(failed.error.map(|e| e.kind), Some(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_rejected_request_fails() {
        let h = harness(
            sample_bytes(100),
            MockBehavior {
                reject_requests: true,
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        let failed = wait_until(&slot, |s| s.status == CacheStatus::Failed).await;
        assert_eq!(failed.progress, 0);
        assert!(failed.renderable_path().is_none());
    }

    #[tokio::test]
    async fn test_evict_during_transfer() {
        let h = harness(
            sample_bytes(1000),
            MockBehavior {
                hold_after: Some(300),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.progress == 30).await;

        h.controller.evict(&slot).await.unwrap();
        let evicted = slot.snapshot().await;
        assert_eq!(evicted.status, CacheStatus::Pending);
        assert_eq!(evicted.received_bytes, 0);
        assert!(evicted.path.is_none());
        assert!(!slot.data_path().exists());
        assert!(!slot.manifest_path().exists());

        h.fetcher.update(|b| b.hold_after = None);
        h.controller.download(&slot).await.unwrap();
        wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(h.fetcher.requests()[1].offset, 0);
    }

    #[tokio::test]
    async fn test_evict_leaves_no_files_behind() {
        let h = harness(
            sample_bytes(4000),
            MockBehavior {
                chunk_delay: Duration::from_millis(1),
                ..Default::default()
            },
        );
        let slot = h.store.get_or_create(&key());

        for round in 0..20u64 {
            h.controller.download(&slot).await.unwrap();
            if round % 2 == 1 {
                tokio::time::sleep(Duration::from_millis(round)).await;
            }
            h.controller.evict(&slot).await.unwrap();

            assert!(!slot.data_path().exists(), "第 {} 轮残留数据文件", round);
            assert!(!slot.manifest_path().exists(), "第 {} 轮残留清单", round);
            let snapshot = slot.snapshot().await;
            assert_eq!(snapshot.status, CacheStatus::Pending);
            assert_eq!(snapshot.received_bytes, 0);
        }
    }

    #[tokio::test]
    async fn test_data_file_unwritable_fails_with_storage() {
        let data = sample_bytes(600);
        let h = harness(data.clone(), MockBehavior::default());
        let slot = h.store.get_or_create(&key());

        // 数据文件位置被目录占用，无法打开写入
        std::fs::create_dir_all(slot.data_path()).unwrap();
        std::fs::write(slot.data_path().join("occupied"), b"x").unwrap();

        h.controller.download(&slot).await.unwrap();
        let failed = wait_until(&slot, |s| s.status == CacheStatus::Failed).await;
        assert_eq!(failed.error.as_ref().map(|e| e.kind), Some(ErrorKind::Storage));
        assert!(failed.renderable_path().is_none());

        std::fs::remove_dir_all(slot.data_path()).unwrap();
        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert!(done.error.is_none());
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), data);
    }

    #[tokio::test]
    async fn test_manifest_write_failure_fails_with_storage() {
        let data = sample_bytes(600);
        let h = harness(data.clone(), MockBehavior::default());
        let slot = h.store.get_or_create(&key());
        let mut rx = record(&slot);

        // 清单位置被非空目录占用，重命名必然失败
        std::fs::create_dir_all(slot.manifest_path()).unwrap();
        std::fs::write(slot.manifest_path().join("occupied"), b"x").unwrap();

        h.controller.download(&slot).await.unwrap();
        let failed = wait_until(&slot, |s| s.status == CacheStatus::Failed).await;
        assert_eq!(failed.error.as_ref().map(|e| e.kind), Some(ErrorKind::Storage));
        assert!(!drain(&mut rx)
            .iter()
            .any(|s| s.status == CacheStatus::Complete));

        std::fs::remove_dir_all(slot.manifest_path()).unwrap();
        h.controller.download(&slot).await.unwrap();
        let done = wait_until(&slot, |s| s.status == CacheStatus::Complete).await;
        assert_eq!(std::fs::read(done.path.unwrap()).unwrap(), data);

        // 完成状态已落盘，重新打开后仍是 Complete
        let reopened = CacheStore::open(h.store.root()).unwrap();
        let reloaded = reopened.get_or_create(&key()).snapshot().await;
        assert_eq!(reloaded.status, CacheStatus::Complete);
        assert_eq!(reloaded.received_bytes, 600);
    }

    #[test]
    fn test_plan_resume() {
        fn response(start: u64, total: Option<u64>, validator: Option<&str>) -> FetchResponse {
            FetchResponse {
                start,
                total,
                validator: validator.map(str::to_string),
                body: futures::stream::empty().boxed(),
            }
        }

        assert_eq!(
            plan_resume(0, None, None, &response(0, Some(10), None)),
            ResumePlan::Continue
        );
        assert_eq!(
            plan_resume(4, Some(10), Some("a"), &response(4, Some(10), Some("a"))),
            ResumePlan::Continue
        );
        assert_eq!(
            plan_resume(4, Some(10), Some("a"), &response(0, Some(10), Some("a"))),
            ResumePlan::SkipPrefix
        );
        assert!(matches!(
            plan_resume(4, Some(10), None, &response(0, Some(10), None)),
            ResumePlan::Restart(_)
        ));
        assert!(matches!(
            plan_resume(4, Some(10), Some("a"), &response(4, Some(12), Some("a"))),
            ResumePlan::Restart(_)
        ));
        assert!(matches!(
            plan_resume(4, Some(10), Some("a"), &response(0, Some(10), Some("b"))),
            ResumePlan::Restart(_)
        ));
        assert!(matches!(
            plan_resume(4, Some(10), Some("a"), &response(6, Some(10), Some("a"))),
            ResumePlan::Restart(_)
        ));
    }
}
