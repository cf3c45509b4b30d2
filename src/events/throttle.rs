//! 进度节流器
//!
//! 控制下载过程中清单写盘的频率；状态变更不经过节流，总是立即落盘

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 500;

/// 时间节流器
///
/// 以创建时刻为原点记录上次放行的偏移量，可跨线程共享
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次放行距原点的纳秒数，u64::MAX 表示从未放行
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(u64::MAX),
            interval_nanos: interval.as_nanos().min(u64::MAX as u128 - 1) as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次放行超过间隔时返回 true 并记录本次时间；首次调用总是放行
    pub fn should_emit(&self) -> bool {
        let now = self.elapsed_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        let due = last == u64::MAX || now.saturating_sub(last) >= self.interval_nanos;
        if !due {
            return false;
        }
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（不检查间隔）
    pub fn force_emit(&self) {
        self.last_emit_nanos
            .store(self.elapsed_nanos(), Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(u64::MAX, Ordering::Relaxed);
    }

    fn elapsed_nanos(&self) -> u64 {
        self.origin.elapsed().as_nanos().min(u64::MAX as u128 - 1) as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
