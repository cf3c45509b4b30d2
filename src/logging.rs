//! 日志系统配置
//!
//! 控制台输出 + 可选的文件持久化。日志文件以启动时间命名，超过大小上限时
//! 追加序号滚动，启动时清理超过保留天数的旧文件

use crate::config::LogConfig;
use chrono::{Local, NaiveDate};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// 日志文件名前缀
pub const LOG_FILE_PREFIX: &str = "file-cache";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的文件写入器
///
/// 文件名：`file-cache.{启动时间}.log`，滚动后为 `file-cache.{启动时间}_{N}.log`
#[derive(Clone)]
pub struct RotatingFileWriter {
    state: Arc<Mutex<RotationState>>,
}

struct RotationState {
    log_dir: PathBuf,
    started_at: String,
    index: u32,
    max_file_size: u64,
    written: u64,
    file: File,
}

impl RotationState {
    fn path_for(log_dir: &Path, started_at: &str, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}.{}.log", LOG_FILE_PREFIX, started_at)
        } else {
            format!("{}.{}_{}.log", LOG_FILE_PREFIX, started_at, index)
        };
        log_dir.join(name)
    }

    fn open(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = Self::open(&Self::path_for(&self.log_dir, &self.started_at, self.index))?;
        self.written = 0;
        Ok(())
    }
}

impl RotatingFileWriter {
    pub fn new(log_dir: impl Into<PathBuf>, max_file_size: u64) -> io::Result<Self> {
        let log_dir = log_dir.into();
        let started_at = Local::now().format("%Y-%m-%d-%H%M%S").to_string();
        let file = RotationState::open(&RotationState::path_for(&log_dir, &started_at, 0))?;
        Ok(Self {
            state: Arc::new(Mutex::new(RotationState {
                log_dir,
                started_at,
                index: 0,
                max_file_size: max_file_size.max(1),
                written: 0,
                file,
            })),
        })
    }

    /// 当前写入的文件路径
    pub fn current_path(&self) -> PathBuf {
        let state = self.state.lock();
        RotationState::path_for(&state.log_dir, &state.started_at, state.index)
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        // 空文件不滚动，避免单条超大日志无限创建新文件
        if state.written > 0 && state.written + buf.len() as u64 > state.max_file_size {
            state.roll()?;
        }
        let n = state.file.write(buf)?;
        state.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.state.lock().file.flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则日志写入线程会终止
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别；文件输出初始化失败时退回仅控制台
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_ansi(true);

    let file_writer = if config.enabled {
        match open_file_writer(config) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!(
                    "初始化日志文件失败: {:?}, 错误: {}，仅输出到控制台",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let (file_layer, file_guard) = match file_writer {
        Some(writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(writer);
            let layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    let persisted = file_guard.is_some();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if persisted {
        info!(
            "日志系统初始化完成: 目录={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
            config.log_dir,
            config.retention_days,
            config.level,
            config.max_file_size as f64 / 1024.0 / 1024.0
        );
        let removed = cleanup_old_logs(&config.log_dir, config.retention_days, Local::now().date_naive());
        if removed > 0 {
            info!("已清理 {} 个过期日志文件", removed);
        }
    } else {
        info!("日志系统初始化完成（仅控制台输出）");
    }

    LogGuard {
        _file_guard: file_guard,
    }
}

fn open_file_writer(config: &LogConfig) -> io::Result<RotatingFileWriter> {
    fs::create_dir_all(&config.log_dir)?;
    RotatingFileWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 日期优先取自文件名，取不到时使用修改时间
pub fn cleanup_old_logs(log_dir: &Path, retention_days: u32, today: NaiveDate) -> usize {
    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|s| s.to_str()) {
            Some(name) if path.is_file() => name,
            _ => continue,
        };
        if !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(".log") {
            continue;
        }

        let file_date = date_from_file_name(name).or_else(|| {
            entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .map(|t| chrono::DateTime::<Local>::from(t).date_naive())
        });
        let expired = match file_date {
            Some(date) => (today - date).num_days() > retention_days as i64,
            None => false,
        };

        if expired {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!("已删除过期日志文件: {:?}", path);
                }
                Err(e) => tracing::warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
            }
        }
    }
    removed
}

/// `file-cache.2024-05-01-083000_2.log` -> 2024-05-01
fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    let date = stem.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_log_config() {
        let config = LogConfig::default();
        assert!(config.enabled);
        assert_eq!(config.log_dir, PathBuf::from("logs"));
        assert_eq!(config.retention_days, 7);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_date_from_file_name() {
        assert_eq!(
            date_from_file_name("file-cache.2024-05-01-083000.log"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(
            date_from_file_name("file-cache.2024-05-01-083000_3.log"),
            NaiveDate::from_ymd_opt(2024, 5, 1)
        );
        assert_eq!(date_from_file_name("file-cache.garbage.log"), None);
        assert_eq!(date_from_file_name("other.2024-05-01.log"), None);
    }

    #[test]
    fn test_rotation_by_size() {
        let temp_dir = TempDir::new().unwrap();
        let mut writer = RotatingFileWriter::new(temp_dir.path(), 16).unwrap();
        let first = writer.current_path();

        writer.write_all(b"0123456789").unwrap();
        writer.write_all(b"0123456789").unwrap();
        writer.flush().unwrap();

        let second = writer.current_path();
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.log"));
        assert_eq!(fs::read(&first).unwrap().len(), 10);
        assert_eq!(fs::read(&second).unwrap().len(), 10);
    }

    #[test]
    fn test_cleanup_old_logs() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();
        fs::write(dir.join("file-cache.2024-01-01-000000.log"), b"old").unwrap();
        fs::write(dir.join("file-cache.2024-01-09-000000_1.log"), b"recent").unwrap();
        fs::write(dir.join("unrelated.2024-01-01.log"), b"keep").unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert_eq!(cleanup_old_logs(dir, 7, today), 1);
        assert!(!dir.join("file-cache.2024-01-01-000000.log").exists());
        assert!(dir.join("file-cache.2024-01-09-000000_1.log").exists());
        assert!(dir.join("unrelated.2024-01-01.log").exists());
    }
}
