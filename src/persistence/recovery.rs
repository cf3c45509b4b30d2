//! 启动恢复
//!
//! - 清理写入中断遗留的 `.meta.tmp`
//! - 校验清单与磁盘上数据文件是否一致，不一致时修正记录

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::manifest::{scan_manifests, MANIFEST_TMP_EXTENSION};
use super::types::{ManifestRecord, PersistedStatus};
use crate::cache::compute_progress;

/// 单条记录的校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 与磁盘一致
    Intact,
    /// 已接收字节数被截断到文件实际长度
    Clamped { from: u64, to: u64 },
    /// 数据不可用，重置为全新 Pending
    Reset,
}

/// 校验记录与数据文件
///
/// - Complete：文件必须存在且长度等于总大小，否则重置
/// - 其他：文件比记录短时按文件长度截断
pub fn reconcile_record(record: &mut ManifestRecord) -> ReconcileOutcome {
    let file_len = record
        .path
        .as_deref()
        .and_then(|p| fs::metadata(p).ok())
        .filter(|m| m.is_file())
        .map(|m| m.len());

    match record.status {
        PersistedStatus::Complete => match (file_len, record.total_bytes) {
            (Some(len), Some(total)) if len == total => ReconcileOutcome::Intact,
            _ => {
                warn!(
                    "已完成条目的数据文件缺失或长度不符，重置: {}:{} (file={:?}, total={:?})",
                    record.manager, record.uri, file_len, record.total_bytes
                );
                reset_record(record);
                ReconcileOutcome::Reset
            }
        },
        _ => {
            let len = file_len.unwrap_or(0);
            if record.received_bytes > len {
                let from = record.received_bytes;
                record.received_bytes = len;
                record.progress = compute_progress(len, record.total_bytes);
                debug!(
                    "截断已接收字节: {}:{} {} -> {}",
                    record.manager, record.uri, from, len
                );
                ReconcileOutcome::Clamped { from, to: len }
            } else {
                ReconcileOutcome::Intact
            }
        }
    }
}

fn reset_record(record: &mut ManifestRecord) {
    record.status = PersistedStatus::Pending;
    record.progress = 0;
    record.path = None;
    record.total_bytes = None;
    record.received_bytes = 0;
    record.validator = None;
    record.error = None;
}

/// 清理缓存根目录下遗留的临时清单文件
pub fn cleanup_temp_manifests(root: &Path) -> io::Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let suffix = format!(".{}", MANIFEST_TMP_EXTENSION);
    let mut removed = 0;

    for entry in WalkDir::new(root).min_depth(1).max_depth(2) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("遍历缓存目录失败: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let is_temp = entry
            .file_name()
            .to_str()
            .map(|name| name.ends_with(&suffix))
            .unwrap_or(false);
        if is_temp {
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    debug!("已删除临时清单: {:?}", entry.path());
                }
                Err(e) => warn!("删除临时清单失败 {:?}: {}", entry.path(), e),
            }
        }
    }

    Ok(removed)
}

/// 恢复扫描结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 命名空间数量
    pub namespaces: usize,
    /// 清单总数
    pub entries: usize,
    /// 已完成条目
    pub complete: usize,
    /// 可续传条目（Pause / Failed）
    pub resumable: usize,
    /// 清理的临时文件数
    pub removed_temp_files: usize,
}

/// 扫描整个缓存根目录
pub fn scan_cache_root(root: &Path) -> io::Result<RecoveryReport> {
    let mut report = RecoveryReport {
        removed_temp_files: cleanup_temp_manifests(root)?,
        ..Default::default()
    };

    if !root.exists() {
        return Ok(report);
    }

    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        report.namespaces += 1;
        for record in scan_manifests(&path)? {
            report.entries += 1;
            match record.status {
                PersistedStatus::Complete => report.complete += 1,
                PersistedStatus::Pause | PersistedStatus::Failed => report.resumable += 1,
                PersistedStatus::Pending => {}
            }
        }
    }

    info!(
        "缓存恢复扫描完成: 命名空间={}, 条目={}, 已完成={}, 可续传={}, 清理临时文件={}",
        report.namespaces,
        report.entries,
        report.complete,
        report.resumable,
        report.removed_temp_files
    );

    Ok(report)
}
