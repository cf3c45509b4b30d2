//! 清单文件操作
//!
//! 每个缓存键一个 `.meta` 文件，写入时先写 `.meta.tmp` 再原子重命名，
//! 写入中断只会留下孤立的临时文件，不会破坏其他键的记录
//!
//! ## 目录结构
//!
//! ```text
//! {root}/
//! └── {namespace}/
//!     ├── {storage_id}.meta   # 清单（JSON）
//!     └── {storage_id}.png    # 数据文件
//! ```

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::types::ManifestRecord;

/// 清单文件扩展名
pub const MANIFEST_EXTENSION: &str = "meta";

/// 临时清单文件扩展名
pub const MANIFEST_TMP_EXTENSION: &str = "meta.tmp";

/// 获取清单文件路径：`{dir}/{storage_id}.meta`
pub fn manifest_path(dir: &Path, storage_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", storage_id, MANIFEST_EXTENSION))
}

/// 检查清单是否存在
pub fn manifest_exists(dir: &Path, storage_id: &str) -> bool {
    manifest_path(dir, storage_id).exists()
}

fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        debug!("已创建目录: {:?}", dir);
    }
    Ok(())
}

/// 保存清单（写临时文件后原子重命名）
pub fn save_manifest(path: &Path, record: &ManifestRecord) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        ensure_dir(dir)?;
    }

    let temp_path = path.with_extension(MANIFEST_TMP_EXTENSION);

    let file = File::create(&temp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, record).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize manifest: {}", e),
        )
    })?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    drop(writer);

    fs::rename(&temp_path, path)?;

    debug!(
        "已保存清单: {:?} ({}:{} status={:?})",
        path, record.manager, record.uri, record.status
    );
    Ok(())
}

/// 加载清单
///
/// 文件不存在或解析失败时返回 None（解析失败会记录警告）
pub fn load_manifest(path: &Path) -> Option<ManifestRecord> {
    if !path.exists() {
        return None;
    }

    match read_manifest(path) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!("加载清单失败 {:?}: {}", path, e);
            None
        }
    }
}

fn read_manifest(path: &Path) -> io::Result<ManifestRecord> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse manifest: {}", e),
        )
    })
}

/// 删除清单，返回是否确实删除了文件
pub fn delete_manifest(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("已删除清单: {:?}", path);
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// 扫描命名空间目录下的全部清单
///
/// 跳过临时文件与无法解析的文件
pub fn scan_manifests(dir: &Path) -> io::Result<Vec<ManifestRecord>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    let mut skipped = 0;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
            continue;
        }
        match read_manifest(&path) {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!("跳过无效清单文件 {:?}: {}", path, e);
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!("扫描清单完成，跳过 {} 个无效文件", skipped);
    }
    debug!("扫描到 {} 个清单: {:?}", records.len(), dir);

    Ok(records)
}
