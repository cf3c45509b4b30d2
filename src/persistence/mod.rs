//! 缓存持久化模块
//!
//! 该模块负责缓存条目的落盘和恢复，包括：
//! - 清单文件：每个缓存键一个 JSON 记录
//! - 启动恢复：清理残留临时文件，校验数据文件与记录是否一致
//!
//! ## 设计原则
//!
//! 1. **原子写入**: 先写 `.meta.tmp` 再重命名，写入中断不会留下半个清单
//! 2. **容错性**: 无法解析的清单被跳过并视为不存在
//! 3. **以磁盘为准**: 数据文件比记录短时截断记录，已完成条目文件缺失时重置
//!
//! ## 文件结构
//!
//! ```text
//! {root}/
//! └── {namespace}/
//!     ├── {storage_id}.meta    # 清单（JSON 格式）
//!     └── {storage_id}.{ext}   # 数据文件
//! ```

pub mod manifest;
pub mod recovery;
pub mod types;

pub use manifest::{
    delete_manifest, load_manifest, manifest_exists, manifest_path, save_manifest,
    scan_manifests, MANIFEST_EXTENSION, MANIFEST_TMP_EXTENSION,
};
pub use recovery::{
    cleanup_temp_manifests, reconcile_record, scan_cache_root, ReconcileOutcome, RecoveryReport,
};
pub use types::{ManifestRecord, PersistedStatus};
