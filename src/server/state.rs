// 应用状态

use crate::cache::FileCacheManager;
use crate::config::AppConfig;
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 缓存管理器
    pub cache: FileCacheManager,
    /// 应用配置（只读）
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// 根据配置创建缓存管理器（使用 HTTP 拉取实现）
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let cache = FileCacheManager::new(&config.cache).context("创建缓存管理器失败")?;
        Ok(Self::with_cache(cache, config))
    }

    pub fn with_cache(cache: FileCacheManager, config: AppConfig) -> Self {
        Self {
            cache,
            config: Arc::new(config),
        }
    }

    /// 优雅关闭：暂停所有进行中的下载
    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}
