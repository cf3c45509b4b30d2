// File Cache Rust Library
// 渐进式、可续传的远端文件缓存

// 缓存核心（条目状态机、下载控制、订阅）
pub mod cache;

// 配置管理模块
pub mod config;

// 观察者通知
pub mod events;

// 日志系统
pub mod logging;

// 清单持久化与启动恢复
pub mod persistence;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use cache::{
    CacheError, CacheHandle, CacheKey, CacheStatus, EntrySnapshot, FileCacheManager,
    SubscribeOptions, Subscription,
};
pub use config::AppConfig;
pub use server::AppState;
