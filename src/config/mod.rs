// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

use crate::cache::{ControllerSettings, FetcherSettings, ManagerSettings};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 缓存配置
    #[serde(default)]
    pub cache: CacheConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    // 容器内需要监听全部网卡才能从宿主机访问
    if running_in_container() {
        "0.0.0.0".to_string()
    } else {
        "127.0.0.1".to_string()
    }
}

fn default_port() -> u16 {
    18890
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: default_cors_origins(),
        }
    }
}

/// 缓存配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存根目录
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// 两个数据块之间允许的最长等待（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// 建立连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 请求使用的 User-Agent
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// 下载中清单写盘间隔（毫秒）
    #[serde(default = "default_persist_interval_ms")]
    pub persist_interval_ms: u64,
    /// 订阅的默认 ready 延迟（毫秒，0 表示立即可用）
    #[serde(default)]
    pub default_ready_delay_ms: u64,
    /// 最后一个观察者离开时是否暂停下载
    #[serde(default)]
    pub abort_on_last_detach: bool,
}

fn default_root_dir() -> PathBuf {
    if running_in_container() {
        PathBuf::from("/app/cache")
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("cache")
    }
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("file-cache-rust/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_persist_interval_ms() -> u64 {
    crate::events::DEFAULT_THROTTLE_INTERVAL_MS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            user_agent: default_user_agent(),
            persist_interval_ms: default_persist_interval_ms(),
            default_ready_delay_ms: 0,
            abort_on_last_detach: false,
        }
    }
}

impl CacheConfig {
    /// 使用指定根目录、其余保持默认
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Self::default()
        }
    }

    pub fn fetcher_settings(&self) -> FetcherSettings {
        FetcherSettings {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            persist_interval: Duration::from_millis(self.persist_interval_ms),
            idle_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        }
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            default_ready_delay: Duration::from_millis(self.default_ready_delay_ms),
            abort_on_last_detach: self.abort_on_last_detach,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            anyhow::bail!("缓存根目录不能为空");
        }
        if self.user_agent.trim().is_empty() {
            anyhow::bail!("user_agent 不能为空");
        }
        Ok(())
    }
}

/// 检测是否运行在容器中
///
/// 1. 检查 /.dockerenv 文件是否存在
/// 2. 检查 /proc/1/cgroup 文件内容
/// 3. 检查环境变量 container
pub fn running_in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    if let Ok(content) = std::fs::read_to_string("/proc/1/cgroup") {
        if content.contains("docker") || content.contains("containerd") {
            return true;
        }
    }
    std::env::var("container").is_ok()
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .cache
            .validate()
            .context("配置文件中的缓存配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.cache
            .validate()
            .context("保存配置失败：缓存配置无效")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {:#}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{NamedTempFile, TempDir};

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 18890);
        assert_eq!(config.cache.persist_interval_ms, 500);
        assert_eq!(config.cache.default_ready_delay_ms, 0);
        assert!(!config.cache.abort_on_last_detach);
        assert!(config.log.enabled);
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.cache.default_ready_delay_ms = 250;
        config.cache.abort_on_last_detach = true;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, config.server.port);
        assert_eq!(loaded.cache.root_dir, config.cache.root_dir);
        assert_eq!(loaded.cache.default_ready_delay_ms, 250);
        assert!(loaded.cache.abort_on_last_detach);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        std::fs::write(
            temp_file.path(),
            "[cache]\nroot_dir = \"/tmp/cache-test\"\npersist_interval_ms = 100\n",
        )
        .unwrap();

        let loaded = AppConfig::load_from_file(temp_file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(loaded.cache.root_dir, PathBuf::from("/tmp/cache-test"));
        assert_eq!(loaded.cache.persist_interval_ms, 100);
        assert_eq!(loaded.cache.request_timeout_secs, 30);
        assert_eq!(loaded.server.port, 18890);
        assert_eq!(loaded.log.level, "info");
    }

    #[tokio::test]
    async fn test_load_or_default_creates_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.server.port, 18890);
        assert!(Path::new(path).exists());
    }

    #[test]
    fn test_settings_conversion() {
        let config = CacheConfig {
            persist_interval_ms: 250,
            request_timeout_secs: 0,
            default_ready_delay_ms: 100,
            abort_on_last_detach: true,
            ..CacheConfig::with_root("/tmp/c")
        };
        assert_eq!(
            config.controller_settings().persist_interval,
            Duration::from_millis(250)
        );
        assert_eq!(config.controller_settings().idle_timeout, Duration::from_secs(1));
        assert_eq!(
            config.manager_settings().default_ready_delay,
            Duration::from_millis(100)
        );
        assert!(config.manager_settings().abort_on_last_detach);
    }

    #[test]
    fn test_validate_rejects_empty_user_agent() {
        let config = CacheConfig {
            user_agent: "  ".to_string(),
            ..CacheConfig::with_root("/tmp/c")
        };
        assert!(config.validate().is_err());
    }
}
