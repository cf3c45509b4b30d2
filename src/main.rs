use file_cache_rust::{
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging, server, AppState,
};
use tracing::{error, info, warn};

/// 配置文件路径：第一个命令行参数，缺省为 `config/app.toml`
fn config_path() -> String {
    std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// 加载日志配置
///
/// 日志系统需要先于完整配置初始化，失败时返回默认配置
async fn load_log_config(path: &str) -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(path).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }
    LogConfig::default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config_path();

    // 🔥 先加载日志配置并初始化日志系统（必须保持 _log_guard 存活）
    let log_config = load_log_config(&config_path).await;
    let _log_guard = logging::init_logging(&log_config);

    info!("File Cache Rust v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(&config_path).await;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let app_state = AppState::new(config)?;
    info!("缓存根目录: {:?}", app_state.cache.store().root());

    // 启动恢复：清理临时清单、修正不一致的记录
    match app_state.cache.recover() {
        Ok(report) => info!(
            "✓ 启动恢复完成: 命名空间 {} 个, 条目 {} 个 (已完成 {}, 可续传 {}), 清理临时文件 {} 个",
            report.namespaces,
            report.entries,
            report.complete,
            report.resumable,
            report.removed_temp_files
        ),
        Err(e) => warn!("⚠️ 启动恢复失败: {}", e),
    }

    let app = server::build_router(app_state.clone());

    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("WebSocket: ws://{}/api/v1/ws", addr);
    info!("健康检查: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // 🔥 使用 select! 监听关闭信号，支持优雅关闭
    let server = axum::serve(listener, app);

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始优雅关闭...");
        }
    }

    // 🔥 优雅关闭：暂停进行中的下载，确保进度写入清单
    info!("正在暂停进行中的下载...");
    app_state.shutdown().await;
    info!("应用已安全退出");

    Ok(())
}
