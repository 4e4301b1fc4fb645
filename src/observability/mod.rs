//! 可观测性：tracing 订阅器初始化
//!
//! 默认级别 info，可通过 RUST_LOG 覆盖；工具审计记录以 `tool` 事件的 audit 字段输出。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局订阅器；重复调用时保留第一次的设置
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
