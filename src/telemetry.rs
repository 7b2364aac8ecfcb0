// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license

//! 日志初始化 (tracing + EnvFilter)

use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// 安装全局日志订阅者
///
/// `RUST_LOG` 优先, 否则使用传入的默认级别 (例如 `"info"` / `"petcam_rs=debug"`).
/// 重复调用时保留已安装的订阅者.
pub fn init(default_directive: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_thread_names(true))
        .try_init();
}
