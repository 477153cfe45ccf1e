//! 日志初始化：`RUST_LOG` 优先，未设置时使用本服务的默认级别。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_DIRECTIVES: &str = concat!(env!("CARGO_CRATE_NAME"), "=info,tower_http=info,warn");

/// 初始化 tracing 订阅器，只在启动时调用一次。
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
