//! 日志初始化
//!
//! 库代码只通过 tracing 宏输出，由可执行程序调用 [`init`] 安装订阅者。

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// 安装 EnvFilter + fmt 订阅者，RUST_LOG 优先于 `default_filter`
pub fn init(default_filter: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
