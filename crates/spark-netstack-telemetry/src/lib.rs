#![deny(unsafe_code)]
#![doc = "spark-netstack-telemetry: 为桥接层进程安装全局 tracing 订阅器。"]
#![doc = ""]
#![doc = "桥接层只通过 `tracing` 宏输出结构化事件，是否输出、输出到哪里由宿主进程决定。"]
#![doc = "本 crate 提供最常见的组合：`EnvFilter`（默认 `info`，可由 `RUST_LOG` 覆盖）加 fmt 层。"]

use std::sync::OnceLock;

use tracing::dispatcher;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// 安装完成标记，保证 `install` 只生效一次。
static INSTALLED: OnceLock<()> = OnceLock::new();

/// 安装阶段的失败路径。
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `install` 被重复调用。
    #[error("telemetry already installed")]
    AlreadyInstalled,
    /// 外部提前设置了全局 `tracing` 订阅器。
    #[error("a global tracing subscriber is already set")]
    SubscriberAlreadySet,
    /// 过滤指令无法解析。
    #[error("invalid filter directives: {0}")]
    InvalidFilter(String),
    /// 设置全局订阅器失败的底层错误。
    #[error("failed to set global subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::dispatcher::SetGlobalDefaultError),
}

/// 以 `RUST_LOG`（缺省 `info`）安装全局订阅器。
///
/// # 教案式说明
/// - **意图（Why）**：宿主进程启动时一行代码获得桥接层的结构化日志；
/// - **契约（What）**：重复调用返回 [`Error::AlreadyInstalled`]；
///   调用前外部已设置订阅器时返回 [`Error::SubscriberAlreadySet`]。
pub fn install() -> Result<(), Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_filter(filter)
}

/// 以显式过滤指令安装，忽略 `RUST_LOG`。
pub fn install_with_directives(directives: &str) -> Result<(), Error> {
    let filter =
        EnvFilter::try_new(directives).map_err(|err| Error::InvalidFilter(err.to_string()))?;
    install_filter(filter)
}

/// 是否已由本 crate 完成安装。
pub fn is_installed() -> bool {
    INSTALLED.get().is_some()
}

fn install_filter(filter: EnvFilter) -> Result<(), Error> {
    if is_installed() {
        return Err(Error::AlreadyInstalled);
    }
    if dispatcher::has_been_set() {
        return Err(Error::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_thread_names(true));
    tracing::subscriber::set_global_default(subscriber)?;
    INSTALLED.set(()).map_err(|_| Error::AlreadyInstalled)
}
