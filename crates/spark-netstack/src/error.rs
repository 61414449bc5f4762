//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为桥接层对外暴露的错误语义提供集中定义，覆盖协议关闭、原生栈故障、资源枯竭与配置错误；
//! - 背压（发送缓冲已满）不属于错误，只在写路径内部以“零进度重试”表达，永远不会穿出组件边界。
//!
//! ## 设计要求（What）
//! - 错误需要 `Clone + Eq`：`TcpConnection::close` 的一次性执行路径要把同一个结果交给所有并发调用者；
//! - 不变量破坏（同一个连接键被重复注册）不进入本枚举，而是直接 panic。

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// 桥接层统一的 `Result` 别名。
pub type Result<T, E = NetstackError> = std::result::Result<T, E>;

/// 描述一次原生栈原语调用对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeOp {
    pub code: &'static str,
    pub message: &'static str,
}

pub const SEND_ENQUEUE: NativeOp = NativeOp {
    code: "spark.netstack.native.send_enqueue_failed",
    message: "native send enqueue",
};
pub const SHUTDOWN: NativeOp = NativeOp {
    code: "spark.netstack.native.shutdown_failed",
    message: "native shutdown",
};
pub const CLOSE: NativeOp = NativeOp {
    code: "spark.netstack.native.close_failed",
    message: "native close",
};
pub const UDP_SEND: NativeOp = NativeOp {
    code: "spark.netstack.native.udp_send_failed",
    message: "native udp send",
};
pub const CONNECTION_ERROR: NativeOp = NativeOp {
    code: "spark.netstack.native.connection_error",
    message: "native connection error",
};

/// 错误所属的处置类别。
///
/// - **意图 (Why)**：调用方据此决定是按流结束处理、立即拆除，还是在建连阶段回绝；
/// - **契约 (What)**：背压不出现在这里，它在写路径内部被吸收。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 对端或本端半关闭，表现为受影响方向上的流结束。
    ProtocolClose,
    /// 原生栈报错或连接被中止，连接必然已被拆除。
    NativeFailure,
    /// 连接数上限，仅在建连时出现。
    ResourceExhausted,
    /// 调用方违反了协议约定，例如确认超过交付量。
    InvariantViolation,
    /// 上层 Handler 在建连阶段拒绝了连接。
    Rejected,
    /// 配置装载或校验失败。
    Configuration,
}

/// 桥接层错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：聚合连接生命周期、原生栈交互与配置装载的全部失败路径；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，可安全跨线程传播；
///   通过 [`From<NetstackError>`](From) 转换为 [`io::Error`]，使连接可以实现 `std::io::Write`；
/// - **设计权衡 (Trade-offs)**：`Handler`/`Config` 使用 `String` 保存上下文，牺牲少量堆分配换取可读性。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NetstackError {
    /// 连接方向已关闭，读写应视为流结束。
    #[error("connection closed")]
    Closed,

    /// 连接尚未完成 accept 流程。
    #[error("connection not yet established")]
    NotConnected,

    /// 原生栈报告错误或连接被中止，原生句柄已失效。
    #[error("connection aborted")]
    Aborted,

    /// 建连时达到连接数上限。
    #[error("connection limit of {limit} reached")]
    ConnectionLimit { limit: usize },

    /// 原生原语返回了致命错误码。
    #[error("{}: native error code {code}", .op.message)]
    Native { op: NativeOp, code: i32 },

    /// 消费者报告的消费量超过本次交付量。
    #[error("consumer reported {consumed} bytes consumed but only {delivered} were delivered")]
    OverAcknowledged { consumed: usize, delivered: usize },

    /// 原生栈无法转换目标地址。
    #[error("native stack failed to translate address {addr}")]
    AddressTranslation { addr: IpAddr },

    /// 上层 Handler 拒绝了新连接或新会话。
    #[error("handler rejected connection: {reason}")]
    Handler { reason: String },

    /// 配置装载或校验失败。
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl NetstackError {
    /// 为 Handler 拒绝构造错误，减少调用点的 `String` 样板代码。
    pub fn handler(reason: impl Into<String>) -> Self {
        NetstackError::Handler {
            reason: reason.into(),
        }
    }

    /// 为配置错误构造错误。
    pub fn config(reason: impl Into<String>) -> Self {
        NetstackError::Config {
            reason: reason.into(),
        }
    }

    /// 返回错误在分类法中的归属。
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetstackError::Closed | NetstackError::NotConnected => ErrorCategory::ProtocolClose,
            NetstackError::Aborted
            | NetstackError::Native { .. }
            | NetstackError::AddressTranslation { .. } => ErrorCategory::NativeFailure,
            NetstackError::ConnectionLimit { .. } => ErrorCategory::ResourceExhausted,
            NetstackError::Handler { .. } => ErrorCategory::Rejected,
            NetstackError::OverAcknowledged { .. } => ErrorCategory::InvariantViolation,
            NetstackError::Config { .. } => ErrorCategory::Configuration,
        }
    }

    /// 返回稳定错误码，便于日志与告警聚合。
    pub fn code(&self) -> &'static str {
        match self {
            NetstackError::Closed => "spark.netstack.closed",
            NetstackError::NotConnected => "spark.netstack.not_connected",
            NetstackError::Aborted => "spark.netstack.aborted",
            NetstackError::ConnectionLimit { .. } => "spark.netstack.connection_limit",
            NetstackError::Native { op, .. } => op.code,
            NetstackError::OverAcknowledged { .. } => "spark.netstack.over_acknowledged",
            NetstackError::AddressTranslation { .. } => "spark.netstack.address_translation",
            NetstackError::Handler { .. } => "spark.netstack.handler_rejected",
            NetstackError::Config { .. } => "spark.netstack.config_invalid",
        }
    }
}

impl From<NetstackError> for io::Error {
    fn from(value: NetstackError) -> Self {
        let kind = match &value {
            NetstackError::Closed => io::ErrorKind::BrokenPipe,
            NetstackError::NotConnected => io::ErrorKind::NotConnected,
            NetstackError::Aborted => io::ErrorKind::ConnectionAborted,
            NetstackError::ConnectionLimit { .. } => io::ErrorKind::OutOfMemory,
            NetstackError::OverAcknowledged { .. } => io::ErrorKind::InvalidData,
            NetstackError::Config { .. } => io::ErrorKind::InvalidInput,
            NetstackError::Native { .. }
            | NetstackError::AddressTranslation { .. }
            | NetstackError::Handler { .. } => io::ErrorKind::Other,
        };
        io::Error::new(kind, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_taxonomy() {
        assert_eq!(NetstackError::Closed.category(), ErrorCategory::ProtocolClose);
        assert_eq!(NetstackError::Aborted.category(), ErrorCategory::NativeFailure);
        assert_eq!(
            NetstackError::ConnectionLimit { limit: 1 }.category(),
            ErrorCategory::ResourceExhausted
        );
        assert_eq!(
            NetstackError::OverAcknowledged {
                consumed: 2,
                delivered: 1
            }
            .category(),
            ErrorCategory::InvariantViolation
        );
    }

    #[test]
    fn io_conversion_keeps_kind_and_message() {
        let err: io::Error = NetstackError::Closed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(err.to_string(), "connection closed");

        let native: io::Error = NetstackError::Native {
            op: SEND_ENQUEUE,
            code: -6,
        }
        .into();
        assert_eq!(native.kind(), io::ErrorKind::Other);
        assert_eq!(native.to_string(), "native send enqueue: native error code -6");
    }
}
