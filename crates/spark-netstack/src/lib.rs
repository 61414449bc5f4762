#![deny(unsafe_code)]
#![doc = "spark-netstack: 单线程原生 TCP/IP 协议栈与多线程消费者之间的桥接层。"]
#![doc = ""]
#![doc = "== 职责划分 =="]
#![doc = "原生栈负责报文处理；本 crate 负责连接身份、TCP 状态机与背压、UDP 流归并、资源缓存与全局串行锁。"]
#![doc = "驱动在原生回调中取得 [`StackGuard`] 后调用 [`Netstack`] 的事件入口；消费者线程通过 [`TcpConnection`] 与 [`UdpConnection`] 阻塞读写。"]
#![doc = ""]
#![doc = "== 锁顺序 =="]
#![doc = "全局串行锁 → 连接状态锁 → 写就绪信号锁。Handler 与 Patch 回调在持有全局锁时执行，回调内不得同步调用连接的阻塞操作。"]

pub mod buffer;
pub mod cache;
pub mod clock;
pub mod config;
mod deferred;
pub mod error;
pub mod native;
mod netstack;
pub mod pipe;
pub mod registry;
pub mod stats;
mod sweeper;
mod sync;
pub mod tcp;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod udp;

pub use buffer::ReceiveView;
pub use cache::{EvictReason, ResourceCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NetstackConfig, TcpOverflowPolicy};
pub use error::{ErrorCategory, NetstackError, Result};
pub use native::{
    NativeAddr, NativeStack, SendOutcome, ShutdownDirection, StackGuard, StackLock, TcpHandle,
    UdpHandle,
};
pub use netstack::{Netstack, NetstackBuilder};
pub use registry::{ConnKey, IdentityRegistry};
pub use stats::{NetstackStats, SweepReport};
pub use sync::OnceGuard;
pub use tcp::{EventVerdict, TcpConnection, TcpCounters, TcpHandler, TcpPatch, TcpState, WriteReadiness};
pub use udp::{FlowKey, UdpConnection, UdpHandler};
