use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use super::{FlowKey, UdpHandler, UdpTracker};
use crate::error::{self, NetstackError, Result};
use crate::native::{StackLock, UdpHandle};

/// 一条 UDP 流的轻量收发外壳。
///
/// # 教案式注释
/// - **意图 (Why)**：UDP 没有握手，流的存活完全由缓存决定；外壳只保存发送所需的上下文；
/// - **契约 (What)**：
///   - `send_to` 经地址缓存解析目的地址后交给原生栈，并刷新流的活跃时间；
///   - `close` 与淘汰都只生效一次，`UdpHandler::on_close` 恰好调用一次；
/// - **风险 (Trade-offs)**：关闭后仍可能收到已在途的数据报，Handler 需自行忽略。
pub struct UdpConnection {
    flow: FlowKey,
    handle: UdpHandle,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: AtomicBool,
    handler: Arc<dyn UdpHandler>,
    tracker: Weak<UdpTracker>,
    stack: Arc<StackLock>,
    bytes_sent: AtomicU64,
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpConnection")
            .field("flow", &self.flow)
            .field("handle", &self.handle)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl UdpConnection {
    pub(crate) fn new(
        flow: FlowKey,
        handle: UdpHandle,
        remote_addr: SocketAddr,
        handler: Arc<dyn UdpHandler>,
        tracker: Weak<UdpTracker>,
        stack: Arc<StackLock>,
    ) -> Self {
        Self {
            flow,
            handle,
            local_addr: flow.source(),
            remote_addr,
            closed: AtomicBool::new(false),
            handler,
            tracker,
            stack,
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn flow(&self) -> FlowKey {
        self.flow
    }

    /// 流的源地址，即协议栈内侧的应用端地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 触发建流的第一个数据报的目的地址。
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// 以 `dst` 为来源地址向流的源端回送数据报。
    pub fn send_to(&self, payload: &[u8], dst: SocketAddr) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        if self.is_closed() {
            return Err(NetstackError::Closed);
        }
        let tracker = self.tracker.upgrade().ok_or(NetstackError::Closed)?;
        {
            let mut stack = self.stack.lock();
            let native = tracker.addrs.resolve(&mut stack, dst.ip())?;
            stack
                .udp_send(self.handle, self.local_addr, native, dst.port(), payload)
                .map_err(|code| NetstackError::Native {
                    op: error::UDP_SEND,
                    code,
                })?;
        }
        tracker.flows.touch(&self.flow);
        self.bytes_sent
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        trace!(flow = %self.flow, %dst, len = payload.len(), "udp datagram sent");
        Ok(payload.len())
    }

    /// 显式关闭流：从流表移除并通知 Handler；幂等。
    pub fn close(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.forget(self);
        }
        self.release();
    }

    /// 标记关闭并通知 Handler，淘汰回调与显式关闭共用。
    pub(crate) fn release(self: &Arc<Self>) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(flow = %self.flow, "udp flow closed");
            self.handler.on_close(self);
        }
    }
}
