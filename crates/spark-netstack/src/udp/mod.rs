//! # udp 模块说明
//!
//! ## 角色定位（Why）
//! - 把无连接的 UDP 数据报按源地址归并为“流”，为每条流提供轻量的收发外壳；
//! - 流没有握手，存活完全由缓存驱动：空闲超过 TTL 或因容量被淘汰即视为关闭。
//!
//! ## 行为契约（What）
//! - `demultiplex`：未命中时创建外壳、调用 `UdpHandler::on_connect` 并插入流表；
//!   命中时刷新活跃时间；
//! - `send`：见 [`UdpConnection::send_to`]，经由目的地址缓存解析后交给原生栈；
//! - `close`：从流表移除并立即释放，区别于后台淘汰。

mod addr;
mod conn;

use std::fmt;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};

pub use conn::UdpConnection;

use crate::buffer::ReceiveView;
use crate::cache::{EvictReason, ResourceCache};
use crate::clock::Clock;
use crate::deferred::DeferredQueue;
use crate::error::Result;
use crate::native::{StackLock, UdpHandle};

pub(crate) use addr::AddressCache;

/// UDP 流标识：数据报的源地址。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey(SocketAddr);

impl FlowKey {
    pub const fn new(source: SocketAddr) -> Self {
        Self(source)
    }

    pub const fn source(self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// UDP 流的接入、收包与关闭回调。
///
/// `on_connect` 与 `on_receive` 在原生事件线程上执行且全局串行锁已被持有，
/// 回调内不得同步调用 [`UdpConnection::send_to`]。
pub trait UdpHandler: Send + Sync {
    /// 新流建立；返回 `Err` 时流被关闭，触发建流的数据报被丢弃。
    fn on_connect(&self, conn: &Arc<UdpConnection>, remote: SocketAddr) -> Result<()>;

    /// 流收到数据报，`dst` 为数据报的目的地址。
    fn on_receive(
        &self,
        conn: &Arc<UdpConnection>,
        data: &mut ReceiveView<'_>,
        dst: SocketAddr,
    ) -> Result<()>;

    /// 流被显式关闭或淘汰，每条流恰好调用一次。
    fn on_close(&self, _conn: &Arc<UdpConnection>) {}
}

/// UDP 流表与目的地址缓存。
pub(crate) struct UdpTracker {
    pub(crate) flows: ResourceCache<FlowKey, Arc<UdpConnection>>,
    pub(crate) addrs: AddressCache,
    handler: Arc<dyn UdpHandler>,
    stack: Arc<StackLock>,
}

/// 构造 [`UdpTracker`] 所需的容量与超时参数。
pub(crate) struct UdpLimits {
    pub(crate) max_flows: NonZeroUsize,
    pub(crate) idle_timeout: Duration,
    pub(crate) address_capacity: NonZeroUsize,
    pub(crate) address_ttl: Duration,
}

impl UdpTracker {
    pub(crate) fn new(
        limits: UdpLimits,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn UdpHandler>,
        stack: Arc<StackLock>,
        deferred: Arc<DeferredQueue>,
    ) -> Self {
        let flows = ResourceCache::new(
            limits.max_flows,
            Some(limits.idle_timeout),
            Arc::clone(&clock),
            Box::new(|flow: FlowKey, conn: Arc<UdpConnection>, reason: EvictReason| {
                debug!(%flow, ?reason, "udp flow evicted");
                conn.release();
            }),
        );
        let addrs = AddressCache::new(
            limits.address_capacity,
            limits.address_ttl,
            clock,
            deferred,
        );
        Self {
            flows,
            addrs,
            handler,
            stack,
        }
    }

    /// 按源地址查找或创建流。
    pub(crate) fn demultiplex(
        self: &Arc<Self>,
        handle: UdpHandle,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<Arc<UdpConnection>> {
        let flow = FlowKey::new(src);
        if let Some(conn) = self.flows.get(&flow) {
            self.flows.touch(&flow);
            return Ok(conn);
        }
        let conn = Arc::new(UdpConnection::new(
            flow,
            handle,
            dst,
            Arc::clone(&self.handler),
            Arc::downgrade(self),
            Arc::clone(&self.stack),
        ));
        if let Err(err) = self.handler.on_connect(&conn, dst) {
            debug!(%flow, %err, "udp handler rejected flow");
            conn.release();
            return Err(err);
        }
        self.flows.insert(flow, Arc::clone(&conn));
        debug!(%flow, %dst, "udp flow created");
        Ok(conn)
    }

    /// 处理一个入站数据报。
    pub(crate) fn input(
        self: &Arc<Self>,
        handle: UdpHandle,
        src: SocketAddr,
        dst: SocketAddr,
        data: &mut ReceiveView<'_>,
    ) -> Result<()> {
        let conn = self.demultiplex(handle, src, dst)?;
        trace!(flow = %conn.flow(), len = data.len(), "udp datagram received");
        self.handler.on_receive(&conn, data, dst)
    }

    /// 显式关闭流。
    pub(crate) fn close(&self, flow: FlowKey) -> bool {
        match self.flows.remove(&flow) {
            Some(conn) => {
                conn.release();
                true
            }
            None => false,
        }
    }

    /// 仅当表中仍是同一个外壳时才移除，避免误删同源地址上新建的流。
    pub(crate) fn forget(&self, conn: &Arc<UdpConnection>) {
        self.flows
            .remove_if(&conn.flow(), |current| Arc::ptr_eq(current, conn));
    }

    pub(crate) fn lookup(&self, flow: FlowKey) -> Option<Arc<UdpConnection>> {
        self.flows.peek(&flow)
    }

    pub(crate) fn set_max_flows(&self, max: NonZeroUsize) {
        self.flows.resize(max);
    }

    pub(crate) fn set_idle_timeout(&self, timeout: Duration) {
        self.flows.set_ttl_all(Some(timeout));
    }

    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }

    pub(crate) fn limit(&self) -> usize {
        self.flows.capacity().get()
    }

    /// 按源地址排序的流快照。
    pub(crate) fn snapshot(&self) -> Vec<(FlowKey, Arc<UdpConnection>)> {
        let mut flows = self.flows.entries();
        flows.sort_by_key(|(flow, _)| *flow);
        flows
    }
}
