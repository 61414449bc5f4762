//! # netstack 模块说明
//!
//! ## 角色定位（Why）
//! - [`Netstack`] 是驱动层唯一需要面对的门面：它持有全局串行锁、TCP 连接集合、UDP 流表、
//!   延迟释放队列与后台清扫线程，并把原生回调翻译为连接级事件；
//! - 驱动在原生回调中先取得 [`StackGuard`]，再调用 `tcp_*`/`udp_input` 系列入口。
//!
//! ## 行为契约（What）
//! - 每个原生事件入口先在锁内执行延迟释放队列，再分发事件；
//! - 未注册的连接键按空操作处理并返回 [`EventVerdict::UnknownKey`]；
//! - 管理类方法（`set_*`、`apply_config`、`sweep_now`、`shutdown`）自行取得全局锁，
//!   调用方不得在持有 [`StackGuard`] 时调用它们；
//! - `shutdown` 幂等，`Drop` 时自动执行。
//!
//! ## 风险提示（Trade-offs）
//! - 未注册 Handler 时使用拒绝一切的缺省实现，新连接会被立即中止、数据报会被丢弃，
//!   以便只使用单一协议的部署无需提供空实现。

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::ReceiveView;
use crate::clock::{Clock, SystemClock};
use crate::config::{NetstackConfig, TcpOverflowPolicy};
use crate::deferred::DeferredQueue;
use crate::error::{NetstackError, Result};
use crate::native::{NativeStack, StackGuard, StackLock, TcpHandle, UdpHandle};
use crate::registry::ConnKey;
use crate::stats::{self, NetstackStats, SweepReport};
use crate::sweeper::Sweeper;
use crate::tcp::{EventVerdict, TcpConnection, TcpHandler, TcpPatch, TcpTable};
use crate::udp::{FlowKey, UdpConnection, UdpHandler, UdpLimits, UdpTracker};

/// 门面与清扫线程共享的状态。
pub(crate) struct Shared {
    stack: Arc<StackLock>,
    tcp: Arc<TcpTable>,
    udp: Arc<UdpTracker>,
    deferred: Arc<DeferredQueue>,
    config: Mutex<NetstackConfig>,
}

impl Shared {
    /// 执行一轮 TTL 清扫，并在全局锁下释放被淘汰的原生资源。
    pub(crate) fn sweep(&self) -> SweepReport {
        let expired_flows = self.udp.flows.sweep();
        let expired_addresses = self.udp.addrs.sweep();
        let reaped = {
            let mut stack = self.stack.lock();
            self.deferred.reap(&mut stack)
        };
        if expired_flows + expired_addresses + reaped > 0 {
            debug!(expired_flows, expired_addresses, reaped, "sweep released resources");
        }
        SweepReport {
            expired_flows,
            expired_addresses,
            reaped,
        }
    }

    fn reap(&self) -> usize {
        let mut stack = self.stack.lock();
        self.deferred.reap(&mut stack)
    }
}

/// 原生协议栈与多线程消费者之间的桥接层。
pub struct Netstack {
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
    stopped: AtomicBool,
}

impl fmt::Debug for Netstack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Netstack")
            .field("stats", &self.stats())
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

impl Netstack {
    /// 以原生栈实现开始构建。
    pub fn builder(stack: Box<dyn NativeStack>) -> NetstackBuilder {
        NetstackBuilder {
            stack,
            config: NetstackConfig::default(),
            clock: Arc::new(SystemClock),
            tcp_handler: None,
            udp_handler: None,
            background_sweeper: true,
        }
    }

    /// 取得全局串行锁，原生事件入口都需要它。
    pub fn lock(&self) -> StackGuard<'_> {
        self.shared.stack.lock()
    }

    fn enter(&self, stack: &mut StackGuard<'_>) {
        debug_assert!(
            stack.belongs_to(&self.shared.stack),
            "stack guard belongs to another netstack"
        );
        self.shared.deferred.reap(stack);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// 原生栈接受了一条新连接。
    ///
    /// 返回 `Err` 时原生连接已被中止，驱动应向原生栈报告“已中止”。
    pub fn tcp_accept(
        &self,
        stack: &mut StackGuard<'_>,
        handle: TcpHandle,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Arc<TcpConnection>> {
        self.enter(stack);
        if self.is_stopped() {
            stack.abort(handle);
            return Err(NetstackError::Closed);
        }
        self.shared.tcp.accept(stack, handle, local, remote)
    }

    /// 原生栈交付入站数据。
    pub fn tcp_recv(
        &self,
        stack: &mut StackGuard<'_>,
        key: ConnKey,
        data: &mut ReceiveView<'_>,
    ) -> Result<EventVerdict> {
        self.enter(stack);
        let Some(conn) = self.shared.tcp.lookup(key) else {
            trace!(%key, len = data.len(), "data for unknown connection ignored");
            return Ok(EventVerdict::UnknownKey);
        };
        conn.on_data(stack, data)
    }

    /// 对端关闭了写方向（原生栈交付了空数据）。
    pub fn tcp_local_closed(&self, stack: &mut StackGuard<'_>, key: ConnKey) -> EventVerdict {
        self.enter(stack);
        match self.shared.tcp.lookup(key) {
            Some(conn) => conn.on_local_closed(stack),
            None => EventVerdict::UnknownKey,
        }
    }

    /// 对端确认了 `count` 字节，发送缓冲腾出空间。
    pub fn tcp_sent(&self, stack: &mut StackGuard<'_>, key: ConnKey, count: usize) -> EventVerdict {
        self.enter(stack);
        match self.shared.tcp.lookup(key) {
            Some(conn) => {
                trace!(%key, count, "send buffer drained");
                conn.check_state(stack)
            }
            None => EventVerdict::UnknownKey,
        }
    }

    /// 原生栈的周期性空闲轮询。
    pub fn tcp_poll(&self, stack: &mut StackGuard<'_>, key: ConnKey) -> EventVerdict {
        self.enter(stack);
        match self.shared.tcp.lookup(key) {
            Some(conn) => conn.check_state(stack),
            None => EventVerdict::UnknownKey,
        }
    }

    /// 原生栈报告连接错误；此时原生句柄已被释放。
    pub fn tcp_error(&self, stack: &mut StackGuard<'_>, key: ConnKey, code: i32) -> EventVerdict {
        self.enter(stack);
        match self.shared.tcp.lookup(key) {
            Some(conn) => conn.on_error(stack, code),
            None => EventVerdict::UnknownKey,
        }
    }

    /// 原生栈收到一个 UDP 数据报。
    pub fn udp_input(
        &self,
        stack: &mut StackGuard<'_>,
        handle: UdpHandle,
        src: SocketAddr,
        dst: SocketAddr,
        data: &mut ReceiveView<'_>,
    ) -> Result<()> {
        self.enter(stack);
        if self.is_stopped() {
            return Err(NetstackError::Closed);
        }
        self.shared.udp.input(handle, src, dst, data)
    }

    pub fn lookup_tcp(&self, key: ConnKey) -> Option<Arc<TcpConnection>> {
        self.shared.tcp.lookup(key)
    }

    pub fn lookup_udp(&self, flow: FlowKey) -> Option<Arc<UdpConnection>> {
        self.shared.udp.lookup(flow)
    }

    /// 显式关闭 UDP 流，流不存在时返回 `false`。
    pub fn close_udp_flow(&self, flow: FlowKey) -> bool {
        self.shared.udp.close(flow)
    }

    /// 调整 TCP 连接上限；缩小时最久未活跃的连接被中止。零值被忽略。
    pub fn set_connection_limits(&self, max: usize) {
        let Some(limit) = std::num::NonZeroUsize::new(max) else {
            warn!("ignoring zero tcp connection limit");
            return;
        };
        self.shared.tcp.set_limit(limit);
        self.shared.config.lock().max_tcp_connections = max;
        let reaped = self.shared.reap();
        debug!(limit = max, reaped, "tcp connection limit updated");
    }

    pub fn set_tcp_overflow_policy(&self, policy: TcpOverflowPolicy) {
        self.shared.tcp.set_policy(policy);
        self.shared.config.lock().tcp_overflow = policy;
        debug!(?policy, "tcp overflow policy updated");
    }

    /// 调整 UDP 流空闲超时，对已有流立即生效。零值被忽略。
    pub fn set_idle_timeout(&self, timeout: Duration) {
        if timeout.is_zero() {
            warn!("ignoring zero udp idle timeout");
            return;
        }
        self.shared.udp.set_idle_timeout(timeout);
        self.shared.config.lock().udp_idle_timeout_secs = whole_secs(timeout);
        debug!(?timeout, "udp idle timeout updated");
    }

    /// 同时调整 UDP 流表与地址缓存容量，以及地址缓存 TTL。零值参数被忽略。
    pub fn set_udp_params(&self, max_flows: usize, address_ttl: Duration) {
        match std::num::NonZeroUsize::new(max_flows) {
            Some(limit) => {
                self.shared.udp.set_max_flows(limit);
                self.shared.udp.addrs.resize(limit);
                let mut config = self.shared.config.lock();
                config.max_udp_flows = max_flows;
                config.address_cache_capacity = max_flows;
            }
            None => warn!("ignoring zero udp flow limit"),
        }
        if address_ttl.is_zero() {
            warn!("ignoring zero address cache ttl");
        } else {
            self.shared.udp.addrs.set_ttl(address_ttl);
            self.shared.config.lock().address_cache_ttl_secs = whole_secs(address_ttl);
        }
        let reaped = self.shared.reap();
        debug!(max_flows, ?address_ttl, reaped, "udp parameters updated");
    }

    /// 整体应用一份配置；校验失败时不做任何修改。
    pub fn apply_config(&self, config: &NetstackConfig) -> Result<()> {
        config.validate()?;
        self.shared.tcp.set_limit(config.tcp_limit()?);
        self.shared.tcp.set_policy(config.tcp_overflow);
        self.shared.udp.set_max_flows(config.udp_limit()?);
        self.shared.udp.set_idle_timeout(config.udp_idle_timeout());
        self.shared.udp.addrs.resize(config.address_limit()?);
        self.shared.udp.addrs.set_ttl(config.address_cache_ttl());
        if let Some(sweeper) = self.sweeper.lock().as_ref() {
            sweeper.set_interval(config.sweep_interval());
        }
        *self.shared.config.lock() = config.clone();
        let reaped = self.shared.reap();
        debug!(reaped, "configuration applied");
        Ok(())
    }

    /// 当前生效的配置。
    pub fn config(&self) -> NetstackConfig {
        self.shared.config.lock().clone()
    }

    pub fn stats(&self) -> NetstackStats {
        let shared = &self.shared;
        NetstackStats {
            tcp_connections: shared.tcp.len(),
            tcp_limit: shared.tcp.limit(),
            udp_flows: shared.udp.len(),
            udp_flow_limit: shared.udp.limit(),
            cached_addresses: shared.udp.addrs.len(),
            address_cache_capacity: shared.udp.addrs.capacity(),
            deferred_pending: shared.deferred.len(),
        }
    }

    /// 把连接清单写入 `out`。
    pub fn write_connection_stats(&self, out: &mut impl fmt::Write) -> fmt::Result {
        stats::write_tcp_section(out, &self.shared.tcp.snapshot())?;
        stats::write_udp_section(out, &self.shared.udp.snapshot())
    }

    /// 连接清单文本。
    pub fn dump_connection_stats(&self) -> String {
        let mut out = String::new();
        // 写入 String 不会失败。
        let _ = self.write_connection_stats(&mut out);
        out
    }

    /// 立即执行一轮清扫，不等待后台周期。
    pub fn sweep_now(&self) -> SweepReport {
        self.shared.sweep()
    }

    /// 停止清扫线程并释放全部连接与缓存；幂等。
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
        let mut stack = self.shared.stack.lock();
        let aborted = self.shared.tcp.abort_all(&mut stack);
        let flows = self.shared.udp.flows.clear();
        let addresses = self.shared.udp.addrs.clear();
        let reaped = self.shared.deferred.reap(&mut stack);
        debug!(aborted, flows, addresses, reaped, "netstack shut down");
    }
}

impl Drop for Netstack {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// 向上取整到秒，避免亚秒级时长在配置快照中变成零。
fn whole_secs(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

/// [`Netstack`] 构建器。
pub struct NetstackBuilder {
    stack: Box<dyn NativeStack>,
    config: NetstackConfig,
    clock: Arc<dyn Clock>,
    tcp_handler: Option<Arc<dyn TcpHandler>>,
    udp_handler: Option<Arc<dyn UdpHandler>>,
    background_sweeper: bool,
}

impl fmt::Debug for NetstackBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetstackBuilder")
            .field("config", &self.config)
            .field("tcp_handler", &self.tcp_handler.is_some())
            .field("udp_handler", &self.udp_handler.is_some())
            .field("background_sweeper", &self.background_sweeper)
            .finish()
    }
}

impl NetstackBuilder {
    pub fn config(mut self, config: NetstackConfig) -> Self {
        self.config = config;
        self
    }

    /// 替换缓存使用的时钟，测试中配合 `ManualClock` 驱动 TTL。
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn tcp_handler(mut self, handler: Arc<dyn TcpHandler>) -> Self {
        self.tcp_handler = Some(handler);
        self
    }

    pub fn udp_handler(mut self, handler: Arc<dyn UdpHandler>) -> Self {
        self.udp_handler = Some(handler);
        self
    }

    /// 是否启动后台清扫线程，默认启动。关闭后需由调用方定期调用 `sweep_now`。
    pub fn background_sweeper(mut self, enabled: bool) -> Self {
        self.background_sweeper = enabled;
        self
    }

    pub fn build(self) -> Result<Netstack> {
        let config = self.config;
        config.validate()?;
        let stack = Arc::new(StackLock::new(self.stack));
        let deferred = Arc::new(DeferredQueue::new());
        let tcp_handler = self.tcp_handler.unwrap_or_else(|| {
            debug!("no tcp handler registered, incoming connections will be refused");
            Arc::new(RefuseTcp)
        });
        let udp_handler = self.udp_handler.unwrap_or_else(|| {
            debug!("no udp handler registered, incoming datagrams will be dropped");
            Arc::new(RefuseUdp)
        });
        let tcp = Arc::new(TcpTable::new(
            config.tcp_limit()?,
            config.tcp_overflow,
            Arc::clone(&self.clock),
            tcp_handler,
            Arc::clone(&stack),
            Arc::clone(&deferred),
        ));
        let udp = Arc::new(UdpTracker::new(
            UdpLimits {
                max_flows: config.udp_limit()?,
                idle_timeout: config.udp_idle_timeout(),
                address_capacity: config.address_limit()?,
                address_ttl: config.address_cache_ttl(),
            },
            self.clock,
            udp_handler,
            Arc::clone(&stack),
            Arc::clone(&deferred),
        ));
        let interval = config.sweep_interval();
        let shared = Arc::new(Shared {
            stack,
            tcp,
            udp,
            deferred,
            config: Mutex::new(config),
        });
        let sweeper = if self.background_sweeper {
            Some(Sweeper::spawn(Arc::downgrade(&shared), interval)?)
        } else {
            None
        };
        Ok(Netstack {
            shared,
            sweeper: Mutex::new(sweeper),
            stopped: AtomicBool::new(false),
        })
    }
}

struct RefuseTcp;

impl TcpHandler for RefuseTcp {
    fn on_connect(
        &self,
        _conn: &Arc<TcpConnection>,
        _remote: SocketAddr,
    ) -> Result<Box<dyn TcpPatch>> {
        Err(NetstackError::handler("no tcp handler registered"))
    }
}

struct RefuseUdp;

impl UdpHandler for RefuseUdp {
    fn on_connect(&self, _conn: &Arc<UdpConnection>, _remote: SocketAddr) -> Result<()> {
        Err(NetstackError::handler("no udp handler registered"))
    }

    fn on_receive(
        &self,
        _conn: &Arc<UdpConnection>,
        _data: &mut ReceiveView<'_>,
        _dst: SocketAddr,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{FakeStack, NativeCall, RecordingTcpHandler, RecordingUdpHandler};
    use std::net::{Ipv4Addr, SocketAddrV4};
    use tracing_test::traced_test;

    fn v4(last: u8, port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port))
    }

    fn build(fake: &FakeStack, config: NetstackConfig) -> Netstack {
        Netstack::builder(Box::new(fake.clone()))
            .config(config)
            .tcp_handler(Arc::new(RecordingTcpHandler::default()))
            .udp_handler(Arc::new(RecordingUdpHandler::default()))
            .background_sweeper(false)
            .build()
            .expect("构建 netstack")
    }

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let config = NetstackConfig {
            max_udp_flows: 0,
            ..NetstackConfig::default()
        };
        let err = Netstack::builder(Box::new(FakeStack::new()))
            .config(config)
            .background_sweeper(false)
            .build()
            .expect_err("零容量必须被拒绝");
        assert_eq!(err, NetstackError::config("max_udp_flows must be positive"));
    }

    #[test]
    fn missing_tcp_handler_refuses_connections() {
        let fake = FakeStack::new();
        let netstack = Netstack::builder(Box::new(fake.clone()))
            .background_sweeper(false)
            .build()
            .expect("构建 netstack");
        let mut stack = netstack.lock();
        let err = netstack
            .tcp_accept(&mut stack, TcpHandle(7), v4(1, 1000), v4(2, 80))
            .expect_err("缺省 Handler 拒绝连接");
        assert!(matches!(err, NetstackError::Handler { .. }));
        drop(stack);
        assert_eq!(
            fake.count(|call| matches!(call, NativeCall::Abort(TcpHandle(7)))),
            1
        );
        assert_eq!(netstack.stats().tcp_connections, 0);
    }

    #[test]
    fn unknown_key_is_a_no_op() {
        let fake = FakeStack::new();
        let netstack = build(&fake, NetstackConfig::default());
        let mut stack = netstack.lock();
        let key = ConnKey::from_raw(42);
        let mut view = ReceiveView::contiguous(b"late");
        assert_eq!(
            netstack.tcp_recv(&mut stack, key, &mut view),
            Ok(EventVerdict::UnknownKey)
        );
        assert_eq!(netstack.tcp_poll(&mut stack, key), EventVerdict::UnknownKey);
        assert_eq!(
            netstack.tcp_error(&mut stack, key, -1),
            EventVerdict::UnknownKey
        );
        drop(stack);
        assert!(fake.calls().is_empty());
    }

    #[test]
    #[traced_test]
    fn zero_reconfiguration_is_ignored() {
        let fake = FakeStack::new();
        let netstack = build(&fake, NetstackConfig::default());
        netstack.set_connection_limits(0);
        netstack.set_idle_timeout(Duration::ZERO);
        netstack.set_udp_params(0, Duration::ZERO);
        assert_eq!(netstack.config(), NetstackConfig::default());
        assert!(logs_contain("ignoring zero tcp connection limit"));
        assert!(logs_contain("ignoring zero udp idle timeout"));
    }

    #[test]
    fn set_udp_params_resizes_both_caches() {
        let fake = FakeStack::new();
        let netstack = build(&fake, NetstackConfig::default());
        netstack.set_udp_params(16, Duration::from_millis(1500));
        let stats = netstack.stats();
        assert_eq!(stats.udp_flow_limit, 16);
        assert_eq!(stats.address_cache_capacity, 16);
        assert_eq!(netstack.config().address_cache_ttl_secs, 2);
    }

    #[test]
    fn shrinking_tcp_limit_aborts_oldest() {
        let fake = FakeStack::new();
        let netstack = build(&fake, NetstackConfig::default());
        let conns: Vec<_> = {
            let mut stack = netstack.lock();
            (1..=3)
                .map(|id| {
                    netstack
                        .tcp_accept(&mut stack, TcpHandle(id), v4(1, 1000 + id as u16), v4(2, 80))
                        .expect("接入连接")
                })
                .collect()
        };
        netstack.set_connection_limits(2);
        assert!(conns[0].is_closed());
        assert!(!conns[1].is_closed());
        assert!(!conns[2].is_closed());
        assert_eq!(netstack.stats().tcp_connections, 2);
        assert_eq!(
            fake.count(|call| matches!(call, NativeCall::Abort(TcpHandle(1)))),
            1
        );
    }

    #[test]
    fn sweep_expires_idle_flows_with_manual_clock() {
        let fake = FakeStack::new();
        let clock = Arc::new(ManualClock::new());
        let udp = Arc::new(RecordingUdpHandler::default());
        let netstack = Netstack::builder(Box::new(fake.clone()))
            .clock(clock.clone())
            .udp_handler(udp.clone())
            .background_sweeper(false)
            .build()
            .expect("构建 netstack");
        {
            let mut stack = netstack.lock();
            let mut view = ReceiveView::contiguous(b"ping");
            netstack
                .udp_input(&mut stack, UdpHandle(1), v4(5, 5353), v4(8, 53), &mut view)
                .expect("建立流");
        }
        clock.advance(Duration::from_secs(61));
        let report = netstack.sweep_now();
        assert_eq!(report.expired_flows, 1);
        assert_eq!(netstack.stats().udp_flows, 0);
        assert_eq!(udp.closed(), vec![FlowKey::new(v4(5, 5353))]);
    }

    #[test]
    fn shutdown_releases_everything_once() {
        let fake = FakeStack::new();
        let udp = Arc::new(RecordingUdpHandler::default());
        let netstack = Netstack::builder(Box::new(fake.clone()))
            .tcp_handler(Arc::new(RecordingTcpHandler::default()))
            .udp_handler(udp.clone())
            .background_sweeper(true)
            .build()
            .expect("构建 netstack");
        let conn = {
            let mut stack = netstack.lock();
            let mut view = ReceiveView::contiguous(b"ping");
            netstack
                .udp_input(&mut stack, UdpHandle(1), v4(5, 5353), v4(8, 53), &mut view)
                .expect("建立流");
            netstack
                .tcp_accept(&mut stack, TcpHandle(1), v4(1, 1000), v4(2, 80))
                .expect("接入连接")
        };
        let flow = netstack.lookup_udp(FlowKey::new(v4(5, 5353))).expect("流存在");
        flow.send_to(b"pong", v4(8, 53)).expect("发送");
        assert_eq!(netstack.stats().cached_addresses, 1);

        netstack.shutdown();
        netstack.shutdown();
        assert!(conn.is_closed());
        assert_eq!(netstack.stats(), NetstackStats {
            tcp_limit: 1024,
            udp_flow_limit: 1024,
            address_cache_capacity: 1024,
            ..NetstackStats::default()
        });
        assert_eq!(udp.closed().len(), 1);
        assert_eq!(fake.count(|call| matches!(call, NativeCall::Abort(_))), 1);
        assert_eq!(fake.live_addrs(), 0);

        let mut stack = netstack.lock();
        assert_eq!(
            netstack.tcp_accept(&mut stack, TcpHandle(2), v4(1, 1001), v4(2, 80)).map(|_| ()),
            Err(NetstackError::Closed)
        );
    }
}
