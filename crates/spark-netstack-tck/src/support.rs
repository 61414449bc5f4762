//! TCK 共享的测试夹具。

use std::fmt::Write as _;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::panic;
use std::sync::Arc;

use spark_netstack::testing::{FakeStack, RecordingTcpHandler, RecordingUdpHandler};
use spark_netstack::{
    ConnKey, EventVerdict, ManualClock, Netstack, NetstackConfig, ReceiveView, Result,
    TcpConnection, TcpHandle, UdpHandle,
};

/// 附加“套件/用例”上下文后重新抛出 panic。
pub fn panic_with_context(suite: &str, case: &str, payload: Box<dyn std::any::Any + Send>) -> ! {
    let mut message = String::new();
    let _ = write!(&mut message, "[spark-netstack-tck::{suite}::{case}] 测试失败：");

    if let Some(text) = payload.downcast_ref::<&str>() {
        let _ = write!(&mut message, "{text}");
    } else if let Some(text) = payload.downcast_ref::<String>() {
        let _ = write!(&mut message, "{text}");
    } else {
        let _ = write!(&mut message, "<未知 panic 类型>");
    }

    panic::resume_unwind(Box::new(message));
}

pub fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(a, b, c, d), port))
}

/// 应用端（协议栈内侧）地址，端口随句柄变化。
pub fn client(handle: u64) -> SocketAddr {
    v4(10, 0, 0, 2, 40_000 + handle as u16)
}

/// 连接的目的地址。
pub fn server() -> SocketAddr {
    v4(93, 184, 216, 34, 80)
}

/// 一套可直接驱动的桥接层实例。
///
/// # 教案式说明
/// - **意图 (Why)**：每个用例都需要“桥接层 + 脚本化原生栈 + 记录型 Handler + 手动时钟”的组合；
/// - **契约 (What)**：后台清扫线程关闭，TTL 由 `clock.advance` 与 `netstack.sweep_now` 显式驱动；
///   事件辅助方法各自取得并释放全局锁，调用方不得在持锁时调用它们。
pub struct Harness {
    pub netstack: Netstack,
    pub fake: FakeStack,
    pub tcp: Arc<RecordingTcpHandler>,
    pub udp: Arc<RecordingUdpHandler>,
    pub clock: Arc<ManualClock>,
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(NetstackConfig::default())
    }

    pub fn with_config(config: NetstackConfig) -> Self {
        let fake = FakeStack::new();
        let tcp = Arc::new(RecordingTcpHandler::default());
        let udp = Arc::new(RecordingUdpHandler::default());
        let clock = Arc::new(ManualClock::new());
        let netstack = Netstack::builder(Box::new(fake.clone()))
            .config(config)
            .clock(clock.clone())
            .tcp_handler(tcp.clone())
            .udp_handler(udp.clone())
            .background_sweeper(false)
            .build()
            .expect("构建 netstack");
        Self {
            netstack,
            fake,
            tcp,
            udp,
            clock,
        }
    }

    pub fn try_accept(&self, handle: u64) -> Result<Arc<TcpConnection>> {
        let mut stack = self.netstack.lock();
        self.netstack
            .tcp_accept(&mut stack, TcpHandle(handle), client(handle), server())
    }

    pub fn accept(&self, handle: u64) -> Arc<TcpConnection> {
        self.try_accept(handle).expect("接入连接")
    }

    pub fn deliver(&self, key: ConnKey, bytes: &[u8]) -> Result<EventVerdict> {
        let mut stack = self.netstack.lock();
        let mut view = ReceiveView::contiguous(bytes);
        self.netstack.tcp_recv(&mut stack, key, &mut view)
    }

    /// 模拟对端确认：归还发送容量并投递 sent 事件。
    pub fn acknowledge_sent(&self, conn: &TcpConnection, count: usize) -> EventVerdict {
        self.fake.release_send_capacity(conn.handle(), count);
        let mut stack = self.netstack.lock();
        self.netstack.tcp_sent(&mut stack, conn.key(), count)
    }

    pub fn local_closed(&self, key: ConnKey) -> EventVerdict {
        let mut stack = self.netstack.lock();
        self.netstack.tcp_local_closed(&mut stack, key)
    }

    pub fn poll(&self, key: ConnKey) -> EventVerdict {
        let mut stack = self.netstack.lock();
        self.netstack.tcp_poll(&mut stack, key)
    }

    pub fn error(&self, key: ConnKey, code: i32) -> EventVerdict {
        let mut stack = self.netstack.lock();
        self.netstack.tcp_error(&mut stack, key, code)
    }

    pub fn datagram(&self, src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<()> {
        let mut stack = self.netstack.lock();
        let mut view = ReceiveView::contiguous(payload);
        self.netstack
            .udp_input(&mut stack, UdpHandle(1), src, dst, &mut view)
    }
}
