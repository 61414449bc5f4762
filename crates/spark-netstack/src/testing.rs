//! 测试支撑：脚本化原生栈与记录型 Handler。
//!
//! - **意图 (Why)**：桥接层的契约几乎都体现为“对原生栈做了哪些调用”，
//!   [`FakeStack`] 记录每一次调用并允许按句柄注入容量与故障；
//! - **契约 (What)**：`FakeStack` 可克隆，克隆体共享同一份状态，
//!   一份交给 `Netstack::builder`，另一份留在测试中断言；
//! - **风险 (Trade-offs)**：仅在 `cfg(test)` 或 `test-util` 特性下编译，不进入生产构建。

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::buffer::ReceiveView;
use crate::error::{NetstackError, Result};
use crate::native::{NativeAddr, NativeStack, SendOutcome, ShutdownDirection, TcpHandle, UdpHandle};
use crate::pipe::{self, PipeReader};
use crate::registry::ConnKey;
use crate::tcp::{TcpConnection, TcpHandler, TcpPatch};
use crate::udp::{FlowKey, UdpConnection, UdpHandler};

/// 未单独设置时每个句柄的发送缓冲容量。
pub const DEFAULT_SEND_CAPACITY: usize = 64 * 1024;

/// 一次被记录的原生调用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NativeCall {
    Enqueue(TcpHandle, usize),
    Shutdown(TcpHandle, ShutdownDirection),
    Close(TcpHandle),
    Abort(TcpHandle),
    Acknowledge(TcpHandle, usize),
    Attach(TcpHandle, ConnKey),
    Detach(TcpHandle),
    ReleaseKey(ConnKey),
    TranslateAddr(IpAddr, NativeAddr),
    ReleaseAddr(NativeAddr),
    UdpSend {
        handle: UdpHandle,
        src: SocketAddr,
        dst: NativeAddr,
        port: u16,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<NativeCall>,
    capacity: HashMap<TcpHandle, usize>,
    sent: HashMap<TcpHandle, Vec<u8>>,
    fail_enqueue: HashMap<TcpHandle, i32>,
    fail_close: HashMap<TcpHandle, i32>,
    fail_shutdown: HashMap<TcpHandle, i32>,
    fail_translate: HashSet<IpAddr>,
    live_addrs: HashSet<NativeAddr>,
    next_addr: u64,
}

/// 记录全部调用的内存原生栈。
#[derive(Clone, Debug, Default)]
pub struct FakeStack {
    state: Arc<Mutex<FakeState>>,
}

impl FakeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置句柄当前可用的发送缓冲字节数；入队会消耗容量。
    pub fn set_send_capacity(&self, handle: TcpHandle, capacity: usize) {
        self.state.lock().capacity.insert(handle, capacity);
    }

    /// 模拟对端确认：为句柄归还 `count` 字节发送容量。
    pub fn release_send_capacity(&self, handle: TcpHandle, count: usize) {
        let mut state = self.state.lock();
        let slot = state.capacity.entry(handle).or_insert(DEFAULT_SEND_CAPACITY);
        *slot = slot.saturating_add(count);
    }

    /// 下一次入队返回致命错误码。
    pub fn fail_next_enqueue(&self, handle: TcpHandle, code: i32) {
        self.state.lock().fail_enqueue.insert(handle, code);
    }

    /// 之后对该句柄的优雅关闭都返回错误码。
    pub fn fail_close(&self, handle: TcpHandle, code: i32) {
        self.state.lock().fail_close.insert(handle, code);
    }

    /// 之后对该句柄的半关闭都返回错误码。
    pub fn fail_shutdown(&self, handle: TcpHandle, code: i32) {
        self.state.lock().fail_shutdown.insert(handle, code);
    }

    /// 之后对该 IP 的地址转换都失败。
    pub fn fail_translate(&self, ip: IpAddr) {
        self.state.lock().fail_translate.insert(ip);
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&NativeCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| pred(call)).count()
    }

    /// 句柄累计入队的字节。
    pub fn sent_bytes(&self, handle: TcpHandle) -> Vec<u8> {
        self.state.lock().sent.get(&handle).cloned().unwrap_or_default()
    }

    /// 句柄累计归还给接收窗口的字节数。
    pub fn acknowledged(&self, handle: TcpHandle) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .map(|call| match call {
                NativeCall::Acknowledge(h, count) if *h == handle => *count,
                _ => 0,
            })
            .sum()
    }

    /// 已转换且尚未释放的原生地址数量。
    pub fn live_addrs(&self) -> usize {
        self.state.lock().live_addrs.len()
    }

    /// 全部 UDP 发送记录的载荷。
    pub fn udp_payloads(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                NativeCall::UdpSend { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }
}

impl NativeStack for FakeStack {
    fn send_capacity(&mut self, handle: TcpHandle) -> usize {
        *self
            .state
            .lock()
            .capacity
            .entry(handle)
            .or_insert(DEFAULT_SEND_CAPACITY)
    }

    fn send_enqueue(&mut self, handle: TcpHandle, bytes: &[u8]) -> SendOutcome {
        let mut state = self.state.lock();
        if let Some(code) = state.fail_enqueue.remove(&handle) {
            return SendOutcome::Fatal(code);
        }
        let capacity = state.capacity.entry(handle).or_insert(DEFAULT_SEND_CAPACITY);
        if bytes.len() > *capacity {
            return SendOutcome::WouldBlock;
        }
        *capacity -= bytes.len();
        state.sent.entry(handle).or_default().extend_from_slice(bytes);
        state.calls.push(NativeCall::Enqueue(handle, bytes.len()));
        SendOutcome::Accepted(bytes.len())
    }

    fn shutdown(&mut self, handle: TcpHandle, direction: ShutdownDirection) -> Result<(), i32> {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::Shutdown(handle, direction));
        match state.fail_shutdown.get(&handle) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }

    fn close(&mut self, handle: TcpHandle) -> Result<(), i32> {
        let mut state = self.state.lock();
        state.calls.push(NativeCall::Close(handle));
        match state.fail_close.get(&handle) {
            Some(code) => Err(*code),
            None => Ok(()),
        }
    }

    fn abort(&mut self, handle: TcpHandle) {
        self.state.lock().calls.push(NativeCall::Abort(handle));
    }

    fn acknowledge_received(&mut self, handle: TcpHandle, count: usize) {
        self.state
            .lock()
            .calls
            .push(NativeCall::Acknowledge(handle, count));
    }

    fn attach(&mut self, handle: TcpHandle, key: ConnKey) {
        self.state.lock().calls.push(NativeCall::Attach(handle, key));
    }

    fn detach(&mut self, handle: TcpHandle) {
        self.state.lock().calls.push(NativeCall::Detach(handle));
    }

    fn release_key(&mut self, key: ConnKey) {
        self.state.lock().calls.push(NativeCall::ReleaseKey(key));
    }

    fn translate_addr(&mut self, addr: IpAddr) -> Option<NativeAddr> {
        let mut state = self.state.lock();
        if state.fail_translate.contains(&addr) {
            return None;
        }
        state.next_addr += 1;
        let native = NativeAddr(state.next_addr);
        state.live_addrs.insert(native);
        state.calls.push(NativeCall::TranslateAddr(addr, native));
        Some(native)
    }

    fn release_addr(&mut self, addr: NativeAddr) {
        let mut state = self.state.lock();
        assert!(
            state.live_addrs.remove(&addr),
            "native address {addr:?} released twice or never allocated"
        );
        state.calls.push(NativeCall::ReleaseAddr(addr));
    }

    fn udp_send(
        &mut self,
        handle: UdpHandle,
        src: SocketAddr,
        dst: NativeAddr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), i32> {
        let mut state = self.state.lock();
        if !state.live_addrs.contains(&dst) {
            return Err(-6);
        }
        state.calls.push(NativeCall::UdpSend {
            handle,
            src,
            dst,
            port: dst_port,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// Patch 对入站数据的消费方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConsumeMode {
    /// 全部消费。
    #[default]
    All,
    /// 每次最多消费 `n` 字节。
    AtMost(usize),
    /// 报告比实际交付多 `n` 字节，用于触发越界确认。
    OverReport(usize),
    /// 返回 I/O 错误，拒收数据。
    Refuse,
}

/// 单条连接 Patch 的观测记录。
#[derive(Debug, Default)]
pub struct PatchLog {
    received: Mutex<Vec<u8>>,
    finished: AtomicUsize,
    read_closed: AtomicUsize,
}

impl PatchLog {
    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn read_closed(&self) -> usize {
        self.read_closed.load(Ordering::SeqCst)
    }
}

struct RecordingPatch {
    log: Arc<PatchLog>,
    mode: ConsumeMode,
}

impl TcpPatch for RecordingPatch {
    fn on_receive(&self, data: &mut ReceiveView<'_>) -> io::Result<usize> {
        if self.mode == ConsumeMode::Refuse {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "patch refused data"));
        }
        let delivered = data.len();
        self.log.received.lock().extend_from_slice(&data.to_vec());
        Ok(match self.mode {
            ConsumeMode::All | ConsumeMode::Refuse => delivered,
            ConsumeMode::AtMost(limit) => delivered.min(limit),
            ConsumeMode::OverReport(extra) => delivered + extra,
        })
    }

    fn finish_inbound(&self) {
        self.log.finished.fetch_add(1, Ordering::SeqCst);
    }

    fn close_read(&self) -> Result<()> {
        self.log.read_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// 记录接入连接并安装 [`RecordingPatch`] 或管道的 TCP Handler。
#[derive(Debug, Default)]
pub struct RecordingTcpHandler {
    mode: Mutex<ConsumeMode>,
    pipe_window: Mutex<Option<usize>>,
    reject: AtomicBool,
    accepted: Mutex<Vec<(ConnKey, SocketAddr)>>,
    logs: Mutex<HashMap<ConnKey, Arc<PatchLog>>>,
    readers: Mutex<HashMap<ConnKey, PipeReader>>,
}

impl RecordingTcpHandler {
    /// 之后接入的连接按 `mode` 消费。
    pub fn set_consume_mode(&self, mode: ConsumeMode) {
        *self.mode.lock() = mode;
    }

    /// 之后接入的连接改为安装窗口为 `window` 的管道。
    pub fn use_pipe(&self, window: usize) {
        *self.pipe_window.lock() = Some(window);
    }

    pub fn reject_new(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn accepted(&self) -> Vec<(ConnKey, SocketAddr)> {
        self.accepted.lock().clone()
    }

    pub fn patch_log(&self, key: ConnKey) -> Option<Arc<PatchLog>> {
        self.logs.lock().get(&key).cloned()
    }

    /// 取走管道模式下该连接的读端。
    pub fn take_reader(&self, key: ConnKey) -> Option<PipeReader> {
        self.readers.lock().remove(&key)
    }
}

impl TcpHandler for RecordingTcpHandler {
    fn on_connect(
        &self,
        conn: &Arc<TcpConnection>,
        remote: SocketAddr,
    ) -> Result<Box<dyn TcpPatch>> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(NetstackError::handler("rejected by recording handler"));
        }
        self.accepted.lock().push((conn.key(), remote));
        if let Some(window) = *self.pipe_window.lock() {
            let (patch, reader) = pipe::pipe(conn, window);
            self.readers.lock().insert(conn.key(), reader);
            return Ok(Box::new(patch));
        }
        let log = Arc::new(PatchLog::default());
        self.logs.lock().insert(conn.key(), Arc::clone(&log));
        Ok(Box::new(RecordingPatch {
            log,
            mode: *self.mode.lock(),
        }))
    }
}

/// 一个被记录的入站数据报。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Datagram {
    pub flow: FlowKey,
    pub payload: Vec<u8>,
    pub dst: SocketAddr,
}

/// 记录建流、收包与关闭的 UDP Handler。
#[derive(Debug, Default)]
pub struct RecordingUdpHandler {
    reject: AtomicBool,
    connected: Mutex<Vec<(FlowKey, SocketAddr)>>,
    received: Mutex<Vec<Datagram>>,
    closed: Mutex<Vec<FlowKey>>,
}

impl RecordingUdpHandler {
    pub fn reject_new(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn connected(&self) -> Vec<(FlowKey, SocketAddr)> {
        self.connected.lock().clone()
    }

    pub fn received(&self) -> Vec<Datagram> {
        self.received.lock().clone()
    }

    pub fn closed(&self) -> Vec<FlowKey> {
        self.closed.lock().clone()
    }
}

impl UdpHandler for RecordingUdpHandler {
    fn on_connect(&self, conn: &Arc<UdpConnection>, remote: SocketAddr) -> Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(NetstackError::handler("rejected by recording handler"));
        }
        self.connected.lock().push((conn.flow(), remote));
        Ok(())
    }

    fn on_receive(
        &self,
        conn: &Arc<UdpConnection>,
        data: &mut ReceiveView<'_>,
        dst: SocketAddr,
    ) -> Result<()> {
        self.received.lock().push(Datagram {
            flow: conn.flow(),
            payload: data.to_vec(),
            dst,
        });
        Ok(())
    }

    fn on_close(&self, conn: &Arc<UdpConnection>) {
        self.closed.lock().push(conn.flow());
    }
}
