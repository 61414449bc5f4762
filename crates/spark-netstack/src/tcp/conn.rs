use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use super::backpressure::WriteReadiness;
use super::state::TcpState;
use super::{EventVerdict, TcpTable};
use crate::buffer::ReceiveView;
use crate::error::{self, NetstackError, Result};
use crate::native::{SendOutcome, ShutdownDirection, StackGuard, StackLock, TcpHandle};
use crate::registry::ConnKey;
use crate::sync::OnceGuard;

/// 连接级字节管道策略，由 Handler 在建连时提供，此后由连接独占。
///
/// # 教案式注释
/// - **意图 (Why)**：状态机只负责生命周期与流控，具体如何缓存、转发入站字节交给 Patch；
/// - **契约 (What)**：
///   - `on_receive` 在原生事件线程上调用，必须返回实际消费的字节数；
///     返回值大于交付量会被拒绝，小于交付量则对端窗口只推进消费部分；
///   - `finish_inbound` 表示入站数据已结束（对端 FIN 或连接拆除），读端应观察到流结束；
///   - `close_read` 表示消费者放弃读取，只由消费者侧的 `close_read`/`close` 触发，拆除路径不会调用；
/// - **风险 (Trade-offs)**：三个方法都可能在持有全局串行锁时被调用，实现不得阻塞，
///   也不得同步调用本连接的 `write`/`close_write`/`abort`。
pub trait TcpPatch: Send + Sync {
    fn on_receive(&self, data: &mut ReceiveView<'_>) -> io::Result<usize>;

    fn finish_inbound(&self);

    fn close_read(&self) -> Result<()>;
}

/// 新 TCP 连接的接入回调。
///
/// 返回 `Err` 表示拒绝连接，桥接层会立即中止原生连接并把错误交还给驱动。
/// 回调执行时全局串行锁已被持有，约束与 [`TcpPatch`] 相同。
pub trait TcpHandler: Send + Sync {
    fn on_connect(&self, conn: &Arc<TcpConnection>, remote: SocketAddr)
    -> Result<Box<dyn TcpPatch>>;
}

/// 连接级字节计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpCounters {
    /// 已写入原生发送缓冲的字节数。
    pub bytes_enqueued: u64,
    /// 交付给 Patch 的入站字节数。
    pub bytes_delivered: u64,
    /// 向原生接收窗口归还的字节数。
    pub bytes_acknowledged: u64,
    /// 写线程因背压进入等待的次数。
    pub write_waits: u64,
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    acknowledged: AtomicU64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Teardown {
    Graceful,
    Abort,
    Errored,
}

/// 一条已接入的 TCP 连接。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 协调两类执行域：原生事件线程推送的异步事件（数据到达、发送确认、错误），
///   与消费者线程发起的同步操作（写入、半关闭、关闭、中止）。
///
/// ## 逻辑 (How)
/// - 生命周期状态由连接级互斥锁保护，迁移规则见 [`TcpState`]；
/// - 写路径按原生发送缓冲的可用容量分块入队，每块只在原生调用期间持有全局锁；
///   零进度时在 [`WriteReadiness`] 上等待，确认事件、状态变化与拆除都会广播唤醒；
/// - 拆除路径由 [`OnceGuard`] 保护：消费者关闭、原生错误、淘汰与显式中止都尝试同一个守卫，
///   只有胜者执行释放副作用。
///
/// ## 契约 (What)
/// - 所有消费者操作都可在任意线程并发调用；同一连接上的多个写线程按调用顺序串行；
/// - 原生句柄只在持有全局锁且状态非终态时被使用；
/// - 锁顺序：全局串行锁 → 状态锁 → 写就绪信号锁。
///
/// ## 注意事项 (Trade-offs)
/// - `close` 只关闭本端两个方向；连接在对端也结束读方向后才进入优雅拆除，
///   如需立即释放请使用 [`abort`](Self::abort)。
pub struct TcpConnection {
    key: ConnKey,
    handle: TcpHandle,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stack: Arc<StackLock>,
    table: Weak<TcpTable>,
    state: Mutex<TcpState>,
    patch: OnceLock<Box<dyn TcpPatch>>,
    writer: Mutex<()>,
    /// 部分写入后中断的原因，留给下一次 `write` 返回。
    interrupted: Mutex<Option<NetstackError>>,
    ready: WriteReadiness,
    teardown: OnceGuard,
    close_result: OnceLock<Result<()>>,
    counters: Counters,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("key", &self.key)
            .field("handle", &self.handle)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl TcpConnection {
    pub(crate) fn new(
        key: ConnKey,
        handle: TcpHandle,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        stack: Arc<StackLock>,
        table: Weak<TcpTable>,
    ) -> Self {
        Self {
            key,
            handle,
            local_addr,
            remote_addr,
            stack,
            table,
            state: Mutex::new(TcpState::New),
            patch: OnceLock::new(),
            writer: Mutex::new(()),
            interrupted: Mutex::new(None),
            ready: WriteReadiness::new(),
            teardown: OnceGuard::new(),
            close_result: OnceLock::new(),
            counters: Counters::default(),
        }
    }

    pub fn key(&self) -> ConnKey {
        self.key
    }

    pub fn handle(&self) -> TcpHandle {
        self.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn state(&self) -> TcpState {
        *self.state.lock()
    }

    /// 连接是否已完成拆除。
    pub fn is_closed(&self) -> bool {
        self.teardown.is_claimed()
    }

    pub fn counters(&self) -> TcpCounters {
        TcpCounters {
            bytes_enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            bytes_delivered: self.counters.delivered.load(Ordering::Relaxed),
            bytes_acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            write_waits: self.ready.waits(),
        }
    }

    /// 阻塞写入，直到全部字节入队或连接进入不可写状态。
    ///
    /// # 契约说明（What）
    /// - 全部入队时返回 `Ok(data.len())`；
    /// - 已有部分字节入队后连接变为不可写，返回 `Ok(已入队字节数)`，中断原因暂存，
    ///   下一次调用原样返回该错误；
    /// - 尚未入队任何字节即不可写时返回错误：半关闭后为 `Closed`，中止或原生错误后为 `Aborted`；
    /// - 原生入队返回致命错误时连接立即中止，不做重试。
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let _writer = self.writer.lock();
        if let Some(err) = self.interrupted.lock().take() {
            return Err(err);
        }
        let mut written = 0;
        while written < data.len() {
            let seen = self.ready.epoch();
            let progress = match self.enqueue_chunk(&data[written..]) {
                Ok(progress) => progress,
                Err(err) if written > 0 => {
                    if matches!(err, NetstackError::Native { .. }) {
                        warn!(key = %self.key, written, %err, "write interrupted after partial progress");
                    } else {
                        debug!(key = %self.key, written, %err, "write interrupted after partial progress");
                    }
                    *self.interrupted.lock() = Some(err);
                    return Ok(written);
                }
                Err(err) => return Err(err),
            };
            written += progress;
            if progress == 0 {
                trace!(key = %self.key, written, "send buffer full, waiting for acknowledgment");
                self.ready.wait_past(seen);
            }
        }
        Ok(written)
    }

    fn enqueue_chunk(&self, remaining: &[u8]) -> Result<usize> {
        let mut stack = self.stack.lock();
        self.check_writable()?;
        let chunk = stack.send_capacity(self.handle).min(remaining.len());
        if chunk == 0 {
            return Ok(0);
        }
        match stack.send_enqueue(self.handle, &remaining[..chunk]) {
            SendOutcome::Accepted(accepted) => {
                let accepted = accepted.min(chunk);
                self.counters
                    .enqueued
                    .fetch_add(accepted as u64, Ordering::Relaxed);
                trace!(key = %self.key, accepted, "enqueued chunk");
                Ok(accepted)
            }
            SendOutcome::WouldBlock => Ok(0),
            SendOutcome::Fatal(code) => {
                warn!(key = %self.key, code, "native send enqueue failed, aborting connection");
                self.teardown(&mut stack, Teardown::Abort);
                Err(NetstackError::Native {
                    op: error::SEND_ENQUEUE,
                    code,
                })
            }
        }
    }

    fn check_writable(&self) -> Result<()> {
        match self.state() {
            state if state.can_write() => Ok(()),
            TcpState::New => Err(NetstackError::NotConnected),
            TcpState::Aborting | TcpState::Errored => Err(NetstackError::Aborted),
            _ => Err(NetstackError::Closed),
        }
    }

    /// 关闭写方向，向对端发送 FIN。重复调用或已关闭时为空操作。
    ///
    /// 若读方向此前已结束，连接随即进入优雅拆除。
    pub fn close_write(&self) -> Result<()> {
        let mut stack = self.stack.lock();
        let next = {
            let mut state = self.state.lock();
            let Some(next) = state.after_close_write() else {
                return Ok(());
            };
            *state = next;
            next
        };
        debug!(key = %self.key, state = %next, "write side closed by consumer");
        if let Err(code) = stack.shutdown(self.handle, ShutdownDirection::Write) {
            warn!(key = %self.key, code, "native shutdown failed, aborting connection");
            self.teardown(&mut stack, Teardown::Abort);
            return Err(NetstackError::Native {
                op: error::SHUTDOWN,
                code,
            });
        }
        self.check_state(&mut stack);
        Ok(())
    }

    /// 放弃读取，委托给 Patch。
    pub fn close_read(&self) -> Result<()> {
        match self.patch.get() {
            Some(patch) => patch.close_read(),
            None => Ok(()),
        }
    }

    /// 关闭读写两个方向。
    ///
    /// 任意多个线程并发调用时，关闭动作只执行一次，所有调用者得到同一个结果。
    pub fn close(&self) -> Result<()> {
        self.close_result
            .get_or_init(|| {
                let read = self.close_read();
                let write = self.close_write();
                write.and(read)
            })
            .clone()
    }

    /// 硬中止连接，不经过关闭握手；幂等。
    pub fn abort(&self) {
        self.mark_aborting();
        let mut stack = self.stack.lock();
        self.check_state(&mut stack);
    }

    /// 在消费者线程上归还接收窗口，用于 Patch 延后确认已缓存的字节。
    ///
    /// 累计归还量超过累计交付量时返回 `OverAcknowledged`，不做任何归还。
    pub fn acknowledge(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let mut stack = self.stack.lock();
        match self.state() {
            TcpState::Aborting | TcpState::Errored => return Err(NetstackError::Aborted),
            TcpState::Closed => return Err(NetstackError::Closed),
            _ => {}
        }
        self.account_acknowledgment(count, 0)?;
        stack.acknowledge_received(self.handle, count);
        Ok(())
    }

    fn account_acknowledgment(&self, count: usize, delivered: usize) -> Result<()> {
        let total_delivered =
            self.counters.delivered.load(Ordering::Relaxed) + delivered as u64;
        let total_acknowledged = self.counters.acknowledged.load(Ordering::Relaxed) + count as u64;
        if total_acknowledged > total_delivered {
            warn!(
                key = %self.key,
                count,
                total_delivered,
                "consumer acknowledged more bytes than were delivered"
            );
            return Err(NetstackError::OverAcknowledged {
                consumed: count,
                delivered: (total_delivered
                    - self.counters.acknowledged.load(Ordering::Relaxed))
                    as usize,
            });
        }
        self.counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.counters
            .acknowledged
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn advance(&self, next: TcpState) -> bool {
        let mut state = self.state.lock();
        if state.can_advance_to(next) {
            *state = next;
            true
        } else {
            false
        }
    }

    pub(crate) fn install_patch(&self, patch: Box<dyn TcpPatch>) {
        if self.patch.set(patch).is_err() {
            debug!(key = %self.key, "patch already installed, keeping the first one");
        }
    }

    /// 标记为待中止并唤醒写线程；返回是否发生了迁移。
    pub(crate) fn mark_aborting(&self) -> bool {
        let advanced = {
            let mut state = self.state.lock();
            match state.after_abort_request() {
                Some(next) => {
                    *state = next;
                    true
                }
                None => false,
            }
        };
        if advanced {
            debug!(key = %self.key, "abort requested");
            self.ready.signal();
        }
        advanced
    }

    /// 在已持有全局锁的路径上中止连接。
    pub(crate) fn abort_locked(&self, stack: &mut StackGuard<'_>) -> EventVerdict {
        self.mark_aborting();
        self.check_state(stack)
    }

    /// 执行待处理的关闭或中止，否则唤醒写线程。
    pub(crate) fn check_state(&self, stack: &mut StackGuard<'_>) -> EventVerdict {
        match self.state() {
            TcpState::Closing => self.teardown(stack, Teardown::Graceful),
            TcpState::Aborting => self.teardown(stack, Teardown::Abort),
            TcpState::Closed | TcpState::Errored => EventVerdict::Closed,
            _ => {
                self.ready.signal();
                EventVerdict::Handled
            }
        }
    }

    /// 原生栈交付入站数据。
    pub(crate) fn on_data(
        &self,
        stack: &mut StackGuard<'_>,
        data: &mut ReceiveView<'_>,
    ) -> Result<EventVerdict> {
        match self.state() {
            state if state.can_receive() => {}
            TcpState::New | TcpState::Connecting => return Err(NetstackError::NotConnected),
            TcpState::Aborting => return Ok(self.teardown(stack, Teardown::Abort)),
            TcpState::Errored => return Err(NetstackError::Aborted),
            _ => return Err(NetstackError::Closed),
        }
        let Some(patch) = self.patch.get() else {
            return Err(NetstackError::NotConnected);
        };
        let delivered = data.len();
        let consumed = patch.on_receive(data).map_err(|err| {
            debug!(key = %self.key, %err, "patch refused inbound data");
            NetstackError::Closed
        })?;
        if consumed > delivered {
            warn!(key = %self.key, consumed, delivered, "patch reported more bytes than delivered");
            // 字节可能已被 Patch 缓存，仍计入交付量，之后可经 `acknowledge` 归还。
            self.counters
                .delivered
                .fetch_add(delivered as u64, Ordering::Relaxed);
            return Err(NetstackError::OverAcknowledged {
                consumed,
                delivered,
            });
        }
        self.account_acknowledgment(consumed, delivered)?;
        if consumed > 0 {
            stack.acknowledge_received(self.handle, consumed);
        }
        trace!(key = %self.key, delivered, consumed, "delivered inbound data");
        Ok(EventVerdict::Handled)
    }

    /// 原生栈报告读方向结束。
    pub(crate) fn on_local_closed(&self, stack: &mut StackGuard<'_>) -> EventVerdict {
        let next = {
            let mut state = self.state.lock();
            state.after_local_closed().inspect(|next| *state = *next)
        };
        if let Some(next) = next {
            debug!(key = %self.key, state = %next, "inbound side finished");
            if let Some(patch) = self.patch.get() {
                patch.finish_inbound();
            }
        }
        self.check_state(stack)
    }

    /// 原生栈报告错误；原生句柄已失效，只释放桥接层资源。
    pub(crate) fn on_error(&self, stack: &mut StackGuard<'_>, code: i32) -> EventVerdict {
        warn!(key = %self.key, code, "native stack reported connection error");
        self.teardown(stack, Teardown::Errored)
    }

    /// 拆除连接，只有第一个到达的路径执行副作用。
    fn teardown(&self, stack: &mut StackGuard<'_>, mode: Teardown) -> EventVerdict {
        if !self.teardown.claim() {
            return EventVerdict::Closed;
        }
        let terminal = match mode {
            Teardown::Errored => TcpState::Errored,
            Teardown::Graceful | Teardown::Abort => TcpState::Closed,
        };
        let previous = std::mem::replace(&mut *self.state.lock(), terminal);
        debug!(key = %self.key, from = %previous, to = %terminal, ?mode, "tearing down connection");

        if let Some(table) = self.table.upgrade() {
            table.forget(self.key);
        }
        if mode != Teardown::Errored {
            stack.detach(self.handle);
        }
        stack.release_key(self.key);

        // 只结束入站；已交付的字节留给读端读完，丢弃与否由消费者的 `close_read` 决定。
        if let Some(patch) = self.patch.get() {
            patch.finish_inbound();
        }

        let verdict = match mode {
            Teardown::Graceful => match stack.close(self.handle) {
                Ok(()) => EventVerdict::Closed,
                Err(code) => {
                    warn!(key = %self.key, code, "native close failed, falling back to abort");
                    stack.abort(self.handle);
                    EventVerdict::Aborted
                }
            },
            Teardown::Abort => {
                stack.abort(self.handle);
                EventVerdict::Aborted
            }
            Teardown::Errored => EventVerdict::Closed,
        };
        self.ready.signal();
        verdict
    }
}

impl io::Write for &TcpConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpConnection::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeStack, NativeCall, RecordingTcpHandler};
    use crate::{Netstack, NetstackConfig};
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::thread;
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), port))
    }

    fn setup(capacity: usize) -> (Netstack, FakeStack, Arc<TcpConnection>) {
        let fake = FakeStack::new();
        fake.set_send_capacity(TcpHandle(1), capacity);
        let netstack = Netstack::builder(Box::new(fake.clone()))
            .config(NetstackConfig::default())
            .tcp_handler(Arc::new(RecordingTcpHandler::default()))
            .background_sweeper(false)
            .build()
            .expect("构建 netstack");
        let conn = {
            let mut stack = netstack.lock();
            netstack
                .tcp_accept(&mut stack, TcpHandle(1), addr(1000), addr(80))
                .expect("接入连接")
        };
        (netstack, fake, conn)
    }

    #[test]
    fn write_within_capacity_enqueues_everything() {
        let (_netstack, fake, conn) = setup(64);
        assert_eq!(conn.write(b"hello").expect("写入"), 5);
        assert_eq!(fake.sent_bytes(TcpHandle(1)), b"hello");
        assert_eq!(conn.counters().bytes_enqueued, 5);
    }

    #[test]
    fn write_after_close_write_reports_closed() {
        let (_netstack, fake, conn) = setup(64);
        conn.close_write().expect("半关闭");
        assert_eq!(conn.state(), TcpState::WriteClosed);
        assert_eq!(conn.write(b"x"), Err(NetstackError::Closed));
        assert_eq!(
            fake.count(|call| matches!(call, NativeCall::Shutdown(_, ShutdownDirection::Write))),
            1
        );
        conn.close_write().expect("重复半关闭是空操作");
        assert_eq!(
            fake.count(|call| matches!(call, NativeCall::Shutdown(..))),
            1
        );
    }

    #[test]
    fn blocked_writer_returns_after_abort() {
        let (_netstack, _fake, conn) = setup(0);
        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.write(b"stuck"))
        };
        thread::sleep(Duration::from_millis(20));
        conn.abort();
        // 写线程可能在拆除前（Aborting）或拆除后（Closed）醒来，两者都是“连接已关闭”。
        let result = writer.join().expect("写线程不应 panic");
        assert!(
            matches!(result, Err(NetstackError::Aborted | NetstackError::Closed)),
            "unexpected write result: {result:?}"
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn fatal_enqueue_aborts_connection() {
        let (_netstack, fake, conn) = setup(64);
        fake.fail_next_enqueue(TcpHandle(1), -10);
        let err = conn.write(b"boom").expect_err("致命错误必须返回");
        assert_eq!(
            err,
            NetstackError::Native {
                op: error::SEND_ENQUEUE,
                code: -10
            }
        );
        assert!(conn.is_closed());
        assert_eq!(fake.count(|call| matches!(call, NativeCall::Abort(_))), 1);
    }

    #[test]
    fn interrupted_write_reports_cause_on_next_call() {
        let (netstack, fake, conn) = setup(4);
        let writer = {
            let conn = Arc::clone(&conn);
            thread::spawn(move || conn.write(b"01234567"))
        };
        while conn.counters().write_waits == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        fake.fail_next_enqueue(TcpHandle(1), -10);
        fake.release_send_capacity(TcpHandle(1), 4);
        {
            let mut stack = netstack.lock();
            netstack.tcp_sent(&mut stack, conn.key(), 4);
        }

        assert_eq!(writer.join().expect("写线程不应 panic"), Ok(4));
        assert_eq!(fake.sent_bytes(TcpHandle(1)), b"0123");
        assert_eq!(
            conn.write(b"89"),
            Err(NetstackError::Native {
                op: error::SEND_ENQUEUE,
                code: -10
            })
        );
        assert_eq!(conn.write(b"89"), Err(NetstackError::Closed));
    }

    #[test]
    fn io_write_maps_errors_to_io_kinds() {
        let (_netstack, _fake, conn) = setup(64);
        conn.abort();
        let err = (&*conn).write_all(b"late").expect_err("中止后写入必须失败");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn late_acknowledge_is_bounded_by_delivery() {
        let (_netstack, _fake, conn) = setup(64);
        assert!(matches!(
            conn.acknowledge(1),
            Err(NetstackError::OverAcknowledged { consumed: 1, delivered: 0 })
        ));
    }
}
