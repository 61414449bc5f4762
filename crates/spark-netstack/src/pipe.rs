//! 阻塞式字节管道 Patch。
//!
//! - **意图 (Why)**：为最常见的“另一个线程阻塞读取入站字节”场景提供现成的 [`TcpPatch`]，
//!   同时演示接收窗口的部分确认：管道只确认窗口内放得下的字节，其余字节暂存但不确认，
//!   对端因此被限速，直到读端取走数据后再补发确认；
//! - **契约 (What)**：[`PipeReader`] 实现 [`std::io::Read`]，无数据时阻塞，入站结束后返回 `Ok(0)`；
//!   消费者关闭读方向或丢弃读端后，缓存与新到达的数据被丢弃并全部确认，避免对端停滞；
//!   连接优雅拆除只结束入站，已缓存的字节仍可读完；
//! - **实现提示 (How)**：共享 `Mutex<PipeState>` + `Condvar`，缓冲使用 `bytes::BytesMut`。

use std::io;
use std::sync::{Arc, Weak};

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::buffer::ReceiveView;
use crate::error::Result;
use crate::tcp::{TcpConnection, TcpPatch};

#[derive(Debug, Default)]
struct PipeState {
    buf: BytesMut,
    withheld: usize,
    inbound_finished: bool,
    reader_closed: bool,
}

#[derive(Debug)]
struct PipeShared {
    state: Mutex<PipeState>,
    readable: Condvar,
    window: usize,
}

/// 管道的写入端，作为连接的 Patch 安装。
#[derive(Debug)]
pub struct PipePatch {
    shared: Arc<PipeShared>,
    conn: Weak<TcpConnection>,
}

/// 管道的读取端，供消费者线程阻塞读取。
#[derive(Debug)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
    conn: Weak<TcpConnection>,
}

/// 为 `conn` 创建接收窗口为 `window` 字节的管道。
///
/// 通常在 `TcpHandler::on_connect` 中调用：返回的 Patch 交还给桥接层，Reader 交给消费者线程。
pub fn pipe(conn: &Arc<TcpConnection>, window: usize) -> (PipePatch, PipeReader) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState::default()),
        readable: Condvar::new(),
        window,
    });
    (
        PipePatch {
            shared: Arc::clone(&shared),
            conn: Arc::downgrade(conn),
        },
        PipeReader {
            shared,
            conn: Arc::downgrade(conn),
        },
    )
}

impl TcpPatch for PipePatch {
    fn on_receive(&self, data: &mut ReceiveView<'_>) -> io::Result<usize> {
        let delivered = data.remaining();
        let mut state = self.shared.state.lock();
        if state.reader_closed {
            data.advance(delivered);
            return Ok(delivered);
        }
        let unread = state.buf.len();
        let free = self.shared.window.saturating_sub(unread);
        let consumed = delivered.min(free);
        state.buf.put(&mut *data);
        state.withheld += delivered - consumed;
        drop(state);
        self.shared.readable.notify_all();
        trace!(delivered, consumed, "pipe buffered inbound data");
        Ok(consumed)
    }

    fn finish_inbound(&self) {
        self.shared.state.lock().inbound_finished = true;
        self.shared.readable.notify_all();
    }

    fn close_read(&self) -> Result<()> {
        discard_reader(&self.shared, &self.conn);
        Ok(())
    }
}

/// 关闭读端并确认此前暂存的字节；连接已关闭时确认失败可忽略。
fn discard_reader(shared: &PipeShared, conn: &Weak<TcpConnection>) {
    let withheld = close_reader(shared);
    if withheld > 0
        && let Some(conn) = conn.upgrade()
    {
        let _ = conn.acknowledge(withheld);
    }
}

/// 关闭读端，返回此前暂存未确认的字节数。
fn close_reader(shared: &PipeShared) -> usize {
    let withheld = {
        let mut state = shared.state.lock();
        state.reader_closed = true;
        state.buf.clear();
        std::mem::take(&mut state.withheld)
    };
    shared.readable.notify_all();
    withheld
}

impl PipeReader {
    /// 当前已缓存但尚未读取的字节数。
    pub fn buffered(&self) -> usize {
        self.shared.state.lock().buf.len()
    }

    /// 已缓存但尚未向对端确认的字节数。
    pub fn withheld(&self) -> usize {
        self.shared.state.lock().withheld
    }
}

impl io::Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let (read, release) = {
            let mut state = self.shared.state.lock();
            loop {
                if state.reader_closed {
                    return Ok(0);
                }
                if !state.buf.is_empty() {
                    break;
                }
                if state.inbound_finished {
                    return Ok(0);
                }
                self.shared.readable.wait(&mut state);
            }
            let read = out.len().min(state.buf.len());
            out[..read].copy_from_slice(&state.buf[..read]);
            state.buf.advance(read);
            let free = self.shared.window.saturating_sub(state.buf.len());
            let release = state.withheld.min(free);
            state.withheld -= release;
            (read, release)
        };
        if release > 0
            && let Some(conn) = self.conn.upgrade()
        {
            trace!(key = %conn.key(), release, "pipe reopened receive window");
            // 连接已关闭时确认失败无关紧要，已缓存的数据仍可读出。
            let _ = conn.acknowledge(release);
        }
        Ok(read)
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        discard_reader(&self.shared, &self.conn);
    }
}
