//! 延迟释放队列。
//!
//! - **意图 (Why)**：缓存淘汰回调可能运行在任意线程（后台清扫、消费者发送路径），
//!   而中止 TCP 连接与释放原生地址结构都必须持有全局串行锁；
//!   回调只负责登记工作，真正的原生调用推迟到下一个持锁点执行；
//! - **契约 (What)**：[`DeferredQueue::reap`] 在每个原生事件入口与每轮清扫时执行，
//!   调用方必须已持有全局锁；
//! - **风险 (Trade-offs)**：排空时先整体取出再逐项执行，执行期间新登记的工作留给下一轮。

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::native::{NativeAddr, StackGuard};
use crate::tcp::TcpConnection;

/// 一项需要全局锁才能完成的释放工作。
#[derive(Debug)]
pub(crate) enum DeferredWork {
    /// 中止因淘汰而被选中的连接。
    AbortTcp(Arc<TcpConnection>),
    /// 释放地址缓存淘汰的原生地址结构。
    ReleaseAddr(NativeAddr),
}

#[derive(Debug, Default)]
pub(crate) struct DeferredQueue {
    pending: Mutex<Vec<DeferredWork>>,
}

impl DeferredQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, work: DeferredWork) {
        self.pending.lock().push(work);
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// 在持有全局锁的前提下执行全部已登记工作，返回执行数量。
    pub(crate) fn reap(&self, stack: &mut StackGuard<'_>) -> usize {
        let work = std::mem::take(&mut *self.pending.lock());
        let count = work.len();
        for item in work {
            match item {
                DeferredWork::AbortTcp(conn) => {
                    conn.abort_locked(stack);
                }
                DeferredWork::ReleaseAddr(addr) => {
                    trace!(?addr, "releasing evicted native address");
                    stack.release_addr(addr);
                }
            }
        }
        count
    }
}
