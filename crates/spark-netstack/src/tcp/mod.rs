//! # tcp 模块说明
//!
//! ## 角色定位（Why）
//! - 管理全部已接入 TCP 连接：身份注册、连接数上限与最近活跃顺序、原生事件分发；
//! - 单条连接的状态机位于 [`conn`]，本模块负责“连接集合”层面的策略。
//!
//! ## 行为契约（What）
//! - 注册表（无界，按 `ConnKey` 查找）与上限表（有界，仅维护最近活跃顺序）分离；
//! - 达到上限时按 [`TcpOverflowPolicy`] 处置：`EvictOldest` 把最久未活跃的连接登记为待中止，
//!   `Refuse` 直接拒绝新连接；
//! - 淘汰回调只登记工作，真正的原生中止在下一次持有全局锁时执行。

mod backpressure;
mod conn;
mod state;

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

pub use backpressure::WriteReadiness;
pub use conn::{TcpConnection, TcpCounters, TcpHandler, TcpPatch};
pub use state::TcpState;

use crate::cache::{EvictReason, ResourceCache};
use crate::clock::Clock;
use crate::config::TcpOverflowPolicy;
use crate::deferred::{DeferredQueue, DeferredWork};
use crate::error::{NetstackError, Result};
use crate::native::{StackGuard, StackLock, TcpHandle};
use crate::registry::{ConnKey, IdentityRegistry};

/// 原生事件处理结论，驱动据此决定回调返回值。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventVerdict {
    /// 事件已处理，连接仍然存活。
    Handled,
    /// 连接已在本次事件中（或此前）完成拆除，原生句柄不得再使用。
    Closed,
    /// 连接在本次事件中被硬中止；在原生回调内部时驱动必须向原生栈报告“已中止”。
    Aborted,
    /// 键未注册：连接已拆除或从未接入，按空操作处理。
    UnknownKey,
}

impl EventVerdict {
    pub fn is_aborted(self) -> bool {
        self == EventVerdict::Aborted
    }
}

/// 连接集合。
pub(crate) struct TcpTable {
    registry: IdentityRegistry<Arc<TcpConnection>>,
    ceiling: ResourceCache<ConnKey, Arc<TcpConnection>>,
    policy: Mutex<TcpOverflowPolicy>,
    handler: Arc<dyn TcpHandler>,
    stack: Arc<StackLock>,
    deferred: Arc<DeferredQueue>,
}

impl TcpTable {
    pub(crate) fn new(
        limit: NonZeroUsize,
        policy: TcpOverflowPolicy,
        clock: Arc<dyn Clock>,
        handler: Arc<dyn TcpHandler>,
        stack: Arc<StackLock>,
        deferred: Arc<DeferredQueue>,
    ) -> Self {
        let sink = Arc::clone(&deferred);
        let ceiling = ResourceCache::new(
            limit,
            None,
            clock,
            Box::new(move |key: ConnKey, conn: Arc<TcpConnection>, reason: EvictReason| {
                debug!(%key, ?reason, "connection evicted from table, scheduling abort");
                conn.mark_aborting();
                sink.push(DeferredWork::AbortTcp(conn));
            }),
        );
        Self {
            registry: IdentityRegistry::new(),
            ceiling,
            policy: Mutex::new(policy),
            handler,
            stack,
            deferred,
        }
    }

    /// 接入新连接。
    ///
    /// # 契约说明（What）
    /// - 成功时连接已注册、已绑定键并处于 `Connected`；
    /// - 失败时原生连接已被中止，驱动只需向原生栈报告“已中止”；
    /// - `EvictOldest` 策略下被淘汰的旧连接在返回前完成中止。
    pub(crate) fn accept(
        self: &Arc<Self>,
        stack: &mut StackGuard<'_>,
        handle: TcpHandle,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<Arc<TcpConnection>> {
        let limit = self.ceiling.capacity().get();
        if *self.policy.lock() == TcpOverflowPolicy::Refuse && self.ceiling.len() >= limit {
            warn!(limit, %remote, "connection limit reached, refusing connection");
            stack.abort(handle);
            return Err(NetstackError::ConnectionLimit { limit });
        }

        let key = self.registry.allocate();
        let conn = Arc::new(TcpConnection::new(
            key,
            handle,
            local,
            remote,
            Arc::clone(&self.stack),
            Arc::downgrade(self),
        ));
        stack.attach(handle, key);
        self.registry.register(key, Arc::clone(&conn));
        conn.advance(TcpState::Connecting);
        self.ceiling.insert(key, Arc::clone(&conn));

        match self.handler.on_connect(&conn, remote) {
            Ok(patch) => {
                conn.install_patch(patch);
                conn.advance(TcpState::Connected);
            }
            Err(err) => {
                warn!(%key, %err, "handler rejected connection");
                conn.abort_locked(stack);
                self.deferred.reap(stack);
                return Err(err);
            }
        }
        self.deferred.reap(stack);
        debug!(%key, %local, %remote, "connection accepted");
        Ok(conn)
    }

    /// 按键查找连接并刷新其最近活跃位置。
    pub(crate) fn lookup(&self, key: ConnKey) -> Option<Arc<TcpConnection>> {
        let conn = self.registry.lookup(key)?;
        self.ceiling.touch(&key);
        Some(conn)
    }

    /// 从注册表与上限表中移除，由拆除路径调用。
    pub(crate) fn forget(&self, key: ConnKey) {
        self.registry.remove(key);
        self.ceiling.remove(&key);
    }

    pub(crate) fn set_limit(&self, limit: NonZeroUsize) {
        self.ceiling.resize(limit);
    }

    pub(crate) fn set_policy(&self, policy: TcpOverflowPolicy) {
        *self.policy.lock() = policy;
    }

    pub(crate) fn limit(&self) -> usize {
        self.ceiling.capacity().get()
    }

    pub(crate) fn len(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<(ConnKey, Arc<TcpConnection>)> {
        self.registry.snapshot()
    }

    /// 中止全部存活连接，返回数量。
    pub(crate) fn abort_all(&self, stack: &mut StackGuard<'_>) -> usize {
        let live = self.registry.snapshot();
        for (_, conn) in &live {
            conn.abort_locked(stack);
        }
        live.len()
    }
}
