use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use crate::cache::{EvictReason, ResourceCache};
use crate::clock::Clock;
use crate::deferred::{DeferredQueue, DeferredWork};
use crate::error::{NetstackError, Result};
use crate::native::{NativeAddr, StackGuard};

/// 目的地址缓存：IP 到原生地址结构的映射。
///
/// # 教案式注释
/// - **意图 (Why)**：热点目的地址每次发送都重新分配、解析原生地址结构代价较高；
/// - **契约 (What)**：缓存独占原生地址结构，淘汰时登记到延迟队列，在持有全局锁时释放；
///   条目自插入起计算 TTL，命中不会续期；
/// - **风险 (Trade-offs)**：释放被推迟到下一个持锁点，短时间内原生侧会多持有少量地址结构。
pub(crate) struct AddressCache {
    cache: ResourceCache<IpAddr, NativeAddr>,
    deferred: Arc<DeferredQueue>,
}

impl AddressCache {
    pub(crate) fn new(
        capacity: NonZeroUsize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
        deferred: Arc<DeferredQueue>,
    ) -> Self {
        let sink = Arc::clone(&deferred);
        let cache = ResourceCache::new(
            capacity,
            Some(ttl),
            clock,
            Box::new(move |ip: IpAddr, addr: NativeAddr, reason: EvictReason| {
                trace!(%ip, ?reason, "native address evicted");
                sink.push(DeferredWork::ReleaseAddr(addr));
            }),
        );
        Self { cache, deferred }
    }

    /// 解析目的地址，命中缓存时不触碰原生栈。
    pub(crate) fn resolve(&self, stack: &mut StackGuard<'_>, ip: IpAddr) -> Result<NativeAddr> {
        if let Some(addr) = self.cache.get(&ip) {
            return Ok(addr);
        }
        let Some(addr) = stack.translate_addr(ip) else {
            warn!(%ip, "native stack failed to translate address");
            return Err(NetstackError::AddressTranslation { addr: ip });
        };
        self.cache.insert(ip, addr);
        self.deferred.reap(stack);
        Ok(addr)
    }

    pub(crate) fn resize(&self, capacity: NonZeroUsize) {
        self.cache.resize(capacity);
    }

    pub(crate) fn set_ttl(&self, ttl: Duration) {
        self.cache.set_ttl_all(Some(ttl));
    }

    pub(crate) fn sweep(&self) -> usize {
        self.cache.sweep()
    }

    pub(crate) fn clear(&self) -> usize {
        self.cache.clear()
    }

    pub(crate) fn len(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.cache.capacity().get()
    }
}
