//! # ResourceCache：带 LRU 淘汰与 TTL 过期的有界缓存
//!
//! ## 核心意图（Why）
//! - 同一套缓存设计服务三个用途：UDP 流表、原生地址缓存、TCP 连接数上限表；
//! - 淘汰必须触发释放回调，让持有原生资源的条目有机会归还资源。
//!
//! ## 行为契约（What）
//! - 容量满时 `insert` 淘汰最久未使用的条目；`sweep` 清理超过 TTL 的条目；
//! - `remove` 返回条目但**不**触发释放回调，只有容量、TTL 与 `resize` 淘汰才会触发；
//! - 释放回调在缓存内部锁释放之后、触发淘汰的调用返回之前同步执行，
//!   回调内部可以再次访问本缓存而不会死锁。
//!
//! ## 实现提示（How）
//! - 底层为 `lru::LruCache`，外包 `parking_lot::Mutex`；
//! - 每个条目记录最后活跃时间与可选 TTL，时间来源为可注入的 [`Clock`]。
//!
//! ## 风险提示（Trade-offs）
//! - 释放回调不得在内部等待原生栈完成关闭，只允许释放内存或登记异步工作；
//!   需要全局锁的工作应投递到延迟队列。

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::clock::Clock;

/// 条目被淘汰的原因，随释放回调一并交付。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictReason {
    /// 插入时容量已满，淘汰最久未使用的条目。
    Capacity,
    /// 超过 TTL，由清扫或读取时发现。
    Expired,
    /// 在线缩容。
    Resized,
    /// 关停时整体清空。
    Cleared,
}

/// 释放回调签名。
pub type ReleaseFn<K, V> = Box<dyn Fn(K, V, EvictReason) + Send + Sync>;

struct Slot<V> {
    value: V,
    touched: Instant,
    ttl: Option<Duration>,
}

impl<V> Slot<V> {
    fn expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.touched) > ttl)
    }
}

struct Inner<K: Hash + Eq, V> {
    entries: LruCache<K, Slot<V>>,
    default_ttl: Option<Duration>,
}

/// 通用有界缓存。
///
/// # 教案式注释
/// - **意图 (Why)**：把“容量上限 + 新鲜度”两种淘汰策略收敛到一个类型，避免三处各写一套；
/// - **契约 (What)**：
///   - `K` 需要 `Clone` 以便清扫时先收集过期键再逐一弹出；
///   - `V` 需要 `Clone`，读取返回值拷贝（通常是 `Arc`），调用方不持有内部锁；
/// - **风险 (Trade-offs)**：所有操作共享一把锁，缓存不适合承载高频大对象。
pub struct ResourceCache<K: Hash + Eq, V> {
    inner: Mutex<Inner<K, V>>,
    clock: Arc<dyn Clock>,
    release: ReleaseFn<K, V>,
}

impl<K: Hash + Eq, V> fmt::Debug for ResourceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ResourceCache")
            .field("len", &inner.entries.len())
            .field("capacity", &inner.entries.cap())
            .field("default_ttl", &inner.default_ttl)
            .finish()
    }
}

impl<K, V> ResourceCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// 构造缓存；`default_ttl` 为 `None` 时条目只受容量约束。
    pub fn new(
        capacity: NonZeroUsize,
        default_ttl: Option<Duration>,
        clock: Arc<dyn Clock>,
        release: ReleaseFn<K, V>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(capacity),
                default_ttl,
            }),
            clock,
            release,
        }
    }

    /// 读取并提升为最近使用；不刷新活跃时间。
    ///
    /// 已过期但尚未被清扫的条目视为缺失，并立即以 [`EvictReason::Expired`] 释放。
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|slot| slot.expired(now)) {
            None => return None,
            Some(false) => return inner.entries.peek(key).map(|slot| slot.value.clone()),
            Some(true) => {}
        }
        let expired = inner.entries.pop_entry(key);
        drop(inner);
        if let Some((key, slot)) = expired {
            (self.release)(key, slot.value, EvictReason::Expired);
        }
        None
    }

    /// 读取但不改变最近使用顺序，也不检查过期。
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner
            .lock()
            .entries
            .peek(key)
            .map(|slot| slot.value.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains(key)
    }

    /// 以默认 TTL 插入。
    ///
    /// 键已存在时替换值并返回旧值（不触发回调）；容量已满时淘汰最久未使用的条目并触发回调。
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let ttl = self.inner.lock().default_ttl;
        self.insert_with_ttl(key, value, ttl)
    }

    /// 以指定 TTL 插入，语义同 [`insert`](Self::insert)。
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Option<Duration>) -> Option<V> {
        let slot = Slot {
            value,
            touched: self.clock.now(),
            ttl,
        };
        let pushed = {
            let mut inner = self.inner.lock();
            inner.entries.push(key.clone(), slot)
        };
        match pushed {
            Some((old_key, old)) if old_key == key => Some(old.value),
            Some((evicted_key, evicted)) => {
                trace!("cache full, evicting least recently used entry");
                (self.release)(evicted_key, evicted.value, EvictReason::Capacity);
                None
            }
            None => None,
        }
    }

    /// 移除条目并返回值，不触发释放回调。
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.pop(key).map(|slot| slot.value)
    }

    /// 仅当 `pred` 对当前值成立时移除，检查与移除在同一次加锁内完成；不触发释放回调。
    pub fn remove_if(&self, key: &K, pred: impl FnOnce(&V) -> bool) -> Option<V> {
        let mut inner = self.inner.lock();
        if !inner.entries.peek(key).is_some_and(|slot| pred(&slot.value)) {
            return None;
        }
        inner.entries.pop(key).map(|slot| slot.value)
    }

    /// 刷新活跃时间、提升为最近使用，并替换 TTL；不重新插入。
    ///
    /// 返回 `false` 表示键不存在。
    pub fn extend(&self, key: &K, ttl: Option<Duration>) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(slot) => {
                slot.touched = now;
                slot.ttl = ttl;
                true
            }
            None => false,
        }
    }

    /// 刷新活跃时间并提升为最近使用，保留原有 TTL。
    pub fn touch(&self, key: &K) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(key) {
            Some(slot) => {
                slot.touched = now;
                true
            }
            None => false,
        }
    }

    /// 在线调整容量；缩容时按最久未使用顺序淘汰多出的条目并触发回调。
    pub fn resize(&self, capacity: NonZeroUsize) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();
            while inner.entries.len() > capacity.get() {
                match inner.entries.pop_lru() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
            inner.entries.resize(capacity);
        }
        self.release_all(evicted, EvictReason::Resized);
    }

    /// 修改之后插入条目使用的默认 TTL；已有条目可通过 [`set_ttl_all`](Self::set_ttl_all) 同步。
    pub fn set_default_ttl(&self, ttl: Option<Duration>) {
        self.inner.lock().default_ttl = ttl;
    }

    /// 同时修改默认 TTL 与全部已有条目的 TTL，活跃时间保持不变。
    pub fn set_ttl_all(&self, ttl: Option<Duration>) {
        let mut inner = self.inner.lock();
        inner.default_ttl = ttl;
        for (_, slot) in inner.entries.iter_mut() {
            slot.ttl = ttl;
        }
    }

    pub fn default_ttl(&self) -> Option<Duration> {
        self.inner.lock().default_ttl
    }

    /// 清扫全部过期条目并返回清理数量。
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut expired = Vec::new();
        {
            let mut inner = self.inner.lock();
            let keys: Vec<K> = inner
                .entries
                .iter()
                .filter(|(_, slot)| slot.expired(now))
                .map(|(key, _)| key.clone())
                .collect();
            for key in keys {
                if let Some(entry) = inner.entries.pop_entry(&key) {
                    expired.push(entry);
                }
            }
        }
        let count = expired.len();
        self.release_all(expired, EvictReason::Expired);
        count
    }

    /// 清空缓存，对每个条目以 [`EvictReason::Cleared`] 触发回调。
    pub fn clear(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut inner = self.inner.lock();
            while let Some(entry) = inner.entries.pop_lru() {
                drained.push(entry);
            }
        }
        let count = drained.len();
        self.release_all(drained, EvictReason::Cleared);
        count
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.inner.lock().entries.cap()
    }

    /// 按最近使用到最久未使用的顺序复制全部条目。
    pub fn entries(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect()
    }

    fn release_all(&self, entries: Vec<(K, Slot<V>)>, reason: EvictReason) {
        for (key, slot) in entries {
            (self.release)(key, slot.value, reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    type Log = Arc<Mutex<Vec<(u32, EvictReason)>>>;

    fn cache(capacity: usize, ttl: Option<Duration>) -> (ResourceCache<u32, u32>, ManualClock, Log) {
        let clock = ManualClock::new();
        let log: Log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let cache = ResourceCache::new(
            NonZeroUsize::new(capacity).expect("测试容量必须非零"),
            ttl,
            Arc::new(clock.clone()),
            Box::new(move |key, _value, reason| sink.lock().push((key, reason))),
        );
        (cache, clock, log)
    }

    #[test]
    fn insert_beyond_capacity_evicts_least_recently_used_once() {
        let (cache, _clock, log) = cache(3, None);
        for key in 0..3 {
            cache.insert(key, key * 10);
        }
        // 读取 0 使其成为最近使用，1 变为最久未使用。
        assert_eq!(cache.get(&0), Some(0));
        cache.insert(3, 30);

        assert_eq!(cache.len(), 3);
        assert_eq!(*log.lock(), vec![(1, EvictReason::Capacity)]);
        assert!(cache.peek(&1).is_none());
    }

    #[test]
    fn remove_if_only_pops_matching_value() {
        let (cache, _clock, log) = cache(4, None);
        cache.insert(1, 10);

        assert_eq!(cache.remove_if(&1, |value| *value == 11), None);
        assert_eq!(cache.peek(&1), Some(10));
        // 同键被替换为新值后，针对旧值的移除不得波及新值。
        cache.insert(1, 11);
        assert_eq!(cache.remove_if(&1, |value| *value == 10), None);
        assert_eq!(cache.remove_if(&1, |value| *value == 11), Some(11));
        assert!(!cache.contains(&1));
        assert_eq!(cache.remove_if(&2, |_| true), None);
        assert!(log.lock().is_empty(), "remove_if 不触发释放回调");
    }

    #[test]
    fn extend_protects_entry_from_capacity_eviction() {
        let (cache, _clock, log) = cache(2, None);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert!(cache.extend(&1, None));
        cache.insert(3, 3);
        assert_eq!(*log.lock(), vec![(2, EvictReason::Capacity)]);
    }

    #[test]
    fn replacing_existing_key_returns_old_value_without_callback() {
        let (cache, _clock, log) = cache(1, None);
        cache.insert(7, 1);
        assert_eq!(cache.insert(7, 2), Some(1));
        assert_eq!(cache.peek(&7), Some(2));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn remove_does_not_run_release_callback() {
        let (cache, _clock, log) = cache(4, None);
        cache.insert(1, 1);
        assert_eq!(cache.remove(&1), Some(1));
        assert_eq!(cache.remove(&1), None);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn sweep_drops_idle_entries_and_keeps_extended_ones() {
        let ttl = Duration::from_secs(60);
        let (cache, clock, log) = cache(8, Some(ttl));
        cache.insert(1, 1);
        cache.insert(2, 2);

        clock.advance(Duration::from_secs(40));
        assert!(cache.extend(&2, Some(ttl)));
        clock.advance(Duration::from_secs(21));

        assert_eq!(cache.sweep(), 1);
        assert!(cache.peek(&1).is_none());
        assert_eq!(cache.peek(&2), Some(2));
        assert_eq!(*log.lock(), vec![(1, EvictReason::Expired)]);
    }

    #[test]
    fn get_treats_expired_entry_as_missing() {
        let (cache, clock, log) = cache(2, Some(Duration::from_secs(1)));
        cache.insert(5, 5);
        clock.advance(Duration::from_secs(2));
        assert_eq!(cache.get(&5), None);
        assert_eq!(*log.lock(), vec![(5, EvictReason::Expired)]);
        assert!(cache.is_empty());
    }

    #[test]
    fn shrinking_evicts_oldest_entries_with_callbacks() {
        let (cache, _clock, log) = cache(4, None);
        for key in 0..4 {
            cache.insert(key, key);
        }
        cache.resize(NonZeroUsize::new(2).expect("非零"));

        assert_eq!(cache.capacity().get(), 2);
        assert_eq!(
            *log.lock(),
            vec![(0, EvictReason::Resized), (1, EvictReason::Resized)]
        );
        let keys: Vec<u32> = cache.entries().into_iter().map(|(key, _)| key).collect();
        assert_eq!(keys, vec![3, 2]);
    }

    #[test]
    fn release_callback_may_reenter_cache() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let observed = Arc::new(Mutex::new(None));
        let cache: Arc<ResourceCache<u32, u32>> = Arc::new_cyclic(|weak: &std::sync::Weak<ResourceCache<u32, u32>>| {
            let weak = weak.clone();
            let observed = Arc::clone(&observed);
            ResourceCache::new(
                NonZeroUsize::new(1).expect("非零"),
                None,
                clock,
                Box::new(move |_, _, _| {
                    if let Some(cache) = weak.upgrade() {
                        *observed.lock() = Some(cache.len());
                    }
                }),
            )
        });
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert_eq!(*observed.lock(), Some(1));
    }

    proptest! {
        #[test]
        fn prop_len_never_exceeds_capacity(
            capacity in 1usize..16,
            ops in proptest::collection::vec((0u32..32, any::<bool>()), 1..128),
        ) {
            let (cache, _clock, log) = cache(capacity, None);
            let mut inserted = 0usize;
            for (key, remove) in ops {
                if remove {
                    cache.remove(&key);
                } else if cache.insert(key, key).is_none() {
                    inserted += 1;
                }
                prop_assert!(cache.len() <= capacity);
            }
            let evictions = log.lock().len();
            prop_assert!(evictions <= inserted);
        }
    }
}
