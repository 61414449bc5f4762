//! # IdentityRegistry：连接键到连接对象的映射
//!
//! ## 核心意图（Why）
//! - 原生回调只能携带一个不透明的整数值跨调用传递，语言侧引用在调用返回后即失效；
//!   注册表是异步原生回调找回完整连接对象的唯一途径；
//! - 原生事件线程并发查找、任意线程并发移除，因此基于 `DashMap` 提供分片并发。
//!
//! ## 行为契约（What）
//! - `allocate`：生成当前未注册的键，计数器回绕或碰撞时重试；
//! - `register`：插入新条目，键已存在视为身份映射损坏，直接 panic；
//! - `lookup`：O(1) 查找，未命中是正常结果（中止与迟到事件之间的窗口），调用方按空操作处理；
//! - `remove`：幂等移除，重复调用静默返回 `None`。
//!
//! ## 风险提示（Trade-offs）
//! - `lookup` 返回克隆值而不是 guard，避免调用方持有分片锁时回调进入用户代码。

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::debug;

/// 进程内唯一的连接键，原生栈在后续回调中原样回放。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnKey(u32);

impl ConnKey {
    /// 以原始整数构造键，供原生胶水层把回调参数还原为键。
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// 返回原生侧需要保存的整数值。
    pub const fn into_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ConnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// 基于 `DashMap` 的身份注册表。
///
/// # 教案式注释
/// - **意图 (Why)**：封装并发安全存储，避免上层直接操作 `DashMap`；
/// - **契约 (What)**：`T` 通常是 `Arc<TcpConnection>`，即键对应的强所有权句柄；
/// - **风险 (Trade-offs)**：键空间为 32 位，计数器回绕后依赖碰撞检测跳过仍存活的键。
#[derive(Debug)]
pub struct IdentityRegistry<T> {
    entries: DashMap<ConnKey, T>,
    next: AtomicU32,
}

impl<T> Default for IdentityRegistry<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            next: AtomicU32::new(1),
        }
    }
}

impl<T: Clone> IdentityRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 生成一个当前未注册的键。
    ///
    /// 零值保留给原生侧表示“未绑定”，因此跳过。
    pub fn allocate(&self) -> ConnKey {
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            if raw == 0 {
                continue;
            }
            let key = ConnKey(raw);
            if !self.entries.contains_key(&key) {
                return key;
            }
            debug!(%key, "connection key still live after wraparound, retrying");
        }
    }

    /// 注册新条目。
    ///
    /// # Panics
    /// 键仍处于注册状态时 panic：这意味着身份映射已被破坏，不存在可恢复的处理方式。
    pub fn register(&self, key: ConnKey, value: T) {
        match self.entries.entry(key) {
            Entry::Occupied(_) => panic!("connection key {key} registered twice"),
            Entry::Vacant(vacant) => {
                vacant.insert(value);
            }
        }
    }

    /// 按键查找，未命中返回 `None`。
    pub fn lookup(&self, key: ConnKey) -> Option<T> {
        self.entries.get(&key).map(|entry| entry.value().clone())
    }

    /// 移除并返回条目；重复移除是静默的空操作。
    pub fn remove(&self, key: ConnKey) -> Option<T> {
        self.entries.remove(&key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: ConnKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 复制当前全部条目，按键排序，供统计与关停路径遍历。
    pub fn snapshot(&self) -> Vec<(ConnKey, T)> {
        let mut entries: Vec<(ConnKey, T)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(key, _)| *key);
        entries
    }

    #[cfg(test)]
    fn seed_counter(&self, raw: u32) {
        self.next.store(raw, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn register_lookup_remove_round() {
        let registry = IdentityRegistry::new();
        let key = registry.allocate();
        let value = Arc::new("conn");
        registry.register(key, Arc::clone(&value));

        let found = registry.lookup(key).expect("刚注册的键必须可查");
        assert!(Arc::ptr_eq(&found, &value), "查找结果必须是同一个对象");

        assert!(registry.remove(key).is_some());
        assert!(registry.lookup(key).is_none(), "移除后查找必须未命中");
        assert!(registry.remove(key).is_none(), "重复移除是空操作");
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_registration_is_fatal() {
        let registry = IdentityRegistry::new();
        let key = registry.allocate();
        registry.register(key, 1);
        registry.register(key, 2);
    }

    #[test]
    fn allocate_skips_zero_and_live_keys_after_wraparound() {
        let registry = IdentityRegistry::new();
        registry.register(ConnKey::from_raw(1), "live");
        registry.seed_counter(u32::MAX);

        assert_eq!(registry.allocate(), ConnKey::from_raw(u32::MAX));
        // 计数器回绕到 0（保留）与 1（仍存活），下一个可用键是 2。
        assert_eq!(registry.allocate(), ConnKey::from_raw(2));
    }

    proptest! {
        #[test]
        fn prop_register_then_lookup_returns_same_value(values in proptest::collection::vec(any::<u64>(), 1..64)) {
            let registry = IdentityRegistry::new();
            let keys: Vec<ConnKey> = values
                .iter()
                .map(|value| {
                    let key = registry.allocate();
                    registry.register(key, *value);
                    key
                })
                .collect();

            for (key, value) in keys.iter().zip(values.iter()) {
                prop_assert_eq!(registry.lookup(*key), Some(*value));
            }
            for key in &keys {
                prop_assert!(registry.remove(*key).is_some());
                prop_assert!(registry.lookup(*key).is_none());
                prop_assert!(registry.remove(*key).is_none());
            }
            prop_assert!(registry.is_empty());
        }
    }
}
