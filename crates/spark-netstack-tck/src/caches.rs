use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use parking_lot::Mutex;
use spark_netstack::testing::NativeCall;
use spark_netstack::{
    EventVerdict, EvictReason, ManualClock, NetstackConfig, NetstackError, ResourceCache,
    TcpHandle, TcpOverflowPolicy,
};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

const CASES: &[TckCase] = &[
    TckCase {
        name: "capacity_overflow_evicts_exactly_one",
        test: capacity_overflow_evicts_exactly_one,
    },
    TckCase {
        name: "ttl_sweep_spares_extended_entries",
        test: ttl_sweep_spares_extended_entries,
    },
    TckCase {
        name: "tcp_ceiling_evicts_least_recently_active",
        test: tcp_ceiling_evicts_least_recently_active,
    },
    TckCase {
        name: "refuse_policy_rejects_at_limit",
        test: refuse_policy_rejects_at_limit,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "caches",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

type Released = Arc<Mutex<Vec<(u32, EvictReason)>>>;

fn recording_cache(
    capacity: usize,
    ttl: Option<Duration>,
    clock: Arc<ManualClock>,
) -> (ResourceCache<u32, String>, Released) {
    let released: Released = Arc::default();
    let sink = Arc::clone(&released);
    let cache = ResourceCache::new(
        NonZeroUsize::new(capacity).expect("容量为正"),
        ttl,
        clock,
        Box::new(move |key: u32, _value: String, reason: EvictReason| {
            sink.lock().push((key, reason));
        }),
    );
    (cache, released)
}

/// 插入第 capacity+1 个条目：恰好一次释放回调，对象是最久未使用的条目。
fn capacity_overflow_evicts_exactly_one() {
    let (cache, released) = recording_cache(3, None, Arc::new(ManualClock::new()));
    for key in 1..=3 {
        cache.insert(key, format!("value-{key}"));
    }
    assert_eq!(cache.get(&1).as_deref(), Some("value-1"));

    cache.insert(4, "value-4".to_owned());
    assert_eq!(*released.lock(), vec![(2, EvictReason::Capacity)]);
    assert_eq!(cache.len(), 3);
    assert!(cache.contains(&1));
    assert!(!cache.contains(&2));
}

/// 超过 TTL 未活跃的条目在下一轮清扫后消失；窗口内续期的条目保留。
fn ttl_sweep_spares_extended_entries() {
    let clock = Arc::new(ManualClock::new());
    let ttl = Duration::from_secs(10);
    let (cache, released) = recording_cache(8, Some(ttl), clock.clone());
    cache.insert(1, "kept".to_owned());
    cache.insert(2, "idle".to_owned());

    clock.advance(Duration::from_secs(6));
    assert!(cache.extend(&1, Some(ttl)));
    clock.advance(Duration::from_secs(6));

    assert_eq!(cache.sweep(), 1);
    assert_eq!(*released.lock(), vec![(2, EvictReason::Expired)]);
    assert!(cache.contains(&1));
    assert!(!cache.contains(&2));
}

/// TCP 连接上限按最近活跃顺序淘汰：收到数据的连接被保留，最久未活跃的被中止。
fn tcp_ceiling_evicts_least_recently_active() {
    let harness = Harness::with_config(NetstackConfig {
        max_tcp_connections: 2,
        ..NetstackConfig::default()
    });
    let first = harness.accept(1);
    let second = harness.accept(2);
    assert_eq!(harness.deliver(first.key(), b"keepalive"), Ok(EventVerdict::Handled));

    let third = harness.accept(3);
    assert!(!first.is_closed());
    assert!(second.is_closed());
    assert!(!third.is_closed());
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::Abort(TcpHandle(2))),
        1
    );
    assert_eq!(harness.netstack.stats().tcp_connections, 2);
}

/// `Refuse` 策略：达到上限时新连接被中止并返回 `ConnectionLimit`，已有连接不受影响。
fn refuse_policy_rejects_at_limit() {
    let harness = Harness::with_config(NetstackConfig {
        max_tcp_connections: 1,
        tcp_overflow: TcpOverflowPolicy::Refuse,
        ..NetstackConfig::default()
    });
    let first = harness.accept(1);

    let refused = harness.try_accept(2).map(|_| ());
    assert_eq!(refused, Err(NetstackError::ConnectionLimit { limit: 1 }));
    assert!(!first.is_closed());
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::Abort(TcpHandle(2))),
        1
    );

    first.abort();
    let replacement = harness.accept(3);
    assert!(!replacement.is_closed());
}
