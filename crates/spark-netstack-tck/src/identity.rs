use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use spark_netstack::testing::NativeCall;
use spark_netstack::{ConnKey, IdentityRegistry, TcpHandle};
use std::collections::HashSet;

const CASES: &[TckCase] = &[
    TckCase {
        name: "keys_resolve_until_removed",
        test: keys_resolve_until_removed,
    },
    TckCase {
        name: "accepted_connections_bind_and_release_keys_once",
        test: accepted_connections_bind_and_release_keys_once,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "identity",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 注册后的键可以查回原值，移除后查找失败，重复移除是空操作。
fn keys_resolve_until_removed() {
    let registry = IdentityRegistry::new();
    let keys: Vec<ConnKey> = (0..100u32)
        .map(|value| {
            let key = registry.allocate();
            registry.register(key, value);
            key
        })
        .collect();

    let unique: HashSet<_> = keys.iter().copied().collect();
    assert_eq!(unique.len(), keys.len(), "分配的键必须互不相同");

    for (value, key) in keys.iter().enumerate() {
        assert_eq!(registry.lookup(*key), Some(value as u32));
    }
    for key in keys.iter().step_by(2) {
        assert!(registry.remove(*key).is_some());
        assert!(registry.lookup(*key).is_none());
        assert!(registry.remove(*key).is_none(), "重复移除应为空操作");
    }
    assert_eq!(registry.len(), 50);
}

/// 接入时绑定键，任意次中止后原生键存储只释放一次。
fn accepted_connections_bind_and_release_keys_once() {
    let harness = Harness::new();
    let conns: Vec<_> = (1..=3).map(|handle| harness.accept(handle)).collect();

    for conn in &conns {
        let key = conn.key();
        let handle = conn.handle();
        assert_eq!(
            harness
                .fake
                .count(|call| *call == NativeCall::Attach(handle, key)),
            1
        );
        assert!(harness.netstack.lookup_tcp(key).is_some());
    }

    let victim = &conns[1];
    victim.abort();
    victim.abort();
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::ReleaseKey(victim.key())),
        1
    );
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::Abort(TcpHandle(2))),
        1
    );
    assert!(harness.netstack.lookup_tcp(victim.key()).is_none());
    assert_eq!(harness.netstack.stats().tcp_connections, 2);
}
