use crate::case::{TckCase, TckSuite};
use crate::support::{Harness, v4};
use spark_netstack::testing::NativeCall;
use spark_netstack::{FlowKey, NetstackConfig, NetstackError};
use std::sync::Arc;
use std::time::Duration;

const CASES: &[TckCase] = &[
    TckCase {
        name: "datagrams_from_one_source_share_a_flow",
        test: datagrams_from_one_source_share_a_flow,
    },
    TckCase {
        name: "send_reuses_cached_destination",
        test: send_reuses_cached_destination,
    },
    TckCase {
        name: "translation_failure_surfaces",
        test: translation_failure_surfaces,
    },
    TckCase {
        name: "explicit_close_notifies_once",
        test: explicit_close_notifies_once,
    },
    TckCase {
        name: "flow_table_evicts_oldest_source",
        test: flow_table_evicts_oldest_source,
    },
    TckCase {
        name: "idle_flows_and_addresses_expire_on_sweep",
        test: idle_flows_and_addresses_expire_on_sweep,
    },
    TckCase {
        name: "rejected_flow_is_not_tracked",
        test: rejected_flow_is_not_tracked,
    },
    TckCase {
        name: "closing_replaced_flow_spares_successor",
        test: closing_replaced_flow_spares_successor,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "udp",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 同一源地址的数据报归入同一条流，不同源地址各建一条。
fn datagrams_from_one_source_share_a_flow() {
    let harness = Harness::new();
    let alice = v4(10, 0, 0, 2, 5000);
    let bob = v4(10, 0, 0, 3, 5000);
    let resolver = v4(1, 1, 1, 1, 53);

    harness.datagram(alice, resolver, b"q1").expect("收包");
    harness.datagram(alice, resolver, b"q2").expect("收包");
    harness.datagram(bob, resolver, b"q3").expect("收包");

    let connected = harness.udp.connected();
    assert_eq!(
        connected,
        vec![(FlowKey::new(alice), resolver), (FlowKey::new(bob), resolver)]
    );
    let received = harness.udp.received();
    assert_eq!(received.len(), 3);
    assert_eq!(received[1].flow, FlowKey::new(alice));
    assert_eq!(received[1].payload, b"q2");
    assert_eq!(received[2].dst, resolver);
    assert_eq!(harness.netstack.stats().udp_flows, 2);
}

/// 回送到同一目的地址只转换一次地址；空载荷不触碰原生栈。
fn send_reuses_cached_destination() {
    let harness = Harness::new();
    let alice = v4(10, 0, 0, 2, 5000);
    let resolver = v4(1, 1, 1, 1, 53);
    harness.datagram(alice, resolver, b"query").expect("收包");
    let flow = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("流已建立");

    assert_eq!(flow.send_to(b"answer-1", resolver), Ok(8));
    assert_eq!(flow.send_to(b"answer-2", resolver), Ok(8));
    assert_eq!(flow.send_to(b"", resolver), Ok(0));

    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::TranslateAddr(..))),
        1
    );
    assert_eq!(
        harness.fake.udp_payloads(),
        vec![b"answer-1".to_vec(), b"answer-2".to_vec()]
    );
    let sources: Vec<_> = harness
        .fake
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            NativeCall::UdpSend { src, port, .. } => Some((src, port)),
            _ => None,
        })
        .collect();
    assert!(sources.iter().all(|entry| *entry == (alice, 53)));
    assert_eq!(flow.bytes_sent(), 16);
    assert_eq!(harness.netstack.stats().cached_addresses, 1);
}

/// 原生地址转换失败时发送返回 `AddressTranslation`，不缓存任何条目。
fn translation_failure_surfaces() {
    let harness = Harness::new();
    let alice = v4(10, 0, 0, 2, 5000);
    let unreachable = v4(203, 0, 113, 9, 53);
    harness.fake.fail_translate(unreachable.ip());
    harness.datagram(alice, unreachable, b"query").expect("收包");
    let flow = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("流已建立");

    assert_eq!(
        flow.send_to(b"answer", unreachable),
        Err(NetstackError::AddressTranslation {
            addr: unreachable.ip()
        })
    );
    assert_eq!(harness.netstack.stats().cached_addresses, 0);
}

/// 显式关闭只通知一次；关闭后发送失败；同源新数据报建立新流。
fn explicit_close_notifies_once() {
    let harness = Harness::new();
    let alice = v4(10, 0, 0, 2, 5000);
    let resolver = v4(1, 1, 1, 1, 53);
    harness.datagram(alice, resolver, b"query").expect("收包");
    let flow = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("流已建立");

    flow.close();
    flow.close();
    assert!(!harness.netstack.close_udp_flow(FlowKey::new(alice)));
    assert_eq!(harness.udp.closed(), vec![FlowKey::new(alice)]);
    assert_eq!(flow.send_to(b"late", resolver), Err(NetstackError::Closed));
    assert_eq!(harness.netstack.stats().udp_flows, 0);

    harness.datagram(alice, resolver, b"again").expect("收包");
    assert_eq!(harness.udp.connected().len(), 2);
    let fresh = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("新流已建立");
    assert!(!fresh.is_closed());
}

/// 流表满时最久未活跃的流被淘汰并收到关闭通知。
fn flow_table_evicts_oldest_source() {
    let harness = Harness::with_config(NetstackConfig {
        max_udp_flows: 2,
        ..NetstackConfig::default()
    });
    let resolver = v4(1, 1, 1, 1, 53);
    let sources: Vec<_> = (2..=4).map(|host| v4(10, 0, 0, host, 5000)).collect();
    for source in &sources {
        harness.datagram(*source, resolver, b"q").expect("收包");
    }

    assert_eq!(harness.udp.closed(), vec![FlowKey::new(sources[0])]);
    assert!(harness.netstack.lookup_udp(FlowKey::new(sources[0])).is_none());
    assert_eq!(harness.netstack.stats().udp_flows, 2);
}

/// 空闲超过 TTL 的流与地址在下一轮清扫中被释放，原生地址结构随之归还。
fn idle_flows_and_addresses_expire_on_sweep() {
    let harness = Harness::new();
    let alice = v4(10, 0, 0, 2, 5000);
    let resolver = v4(1, 1, 1, 1, 53);
    harness.datagram(alice, resolver, b"query").expect("收包");
    let flow = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("流已建立");
    flow.send_to(b"answer", resolver).expect("发送");
    assert_eq!(harness.fake.live_addrs(), 1);

    harness.clock.advance(Duration::from_secs(30));
    assert_eq!(harness.netstack.sweep_now().expired_flows, 0);

    harness.clock.advance(Duration::from_secs(31));
    let report = harness.netstack.sweep_now();
    assert_eq!(report.expired_flows, 1);
    assert_eq!(report.expired_addresses, 1);
    assert_eq!(report.reaped, 1);
    assert!(flow.is_closed());
    assert_eq!(harness.fake.live_addrs(), 0);
    assert_eq!(harness.udp.closed(), vec![FlowKey::new(alice)]);
}

/// Handler 拒绝建流：数据报被丢弃，流表中不留下条目。
fn rejected_flow_is_not_tracked() {
    let harness = Harness::new();
    harness.udp.reject_new(true);
    let result = harness.datagram(v4(10, 0, 0, 2, 5000), v4(1, 1, 1, 1, 53), b"query");
    assert!(matches!(result, Err(NetstackError::Handler { .. })));
    assert!(harness.udp.received().is_empty());
    assert_eq!(harness.netstack.stats().udp_flows, 0);
}

/// 旧流被淘汰、同源地址建立新流后，再关闭旧外壳不得移除新流，新流仍只在自身关闭时通知一次。
fn closing_replaced_flow_spares_successor() {
    let harness = Harness::with_config(NetstackConfig {
        max_udp_flows: 1,
        ..NetstackConfig::default()
    });
    let alice = v4(10, 0, 0, 2, 5000);
    let bob = v4(10, 0, 0, 3, 5000);
    let resolver = v4(1, 1, 1, 1, 53);

    harness.datagram(alice, resolver, b"q1").expect("收包");
    let stale = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("流已建立");
    harness.datagram(bob, resolver, b"q2").expect("收包");
    harness.datagram(alice, resolver, b"q3").expect("收包");
    let successor = harness
        .netstack
        .lookup_udp(FlowKey::new(alice))
        .expect("新流已建立");
    assert!(!Arc::ptr_eq(&stale, &successor));

    stale.close();
    assert!(!successor.is_closed());
    assert!(harness.netstack.lookup_udp(FlowKey::new(alice)).is_some());

    successor.close();
    let closed = harness.udp.closed();
    assert_eq!(
        closed,
        vec![FlowKey::new(alice), FlowKey::new(bob), FlowKey::new(alice)]
    );
    assert_eq!(harness.netstack.stats().udp_flows, 0);
}
