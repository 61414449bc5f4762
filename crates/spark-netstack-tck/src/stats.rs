use crate::case::{TckCase, TckSuite};
use crate::support::{Harness, v4};
use spark_netstack::NetstackStats;

const CASES: &[TckCase] = &[
    TckCase {
        name: "dump_lists_connections_and_flows",
        test: dump_lists_connections_and_flows,
    },
    TckCase {
        name: "snapshot_counts_live_resources",
        test: snapshot_counts_live_resources,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "stats",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 连接清单：TCP 段按键升序，UDP 段按源地址升序，状态使用小写名称。
fn dump_lists_connections_and_flows() {
    let harness = Harness::new();
    let first = harness.accept(1);
    let second = harness.accept(2);
    second.close_write().expect("半关闭");
    harness
        .datagram(v4(10, 0, 0, 3, 5353), v4(224, 0, 0, 251, 5353), b"mdns")
        .expect("收包");
    harness
        .datagram(v4(10, 0, 0, 2, 5353), v4(224, 0, 0, 251, 5353), b"mdns")
        .expect("收包");

    let expected = format!(
        "tcp connection count: 2, list:\n\
         conn {}: 10.0.0.2:40001 -> 93.184.216.34:80 [connected]\n\
         conn {}: 10.0.0.2:40002 -> 93.184.216.34:80 [write-closed]\n\
         udp connection count: 2, list:\n\
         conn 10.0.0.2:5353: 10.0.0.2:5353\n\
         conn 10.0.0.3:5353: 10.0.0.3:5353\n",
        first.key(),
        second.key(),
    );
    assert_eq!(harness.netstack.dump_connection_stats(), expected);
}

fn snapshot_counts_live_resources() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    harness
        .datagram(v4(10, 0, 0, 2, 5000), v4(1, 1, 1, 1, 53), b"q")
        .expect("收包");
    let flow = harness
        .netstack
        .lookup_udp(spark_netstack::FlowKey::new(v4(10, 0, 0, 2, 5000)))
        .expect("流已建立");
    flow.send_to(b"a", v4(1, 1, 1, 1, 53)).expect("发送");

    assert_eq!(
        harness.netstack.stats(),
        NetstackStats {
            tcp_connections: 1,
            tcp_limit: 1024,
            udp_flows: 1,
            udp_flow_limit: 1024,
            cached_addresses: 1,
            address_cache_capacity: 1024,
            deferred_pending: 0,
        }
    );

    conn.abort();
    assert_eq!(harness.netstack.stats().tcp_connections, 0);
}
