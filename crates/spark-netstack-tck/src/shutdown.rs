use crate::case::{TckCase, TckSuite};
use crate::support::{Harness, v4};
use spark_netstack::testing::NativeCall;
use spark_netstack::{FlowKey, NetstackConfig, NetstackError, TcpOverflowPolicy};

const CASES: &[TckCase] = &[
    TckCase {
        name: "drop_releases_every_resource",
        test: drop_releases_every_resource,
    },
    TckCase {
        name: "toml_config_applies_live",
        test: toml_config_applies_live,
    },
    TckCase {
        name: "invalid_config_changes_nothing",
        test: invalid_config_changes_nothing,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "shutdown",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 丢弃桥接层即关停：连接被中止、流收到关闭通知、原生地址全部归还。
fn drop_releases_every_resource() {
    let Harness {
        netstack,
        fake,
        udp,
        ..
    } = Harness::new();
    let conns: Vec<_> = {
        let mut stack = netstack.lock();
        (1..=2)
            .map(|handle| {
                netstack
                    .tcp_accept(
                        &mut stack,
                        spark_netstack::TcpHandle(handle),
                        crate::support::client(handle),
                        crate::support::server(),
                    )
                    .expect("接入连接")
            })
            .collect()
    };
    {
        let mut stack = netstack.lock();
        let mut view = spark_netstack::ReceiveView::contiguous(b"q");
        netstack
            .udp_input(
                &mut stack,
                spark_netstack::UdpHandle(1),
                v4(10, 0, 0, 2, 5000),
                v4(1, 1, 1, 1, 53),
                &mut view,
            )
            .expect("收包");
    }
    let flow = netstack
        .lookup_udp(FlowKey::new(v4(10, 0, 0, 2, 5000)))
        .expect("流已建立");
    flow.send_to(b"a", v4(1, 1, 1, 1, 53)).expect("发送");

    drop(netstack);

    assert!(conns.iter().all(|conn| conn.is_closed()));
    assert_eq!(fake.count(|call| matches!(call, NativeCall::Abort(_))), 2);
    assert_eq!(fake.count(|call| matches!(call, NativeCall::ReleaseKey(_))), 2);
    assert_eq!(udp.closed(), vec![FlowKey::new(v4(10, 0, 0, 2, 5000))]);
    assert_eq!(fake.live_addrs(), 0);
    assert_eq!(
        conns[0].write(b"late"),
        Err(NetstackError::Closed),
        "关停后写入必须失败"
    );
}

/// 从 TOML 载入配置并在线应用：策略与上限立即生效。
fn toml_config_applies_live() {
    let harness = Harness::new();
    let config = NetstackConfig::from_toml_str(
        r#"
        max_tcp_connections = 1
        tcp_overflow = "refuse"
        max_udp_flows = 8
        "#,
    )
    .expect("解析配置");
    assert_eq!(config.tcp_overflow, TcpOverflowPolicy::Refuse);

    harness.netstack.apply_config(&config).expect("应用配置");
    assert_eq!(harness.netstack.config(), config);
    assert_eq!(harness.netstack.stats().udp_flow_limit, 8);

    harness.accept(1);
    assert_eq!(
        harness.try_accept(2).map(|_| ()),
        Err(NetstackError::ConnectionLimit { limit: 1 })
    );
}

/// 校验失败的配置不会部分生效；未知字段在解析阶段即被拒绝。
fn invalid_config_changes_nothing() {
    let harness = Harness::new();
    let invalid = NetstackConfig {
        max_tcp_connections: 4,
        address_cache_capacity: 0,
        ..NetstackConfig::default()
    };
    assert!(matches!(
        harness.netstack.apply_config(&invalid),
        Err(NetstackError::Config { .. })
    ));
    assert_eq!(harness.netstack.config(), NetstackConfig::default());
    assert_eq!(harness.netstack.stats().tcp_limit, 1024);

    assert!(matches!(
        NetstackConfig::from_toml_str("max_tcp_conections = 4"),
        Err(NetstackError::Config { .. })
    ));
}
