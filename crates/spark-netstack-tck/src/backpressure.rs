use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use spark_netstack::{EventVerdict, NetstackConfig, NetstackError, TcpHandle};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CASES: &[TckCase] = &[
    TckCase {
        name: "large_write_completes_as_peer_acknowledges",
        test: large_write_completes_as_peer_acknowledges,
    },
    TckCase {
        name: "blocked_writer_wakes_when_evicted",
        test: blocked_writer_wakes_when_evicted,
    },
    TckCase {
        name: "shrunk_limit_aborts_least_recent_on_accept",
        test: shrunk_limit_aborts_least_recent_on_accept,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "backpressure",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

const DEADLINE: Duration = Duration::from_secs(10);

/// 10 000 字节写入 1 500 字节的发送缓冲：写线程随确认推进，最终全部按序入队。
fn large_write_completes_as_peer_acknowledges() {
    let harness = Harness::new();
    harness.fake.set_send_capacity(TcpHandle(1), 1500);
    let conn = harness.accept(1);
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

    let writer = {
        let conn = Arc::clone(&conn);
        let payload = payload.clone();
        thread::spawn(move || conn.write(&payload))
    };

    let started = Instant::now();
    while !writer.is_finished() {
        assert!(started.elapsed() < DEADLINE, "写线程未能在确认驱动下完成");
        thread::sleep(Duration::from_millis(1));
        harness.acknowledge_sent(&conn, 1500);
    }

    let written = writer.join().expect("写线程不应 panic");
    assert_eq!(written, Ok(10_000));
    assert_eq!(harness.fake.sent_bytes(TcpHandle(1)), payload);
    assert_eq!(conn.counters().bytes_enqueued, 10_000);
}

/// 发送缓冲为零的写线程被阻塞；新连接挤占上限后旧连接被中止，写线程随即返回。
fn blocked_writer_wakes_when_evicted() {
    let harness = Harness::with_config(NetstackConfig {
        max_tcp_connections: 1,
        ..NetstackConfig::default()
    });
    harness.fake.set_send_capacity(TcpHandle(1), 0);
    let victim = harness.accept(1);

    let writer = {
        let victim = Arc::clone(&victim);
        thread::spawn(move || victim.write(b"never fits"))
    };
    thread::sleep(Duration::from_millis(20));

    let survivor = harness.accept(2);
    let result = writer.join().expect("写线程不应 panic");
    assert!(
        matches!(result, Err(NetstackError::Aborted | NetstackError::Closed)),
        "unexpected write result: {result:?}"
    );
    assert!(victim.is_closed());
    assert!(!survivor.is_closed());
}

/// 缩容后，新连接挤出最久未活跃的连接；被挤出的连接在接入返回前完成中止，轮询按未知键处理。
fn shrunk_limit_aborts_least_recent_on_accept() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    conn.close_write().expect("半关闭");
    assert_eq!(
        harness.poll(conn.key()),
        EventVerdict::Handled
    );
    assert!(!conn.is_closed());

    harness.netstack.set_connection_limits(1);
    let other = harness.accept(2);
    assert!(conn.is_closed(), "缩容后最久未活跃的连接应被中止");
    assert_eq!(harness.poll(conn.key()), EventVerdict::UnknownKey);
    assert_eq!(harness.poll(other.key()), EventVerdict::Handled);
}
