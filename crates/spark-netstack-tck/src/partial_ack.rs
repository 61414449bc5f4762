use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use spark_netstack::testing::ConsumeMode;
use spark_netstack::{EventVerdict, NetstackError, TcpState};
use std::io::Read;

const CASES: &[TckCase] = &[
    TckCase {
        name: "only_consumed_bytes_are_acknowledged",
        test: only_consumed_bytes_are_acknowledged,
    },
    TckCase {
        name: "over_report_is_rejected_without_acknowledging",
        test: over_report_is_rejected_without_acknowledging,
    },
    TckCase {
        name: "pipe_reopens_window_as_reader_drains",
        test: pipe_reopens_window_as_reader_drains,
    },
    TckCase {
        name: "pipe_keeps_acknowledged_bytes_through_graceful_close",
        test: pipe_keeps_acknowledged_bytes_through_graceful_close,
    },
    TckCase {
        name: "consumer_close_read_discards_pipe_buffer",
        test: consumer_close_read_discards_pipe_buffer,
    },
    TckCase {
        name: "refusing_patch_reports_closed",
        test: refusing_patch_reports_closed,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "partial_ack",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 交付 10 字节、消费 3 字节：只向接收窗口归还 3 字节。
fn only_consumed_bytes_are_acknowledged() {
    let harness = Harness::new();
    harness.tcp.set_consume_mode(ConsumeMode::AtMost(3));
    let conn = harness.accept(1);

    assert_eq!(harness.deliver(conn.key(), b"0123456789"), Ok(EventVerdict::Handled));
    assert_eq!(harness.fake.acknowledged(conn.handle()), 3);
    let counters = conn.counters();
    assert_eq!(counters.bytes_delivered, 10);
    assert_eq!(counters.bytes_acknowledged, 3);

    let log = harness.tcp.patch_log(conn.key()).expect("Patch 已安装");
    assert_eq!(log.received(), b"0123456789");
}

/// 消费量超过交付量：不归还任何字节，返回 `OverAcknowledged`，连接保持打开。
fn over_report_is_rejected_without_acknowledging() {
    let harness = Harness::new();
    harness.tcp.set_consume_mode(ConsumeMode::OverReport(5));
    let conn = harness.accept(1);

    assert_eq!(
        harness.deliver(conn.key(), b"0123456789"),
        Err(NetstackError::OverAcknowledged {
            consumed: 15,
            delivered: 10
        })
    );
    assert_eq!(harness.fake.acknowledged(conn.handle()), 0);
    assert_eq!(conn.state(), TcpState::Connected);
    assert!(!conn.is_closed());

    // 被拒绝的交付仍计入交付量，消费者随后可以补发确认。
    let counters = conn.counters();
    assert_eq!(counters.bytes_delivered, 10);
    assert_eq!(counters.bytes_acknowledged, 0);
    assert_eq!(conn.acknowledge(10), Ok(()));
    assert_eq!(harness.fake.acknowledged(conn.handle()), 10);
}

/// 管道窗口 4 字节：先确认 4 字节，读端取走数据后补发剩余确认，入站结束后读到 EOF。
fn pipe_reopens_window_as_reader_drains() {
    let harness = Harness::new();
    harness.tcp.use_pipe(4);
    let conn = harness.accept(1);
    let mut reader = harness.tcp.take_reader(conn.key()).expect("管道读端");

    assert_eq!(harness.deliver(conn.key(), b"0123456789"), Ok(EventVerdict::Handled));
    assert_eq!(harness.fake.acknowledged(conn.handle()), 4);
    assert_eq!(reader.buffered(), 10);
    assert_eq!(reader.withheld(), 6);

    let mut chunk = [0u8; 8];
    assert_eq!(reader.read(&mut chunk).expect("读取"), 8);
    assert_eq!(&chunk, b"01234567");
    assert_eq!(harness.fake.acknowledged(conn.handle()), 6);
    assert_eq!(reader.withheld(), 4);

    let mut rest = Vec::new();
    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Handled);
    reader.read_to_end(&mut rest).expect("读到 EOF");
    assert_eq!(rest, b"89");
    assert_eq!(harness.fake.acknowledged(conn.handle()), 10);
    assert_eq!(reader.withheld(), 0);
    assert_eq!(conn.counters().bytes_acknowledged, 10);
}

/// Patch 拒收数据时事件以 `Closed` 失败，驱动据此关闭读方向。
fn refusing_patch_reports_closed() {
    let harness = Harness::new();
    harness.tcp.set_consume_mode(ConsumeMode::Refuse);
    let conn = harness.accept(1);
    assert_eq!(harness.deliver(conn.key(), b"data"), Err(NetstackError::Closed));
    assert_eq!(harness.fake.acknowledged(conn.handle()), 0);
}

/// 对端数据加 FIN 到达后本端半关闭，连接优雅拆除；读端仍能读出全部已确认的字节。
fn pipe_keeps_acknowledged_bytes_through_graceful_close() {
    let harness = Harness::new();
    harness.tcp.use_pipe(64);
    let conn = harness.accept(1);
    let mut reader = harness.tcp.take_reader(conn.key()).expect("管道读端");

    assert_eq!(harness.deliver(conn.key(), b"request body"), Ok(EventVerdict::Handled));
    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Handled);
    conn.close_write().expect("半关闭");
    assert_eq!(conn.state(), TcpState::Closed);

    let mut body = Vec::new();
    reader.read_to_end(&mut body).expect("读到 EOF");
    assert_eq!(body, b"request body");
}

/// 消费者主动放弃读取：缓存被丢弃，窗口外暂存的字节随即补发确认，读端立即看到 EOF。
fn consumer_close_read_discards_pipe_buffer() {
    let harness = Harness::new();
    harness.tcp.use_pipe(4);
    let conn = harness.accept(1);
    let mut reader = harness.tcp.take_reader(conn.key()).expect("管道读端");

    assert_eq!(harness.deliver(conn.key(), b"unwanted"), Ok(EventVerdict::Handled));
    assert_eq!(harness.fake.acknowledged(conn.handle()), 4);
    assert_eq!(reader.withheld(), 4);

    conn.close_read().expect("关闭读方向");
    assert_eq!(harness.fake.acknowledged(conn.handle()), 8);
    assert_eq!(conn.counters().bytes_acknowledged, 8);

    let mut rest = Vec::new();
    assert_eq!(reader.read_to_end(&mut rest).expect("读到 EOF"), 0);
    assert_eq!(reader.buffered(), 0);
    assert_eq!(reader.withheld(), 0);
}
