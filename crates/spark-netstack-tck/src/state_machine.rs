use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use spark_netstack::testing::NativeCall;
use spark_netstack::{EventVerdict, NetstackError, ShutdownDirection, TcpHandle, TcpState};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CASES: &[TckCase] = &[
    TckCase {
        name: "close_write_then_remote_fin_closes_gracefully",
        test: close_write_then_remote_fin_closes_gracefully,
    },
    TckCase {
        name: "remote_fin_then_close_write_closes_gracefully",
        test: remote_fin_then_close_write_closes_gracefully,
    },
    TckCase {
        name: "native_error_releases_without_touching_handle",
        test: native_error_releases_without_touching_handle,
    },
    TckCase {
        name: "native_error_wakes_blocked_writer",
        test: native_error_wakes_blocked_writer,
    },
    TckCase {
        name: "failed_graceful_close_falls_back_to_abort",
        test: failed_graceful_close_falls_back_to_abort,
    },
    TckCase {
        name: "events_after_teardown_are_ignored",
        test: events_after_teardown_are_ignored,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "state_machine",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

/// 本端先半关闭、对端后 FIN：注销回调后优雅关闭，不发生中止。
fn close_write_then_remote_fin_closes_gracefully() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    assert_eq!(conn.state(), TcpState::Connected);

    conn.close_write().expect("半关闭");
    assert_eq!(conn.state(), TcpState::WriteClosed);
    assert_eq!(
        harness.deliver(conn.key(), b"still readable"),
        Ok(EventVerdict::Handled),
        "写方向关闭后仍可接收"
    );

    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Closed);
    assert_eq!(conn.state(), TcpState::Closed);
    assert!(conn.is_closed());

    let calls = harness.fake.calls();
    let handle = conn.handle();
    let detach = calls.iter().position(|call| *call == NativeCall::Detach(handle));
    let close = calls.iter().position(|call| *call == NativeCall::Close(handle));
    assert!(detach.is_some() && close.is_some());
    assert!(detach < close, "必须先注销回调再关闭");
    assert_eq!(harness.fake.count(|call| matches!(call, NativeCall::Abort(_))), 0);
}

/// 对端先 FIN：Patch 收到入站结束通知，本端随后半关闭即完成拆除。
fn remote_fin_then_close_write_closes_gracefully() {
    let harness = Harness::new();
    let conn = harness.accept(1);

    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Handled);
    assert_eq!(conn.state(), TcpState::ReceiveClosed);
    let log = harness.tcp.patch_log(conn.key()).expect("Patch 已安装");
    assert!(log.finished() >= 1);
    assert_eq!(
        harness.deliver(conn.key(), b"late"),
        Err(NetstackError::Closed),
        "读方向结束后不再交付数据"
    );

    conn.write(b"reply").expect("读方向结束后仍可写");
    conn.close_write().expect("半关闭");
    assert_eq!(conn.state(), TcpState::Closed);
    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::Shutdown(_, ShutdownDirection::Write))),
        1
    );
    assert_eq!(harness.fake.count(|call| matches!(call, NativeCall::Close(_))), 1);
}

/// 原生错误后句柄已失效：只释放键，不注销、不关闭、不中止。
fn native_error_releases_without_touching_handle() {
    let harness = Harness::new();
    let conn = harness.accept(1);

    assert_eq!(harness.error(conn.key(), -14), EventVerdict::Closed);
    assert_eq!(conn.state(), TcpState::Errored);
    assert_eq!(conn.write(b"x"), Err(NetstackError::Aborted));

    let handle_calls = harness.fake.count(|call| {
        matches!(
            call,
            NativeCall::Detach(_) | NativeCall::Close(_) | NativeCall::Abort(_)
        )
    });
    assert_eq!(handle_calls, 0);
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::ReleaseKey(conn.key())),
        1
    );
}

/// 原生优雅关闭失败时退回硬中止，事件结论为 `Aborted`。
fn failed_graceful_close_falls_back_to_abort() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    harness.fake.fail_close(conn.handle(), -1);

    conn.close_write().expect("半关闭");
    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Aborted);
    assert!(conn.is_closed());
    assert_eq!(
        harness
            .fake
            .count(|call| *call == NativeCall::Abort(conn.handle())),
        1
    );
}

/// 拆除后到达的原生事件按未知键处理，不再触碰原生栈。
fn events_after_teardown_are_ignored() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    conn.abort();
    let before = harness.fake.calls().len();

    assert_eq!(harness.deliver(conn.key(), b"x"), Ok(EventVerdict::UnknownKey));
    assert_eq!(harness.poll(conn.key()), EventVerdict::UnknownKey);
    assert_eq!(harness.local_closed(conn.key()), EventVerdict::UnknownKey);
    assert_eq!(harness.error(conn.key(), -1), EventVerdict::UnknownKey);
    assert_eq!(harness.fake.calls().len(), before);
}

/// 发送缓冲为零时阻塞的写线程，在原生错误到达后以 `Aborted` 返回，不会永久挂起。
fn native_error_wakes_blocked_writer() {
    let harness = Harness::new();
    harness.fake.set_send_capacity(TcpHandle(1), 0);
    let conn = harness.accept(1);
    let writer = {
        let conn = Arc::clone(&conn);
        thread::spawn(move || conn.write(b"never fits"))
    };
    while conn.counters().write_waits == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(harness.error(conn.key(), -14), EventVerdict::Closed);
    assert_eq!(writer.join().expect("写线程不应 panic"), Err(NetstackError::Aborted));
    assert_eq!(conn.state(), TcpState::Errored);
    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::Abort(_) | NativeCall::Close(_))),
        0
    );
}
