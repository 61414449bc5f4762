use crate::case::{TckCase, TckSuite};
use crate::support::Harness;
use spark_netstack::testing::NativeCall;
use spark_netstack::{EventVerdict, ShutdownDirection};
use std::sync::{Arc, Barrier};
use std::thread;

const CASES: &[TckCase] = &[
    TckCase {
        name: "concurrent_close_shares_one_result",
        test: concurrent_close_shares_one_result,
    },
    TckCase {
        name: "abort_racing_close_releases_once",
        test: abort_racing_close_releases_once,
    },
];

const SUITE: TckSuite = TckSuite {
    name: "close_once",
    cases: CASES,
};

pub const fn suite() -> &'static TckSuite {
    &SUITE
}

const RACERS: usize = 8;

/// 多个线程同时 `close`：半关闭只发出一次，每个调用者得到同一个结果。
fn concurrent_close_shares_one_result() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    let barrier = Arc::new(Barrier::new(RACERS));

    let racers: Vec<_> = (0..RACERS)
        .map(|_| {
            let conn = Arc::clone(&conn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                conn.close()
            })
        })
        .collect();
    let results: Vec<_> = racers
        .into_iter()
        .map(|racer| racer.join().expect("关闭线程不应 panic"))
        .collect();

    assert!(results.iter().all(|result| *result == results[0]));
    assert_eq!(results[0], Ok(()));
    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::Shutdown(_, ShutdownDirection::Write))),
        1
    );
    let log = harness.tcp.patch_log(conn.key()).expect("Patch 已安装");
    assert_eq!(log.read_closed(), 1);

    assert_eq!(harness.local_closed(conn.key()), EventVerdict::Closed);
    assert_eq!(conn.close(), Ok(()), "拆除后再次关闭返回缓存的结果");
    assert_eq!(harness.fake.count(|call| matches!(call, NativeCall::Close(_))), 1);
    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::ReleaseKey(_))),
        1
    );
}

/// 中止与关闭交错：最终恰好一次硬中止、一次键释放，没有优雅关闭。
fn abort_racing_close_releases_once() {
    let harness = Harness::new();
    let conn = harness.accept(1);
    let barrier = Arc::new(Barrier::new(RACERS));

    let racers: Vec<_> = (0..RACERS)
        .map(|index| {
            let conn = Arc::clone(&conn);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if index % 2 == 0 {
                    conn.abort();
                } else {
                    let _ = conn.close();
                }
            })
        })
        .collect();
    for racer in racers {
        racer.join().expect("竞争线程不应 panic");
    }

    assert!(conn.is_closed());
    assert_eq!(harness.fake.count(|call| matches!(call, NativeCall::Abort(_))), 1);
    assert_eq!(harness.fake.count(|call| matches!(call, NativeCall::Close(_))), 0);
    assert_eq!(
        harness
            .fake
            .count(|call| matches!(call, NativeCall::ReleaseKey(_))),
        1
    );
}
