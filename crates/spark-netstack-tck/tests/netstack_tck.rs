//! 逐套件执行 spark-netstack 契约测试，失败时输出“套件/用例”定位信息。

use spark_netstack_tck as tck;

#[test]
fn identity() {
    tck::run_identity_suite();
}

#[test]
fn state_machine() {
    tck::run_state_machine_suite();
}

#[test]
fn backpressure() {
    tck::run_backpressure_suite();
}

#[test]
fn close_once() {
    tck::run_close_once_suite();
}

#[test]
fn caches() {
    tck::run_caches_suite();
}

#[test]
fn udp() {
    tck::run_udp_suite();
}

#[test]
fn partial_ack() {
    tck::run_partial_ack_suite();
}

#[test]
fn stats() {
    tck::run_stats_suite();
}

#[test]
fn shutdown() {
    tck::run_shutdown_suite();
}

#[test]
fn every_suite_is_registered_once() {
    let names: Vec<_> = tck::all_suites().iter().map(|suite| suite.name).collect();
    assert_eq!(
        names,
        [
            "identity",
            "state_machine",
            "backpressure",
            "close_once",
            "caches",
            "udp",
            "partial_ack",
            "stats",
            "shutdown",
        ]
    );
    assert!(tck::all_suites().iter().all(|suite| !suite.cases.is_empty()));
}
