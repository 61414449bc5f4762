//! TCP 连接生命周期性质验证。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：以随机事件序列驱动真实的桥接层，验证两条与交错无关的性质：
//!   1. 观测到的状态只会原地停留或沿合法迁移前进；
//!   2. 一旦进入终态，原生键恰好释放一次，原生句柄至多被关闭或中止一次。
//! - **设计手法 (How)**：事件同时覆盖原生侧（数据、读结束、确认、轮询、错误）与消费者侧
//!   （写入、半关闭、关闭、中止），每步之后读取状态并与上一步比较。
//! - **前置条件 (What)**：脚本化原生栈不注入失败，单次写入远小于发送容量，写路径不会阻塞。

use proptest::prelude::*;
use spark_netstack::testing::NativeCall;
use spark_netstack::{TcpConnection, TcpState};
use spark_netstack_tck::support::Harness;

#[derive(Clone, Debug)]
enum Event {
    Deliver(Vec<u8>),
    LocalClosed,
    Sent(usize),
    Poll,
    Error(i32),
    Write(Vec<u8>),
    CloseWrite,
    CloseRead,
    Close,
    Abort,
}

fn event() -> impl Strategy<Value = Event> {
    prop_oneof![
        3 => proptest::collection::vec(any::<u8>(), 1..16).prop_map(Event::Deliver),
        1 => Just(Event::LocalClosed),
        2 => (1usize..16).prop_map(Event::Sent),
        2 => Just(Event::Poll),
        1 => (-15i32..-1).prop_map(Event::Error),
        3 => proptest::collection::vec(any::<u8>(), 1..16).prop_map(Event::Write),
        1 => Just(Event::CloseWrite),
        1 => Just(Event::CloseRead),
        1 => Just(Event::Close),
        1 => Just(Event::Abort),
    ]
}

fn apply(harness: &Harness, conn: &TcpConnection, event: &Event) {
    // 事件结果本身不在此断言，只观察状态与原生调用。
    match event {
        Event::Deliver(bytes) => {
            let _ = harness.deliver(conn.key(), bytes);
        }
        Event::LocalClosed => {
            harness.local_closed(conn.key());
        }
        Event::Sent(count) => {
            harness.acknowledge_sent(conn, *count);
        }
        Event::Poll => {
            harness.poll(conn.key());
        }
        Event::Error(code) => {
            harness.error(conn.key(), *code);
        }
        Event::Write(bytes) => {
            let _ = conn.write(bytes);
        }
        Event::CloseWrite => {
            let _ = conn.close_write();
        }
        Event::CloseRead => {
            let _ = conn.close_read();
        }
        Event::Close => {
            let _ = conn.close();
        }
        Event::Abort => conn.abort(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn prop_state_only_moves_forward(events in proptest::collection::vec(event(), 1..40)) {
        let harness = Harness::new();
        let conn = harness.accept(1);
        let mut previous = conn.state();
        prop_assert_eq!(previous, TcpState::Connected);

        for (index, event) in events.iter().enumerate() {
            apply(&harness, &conn, event);
            let next = conn.state();
            prop_assert!(
                next == previous || previous.can_advance_to(next),
                "事件 #{} {:?} 导致非法迁移 {} -> {}",
                index,
                event,
                previous,
                next
            );
            previous = next;
        }
    }

    #[test]
    fn prop_terminal_state_releases_exactly_once(events in proptest::collection::vec(event(), 1..40)) {
        let harness = Harness::new();
        let conn = harness.accept(1);
        let handle = conn.handle();
        let key = conn.key();
        for event in &events {
            apply(&harness, &conn, event);
        }

        let released = harness
            .fake
            .count(|call| *call == NativeCall::ReleaseKey(key));
        let finished = harness
            .fake
            .count(|call| matches!(call, NativeCall::Close(h) | NativeCall::Abort(h) if *h == handle));
        if conn.state().is_terminal() {
            prop_assert!(conn.is_closed());
            prop_assert_eq!(released, 1);
            prop_assert!(harness.netstack.lookup_tcp(key).is_none());
        } else {
            prop_assert_eq!(released, 0);
            prop_assert_eq!(finished, 0);
        }
        prop_assert!(finished <= 1);
    }
}
