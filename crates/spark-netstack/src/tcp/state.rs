//! TCP 连接生命周期状态。
//!
//! - **意图 (Why)**：把“哪些迁移合法”集中成纯函数，连接对象只负责加锁与副作用；
//! - **契约 (What)**：迁移沿 `New → Connecting → Connected → {WriteClosed, ReceiveClosed} → Closing → Closed`
//!   单调前进，`Aborting`/`Errored` 可由任意非终态进入；`Closed`/`Errored` 为终态，不再迁出；
//! - **实现提示 (How)**：每个状态映射到一个序号，两个半关闭状态共享同一序号，
//!   “只允许序号严格增大”即可同时表达单调性与半关闭之间不可互转。

use std::fmt;

/// 连接生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TcpState {
    New,
    Connecting,
    Connected,
    /// 本端已请求写方向半关闭。
    WriteClosed,
    /// 原生栈报告读方向已结束（对端 FIN）。
    ReceiveClosed,
    /// 两个方向均已关闭，等待拆除。
    Closing,
    /// 已请求硬中止，等待持有全局锁的路径执行。
    Aborting,
    Closed,
    /// 原生栈报告错误，句柄已由原生侧释放。
    Errored,
}

impl TcpState {
    fn rank(self) -> u8 {
        match self {
            TcpState::New => 0,
            TcpState::Connecting => 1,
            TcpState::Connected => 2,
            TcpState::WriteClosed | TcpState::ReceiveClosed => 3,
            TcpState::Closing => 4,
            TcpState::Aborting => 5,
            TcpState::Closed | TcpState::Errored => 6,
        }
    }

    /// 是否为终态。
    pub fn is_terminal(self) -> bool {
        matches!(self, TcpState::Closed | TcpState::Errored)
    }

    /// 迁移到 `next` 是否合法。
    pub fn can_advance_to(self, next: TcpState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    /// 写路径可继续入队的状态。
    pub fn can_write(self) -> bool {
        matches!(
            self,
            TcpState::Connecting | TcpState::Connected | TcpState::ReceiveClosed
        )
    }

    /// 仍可向消费者交付数据的状态。
    pub fn can_receive(self) -> bool {
        matches!(self, TcpState::Connected | TcpState::WriteClosed)
    }

    /// 消费者请求写方向半关闭后的状态；`None` 表示无需任何动作。
    pub fn after_close_write(self) -> Option<TcpState> {
        match self {
            TcpState::Connecting | TcpState::Connected => Some(TcpState::WriteClosed),
            TcpState::ReceiveClosed => Some(TcpState::Closing),
            _ => None,
        }
    }

    /// 原生栈报告读方向结束后的状态；`None` 表示无需任何动作。
    pub fn after_local_closed(self) -> Option<TcpState> {
        match self {
            TcpState::Connecting | TcpState::Connected => Some(TcpState::ReceiveClosed),
            TcpState::WriteClosed => Some(TcpState::Closing),
            _ => None,
        }
    }

    /// 请求中止后的状态；已处于 `Aborting` 或终态时为 `None`。
    pub fn after_abort_request(self) -> Option<TcpState> {
        self.can_advance_to(TcpState::Aborting)
            .then_some(TcpState::Aborting)
    }

    /// 在统计报告中使用的小写名称。
    pub fn as_str(self) -> &'static str {
        match self {
            TcpState::New => "new",
            TcpState::Connecting => "connecting",
            TcpState::Connected => "connected",
            TcpState::WriteClosed => "write-closed",
            TcpState::ReceiveClosed => "receive-closed",
            TcpState::Closing => "closing",
            TcpState::Aborting => "aborting",
            TcpState::Closed => "closed",
            TcpState::Errored => "errored",
        }
    }
}

impl fmt::Display for TcpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Clone, Copy, Debug)]
    enum Event {
        Accept,
        CloseWrite,
        LocalClosed,
        Abort,
        Error,
        Teardown,
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::Accept),
            Just(Event::CloseWrite),
            Just(Event::LocalClosed),
            Just(Event::Abort),
            Just(Event::Error),
            Just(Event::Teardown),
        ]
    }

    fn apply(state: TcpState, event: Event) -> Option<TcpState> {
        match event {
            Event::Accept => match state {
                TcpState::New => Some(TcpState::Connecting),
                TcpState::Connecting => Some(TcpState::Connected),
                _ => None,
            },
            Event::CloseWrite => state.after_close_write(),
            Event::LocalClosed => state.after_local_closed(),
            Event::Abort => state.after_abort_request(),
            Event::Error => state
                .can_advance_to(TcpState::Errored)
                .then_some(TcpState::Errored),
            Event::Teardown => matches!(state, TcpState::Closing | TcpState::Aborting)
                .then_some(TcpState::Closed),
        }
    }

    #[test]
    fn half_closes_converge_on_closing() {
        let write_first = TcpState::Connected
            .after_close_write()
            .and_then(TcpState::after_local_closed);
        let read_first = TcpState::Connected
            .after_local_closed()
            .and_then(TcpState::after_close_write);
        assert_eq!(write_first, Some(TcpState::Closing));
        assert_eq!(read_first, Some(TcpState::Closing));
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for terminal in [TcpState::Closed, TcpState::Errored] {
            assert!(terminal.after_close_write().is_none());
            assert!(terminal.after_local_closed().is_none());
            assert!(terminal.after_abort_request().is_none());
            assert!(!terminal.can_advance_to(TcpState::Errored));
        }
    }

    #[test]
    fn aborting_may_still_observe_native_error() {
        assert!(TcpState::Aborting.can_advance_to(TcpState::Errored));
        assert!(TcpState::Aborting.after_abort_request().is_none());
    }

    proptest! {
        #[test]
        fn prop_state_never_regresses(events in proptest::collection::vec(event(), 0..48)) {
            let mut state = TcpState::New;
            for event in events {
                if let Some(next) = apply(state, event) {
                    prop_assert!(
                        state.can_advance_to(next),
                        "{state} -> {next} 违反单调性"
                    );
                    state = next;
                }
            }
            if state.is_terminal() {
                prop_assert!(!state.can_write());
                prop_assert!(!state.can_receive());
            }
        }
    }
}
