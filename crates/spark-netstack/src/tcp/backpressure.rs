use std::fmt;

#[cfg(not(loom))]
use parking_lot::{Condvar, Mutex};

#[cfg(loom)]
use loom::sync::{Condvar, Mutex};
#[cfg(loom)]
use std::sync::PoisonError;

/// 管理 TCP 写路径的背压等待与唤醒。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 发送缓冲已满时，写线程需要阻塞到原生栈报告“字节已确认”或连接进入终态；
/// - 唤醒不能丢失：信号可能在写线程检查容量之后、进入等待之前到达。
///
/// ## 逻辑 (How)
/// - 内部维护单调递增的 `epoch`，每次 [`signal`](Self::signal) 递增并广播；
/// - 写线程在尝试写入**之前**读取 `epoch` 快照，写入零进度后调用
///   [`wait_past`](Self::wait_past)，只有当 `epoch` 与快照相同才真正等待；
///   因此任何发生在快照之后的信号都会让等待立即返回。
///
/// ## 契约 (What)
/// - `signal` 由原生事件（确认、轮询、半关闭）与拆除路径调用；
/// - `waits` 统计写线程因背压进入等待的次数，供连接计数器暴露；
/// - **前置条件**：调用 `wait_past` 时不得持有全局串行锁或连接状态锁。
///
/// ## 注意事项 (Trade-offs)
/// - 采用广播而非单播：同一连接上的写线程由写互斥串行化，实际等待者至多一个，
///   广播不会引起惊群；
/// - 启用 `--cfg loom` 时切换到 Loom 的 `Mutex`/`Condvar`，以便穷举唤醒交错。
pub struct WriteReadiness {
    state: Mutex<Epoch>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct Epoch {
    value: u64,
    waits: u64,
}

impl fmt::Debug for WriteReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteReadiness")
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Default for WriteReadiness {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteReadiness {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Epoch::default()),
            cond: Condvar::new(),
        }
    }

    /// 读取当前信号代数，写线程在尝试写入前调用。
    pub fn epoch(&self) -> u64 {
        self.lock_value(|epoch| epoch.value)
    }

    /// 累计的背压等待次数。
    pub fn waits(&self) -> u64 {
        self.lock_value(|epoch| epoch.waits)
    }

    /// 推进代数并唤醒全部等待者。
    pub fn signal(&self) {
        self.lock_value(|epoch| epoch.value = epoch.value.wrapping_add(1));
        self.cond.notify_all();
    }

    /// 阻塞直到代数不再等于 `seen`。
    #[cfg(not(loom))]
    pub fn wait_past(&self, seen: u64) {
        let mut guard = self.state.lock();
        guard.waits = guard.waits.saturating_add(1);
        while guard.value == seen {
            self.cond.wait(&mut guard);
        }
    }

    /// 阻塞直到代数不再等于 `seen`。
    #[cfg(loom)]
    pub fn wait_past(&self, seen: u64) {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        guard.waits = guard.waits.saturating_add(1);
        while guard.value == seen {
            guard = self
                .cond
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(not(loom))]
    fn lock_value<R>(&self, f: impl FnOnce(&mut Epoch) -> R) -> R {
        f(&mut self.state.lock())
    }

    #[cfg(loom)]
    fn lock_value<R>(&self, f: impl FnOnce(&mut Epoch) -> R) -> R {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let ready = WriteReadiness::new();
        let seen = ready.epoch();
        ready.signal();
        // 快照之后已有信号，等待必须立即返回。
        ready.wait_past(seen);
        assert_eq!(ready.waits(), 1);
    }

    #[test]
    fn blocked_waiter_resumes_after_signal() {
        let ready = Arc::new(WriteReadiness::new());
        let seen = ready.epoch();
        let waiter = {
            let ready = Arc::clone(&ready);
            thread::spawn(move || ready.wait_past(seen))
        };
        thread::sleep(Duration::from_millis(20));
        ready.signal();
        waiter.join().expect("等待线程不应 panic");
        assert_eq!(ready.epoch(), seen + 1);
    }
}
