//! 一次性执行守卫。
//!
//! - **意图 (Why)**：连接拆除可能同时由消费者关闭、原生错误、缓存淘汰与显式中止触发，
//!   释放副作用必须恰好执行一次；
//! - **契约 (What)**：[`OnceGuard::claim`] 只对第一个调用者返回 `true`，之后永远返回 `false`；
//! - **实现提示 (How)**：`compare_exchange` 的 AcqRel 语义保证胜者之前的写入对后续观察者可见；
//!   启用 `--cfg loom` 时切换到 Loom 的原子类型以便模型检查。

#[cfg(not(loom))]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicBool, Ordering};

/// 原子化的“只允许一个胜者”守卫。
#[derive(Debug)]
pub struct OnceGuard {
    claimed: AtomicBool,
}

impl Default for OnceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl OnceGuard {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
        }
    }

    /// 尝试成为胜者；只有第一次调用返回 `true`。
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn only_one_thread_wins() {
        let guard = Arc::new(OnceGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if guard.claim() {
                        winners.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("线程不应 panic");
        }
        assert_eq!(winners.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(guard.is_claimed());
    }
}
