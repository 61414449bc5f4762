//! 可注入的单调时钟。
//!
//! - **意图 (Why)**：TTL 过期与空闲淘汰都依赖“当前时间”，测试需要在不睡眠的前提下推进时间；
//! - **契约 (What)**：[`SystemClock`] 读取真实单调时钟，[`ManualClock`] 只在显式 `advance` 时前进；
//! - **实现提示 (How)**：`ManualClock` 以 `Arc<Mutex<Duration>>` 保存偏移，克隆体共享同一时间轴。

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 抽象可注入的时钟。
pub trait Clock: Send + Sync + 'static {
    /// 返回当前的单调时间点。
    fn now(&self) -> Instant;
}

/// 读取 [`Instant::now`] 的生产时钟。
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// 手动推进的虚拟时钟，服务于缓存过期与空闲淘汰的确定性测试。
///
/// # 教案式注释
/// - **意图 (Why)**：测试需要验证“超过 TTL 的条目在下一轮清扫后消失”，
///   真实计时器会让用例变慢且不稳定；
/// - **契约 (What)**：
///   - `new` 以当前系统时间为原点，偏移为零；
///   - `advance` 推进虚拟时间；
///   - `now` 返回 `origin + elapsed`；
/// - **注意 (Trade-offs)**：推进操作只影响读取方，不会唤醒任何等待中的线程。
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// 推进虚拟时间。
    pub fn advance(&self, by: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(by);
    }

    /// 自原点以来推进的总时长。
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.elapsed.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert_eq!(clock.now(), start);

        let shared = clock.clone();
        shared.advance(Duration::from_secs(3));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
        assert_eq!(clock.elapsed(), Duration::from_secs(3));
    }
}
