//! 后台清扫线程。
//!
//! - **意图 (Why)**：UDP 流与地址缓存依赖 TTL 回收，需要一个与原生事件无关的周期驱动；
//! - **契约 (What)**：线程按配置周期调用 `Shared::sweep`；`stop` 唤醒并等待线程退出，
//!   之后不会再有任何清扫发生；线程只持有 `Weak`，桥接层被释放后自行退出；
//! - **风险 (Trade-offs)**：调整周期或虚假唤醒都会提前触发一轮清扫，清扫本身幂等，无副作用。

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{NetstackError, Result};
use crate::netstack::Shared;

const THREAD_NAME: &str = "spark-netstack-sweeper";

#[derive(Debug)]
struct Control {
    stopped: bool,
    interval: Duration,
}

#[derive(Debug)]
struct Signal {
    control: Mutex<Control>,
    wake: Condvar,
}

/// 运行中的清扫线程句柄。
#[derive(Debug)]
pub(crate) struct Sweeper {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn spawn(shared: Weak<Shared>, interval: Duration) -> Result<Self> {
        let signal = Arc::new(Signal {
            control: Mutex::new(Control {
                stopped: false,
                interval,
            }),
            wake: Condvar::new(),
        });
        let worker = Arc::clone(&signal);
        let thread = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || run(&worker, &shared))
            .map_err(|err| NetstackError::config(format!("failed to spawn sweeper thread: {err}")))?;
        debug!(?interval, "sweeper started");
        Ok(Self {
            signal,
            thread: Some(thread),
        })
    }

    pub(crate) fn set_interval(&self, interval: Duration) {
        self.signal.control.lock().interval = interval;
        self.signal.wake.notify_all();
    }

    /// 请求停止并等待线程退出。调用方不得持有全局串行锁。
    pub(crate) fn stop(&mut self) {
        self.signal.control.lock().stopped = true;
        self.signal.wake.notify_all();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("sweeper thread panicked");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(signal: &Signal, shared: &Weak<Shared>) {
    loop {
        {
            let mut control = signal.control.lock();
            if !control.stopped {
                let interval = control.interval;
                signal.wake.wait_for(&mut control, interval);
            }
            if control.stopped {
                break;
            }
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let report = shared.sweep();
        trace!(?report, "sweep finished");
    }
    debug!("sweeper stopped");
}
