#![cfg(loom)]

use loom::{
    model,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};
use spark_netstack::{OnceGuard, WriteReadiness};

#[test]
fn once_guard_has_exactly_one_winner() {
    //
    // 教案级说明：拆除路径可能被关闭、错误与淘汰同时触发。
    // - **Why**：释放副作用执行两次会重复释放原生资源；
    // - **What**：任意交错下恰好一个线程赢得守卫，之后所有观察者都看到已占用。
    model(|| {
        let guard = Arc::new(OnceGuard::new());
        let winners = Arc::new(AtomicUsize::new(0));

        let racers: Vec<_> = (0..2)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    if guard.claim() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for racer in racers {
            racer.join().expect("竞争线程不应 panic");
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
        assert!(guard.is_claimed());
        assert!(!guard.claim(), "胜者确定后不得再有第二个胜者");
    });
}

#[test]
fn write_readiness_never_loses_a_wakeup() {
    //
    // 教案级说明：验证“先取代数、再尝试、零进度才等待”的协议不会丢失唤醒。
    // - **How**：`room` 模拟发送缓冲空间；确认线程先腾出空间再发信号，
    //   写线程在每次尝试前读取代数快照；
    // - **What**：无论信号落在快照之前还是之后，写线程都能退出，Loom 不会报告死锁。
    model(|| {
        let ready = Arc::new(WriteReadiness::new());
        let room = Arc::new(AtomicBool::new(false));

        let writer = {
            let ready = Arc::clone(&ready);
            let room = Arc::clone(&room);
            thread::spawn(move || {
                loop {
                    let seen = ready.epoch();
                    if room.load(Ordering::SeqCst) {
                        break;
                    }
                    ready.wait_past(seen);
                }
            })
        };

        room.store(true, Ordering::SeqCst);
        ready.signal();

        writer.join().expect("写线程不应 panic");
        assert!(ready.epoch() >= 1);
    });
}
