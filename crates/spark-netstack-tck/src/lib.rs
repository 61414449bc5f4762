//! spark-netstack 契约测试套件（TCK）入口。
//!
//! # 教案式综述（Why / How / What）
//! - **为什么存在**：桥接层的正确性主要体现为跨线程、跨回调的性质（键唯一、状态单调、拆除恰好一次、
//!   背压不丢唤醒、缓存有界），单元测试难以覆盖完整链路，因此集中在独立 crate 中以整体视角验证；
//! - **如何集成**：每个主题暴露一个 `run_*_suite` 入口，`tests/` 下的集成测试逐一调用；
//!   也可通过 [`all_suites`] 遍历执行；
//! - **测试对象**：全部用例经由 `spark_netstack::testing::FakeStack` 驱动，只依赖桥接层的公开接口。
//!
//! # 风险提示（Trade-offs）
//! - 背压与并发关闭用例使用真实线程，依赖调度但不依赖时序；
//!   断言只检查最终结果，不检查中间交错。

mod backpressure;
mod caches;
mod close_once;
mod identity;
mod partial_ack;
mod shutdown;
mod state_machine;
mod stats;
pub mod support;
mod udp;

use case::{TckSuite, run_suite};

const ALL_SUITES: [&TckSuite; 9] = [
    identity::suite(),
    state_machine::suite(),
    backpressure::suite(),
    close_once::suite(),
    caches::suite(),
    udp::suite(),
    partial_ack::suite(),
    stats::suite(),
    shutdown::suite(),
];

pub mod case {
    use super::support;
    use std::panic;

    /// 单个 TCK 用例：名称加零参数断言函数，失败时 panic。
    #[derive(Clone, Copy)]
    pub struct TckCase {
        pub name: &'static str,
        pub test: fn(),
    }

    /// 同一主题的一组用例。
    #[derive(Clone, Copy)]
    pub struct TckSuite {
        pub name: &'static str,
        pub cases: &'static [TckCase],
    }

    /// 依次执行套件中的用例，失败时附加“套件/用例”上下文后重新 panic。
    pub fn run_suite(suite: &TckSuite) {
        assert!(!suite.cases.is_empty(), "TCK 套件不应为空");
        for case in suite.cases {
            let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| (case.test)()));
            if let Err(payload) = outcome {
                support::panic_with_context(suite.name, case.name, payload);
            }
        }
    }
}

/// 返回所有已注册的套件，顺序与 `run_*` 入口一致。
pub fn all_suites() -> &'static [&'static TckSuite] {
    &ALL_SUITES
}

/// 身份注册表：键唯一、查找往返、释放恰好一次。
pub fn run_identity_suite() {
    run_suite(identity::suite());
}

/// TCP 状态机：半关闭组合、原生错误、优雅关闭回退。
pub fn run_state_machine_suite() {
    run_suite(state_machine::suite());
}

/// 写路径背压：大写入随确认推进完成，中止唤醒阻塞写线程。
pub fn run_backpressure_suite() {
    run_suite(backpressure::suite());
}

/// 并发关闭：拆除副作用恰好一次，所有调用者得到同一结果。
pub fn run_close_once_suite() {
    run_suite(close_once::suite());
}

/// 资源缓存：容量淘汰、TTL 清扫与 TCP 连接上限策略。
pub fn run_caches_suite() {
    run_suite(caches::suite());
}

/// UDP 流归并、发送与目的地址缓存。
pub fn run_udp_suite() {
    run_suite(udp::suite());
}

/// 接收窗口的部分确认。
pub fn run_partial_ack_suite() {
    run_suite(partial_ack::suite());
}

/// 统计快照与连接清单文本。
pub fn run_stats_suite() {
    run_suite(stats::suite());
}

/// 关停与配置应用。
pub fn run_shutdown_suite() {
    run_suite(shutdown::suite());
}
