//! # native 模块说明
//!
//! ## 角色定位（Why）
//! - 原生协议栈被视为外部协作者：它负责报文处理，桥接层只通过本模块定义的原语与它交互；
//! - 原生栈是单线程执行模型，任何线程调用其入口前都必须持有全局串行锁。
//!   本模块把这条约定固化为类型：[`NativeStack`] 只能经由 [`StackGuard`] 访问。
//!
//! ## 行为契约（What）
//! - 句柄类型 [`TcpHandle`]/[`UdpHandle`]/[`NativeAddr`] 是不透明整数，由原生胶水层分配与解释；
//! - 事件入口（`Netstack::tcp_recv` 等）要求调用方传入 `&mut StackGuard`，
//!   以类型证明“当前线程持有全局锁”；
//! - 锁顺序固定为：全局串行锁 → 连接状态锁 → 写就绪信号锁，任何路径都不得在持有后两者时申请前者。
//!
//! ## 风险提示（Trade-offs）
//! - `parking_lot::Mutex` 不可重入：Handler 与 Patch 在原生回调内被调用时已经持有全局锁，
//!   不得在回调内同步调用连接的阻塞操作（`write`/`close_write`/`abort`），否则会自锁。

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

use crate::registry::ConnKey;

/// 原生 TCP 控制块句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TcpHandle(pub u64);

/// 原生 UDP 控制块句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct UdpHandle(pub u64);

/// 原生侧格式化后的地址结构，由地址缓存独占所有权。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NativeAddr(pub u64);

impl fmt::Display for TcpHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp#{}", self.0)
    }
}

/// 半关闭方向。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownDirection {
    /// 关闭读方向。
    Read,
    /// 关闭写方向，向对端发送 FIN。
    Write,
    /// 同时关闭读写。
    Both,
}

/// 一次发送入队的结果。
///
/// - `Accepted(n)`：`n` 字节已复制进原生发送缓冲并触发输出；
/// - `WouldBlock`：发送缓冲暂时无空间，视为零进度，不是错误；
/// - `Fatal(code)`：原生栈返回致命错误码，连接必须拆除。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted(usize),
    WouldBlock,
    Fatal(i32),
}

/// 原生协议栈对桥接层暴露的原语集合。
///
/// # 教案式注释
/// - **意图 (Why)**：以 trait 隔离原生实现，使桥接层可以在测试中替换为脚本化实现；
/// - **契约 (What)**：
///   - 所有方法以 `&mut self` 接收，实现者可以假定调用严格串行；
///   - `attach` 把连接键写入原生侧为该连接分配的存储，后续回调原样回放该键；
///   - `release_key` 释放该存储，拆除路径对每个键恰好调用一次；
///   - `detach` 注销该连接的全部原生回调，仅在优雅关闭前调用；
///   - `abort` 之后句柄立即失效，不得再以任何方式使用；
/// - **风险 (Trade-offs)**：`send_enqueue` 自身负责刷新输出，桥接层不再单独调用 flush。
pub trait NativeStack: Send {
    /// 当前发送缓冲可接受的字节数。
    fn send_capacity(&mut self, handle: TcpHandle) -> usize;

    /// 把字节复制进发送缓冲。
    fn send_enqueue(&mut self, handle: TcpHandle, bytes: &[u8]) -> SendOutcome;

    /// 请求半关闭。
    fn shutdown(&mut self, handle: TcpHandle, direction: ShutdownDirection) -> Result<(), i32>;

    /// 优雅关闭，失败时调用方会退回 `abort`。
    fn close(&mut self, handle: TcpHandle) -> Result<(), i32>;

    /// 硬中止，不经过关闭握手。
    fn abort(&mut self, handle: TcpHandle);

    /// 向接收窗口归还 `count` 字节。
    fn acknowledge_received(&mut self, handle: TcpHandle, count: usize);

    /// 绑定连接键。
    fn attach(&mut self, handle: TcpHandle, key: ConnKey);

    /// 注销回调。
    fn detach(&mut self, handle: TcpHandle);

    /// 释放保存连接键的原生存储。
    fn release_key(&mut self, key: ConnKey);

    /// 把 IP 转换为原生地址结构，失败返回 `None`。
    fn translate_addr(&mut self, addr: IpAddr) -> Option<NativeAddr>;

    /// 释放 [`translate_addr`](Self::translate_addr) 分配的地址结构。
    fn release_addr(&mut self, addr: NativeAddr);

    /// 以 `src` 为源地址向 `dst:dst_port` 发送数据报。
    fn udp_send(
        &mut self,
        handle: UdpHandle,
        src: SocketAddr,
        dst: NativeAddr,
        dst_port: u16,
        payload: &[u8],
    ) -> Result<(), i32>;
}

/// 全局串行锁：原生栈单线程执行模型的显式化。
pub struct StackLock {
    inner: Mutex<Box<dyn NativeStack>>,
}

impl fmt::Debug for StackLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}

impl StackLock {
    pub fn new(stack: Box<dyn NativeStack>) -> Self {
        Self {
            inner: Mutex::new(stack),
        }
    }

    /// 阻塞直到取得全局锁。
    pub fn lock(&self) -> StackGuard<'_> {
        StackGuard {
            owner: self,
            inner: self.inner.lock(),
        }
    }

    /// 非阻塞尝试取得全局锁。
    pub fn try_lock(&self) -> Option<StackGuard<'_>> {
        self.inner
            .try_lock()
            .map(|inner| StackGuard { owner: self, inner })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

/// 持有全局串行锁的证明；析构时释放锁。
pub struct StackGuard<'a> {
    owner: &'a StackLock,
    inner: MutexGuard<'a, Box<dyn NativeStack>>,
}

impl StackGuard<'_> {
    /// 该守卫是否取自 `lock`。
    pub fn belongs_to(&self, lock: &StackLock) -> bool {
        std::ptr::eq(self.owner, lock)
    }
}

impl fmt::Debug for StackGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StackGuard")
    }
}

impl Deref for StackGuard<'_> {
    type Target = dyn NativeStack;

    fn deref(&self) -> &Self::Target {
        &**self.inner
    }
}

impl DerefMut for StackGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut **self.inner
    }
}
