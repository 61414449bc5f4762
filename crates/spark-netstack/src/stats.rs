//! 运行期统计与连接清单。
//!
//! - **意图 (Why)**：排障时需要一眼看到当前存活的连接与各缓存的占用；
//! - **契约 (What)**：[`NetstackStats`] 是某一时刻的计数快照；
//!   文本清单先列 TCP 段再列 UDP 段，每段以 `... connection count: N, list:` 开头，
//!   其后每行一个连接，TCP 按键升序、UDP 按源地址升序。

use std::fmt;
use std::sync::Arc;

use crate::registry::ConnKey;
use crate::tcp::TcpConnection;
use crate::udp::{FlowKey, UdpConnection};

/// 计数快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetstackStats {
    pub tcp_connections: usize,
    pub tcp_limit: usize,
    pub udp_flows: usize,
    pub udp_flow_limit: usize,
    pub cached_addresses: usize,
    pub address_cache_capacity: usize,
    /// 已登记但尚未在全局锁下执行的释放工作。
    pub deferred_pending: usize,
}

impl fmt::Display for NetstackStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tcp {}/{}, udp {}/{}, addresses {}/{}, deferred {}",
            self.tcp_connections,
            self.tcp_limit,
            self.udp_flows,
            self.udp_flow_limit,
            self.cached_addresses,
            self.address_cache_capacity,
            self.deferred_pending,
        )
    }
}

/// 一轮清扫的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_flows: usize,
    pub expired_addresses: usize,
    /// 本轮在全局锁下执行的延迟释放工作数量。
    pub reaped: usize,
}

pub(crate) fn write_tcp_section(
    out: &mut impl fmt::Write,
    conns: &[(ConnKey, Arc<TcpConnection>)],
) -> fmt::Result {
    writeln!(out, "tcp connection count: {}, list:", conns.len())?;
    for (key, conn) in conns {
        writeln!(
            out,
            "conn {key}: {} -> {} [{}]",
            conn.local_addr(),
            conn.remote_addr(),
            conn.state()
        )?;
    }
    Ok(())
}

pub(crate) fn write_udp_section(
    out: &mut impl fmt::Write,
    flows: &[(FlowKey, Arc<UdpConnection>)],
) -> fmt::Result {
    writeln!(out, "udp connection count: {}, list:", flows.len())?;
    for (flow, conn) in flows {
        writeln!(out, "conn {flow}: {}", conn.local_addr())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sections_keep_headers() {
        let mut out = String::new();
        write_tcp_section(&mut out, &[]).expect("写入字符串不会失败");
        write_udp_section(&mut out, &[]).expect("写入字符串不会失败");
        assert_eq!(
            out,
            "tcp connection count: 0, list:\nudp connection count: 0, list:\n"
        );
    }

    #[test]
    fn summary_line_lists_every_counter() {
        let stats = NetstackStats {
            tcp_connections: 2,
            tcp_limit: 8,
            udp_flows: 1,
            udp_flow_limit: 4,
            cached_addresses: 3,
            address_cache_capacity: 16,
            deferred_pending: 0,
        };
        assert_eq!(
            stats.to_string(),
            "tcp 2/8, udp 1/4, addresses 3/16, deferred 0"
        );
    }
}
