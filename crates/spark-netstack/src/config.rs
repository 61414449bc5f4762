//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 集中描述连接上限、空闲超时、地址缓存与清扫周期等可调参数；
//! - 以 TOML 作为外部载体，字段缺省时回退到默认值，未知字段直接报错，避免拼写错误被静默忽略。
//!
//! ## 行为契约（What）
//! - [`NetstackConfig::from_toml_str`]：解析并校验；
//! - [`NetstackConfig::validate`]：拒绝零容量、零 TTL 与零清扫周期；
//! - 运行期调整通过 `Netstack::set_*` 系列方法完成，本模块只负责静态描述。

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{NetstackError, Result};

/// TCP 连接数达到上限时的处置策略。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TcpOverflowPolicy {
    /// 中止最久未活跃的连接，为新连接腾出位置。
    #[default]
    EvictOldest,
    /// 拒绝新连接，返回 `ConnectionLimit`。
    Refuse,
}

/// 桥接层配置。
///
/// # 教案式注释
/// - **意图 (Why)**：让部署方在不改代码的前提下调整资源上限；
/// - **契约 (What)**：所有字段都有默认值，空文档等价于 [`NetstackConfig::default`]；
/// - **风险 (Trade-offs)**：时间字段以整数秒/毫秒表达，牺牲一点精度换取配置文件的可读性。
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetstackConfig {
    pub max_tcp_connections: usize,
    pub tcp_overflow: TcpOverflowPolicy,
    pub max_udp_flows: usize,
    pub udp_idle_timeout_secs: u64,
    pub address_cache_capacity: usize,
    pub address_cache_ttl_secs: u64,
    pub sweep_interval_ms: u64,
}

impl Default for NetstackConfig {
    fn default() -> Self {
        Self {
            max_tcp_connections: 1024,
            tcp_overflow: TcpOverflowPolicy::EvictOldest,
            max_udp_flows: 1024,
            udp_idle_timeout_secs: 60,
            address_cache_capacity: 1024,
            address_cache_ttl_secs: 60,
            sweep_interval_ms: 10_000,
        }
    }
}

impl NetstackConfig {
    /// 解析 TOML 文本并执行校验。
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: NetstackConfig =
            toml::from_str(raw).map_err(|err| NetstackError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验字段取值。
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("max_tcp_connections", self.max_tcp_connections as u64),
            ("max_udp_flows", self.max_udp_flows as u64),
            ("udp_idle_timeout_secs", self.udp_idle_timeout_secs),
            ("address_cache_capacity", self.address_cache_capacity as u64),
            ("address_cache_ttl_secs", self.address_cache_ttl_secs),
            ("sweep_interval_ms", self.sweep_interval_ms),
        ];
        match checks.iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(NetstackError::config(format!("{field} must be positive"))),
            None => Ok(()),
        }
    }

    pub(crate) fn tcp_limit(&self) -> Result<NonZeroUsize> {
        non_zero("max_tcp_connections", self.max_tcp_connections)
    }

    pub(crate) fn udp_limit(&self) -> Result<NonZeroUsize> {
        non_zero("max_udp_flows", self.max_udp_flows)
    }

    pub(crate) fn address_limit(&self) -> Result<NonZeroUsize> {
        non_zero("address_cache_capacity", self.address_cache_capacity)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn address_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.address_cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn non_zero(field: &str, value: usize) -> Result<NonZeroUsize> {
    NonZeroUsize::new(value).ok_or_else(|| NetstackError::config(format!("{field} must be positive")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = NetstackConfig::from_toml_str("").expect("空文档应当合法");
        assert_eq!(config, NetstackConfig::default());
        assert_eq!(config.udp_idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.sweep_interval(), Duration::from_secs(10));
    }

    #[test]
    fn partial_document_overrides_named_fields() {
        let config = NetstackConfig::from_toml_str(
            r#"
            max_tcp_connections = 16
            tcp_overflow = "refuse"
            address_cache_ttl_secs = 5
            "#,
        )
        .expect("配置应当合法");
        assert_eq!(config.max_tcp_connections, 16);
        assert_eq!(config.tcp_overflow, TcpOverflowPolicy::Refuse);
        assert_eq!(config.address_cache_ttl(), Duration::from_secs(5));
        assert_eq!(config.max_udp_flows, 1024);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = NetstackConfig::from_toml_str("max_connections = 3").expect_err("未知字段必须报错");
        assert!(matches!(err, NetstackError::Config { .. }));
    }

    #[test]
    fn zero_capacity_fails_validation() {
        let err = NetstackConfig::from_toml_str("max_udp_flows = 0").expect_err("零容量必须报错");
        assert_eq!(
            err,
            NetstackError::config("max_udp_flows must be positive")
        );
    }
}
