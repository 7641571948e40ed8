use std::time::Duration;

use serde::Deserialize;

use crate::error::TlsError;

/// TLS 过滤器的运行时配置。
///
/// # 契约说明（What）
/// - `handshake_timeout`：`None` 表示纯事件驱动握手；`Some(d)` 表示在读事件线程上
///   以阻塞读驱动握手直至完成，单次阻塞读超过 `d` 即视为握手失败；
/// - `renegotiate_on_client_auth_want`：对端证书缺失且引擎仅“希望”客户端认证时，
///   是否仍触发重协商（“需要”客户端认证时总是触发）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsFilterConfig {
    pub handshake_timeout: Option<Duration>,
    pub renegotiate_on_client_auth_want: bool,
}

impl Default for TlsFilterConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: None,
            renegotiate_on_client_auth_want: true,
        }
    }
}

impl TlsFilterConfig {
    pub fn builder() -> TlsFilterConfigBuilder {
        TlsFilterConfigBuilder::default()
    }

    /// 从 TOML 文本解析配置。
    ///
    /// ```toml
    /// handshake_timeout_ms = 5000          # 缺省或负数表示关闭
    /// renegotiate_on_client_auth_want = true
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, TlsError> {
        let raw: RawConfig =
            toml::from_str(source).map_err(|err| TlsError::Config(err.to_string()))?;
        Ok(Self {
            handshake_timeout: u64::try_from(raw.handshake_timeout_ms)
                .ok()
                .map(Duration::from_millis),
            renegotiate_on_client_auth_want: raw.renegotiate_on_client_auth_want,
        })
    }
}

#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    handshake_timeout_ms: i64,
    renegotiate_on_client_auth_want: bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: -1,
            renegotiate_on_client_auth_want: true,
        }
    }
}

#[derive(Default)]
pub struct TlsFilterConfigBuilder {
    config: TlsFilterConfig,
}

impl TlsFilterConfigBuilder {
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    pub fn renegotiate_on_client_auth_want(mut self, enabled: bool) -> Self {
        self.config.renegotiate_on_client_auth_want = enabled;
        self
    }

    pub fn build(self) -> TlsFilterConfig {
        self.config
    }
}
