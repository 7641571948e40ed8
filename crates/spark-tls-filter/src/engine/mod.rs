//! TLS 引擎能力契约。
//!
//! # 模块定位（Why）
//! - 过滤器只依赖“握手状态 + 单次 wrap/unwrap + 委托任务 + 会话访问器”这组窄能力，
//!   具体实现（rustls 或测试中的脚本引擎）通过 [`EngineFactory`] 按连接注入；
//! - 缓冲统一使用 [`spark_buffer::Buffer`]：输入为只读切片，输出写入缓冲的可写区间，
//!   “剩余可写空间不足”即 [`EngineStatus::BufferOverflow`]。

mod rustls_adapter;

pub use rustls_adapter::{
    APP_BUFFER_SIZE, NET_BUFFER_SIZE, RustlsClientFactory, RustlsEngine, RustlsServerFactory,
};

use spark_buffer::Buffer;
use spark_filterchain::Connection;

/// 引擎报告的握手状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeStatus {
    NeedUnwrap,
    NeedWrap,
    NeedTask,
    /// 仅出现在完成握手的那一次操作结果中。
    Finished,
    NotHandshaking,
}

impl HandshakeStatus {
    pub fn is_handshaking(self) -> bool {
        matches!(self, Self::NeedUnwrap | Self::NeedWrap | Self::NeedTask)
    }
}

/// 单次 wrap/unwrap 的结果状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    Closed,
    /// 输入不足一条完整记录。
    BufferUnderflow,
    /// 目标缓冲剩余可写空间不足。
    BufferOverflow,
}

/// 单次 wrap/unwrap 的完整结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

/// 引擎交给驱动线程同步执行的 CPU 密集任务。
pub type DelegatedTask = Box<dyn FnOnce() + Send + 'static>;

/// DER 编码的对端证书，尚未解析。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawCertificate(pub Vec<u8>);

impl RawCertificate {
    pub fn as_der(&self) -> &[u8] {
        &self.0
    }
}

/// 引擎层故障。
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("handshake failure: {0}")]
    Handshake(String),
    #[error("record failure: {0}")]
    Record(String),
    /// 对端不支持 RFC 5746 安全重协商。
    #[error("insecure renegotiation: {0}")]
    InsecureRenegotiation(String),
    #[error("renegotiation is not supported: {0}")]
    RenegotiationUnsupported(&'static str),
    #[error("peer identity has not been verified")]
    PeerUnverified,
    #[error("engine is closed")]
    Closed,
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

impl EngineError {
    /// 是否属于“对端不支持安全重协商”的握手失败。
    pub fn is_insecure_renegotiation(&self) -> bool {
        match self {
            Self::InsecureRenegotiation(_) => true,
            Self::Handshake(reason) => reason.to_ascii_lowercase().contains("insecure renegotiation"),
            _ => false,
        }
    }
}

/// 握手引擎能力集合。
///
/// # 契约说明（What）
/// - `unwrap` 的 `src` 恰为一条完整记录；目标缓冲容纳不下明文时返回 `BufferOverflow`，
///   并在 `bytes_consumed` 中报告已经吸收的输入，调用方扩容后以剩余输入重试；
/// - `wrap` 在目标缓冲剩余空间不足以容纳一条完整记录时返回 `BufferOverflow`；
/// - `handshake_status` 为 `NeedTask` 时，`delegated_task` 必须至少返回一个任务；
/// - `peer_certificates` 在对端身份未经验证时返回 `Err(EngineError::PeerUnverified)`。
pub trait TlsEngine: Send + 'static {
    fn begin_handshake(&mut self) -> Result<(), EngineError>;

    fn handshake_status(&self) -> HandshakeStatus;

    fn wrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, EngineError>;

    fn unwrap(&mut self, src: &[u8], dst: &mut Buffer) -> Result<EngineResult, EngineError>;

    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// 使当前会话失效，下一次握手不得复用其密钥材料。
    fn invalidate_session(&mut self);

    fn peer_certificates(&self) -> Result<Vec<RawCertificate>, EngineError>;

    fn want_client_auth(&self) -> bool;

    fn need_client_auth(&self) -> bool;

    fn set_want_client_auth(&mut self, want: bool);

    fn set_need_client_auth(&mut self, need: bool);

    /// 单条加密记录的最大字节数。
    fn net_buffer_size(&self) -> usize;

    /// 单条记录可承载的最大明文字节数。
    fn app_buffer_size(&self) -> usize;

    /// 握手协商出的应用层协议（ALPN）。
    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        None
    }
}

/// 按连接创建引擎。
pub trait EngineFactory: Send + Sync + 'static {
    fn create_engine(&self, connection: &Connection) -> Result<Box<dyn TlsEngine>, EngineError>;
}
