use std::time::Duration;

use rustls::{AlertDescription, Error as RustlsError};
use spark_filterchain::{CoreError, ErrorCategory, SecurityClass};

use crate::engine::EngineError;

/// TLS 过滤器错误码。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将引擎、记录层与阻塞读的故障统一映射到过滤链的 [`ErrorCategory`]，
///   使异常路径能据此决定关闭连接或只终止当前写入；
/// - 稳定错误码让测试与运维脚本无需解析底层库细节即可定位问题。
///
/// ## 契约（What）
/// - 每个 [`TlsError`] 分支对应一个 `spark.transport.tls.*` 错误码；
/// - 转换为 [`CoreError`] 时原始 [`TlsError`] 保留为 `source()`，可经 `cause_ref` 取回。
pub mod codes {
    pub const PROTOCOL_VIOLATION: &str = "spark.transport.tls.protocol_violation";
    pub const ENGINE_FAILURE: &str = "spark.transport.tls.engine_failure";
    pub const HANDSHAKE_TIMEOUT: &str = "spark.transport.tls.handshake_timeout";
    pub const INSECURE_RENEGOTIATION: &str = "spark.transport.tls.insecure_renegotiation";
    pub const CERTIFICATE_CONVERSION: &str = "spark.transport.tls.certificate_conversion";
    pub const UNSUPPORTED_OPERATION: &str = "spark.transport.tls.unsupported_operation";
    pub const NO_SESSION: &str = "spark.transport.tls.no_session";
    pub const TRANSPORT: &str = "spark.transport.tls.transport";
    pub const INVALID_CONFIG: &str = "spark.transport.tls.invalid_config";
}

/// TLS 过滤器的领域错误。
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    /// 握手阶段 unwrap 报告缓冲不足/溢出，或记录头无法识别。
    #[error("tls protocol violation: {0}")]
    Protocol(String),
    #[error("tls engine failure: {0}")]
    Engine(#[from] EngineError),
    #[error("tls handshake timed out after {timeout:?}")]
    HandshakeTimeout {
        timeout: Option<Duration>,
        #[source]
        source: CoreError,
    },
    #[error("peer does not support secure renegotiation")]
    InsecureRenegotiation(#[source] EngineError),
    #[error("peer certificate conversion failed: {0}")]
    CertificateConversion(String),
    #[error("{0}")]
    UnsupportedOperation(&'static str),
    #[error("no tls session is associated with this connection")]
    NoSession,
    #[error("transport failure during tls processing")]
    Transport(#[source] CoreError),
    #[error("invalid tls filter configuration: {0}")]
    Config(String),
}

impl TlsError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => codes::PROTOCOL_VIOLATION,
            Self::Engine(_) => codes::ENGINE_FAILURE,
            Self::HandshakeTimeout { .. } => codes::HANDSHAKE_TIMEOUT,
            Self::InsecureRenegotiation(_) => codes::INSECURE_RENEGOTIATION,
            Self::CertificateConversion(_) => codes::CERTIFICATE_CONVERSION,
            Self::UnsupportedOperation(_) => codes::UNSUPPORTED_OPERATION,
            Self::NoSession => codes::NO_SESSION,
            Self::Transport(_) => codes::TRANSPORT,
            Self::Config(_) => codes::INVALID_CONFIG,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Protocol(_) => ErrorCategory::ProtocolViolation,
            Self::Engine(err) => categorize_engine_error(err),
            Self::HandshakeTimeout { .. } => ErrorCategory::Timeout,
            Self::InsecureRenegotiation(_) => ErrorCategory::Security(SecurityClass::Integrity),
            Self::CertificateConversion(_) => ErrorCategory::Security(SecurityClass::Authentication),
            Self::UnsupportedOperation(_) => ErrorCategory::Unsupported,
            Self::NoSession | Self::Config(_) => ErrorCategory::NonRetryable,
            Self::Transport(err) => err.category(),
        }
    }

    /// 把同步握手中阻塞读的失败映射为领域错误：超时归入 [`TlsError::HandshakeTimeout`]。
    pub(crate) fn from_blocking_read(error: CoreError, timeout: Option<Duration>) -> Self {
        if error.category() == ErrorCategory::Timeout {
            Self::HandshakeTimeout {
                timeout,
                source: error,
            }
        } else {
            Self::Transport(error)
        }
    }
}

impl From<TlsError> for CoreError {
    fn from(error: TlsError) -> Self {
        CoreError::new(error.code(), error.to_string())
            .with_category(error.category())
            .with_cause(error)
    }
}

fn categorize_engine_error(error: &EngineError) -> ErrorCategory {
    match error {
        EngineError::Rustls(err) => categorize_rustls_error(err),
        EngineError::InsecureRenegotiation(_) => ErrorCategory::Security(SecurityClass::Integrity),
        EngineError::Handshake(_) => ErrorCategory::Security(SecurityClass::Unknown),
        EngineError::PeerUnverified => ErrorCategory::Security(SecurityClass::Authentication),
        EngineError::Record(_) => ErrorCategory::ProtocolViolation,
        EngineError::RenegotiationUnsupported(_) => ErrorCategory::Unsupported,
        EngineError::Closed => ErrorCategory::NonRetryable,
    }
}

fn categorize_rustls_error(error: &RustlsError) -> ErrorCategory {
    use RustlsError::*;
    match error {
        InappropriateMessage { .. }
        | InappropriateHandshakeMessage { .. }
        | InvalidMessage(_)
        | PeerMisbehaved(_)
        | DecryptError
        | EncryptError
        | PeerSentOversizedRecord => ErrorCategory::Security(SecurityClass::Integrity),
        NoCertificatesPresented | InvalidCertificate(_) | UnsupportedNameType => {
            ErrorCategory::Security(SecurityClass::Authentication)
        }
        AlertReceived(alert) => alert_to_category(alert),
        NoApplicationProtocol => ErrorCategory::Security(SecurityClass::Unknown),
        FailedToGetCurrentTime | FailedToGetRandomBytes => ErrorCategory::ResourceExhausted,
        _ => ErrorCategory::NonRetryable,
    }
}

fn alert_to_category(alert: &AlertDescription) -> ErrorCategory {
    use AlertDescription::*;
    match alert {
        BadCertificate
        | UnsupportedCertificate
        | CertificateRevoked
        | CertificateExpired
        | CertificateUnknown
        | UnknownCA
        | CertificateRequired => ErrorCategory::Security(SecurityClass::Authentication),
        AccessDenied => ErrorCategory::Security(SecurityClass::Authorization),
        DecodeError
        | DecryptError
        | HandshakeFailure
        | IllegalParameter
        | RecordOverflow
        | BadRecordMac
        | UnexpectedMessage
        | InsufficientSecurity
        | ProtocolVersion => ErrorCategory::Security(SecurityClass::Integrity),
        _ => ErrorCategory::NonRetryable,
    }
}
