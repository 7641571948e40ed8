use std::{borrow::Cow, error::Error, fmt};

/// `ErrorCause` 封装底层原因，保持 `Send + Sync` 以方便跨线程传递。
pub type ErrorCause = Box<dyn Error + Send + Sync + 'static>;

/// 过滤链统一的返回值别名。
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// `CoreError` 提供稳定的错误码与根因链路，是过滤链错误分层的最底层。
///
/// # 设计背景（Why）
/// - 过滤器、传输与 TLS 层各自产生的故障需要合流为统一的错误码，
///   以便过滤链的异常路径按分类决定关闭连接还是仅终止当前操作；
/// - 领域错误（例如 TLS 层的 `TlsError`）以 `cause` 的形式保留，调用方可经 `source()` 向下转型。
///
/// # 契约说明（What）
/// - `code`：稳定字符串，遵循 `<域>.<语义>` 命名，例如 `spark.transport.tls.handshake_timeout`；
/// - `message`：人类可读描述，避免包含敏感信息；
/// - `category`：结构化分类，未显式设置时视为 [`ErrorCategory::NonRetryable`]。
#[derive(Debug)]
pub struct CoreError {
    code: &'static str,
    message: Cow<'static, str>,
    cause: Option<ErrorCause>,
    category: Option<ErrorCategory>,
}

impl CoreError {
    /// 构造核心错误。
    pub fn new(code: &'static str, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
            category: None,
        }
    }

    /// 附带底层原因。
    pub fn with_cause(mut self, cause: impl Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// 标记结构化分类。
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn category(&self) -> ErrorCategory {
        self.category.unwrap_or(ErrorCategory::NonRetryable)
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// 若底层原因为 `T`，返回其引用。
    pub fn cause_ref<T: Error + 'static>(&self) -> Option<&T> {
        self.cause.as_deref().and_then(|cause| cause.downcast_ref::<T>())
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause
            .as_ref()
            .map(|boxed| boxed.as_ref() as &(dyn Error + 'static))
    }
}

/// 错误分类枚举，驱动过滤链的自动化处置策略。
///
/// - `Timeout`：阻塞读取或握手超出截止时间；
/// - `ProtocolViolation`：对端或引擎违反记录层约束，连接必须关闭；
/// - `Security`：标记安全分类 [`SecurityClass`]；
/// - `Unsupported`：操作本身不被支持，只终止当前调用；
/// - 其余分支对应确定性的策略。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    NonRetryable,
    Security(SecurityClass),
    ResourceExhausted,
    ProtocolViolation,
    Unsupported,
    Cancelled,
    Timeout,
}

/// 安全事件的细分类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityClass {
    Authentication,
    Authorization,
    Integrity,
    Unknown,
}

/// 过滤链自身使用的稳定错误码。
pub mod codes {
    pub const TRANSPORT_IO: &str = "spark.filterchain.transport_io";
    pub const READ_TIMEOUT: &str = "spark.filterchain.read_timeout";
    pub const CONNECTION_CLOSED: &str = "spark.filterchain.connection_closed";
}
