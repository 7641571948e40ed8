use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use spark_buffer::{Buffer, SlabBufferPool};
use spark_filterchain::{
    Connection, CoreError, Event, Filter, FilterContext, Message, NextAction, Rehome, Result,
};
use tracing::debug;

use crate::{
    certificate::X509Certificate,
    config::TlsFilterConfig,
    context::{SessionContext, SessionState},
    engine::EngineFactory,
    error::TlsError,
    handoff::WriteOwnershipPolicy,
    listener::{HandshakeListener, HandshakeListeners},
};

const SEND_FILE_UNSUPPORTED: &str = "TLS operations not supported with SendFile messages";

/// 过滤链上的 TLS 阶段。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 读方向：握手阶段驱动引擎状态机，建立后把完整记录解密为明文交给上层；
/// - 写方向：在连接写互斥内把明文加密为记录，并附带所有权策略交给下层传输；
/// - 事件方向：同步应答证书请求，并为客户端发起首次握手。
///
/// ## 逻辑（How）
/// - 每条连接的会话状态保存在 [`SessionContext`] 连接属性中，过滤器自身无连接级状态，
///   可被多条连接、多条过滤链共享；
/// - `handshake_timeout` 为 `None` 时每个读事件只推进一步握手，需要更多数据即返回；
///   否则在当前线程以阻塞读驱动握手至完成；
/// - 握手完成后若会话登记了替换过滤链，则安装新链，并请求调度器在新链的同一索引处以新任务
///   继续处理尚未解密的剩余字节。
///
/// ## 契约（What）
/// - 不接受 `FileRegion` 消息：加密必须经过用户态缓冲；
/// - 写操作在会话没有引擎之前返回 [`TlsError::NoSession`]；
/// - 对端的关闭通知以一次（可能为空的）明文读事件告知上层，并标记会话入站关闭。
pub struct TlsFilter {
    engine_factory: Arc<dyn EngineFactory>,
    config: ArcSwap<TlsFilterConfig>,
    listeners: HandshakeListeners,
    output_pool: SlabBufferPool,
}

impl TlsFilter {
    pub fn new(engine_factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            engine_factory,
            config: ArcSwap::from_pointee(TlsFilterConfig::default()),
            listeners: HandshakeListeners::new(),
            output_pool: SlabBufferPool::new(),
        }
    }

    pub fn with_config(self, config: TlsFilterConfig) -> Self {
        self.config.store(Arc::new(config));
        self
    }

    /// 使用外部提供的输出缓冲池，便于多个过滤器实例共享同一组空闲块。
    pub fn with_output_pool(mut self, pool: SlabBufferPool) -> Self {
        self.output_pool = pool;
        self
    }

    pub fn config_snapshot(&self) -> Arc<TlsFilterConfig> {
        self.config.load_full()
    }

    /// 替换配置；只影响之后开始的握手。
    pub fn replace_config(&self, config: TlsFilterConfig) {
        self.config.store(Arc::new(config));
    }

    pub fn listeners(&self) -> &HandshakeListeners {
        &self.listeners
    }

    /// 登记过滤器级监听器，接收共享此过滤器的所有连接的握手通知。
    ///
    /// 只关心单条连接时使用 [`SessionContext::add_handshake_listener`]。
    pub fn add_handshake_listener(&self, listener: Arc<dyn HandshakeListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_handshake_listener(&self, listener: &Arc<dyn HandshakeListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn output_pool(&self) -> &SlabBufferPool {
        &self.output_pool
    }

    pub(crate) fn notify_start(&self, session: &SessionContext, connection: &Connection) {
        self.listeners.notify_start(connection);
        session.listeners().notify_start(connection);
    }

    pub(crate) fn notify_complete(&self, session: &SessionContext, connection: &Connection) {
        self.listeners.notify_complete(connection);
        session.listeners().notify_complete(connection);
    }

    pub(crate) fn notify_failure(
        &self,
        session: &SessionContext,
        connection: &Connection,
        error: &TlsError,
    ) {
        self.listeners.notify_failure(connection, error);
        session.listeners().notify_failure(connection, error);
    }

    /// 取得连接的会话上下文，不存在时创建。
    pub fn session(&self, connection: &Connection) -> Arc<SessionContext> {
        SessionContext::obtain(connection, &self.output_pool)
    }

    /// 会话尚无引擎时创建引擎并开始握手。
    pub(crate) fn ensure_engine(
        &self,
        session: &SessionContext,
        connection: &Connection,
    ) -> Result<(), TlsError> {
        if session.has_engine() {
            return Ok(());
        }
        let mut engine = self.engine_factory.create_engine(connection)?;
        engine.begin_handshake()?;
        session.install_engine(engine);
        session.mark_handshaking();
        debug!(
            target: "spark::tls",
            connection = %connection.id(),
            net_buffer_size = session.net_buffer_size(),
            "tls engine installed, handshake started"
        );
        self.notify_start(session, connection);
        Ok(())
    }

    fn read(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction, TlsError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::Stop);
        };
        let incoming = match message {
            Message::Buffer(buffer) => buffer,
            Message::Composite(composite) => composite.into_contiguous(),
            Message::FileRegion(_) => return Err(TlsError::UnsupportedOperation(SEND_FILE_UNSUPPORTED)),
        };
        let connection = ctx.connection();
        let session = self.session(connection);
        let input = Buffer::concat(session.take_remainder(), incoming);

        if session.has_engine()
            && session.state() == SessionState::Established
            && !session.is_handshaking()
        {
            return self.forward_plaintext(&session, ctx, input);
        }

        self.ensure_engine(&session, connection)?;
        let leftover = match self.config_snapshot().handshake_timeout {
            Some(timeout) => self.handshake_sync(&session, ctx, Some(input), Some(timeout))?,
            None => self.handshake_step(&session, ctx, Some(input))?,
        };
        if session.is_handshaking() {
            session.store_remainder(leftover);
            return Ok(NextAction::Stop);
        }
        self.finish_handshake(&session, ctx, leftover)
    }

    fn forward_plaintext(
        &self,
        session: &SessionContext,
        ctx: &mut FilterContext<'_>,
        input: Buffer,
    ) -> Result<NextAction, TlsError> {
        let outcome = self.unwrap_all(session, ctx, input)?;
        session.store_remainder(outcome.remainder);
        match outcome.plaintext {
            Some(plaintext) => {
                ctx.set_message(Some(Message::Buffer(plaintext)));
                Ok(NextAction::Invoke)
            }
            None if outcome.closed => {
                ctx.set_message(Some(Message::Buffer(Buffer::with_capacity(0))));
                Ok(NextAction::Invoke)
            }
            None => Ok(NextAction::Stop),
        }
    }

    /// `Handshaking -> Established`，并按是否存在替换过滤链决定剩余字节的去向。
    fn finish_handshake(
        &self,
        session: &SessionContext,
        ctx: &mut FilterContext<'_>,
        remainder: Option<Buffer>,
    ) -> Result<NextAction, TlsError> {
        let connection = ctx.connection();
        let outcome = session.complete_handshake();
        debug!(
            target: "spark::tls",
            connection = %connection.id(),
            protocol = ?session.negotiated_protocol().map(|p| String::from_utf8_lossy(&p).into_owned()),
            "tls handshake completed"
        );
        self.notify_complete(session, connection);

        match (outcome.pending_chain, remainder) {
            (Some(chain), remainder) => {
                connection.set_filter_chain(Arc::clone(&chain));
                Ok(match remainder {
                    Some(remainder) => NextAction::Rehome(Rehome {
                        chain,
                        start_index: ctx.filter_index(),
                        message: Some(Message::Buffer(remainder)),
                    }),
                    None => NextAction::Stop,
                })
            }
            (None, Some(remainder)) => self.forward_plaintext(session, ctx, remainder),
            (None, None) => Ok(NextAction::Stop),
        }
    }

    fn write(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction, TlsError> {
        let Some(message) = ctx.take_message() else {
            return Ok(NextAction::Stop);
        };
        let plaintext = match message {
            Message::Buffer(buffer) => buffer,
            Message::Composite(composite) => composite.into_contiguous(),
            Message::FileRegion(_) => return Err(TlsError::UnsupportedOperation(SEND_FILE_UNSUPPORTED)),
        };
        let connection = ctx.connection();
        let session = SessionContext::get(connection)
            .filter(|session| session.has_engine())
            .ok_or(TlsError::NoSession)?;

        let _write_guard = connection.write_lock();
        let records = self.wrap_all(&session, plaintext)?;
        ctx.write_with(records, Arc::new(WriteOwnershipPolicy))
            .map_err(TlsError::Transport)?;
        Ok(NextAction::Stop)
    }

    fn start_handshake(&self, ctx: &mut FilterContext<'_>) -> Result<(), TlsError> {
        let connection = ctx.connection();
        let session = self.session(connection);
        self.ensure_engine(&session, connection)?;
        let leftover = self.handshake_step(&session, ctx, session.take_remainder())?;
        session.store_remainder(leftover);
        if !session.is_handshaking() && session.state() != SessionState::Established {
            // 剩余字节留在会话中，由下一次读事件处理。
            self.finish_handshake(&session, ctx, None)?;
        }
        Ok(())
    }
}

impl Filter for TlsFilter {
    fn handle_read(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        Ok(self.read(ctx)?)
    }

    fn handle_write(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        Ok(self.write(ctx)?)
    }

    fn handle_event(&self, ctx: &mut FilterContext<'_>, event: &mut dyn Event) -> Result<NextAction> {
        if let Some(request) = event.downcast_mut::<CertificateEvent>() {
            let need_client_auth = request.need_client_auth;
            request.certificates = SessionContext::get(ctx.connection())
                .filter(|session| session.has_engine())
                .and_then(|session| self.peer_certificate_chain(&session, ctx, need_client_auth));
            return Ok(NextAction::Stop);
        }
        if event.is::<StartHandshakeEvent>() {
            self.start_handshake(ctx).map_err(CoreError::from)?;
            return Ok(NextAction::Stop);
        }
        Ok(NextAction::Invoke)
    }
}

impl fmt::Debug for TlsFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsFilter")
            .field("config", &self.config_snapshot())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// 请求对端证书链的事件，由 TLS 阶段就地填充 `certificates` 后截断传递。
#[derive(Debug, Default)]
pub struct CertificateEvent {
    pub need_client_auth: bool,
    pub certificates: Option<Vec<X509Certificate>>,
}

impl CertificateEvent {
    pub fn new(need_client_auth: bool) -> Self {
        Self {
            need_client_auth,
            certificates: None,
        }
    }
}

impl Event for CertificateEvent {
    fn event_type(&self) -> &'static str {
        "tls.certificate_request"
    }
}

/// 客户端发起握手：创建引擎并立即写出首个握手报文。
#[derive(Debug, Default, Clone, Copy)]
pub struct StartHandshakeEvent;

impl Event for StartHandshakeEvent {
    fn event_type(&self) -> &'static str {
        "tls.start_handshake"
    }
}
