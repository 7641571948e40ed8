use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use parking_lot::Mutex;
use spark_buffer::{Buffer, BufferId, MemoryManager, SlabBufferPool};
use spark_filterchain::{Connection, ConnectionId, FilterChain};

use crate::{
    allocator::Allocator,
    engine::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine},
    error::TlsError,
    listener::{HandshakeListener, HandshakeListeners},
};

/// 同一条记录连续报告 `BUFFER_OVERFLOW` 的上限。
const MAX_OVERFLOW_RETRIES: usize = 8;

/// 会话的握手阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Handshaking,
    Established,
}

/// 握手完成时的状态迁移结果。
///
/// `pending_chain` 为 `Some` 时，调用方应在新链上排入一个新任务继续处理剩余数据。
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub pending_chain: Option<Arc<FilterChain>>,
}

/// 写路径记住的“最近一次输出缓冲”：只保存身份与当时的可读字节数，不持有缓冲本身。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputMark {
    pub id: BufferId,
    pub remaining: usize,
}

/// 每条连接一份的 TLS 会话上下文，以连接属性的形式随连接销毁。
///
/// # 设计背景（Why）
/// - 握手可能跨越多个读事件，未解密完的记录余量、引擎与协商出的尺寸都必须保存在连接上；
/// - 写路径的所有权策略运行在移交异步写队列的线程上，需要原子地“读取并清空”最近一次输出的标记。
///
/// # 逻辑（How）
/// - 引擎放在 `parking_lot::Mutex` 中，所有引擎调用都在短临界区内完成，
///   委托任务在锁外执行，网络 I/O 从不在持锁期间发生；
/// - 输入余量与输出标记各自独立加锁，保证“每个上下文至多一个存活的余量与一个输出标记”；
/// - 连接级握手监听器登记在上下文上，只接收本连接的握手通知。
///
/// # 契约（What）
/// - 在安装引擎之前，尺寸提示为 0，握手状态视为 `NotHandshaking`；
/// - [`with_engine`](Self::with_engine) 在没有引擎时返回 [`TlsError::NoSession`]。
pub struct SessionContext {
    connection_id: ConnectionId,
    memory_manager: Arc<dyn MemoryManager>,
    output_pool: SlabBufferPool,
    engine: Mutex<Option<Box<dyn TlsEngine>>>,
    state: Mutex<SessionState>,
    input_remainder: Mutex<Option<Buffer>>,
    last_output: Mutex<Option<OutputMark>>,
    pending_chain: Mutex<Option<Arc<FilterChain>>>,
    listeners: HandshakeListeners,
    net_buffer_size: AtomicUsize,
    app_buffer_size: AtomicUsize,
    inbound_closed: AtomicBool,
}

impl SessionContext {
    fn new(connection: &Connection, output_pool: SlabBufferPool) -> Self {
        Self {
            connection_id: connection.id(),
            memory_manager: Arc::clone(connection.memory_manager()),
            output_pool,
            engine: Mutex::new(None),
            state: Mutex::new(SessionState::NotStarted),
            input_remainder: Mutex::new(None),
            last_output: Mutex::new(None),
            pending_chain: Mutex::new(None),
            listeners: HandshakeListeners::new(),
            net_buffer_size: AtomicUsize::new(0),
            app_buffer_size: AtomicUsize::new(0),
            inbound_closed: AtomicBool::new(false),
        }
    }

    /// 取得连接上的会话上下文，不存在时创建。
    pub fn obtain(connection: &Connection, output_pool: &SlabBufferPool) -> Arc<Self> {
        connection.attribute_or_insert_with(|| Self::new(connection, output_pool.clone()))
    }

    /// 仅查询，不创建。
    pub fn get(connection: &Connection) -> Option<Arc<Self>> {
        connection.attribute::<Self>()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    pub fn output_pool(&self) -> &SlabBufferPool {
        &self.output_pool
    }

    /// 本连接的握手监听器；过滤器级监听器之后按登记顺序通知。
    pub fn listeners(&self) -> &HandshakeListeners {
        &self.listeners
    }

    pub fn add_handshake_listener(&self, listener: Arc<dyn HandshakeListener>) {
        self.listeners.add(listener);
    }

    pub fn remove_handshake_listener(&self, listener: &Arc<dyn HandshakeListener>) -> bool {
        self.listeners.remove(listener)
    }

    pub fn has_engine(&self) -> bool {
        self.engine.lock().is_some()
    }

    /// 安装引擎并记录其尺寸提示。
    pub fn install_engine(&self, engine: Box<dyn TlsEngine>) {
        self.net_buffer_size
            .store(engine.net_buffer_size(), Ordering::Release);
        self.app_buffer_size
            .store(engine.app_buffer_size(), Ordering::Release);
        *self.engine.lock() = Some(engine);
    }

    /// 在引擎锁内执行 `f`。
    pub fn with_engine<R>(&self, f: impl FnOnce(&mut dyn TlsEngine) -> R) -> Result<R, TlsError> {
        let mut guard = self.engine.lock();
        let engine = guard.as_deref_mut().ok_or(TlsError::NoSession)?;
        Ok(f(engine))
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        self.engine
            .lock()
            .as_deref()
            .map_or(HandshakeStatus::NotHandshaking, |engine| {
                engine.handshake_status()
            })
    }

    pub fn is_handshaking(&self) -> bool {
        self.handshake_status().is_handshaking()
    }

    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.engine
            .lock()
            .as_deref()
            .and_then(|engine| engine.negotiated_protocol())
    }

    pub fn net_buffer_size(&self) -> usize {
        self.net_buffer_size.load(Ordering::Acquire)
    }

    pub fn app_buffer_size(&self) -> usize {
        self.app_buffer_size.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub(crate) fn mark_handshaking(&self) {
        *self.state.lock() = SessionState::Handshaking;
    }

    /// `Handshaking -> Established`，同时取走待安装的过滤链。
    pub fn complete_handshake(&self) -> HandshakeOutcome {
        *self.state.lock() = SessionState::Established;
        HandshakeOutcome {
            pending_chain: self.pending_chain.lock().take(),
        }
    }

    /// 重协商完成：只迁移状态，待安装的过滤链保持不变。
    pub(crate) fn mark_established(&self) {
        *self.state.lock() = SessionState::Established;
    }

    /// 登记握手完成后需要切换到的过滤链（通常由 ALPN 等上层协商设置）。
    pub fn set_pending_chain(&self, chain: Arc<FilterChain>) {
        *self.pending_chain.lock() = Some(chain);
    }

    pub fn take_remainder(&self) -> Option<Buffer> {
        self.input_remainder.lock().take()
    }

    /// 保存未解密余量；空缓冲直接释放。
    pub fn store_remainder(&self, remainder: Option<Buffer>) {
        *self.input_remainder.lock() = remainder.filter(Buffer::has_remaining);
    }

    pub fn remainder_len(&self) -> usize {
        self.input_remainder
            .lock()
            .as_ref()
            .map_or(0, Buffer::remaining)
    }

    pub(crate) fn remember_last_output(&self, buffer: &Buffer) {
        *self.last_output.lock() = Some(OutputMark {
            id: buffer.id(),
            remaining: buffer.remaining(),
        });
    }

    /// 原子地读取并清空最近一次输出的标记。
    pub fn take_last_output(&self) -> Option<OutputMark> {
        self.last_output.lock().take()
    }

    pub fn is_inbound_closed(&self) -> bool {
        self.inbound_closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_inbound_closed(&self) {
        self.inbound_closed.store(true, Ordering::Release);
    }

    /// 执行引擎挂起的全部委托任务（在锁外运行）。
    pub(crate) fn run_delegated_tasks(&self) -> Result<usize, TlsError> {
        let mut executed = 0;
        while let Some(task) = self.with_engine(|engine| engine.delegated_task())? {
            task();
            executed += 1;
        }
        Ok(executed)
    }

    /// 把 `input` 起始处长度为 `record_len` 的完整记录解密进 `output`。
    ///
    /// 目标缓冲剩余空间不足应用缓冲尺寸时先经 `allocator` 扩容；
    /// 引擎报告 `BUFFER_OVERFLOW` 时按倍数继续扩容，并以剩余输入重试。
    /// 成功后 `input` 前移已消费的字节数。
    pub(crate) fn unwrap_record(
        &self,
        input: &mut Buffer,
        record_len: usize,
        output: &mut Option<Buffer>,
        allocator: &dyn Allocator,
    ) -> Result<EngineResult, TlsError> {
        let mut wanted = self.app_buffer_size().max(1);
        let mut consumed = 0;
        let mut produced = 0;
        for _ in 0..MAX_OVERFLOW_RETRIES {
            let target = self.ensure_writable(output, wanted, allocator);
            let record = &input.chunk()[consumed..record_len];
            let result = self.with_engine(|engine| engine.unwrap(record, target))??;
            consumed += result.bytes_consumed;
            produced += result.bytes_produced;
            if result.status == EngineStatus::BufferOverflow {
                wanted = wanted.saturating_mul(2);
                continue;
            }
            input.advance(consumed);
            return Ok(EngineResult::new(
                result.status,
                result.handshake_status,
                consumed,
                produced,
            ));
        }
        Err(TlsError::Protocol(format!(
            "engine kept reporting BUFFER_OVERFLOW for a {record_len}-byte record"
        )))
    }

    fn ensure_writable<'a>(
        &self,
        slot: &'a mut Option<Buffer>,
        wanted: usize,
        allocator: &dyn Allocator,
    ) -> &'a mut Buffer {
        let buffer = match slot.take() {
            Some(buffer) if buffer.remaining_mut() >= wanted => buffer,
            other => {
                let used = other.as_ref().map_or(0, Buffer::remaining);
                allocator.grow(self, other, used + wanted)
            }
        };
        slot.insert(buffer)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("connection", &self.connection_id)
            .field("state", &self.state())
            .field("has_engine", &self.has_engine())
            .field("remainder", &self.remainder_len())
            .field("inbound_closed", &self.is_inbound_closed())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
