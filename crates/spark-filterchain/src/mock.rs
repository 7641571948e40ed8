//! 测试替身：内存传输与收集型应用过滤器。
//!
//! 仅在 `test-util` 特性下编译，供本 crate 与下游 crate 的集成测试复用。

use std::{
    collections::VecDeque,
    panic,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use spark_buffer::Buffer;

use crate::{
    connection::Connection,
    context::FilterContext,
    error::{CoreError, ErrorCategory, Result, codes},
    event::Event,
    filter::{Filter, NextAction},
    message::Message,
    transport::{Transport, WriteLifecycle},
};

/// 写入的移交方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandoffMode {
    /// 在调用线程直接完成写入，不触发生命周期钩子。
    Inline,
    /// 模拟进入异步写队列：在另一线程上执行 `on_thread_context_switch` 后再记录。
    Queued,
}

/// 把写出的消息记录在内存中、从预置队列提供阻塞读数据的传输。
///
/// 阻塞读在队列为空时立即以超时错误返回，避免测试真正挂起。
pub struct MemoryTransport {
    mode: HandoffMode,
    written: Mutex<Vec<Message>>,
    inbound: Mutex<VecDeque<Buffer>>,
    observed_timeouts: Mutex<Vec<Option<Duration>>>,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Self::with_mode(HandoffMode::Inline)
    }

    pub fn queued() -> Arc<Self> {
        Self::with_mode(HandoffMode::Queued)
    }

    pub fn with_mode(mode: HandoffMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            written: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            observed_timeouts: Mutex::new(Vec::new()),
        })
    }

    /// 为后续的阻塞读预置一块数据。
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.inbound.lock().push_back(Buffer::copy_from_slice(bytes));
    }

    pub fn write_count(&self) -> usize {
        self.written.lock().len()
    }

    /// 取走全部已写出的消息。
    pub fn take_written(&self) -> Vec<Message> {
        std::mem::take(&mut *self.written.lock())
    }

    /// 取走全部已写出的消息并拼接为字节序列。
    pub fn take_written_bytes(&self) -> Vec<u8> {
        self.take_written()
            .iter()
            .flat_map(Message::to_vec)
            .collect()
    }

    /// 每次阻塞读时观察到的超时设置。
    pub fn observed_timeouts(&self) -> Vec<Option<Duration>> {
        self.observed_timeouts.lock().clone()
    }
}

impl Transport for MemoryTransport {
    fn write(
        &self,
        connection: &Connection,
        message: Message,
        lifecycle: Option<Arc<dyn WriteLifecycle>>,
    ) -> Result<()> {
        let message = match (self.mode, lifecycle) {
            (HandoffMode::Queued, Some(lifecycle)) => thread::scope(|scope| {
                let handle =
                    scope.spawn(move || lifecycle.on_thread_context_switch(connection, message));
                match handle.join() {
                    Ok(message) => message,
                    Err(payload) => panic::resume_unwind(payload),
                }
            }),
            (_, _) => message,
        };
        self.written.lock().push(message);
        Ok(())
    }

    fn read_blocking(&self, _connection: &Connection, timeout: Option<Duration>) -> Result<Buffer> {
        self.observed_timeouts.lock().push(timeout);
        self.inbound.lock().pop_front().ok_or_else(|| {
            CoreError::new(codes::READ_TIMEOUT, "blocking read timed out")
                .with_category(ErrorCategory::Timeout)
        })
    }
}

/// 位于过滤链顶端的应用过滤器：收集读到的字节与事件类型。
#[derive(Default)]
pub struct CollectingFilter {
    received: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    events: Mutex<Vec<&'static str>>,
}

impl CollectingFilter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl Filter for CollectingFilter {
    fn handle_read(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = ctx.take_message() {
            self.received.lock().extend_from_slice(&message.to_vec());
        }
        Ok(NextAction::Stop)
    }

    fn handle_event(&self, _ctx: &mut FilterContext<'_>, event: &mut dyn Event) -> Result<NextAction> {
        self.events.lock().push(event.event_type());
        Ok(NextAction::Stop)
    }
}
