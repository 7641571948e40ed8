use std::{sync::Arc, time::Duration};

use spark_buffer::Buffer;

use crate::{
    connection::Connection,
    context::FilterContext,
    error::Result,
    filter::{Filter, NextAction},
    message::Message,
};

/// 传输层契约：非阻塞写入（可能进入异步写队列）与带超时的阻塞读取。
///
/// # 契约说明（What）
/// - `write`：当消息无法在当前线程立即写出而需进入异步写队列时，
///   传输层必须在移交队列的那一刻调用 `lifecycle.on_thread_context_switch`，并写出其返回的消息；
/// - `read_blocking`：超时必须以 [`ErrorCategory::Timeout`](crate::ErrorCategory::Timeout) 的错误报告。
pub trait Transport: Send + Sync + 'static {
    fn write(
        &self,
        connection: &Connection,
        message: Message,
        lifecycle: Option<Arc<dyn WriteLifecycle>>,
    ) -> Result<()>;

    fn read_blocking(&self, connection: &Connection, timeout: Option<Duration>) -> Result<Buffer>;
}

/// 写操作生命周期钩子。
///
/// 在消息跨越线程进入异步写队列时执行，可能运行在与产生该消息不同的线程上。
pub trait WriteLifecycle: Send + Sync + 'static {
    fn on_thread_context_switch(&self, connection: &Connection, message: Message) -> Message;
}

/// 过滤链最底层的传输过滤器：读方向原样放行，写方向把消息交给连接的传输层。
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportFilter;

impl Filter for TransportFilter {
    fn handle_read(&self, _ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        Ok(NextAction::Invoke)
    }

    fn handle_write(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        if let Some(message) = ctx.take_message() {
            let lifecycle = ctx.take_lifecycle();
            let connection = ctx.connection();
            connection.transport().write(connection, message, lifecycle)?;
        }
        Ok(NextAction::Stop)
    }
}
