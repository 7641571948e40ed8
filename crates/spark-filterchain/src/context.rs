use std::sync::Arc;

use spark_buffer::Buffer;

use crate::{
    chain::FilterChain,
    connection::Connection,
    error::Result,
    message::Message,
    transport::WriteLifecycle,
};

/// 一次过滤器调用的上下文：所属连接、所属过滤链、当前位置与在途消息。
///
/// # 设计背景（Why）
/// - 过滤器在处理读事件的同时可能需要向下写（例如握手记录）或同步读（阻塞握手），
///   上下文把这些能力收敛在一处，过滤器无需直接持有过滤链；
/// - 上下文只在一次调用内有效，借用连接与过滤链而不延长其生命周期。
///
/// # 契约说明（What）
/// - [`write`](Self::write) 从当前位置的下一个过滤器开始向下传递，不会重新经过当前过滤器；
/// - [`read`](Self::read) 以连接当前的阻塞读超时同步读取。
pub struct FilterContext<'a> {
    connection: &'a Arc<Connection>,
    chain: &'a Arc<FilterChain>,
    index: usize,
    message: Option<Message>,
    lifecycle: Option<Arc<dyn WriteLifecycle>>,
}

impl<'a> FilterContext<'a> {
    pub fn new(connection: &'a Arc<Connection>, chain: &'a Arc<FilterChain>, index: usize) -> Self {
        Self {
            connection,
            chain,
            index,
            message: None,
            lifecycle: None,
        }
    }

    pub fn connection(&self) -> &'a Arc<Connection> {
        self.connection
    }

    pub fn chain(&self) -> &'a Arc<FilterChain> {
        self.chain
    }

    /// 当前过滤器在过滤链中的索引。
    pub fn filter_index(&self) -> usize {
        self.index
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take()
    }

    pub fn set_message(&mut self, message: Option<Message>) {
        self.message = message;
    }

    pub fn take_lifecycle(&mut self) -> Option<Arc<dyn WriteLifecycle>> {
        self.lifecycle.take()
    }

    pub fn set_lifecycle(&mut self, lifecycle: Option<Arc<dyn WriteLifecycle>>) {
        self.lifecycle = lifecycle;
    }

    /// 向下游写出消息。
    pub fn write(&self, message: Message) -> Result<()> {
        self.chain.write_from(self.connection, self.index, message, None)
    }

    /// 向下游写出消息，并附带异步写队列移交时执行的生命周期钩子。
    pub fn write_with(&self, message: Message, lifecycle: Arc<dyn WriteLifecycle>) -> Result<()> {
        self.chain
            .write_from(self.connection, self.index, message, Some(lifecycle))
    }

    /// 同步读取一块数据。
    pub fn read(&self) -> Result<Buffer> {
        self.connection.read_blocking()
    }
}
