use std::{collections::VecDeque, fmt, sync::Arc};

use tracing::{debug, trace};

use crate::{
    connection::Connection,
    context::FilterContext,
    error::{CoreError, Result},
    event::Event,
    filter::{Filter, NextAction},
    message::Message,
    transport::WriteLifecycle,
};

const UNHANDLED_WRITE: &str = "spark.filterchain.unhandled_write";

/// 有序的过滤器序列及其调度逻辑。
///
/// # 设计背景（Why）
/// - 读事件自底向上、写操作自顶向下，是过滤链最基本的执行模型；
/// - 握手完成后 TLS 过滤器可能请求切换到另一条过滤链，调度器以“排入新任务”的方式响应，
///   不在原调用栈上恢复挂起的续体，从而保证同一连接的读事件仍按序处理。
///
/// # 逻辑（How）
/// - [`fire_read`](Self::fire_read) 维护一个任务队列：每个任务从指定索引开始执行读路径，
///   遇到 [`NextAction::Rehome`] 时把新链上的任务追加到队尾；
/// - [`write_from`](Self::write_from) 从给定索引的下一个过滤器开始逆序执行写路径；
/// - 任一过滤器返回错误时，按逆序通知已执行的过滤器后把错误返回给调用方。
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn builder() -> FilterChainBuilder {
        FilterChainBuilder::default()
    }

    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Arc<Self> {
        Arc::new(Self { filters })
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<dyn Filter>> {
        self.filters.get(index)
    }

    /// 从索引 0 开始派发一次读事件，并执行由此产生的全部后续任务。
    pub fn fire_read(self: &Arc<Self>, connection: &Arc<Connection>, message: Message) -> Result<()> {
        let mut tasks = VecDeque::from([(Arc::clone(self), 0usize, Some(message))]);
        while let Some((chain, start, message)) = tasks.pop_front() {
            if let Some(rehome) = chain.run_read(connection, start, message)? {
                debug!(
                    connection = %connection.id(),
                    start_index = rehome.start_index,
                    "re-entering read path on replacement chain"
                );
                tasks.push_back((rehome.chain, rehome.start_index, rehome.message));
            }
        }
        Ok(())
    }

    /// 从过滤链顶端发起写操作。
    pub fn fire_write(self: &Arc<Self>, connection: &Arc<Connection>, message: Message) -> Result<()> {
        self.write_from(connection, self.filters.len(), message, None)
    }

    /// 自索引 0 向上派发事件，直到某个过滤器返回 [`NextAction::Stop`]。
    pub fn fire_event(self: &Arc<Self>, connection: &Arc<Connection>, event: &mut dyn Event) -> Result<()> {
        for (index, filter) in self.filters.iter().enumerate() {
            let mut ctx = FilterContext::new(connection, self, index);
            match filter.handle_event(&mut ctx, event) {
                Ok(NextAction::Invoke) => {}
                Ok(NextAction::Stop | NextAction::Rehome(_)) => {
                    trace!(
                        connection = %connection.id(),
                        event = event.event_type(),
                        index,
                        "event consumed"
                    );
                    return Ok(());
                }
                Err(err) => {
                    self.notify_exception(connection, index, &err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// 执行 `[0, end)` 区间内过滤器的写路径（逆序）。
    pub(crate) fn write_from(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        end: usize,
        message: Message,
        lifecycle: Option<Arc<dyn WriteLifecycle>>,
    ) -> Result<()> {
        let mut message = Some(message);
        let mut lifecycle = lifecycle;
        for index in (0..end.min(self.filters.len())).rev() {
            let mut ctx = FilterContext::new(connection, self, index);
            ctx.set_message(message.take());
            ctx.set_lifecycle(lifecycle.take());
            match self.filters[index].handle_write(&mut ctx) {
                Ok(NextAction::Invoke) => {
                    message = ctx.take_message();
                    lifecycle = ctx.take_lifecycle();
                }
                Ok(NextAction::Stop | NextAction::Rehome(_)) => return Ok(()),
                Err(err) => {
                    self.notify_exception(connection, index, &err);
                    return Err(err);
                }
            }
        }
        match message {
            Some(_) => Err(CoreError::new(
                UNHANDLED_WRITE,
                "write reached the bottom of the filter chain without a transport",
            )),
            None => Ok(()),
        }
    }

    fn run_read(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        start: usize,
        message: Option<Message>,
    ) -> Result<Option<crate::filter::Rehome>> {
        let mut message = message;
        for index in start..self.filters.len() {
            let mut ctx = FilterContext::new(connection, self, index);
            ctx.set_message(message.take());
            match self.filters[index].handle_read(&mut ctx) {
                Ok(NextAction::Invoke) => message = ctx.take_message(),
                Ok(NextAction::Stop) => return Ok(None),
                Ok(NextAction::Rehome(rehome)) => return Ok(Some(rehome)),
                Err(err) => {
                    self.notify_exception(connection, index, &err);
                    return Err(err);
                }
            }
        }
        Ok(None)
    }

    fn notify_exception(self: &Arc<Self>, connection: &Arc<Connection>, failed: usize, error: &CoreError) {
        debug!(
            connection = %connection.id(),
            index = failed,
            code = error.code(),
            "filter failed: {error}"
        );
        for index in (0..=failed.min(self.filters.len().saturating_sub(1))).rev() {
            let mut ctx = FilterContext::new(connection, self, index);
            self.filters[index].exception_occurred(&mut ctx, error);
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("len", &self.filters.len())
            .finish()
    }
}

/// 顺序组装过滤链：先添加的过滤器位于底层（靠近传输）。
#[derive(Default)]
pub struct FilterChainBuilder {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChainBuilder {
    pub fn add<F: Filter>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn add_shared(mut self, filter: Arc<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn build(self) -> Arc<FilterChain> {
        FilterChain::new(self.filters)
    }
}
