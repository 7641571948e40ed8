use std::{fmt, sync::Arc};

use crate::{
    chain::FilterChain,
    context::FilterContext,
    error::{CoreError, Result},
    event::Event,
    message::Message,
};

/// 过滤器的能力集合：读、写、事件与异常通知。
///
/// # 设计背景（Why）
/// - 过滤链只通过这一组能力与各阶段交互，具体阶段（传输、TLS、应用）以封闭的变体集合实现，
///   避免在调度器中出现针对具体类型的分支；
/// - 默认实现均为“放行”，阶段只需覆盖自己关心的方向。
///
/// # 契约说明（What）
/// - 读事件从索引 0 向上传递，写操作从调用点向下传递到索引 0，事件从索引 0 向上传递；
/// - 同一连接的读事件由调度器顺序派发，实现无需处理同一连接上的并发读；
/// - 返回 `Err` 时调度器会按逆序通知已执行过的过滤器 [`exception_occurred`](Self::exception_occurred)，
///   随后把错误交给调用方。
pub trait Filter: Send + Sync + 'static {
    fn handle_read(&self, _ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        Ok(NextAction::Invoke)
    }

    fn handle_write(&self, _ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        Ok(NextAction::Invoke)
    }

    fn handle_event(
        &self,
        _ctx: &mut FilterContext<'_>,
        _event: &mut dyn Event,
    ) -> Result<NextAction> {
        Ok(NextAction::Invoke)
    }

    fn exception_occurred(&self, _ctx: &mut FilterContext<'_>, _error: &CoreError) {}
}

/// 过滤器处理完毕后告知调度器的下一步。
#[derive(Debug)]
pub enum NextAction {
    /// 把上下文中的消息交给下一个过滤器。
    Invoke,
    /// 结束本次传递。
    Stop,
    /// 结束本次传递，并由调度器以新任务在另一条过滤链上重新进入。
    Rehome(Rehome),
}

/// 在新的过滤链上重新进入读路径的请求。
///
/// 调度器观察到该请求后排入一个全新的读任务，而不是恢复被挂起的旧调用栈。
pub struct Rehome {
    pub chain: Arc<FilterChain>,
    pub start_index: usize,
    pub message: Option<Message>,
}

impl fmt::Debug for Rehome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rehome")
            .field("chain_len", &self.chain.len())
            .field("start_index", &self.start_index)
            .field("message", &self.message)
            .finish()
    }
}
