//! 过滤链阶段的封闭变体集合与组装规则。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 调度器只认识 [`Filter`] 能力集合；阶段种类（传输、TLS 装饰的传输、TLS、应用）
//!   以枚举表达，组装时能按种类改写过滤链而无需运行期类型探测；
//! - 服务端在首个读事件到达时就需要引擎，因此传输阶段在存在 TLS 阶段时被装饰，
//!   由装饰器在把数据交给被包装的传输过滤器之前创建引擎。
//!
//! ## 逻辑（How）
//! - [`StageChainBuilder::build`] 在构造过滤链之前调用 [`assemble`]：
//!   存在 TLS 阶段时，第一个传输阶段被包装为 [`Stage::TlsTransport`]；
//!   不存在 TLS 阶段时，任何残留的装饰器被拆回原始传输阶段；
//! - 装饰器以所有权持有被包装的过滤器，拆除时原样归还。

use std::sync::Arc;

use spark_filterchain::{CoreError, Event, Filter, FilterChain, FilterContext, NextAction, Result};

use crate::filter::TlsFilter;

/// 过滤链中的一个阶段。
pub enum Stage {
    Transport(Arc<dyn Filter>),
    TlsTransport(TlsTransportFilter),
    Tls(Arc<TlsFilter>),
    Application(Arc<dyn Filter>),
}

impl Stage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::TlsTransport(_) => "tls-transport",
            Self::Tls(_) => "tls",
            Self::Application(_) => "application",
        }
    }

    fn as_filter(&self) -> &dyn Filter {
        match self {
            Self::Transport(filter) | Self::Application(filter) => filter.as_ref(),
            Self::TlsTransport(decorator) => decorator,
            Self::Tls(filter) => filter.as_ref(),
        }
    }
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Stage").field(&self.kind()).finish()
    }
}

impl Filter for Stage {
    fn handle_read(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        self.as_filter().handle_read(ctx)
    }

    fn handle_write(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        self.as_filter().handle_write(ctx)
    }

    fn handle_event(&self, ctx: &mut FilterContext<'_>, event: &mut dyn Event) -> Result<NextAction> {
        self.as_filter().handle_event(ctx, event)
    }

    fn exception_occurred(&self, ctx: &mut FilterContext<'_>, error: &CoreError) {
        self.as_filter().exception_occurred(ctx, error);
    }
}

/// 为传输过滤器注入 TLS 会话的装饰器：读事件到达时先确保引擎存在。
pub struct TlsTransportFilter {
    transport: Arc<dyn Filter>,
    tls: Arc<TlsFilter>,
}

impl TlsTransportFilter {
    pub fn new(transport: Arc<dyn Filter>, tls: Arc<TlsFilter>) -> Self {
        Self { transport, tls }
    }

    /// 拆除装饰，归还被包装的传输过滤器。
    pub fn into_inner(self) -> Arc<dyn Filter> {
        self.transport
    }
}

impl Filter for TlsTransportFilter {
    fn handle_read(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        let connection = ctx.connection();
        let session = self.tls.session(connection);
        self.tls
            .ensure_engine(&session, connection)
            .map_err(CoreError::from)?;
        self.transport.handle_read(ctx)
    }

    fn handle_write(&self, ctx: &mut FilterContext<'_>) -> Result<NextAction> {
        self.transport.handle_write(ctx)
    }

    fn handle_event(&self, ctx: &mut FilterContext<'_>, event: &mut dyn Event) -> Result<NextAction> {
        self.transport.handle_event(ctx, event)
    }

    fn exception_occurred(&self, ctx: &mut FilterContext<'_>, error: &CoreError) {
        self.transport.exception_occurred(ctx, error);
    }
}

/// 按阶段顺序组装过滤链：先添加的阶段位于底层。
#[derive(Default)]
pub struct StageChainBuilder {
    stages: Vec<Stage>,
}

impl StageChainBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(self, filter: Arc<dyn Filter>) -> Self {
        self.stage(Stage::Transport(filter))
    }

    pub fn tls(self, filter: Arc<TlsFilter>) -> Self {
        self.stage(Stage::Tls(filter))
    }

    pub fn application(self, filter: Arc<dyn Filter>) -> Self {
        self.stage(Stage::Application(filter))
    }

    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Arc<FilterChain> {
        let filters = assemble(self.stages)
            .into_iter()
            .map(|stage| Arc::new(stage) as Arc<dyn Filter>)
            .collect();
        FilterChain::new(filters)
    }
}

/// 过滤链构造前的改写规则，见模块文档。
pub fn assemble(stages: Vec<Stage>) -> Vec<Stage> {
    let tls = stages.iter().find_map(|stage| match stage {
        Stage::Tls(filter) => Some(Arc::clone(filter)),
        _ => None,
    });

    match tls {
        Some(tls) => {
            let mut decorated = stages
                .iter()
                .any(|stage| matches!(stage, Stage::TlsTransport(_)));
            stages
                .into_iter()
                .map(|stage| match stage {
                    Stage::Transport(transport) if !decorated => {
                        decorated = true;
                        Stage::TlsTransport(TlsTransportFilter::new(transport, Arc::clone(&tls)))
                    }
                    other => other,
                })
                .collect()
        }
        None => stages
            .into_iter()
            .map(|stage| match stage {
                Stage::TlsTransport(decorator) => Stage::Transport(decorator.into_inner()),
                other => other,
            })
            .collect(),
    }
}
