//! `spark-filterchain` 定义过滤链调度与连接、传输的窄契约。
//!
//! # 模块定位（Why）
//! - TLS 过滤器只通过这里的接口与外部协作：读写消息、同步阻塞读、向下游写、
//!   连接级属性与写互斥、在握手完成后切换过滤链；
//! - 调度器保持最小实现：顺序派发读事件、逆序执行写路径、向上传递事件，
//!   足以承载真实部署中的单连接事件序列，也便于在测试中精确复现。
//!
//! # 结构概览（How）
//! - [`Filter`]/[`NextAction`]/[`FilterContext`]：过滤器的能力集合与调用上下文；
//! - [`FilterChain`]：有序过滤器序列与任务队列式调度；
//! - [`Connection`]：传输句柄、可替换的过滤链、按类型索引的属性；
//! - [`Transport`]/[`WriteLifecycle`]/[`TransportFilter`]：传输层契约与最底层过滤器；
//! - [`CoreError`]/[`ErrorCategory`]：稳定错误码与分类；
//! - `mock`（`test-util` 特性）：内存传输与收集型应用过滤器。

mod chain;
mod connection;
mod context;
mod error;
mod event;
mod filter;
mod message;
mod transport;

#[cfg(feature = "test-util")]
pub mod mock;

pub use chain::{FilterChain, FilterChainBuilder};
pub use connection::{Connection, ConnectionId};
pub use context::FilterContext;
pub use error::{CoreError, ErrorCategory, ErrorCause, Result, SecurityClass, codes};
pub use event::Event;
pub use filter::{Filter, NextAction, Rehome};
pub use message::{FileRegion, Message};
pub use transport::{Transport, TransportFilter, WriteLifecycle};
