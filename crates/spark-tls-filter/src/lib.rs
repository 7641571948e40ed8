#![doc = r#"
# spark-tls-filter

## 设计动机（Why）
- **过滤链内加密**：TLS 作为过滤链中的一个阶段运行，握手与记录加解密都以读写事件驱动，
  不占用专门的 I/O 任务；
- **可中断的握手**：事件驱动模式在缺少网络数据时直接返回事件循环，下一次读事件带着累积的余量继续；
  需要确定性完成时间的场景可切换为带超时的同步握手；
- **可运维性**：引擎、记录层与传输的故障统一映射为稳定错误码与分类，
  对端不支持安全重协商等运维关注的情形有独立诊断日志。

## 核心契约（What）
- [`TlsFilter`]：过滤链上的 TLS 阶段，处理读（握手/解密）、写（加密）与事件（证书请求、发起握手）；
- [`TlsEngine`]/[`EngineFactory`]：握手引擎能力集合，[`RustlsServerFactory`]/[`RustlsClientFactory`] 为基于 `rustls` 的实现；
- [`SessionContext`]：连接级会话状态，保存引擎、未解密余量与最近一次输出的标记；
- [`WriteOwnershipPolicy`]：加密输出移交异步写队列时的所有权策略；
- [`HandshakeListener`]：握手开始、完成与失败的通知；
- [`StageChainBuilder`]：按阶段组装过滤链，并在存在 TLS 阶段时装饰传输阶段。

## 实现策略（How）
- 记录边界由 [`packet_size`] 从记录头计算，引擎每次只接收一条完整记录；
- 解密输出由连接的内存管理器分配，加密输出从过滤器的缓冲池租借，两条路径的增长策略见 [`Allocator`]；
- 配置通过 `ArcSwap` 热替换，监听器注册表以快照通知。

## 风险与考量（Trade-offs）
- `rustls` 不实现重协商，基于它的引擎在已建立会话上开始握手会返回错误，证书补取因此退化为“无证书”；
- 同步握手会阻塞读事件线程，只应在超时受控的场景启用。
"#]

mod allocator;
mod certificate;
mod codec;
mod config;
mod context;
pub mod engine;
mod error;
mod filter;
mod handoff;
mod handshake;
mod listener;
mod record;
mod renegotiate;
mod stage;

pub use allocator::{Allocator, MemoryManagerAllocator, OutputBufferAllocator};
pub use certificate::{X509Certificate, convert_chain};
pub use codec::UnwrapOutcome;
pub use config::{TlsFilterConfig, TlsFilterConfigBuilder};
pub use context::{HandshakeOutcome, OutputMark, SessionContext, SessionState};
pub use engine::{
    EngineError, EngineFactory, EngineResult, EngineStatus, HandshakeStatus, RawCertificate,
    RustlsClientFactory, RustlsEngine, RustlsServerFactory, TlsEngine,
};
pub use error::{TlsError, codes};
pub use filter::{CertificateEvent, StartHandshakeEvent, TlsFilter};
pub use handoff::WriteOwnershipPolicy;
pub use listener::{HandshakeListener, HandshakeListeners};
pub use record::{RECORD_HEADER_LEN, packet_size};
pub use stage::{Stage, StageChainBuilder, TlsTransportFilter, assemble};
