use spark_buffer::{Buffer, CompositeBuffer};
use spark_filterchain::{FilterContext, Message};
use tracing::debug;

use crate::{
    allocator::{Allocator, MemoryManagerAllocator, OutputBufferAllocator},
    context::SessionContext,
    engine::{EngineError, EngineStatus},
    error::TlsError,
    filter::TlsFilter,
    record::packet_size,
};

/// 连续 `BUFFER_OVERFLOW` 的上限，防止引擎异常时无限扩容。
pub(crate) const MAX_WRAP_OVERFLOWS: usize = 8;

/// [`TlsFilter::unwrap_all`] 的结果。
#[derive(Debug, Default)]
pub struct UnwrapOutcome {
    /// 已解密的明文，收紧到实际使用的范围。
    pub plaintext: Option<Buffer>,
    /// 尚不构成完整记录的尾部字节，原样保留。
    pub remainder: Option<Buffer>,
    /// 是否收到了对端的关闭通知。
    pub closed: bool,
}

impl TlsFilter {
    /// 解密输入中的全部完整记录。
    ///
    /// # 逻辑（How）
    /// - 按记录头声明的长度逐条解密，输出累积在内存管理器分配的缓冲中；
    /// - 解密后若引擎重新进入握手（对端发起的重协商），以当前剩余输入同步驱动握手至完成，
    ///   握手留下的字节成为新的输入；重协商失败只记录调试日志并结束循环，已解密的明文照常返回；
    /// - `CLOSED` 立即停止，并与已产出的明文一起报告；
    /// - 不完整的尾部记录从不消费，作为余量返回。
    ///
    /// # 契约（What）
    /// - 解密本身出错时已累积的输出随之释放，错误原样返回。
    pub fn unwrap_all(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        input: Buffer,
    ) -> Result<UnwrapOutcome, TlsError> {
        let mut input = Some(input);
        let mut output = None;
        let mut closed = false;

        while let Some(current) = input.as_mut() {
            let Some(record_len) = packet_size(current.chunk())? else {
                break;
            };
            if current.remaining() < record_len {
                break;
            }
            let result =
                session.unwrap_record(current, record_len, &mut output, &MemoryManagerAllocator)?;

            if session.is_handshaking() {
                debug!(
                    target: "spark::tls",
                    connection = %ctx.connection().id(),
                    "peer initiated renegotiation"
                );
                let leftover = input.take().filter(Buffer::has_remaining);
                match self.rehandshake(session, ctx, leftover) {
                    Ok(next) => {
                        input = next;
                        continue;
                    }
                    Err(err) => {
                        // 会话保持握手态，后续读事件沿握手路径继续推进。
                        debug!(
                            target: "spark::tls",
                            connection = %ctx.connection().id(),
                            error = %err,
                            "peer initiated renegotiation failed"
                        );
                        break;
                    }
                }
            }

            match result.status {
                EngineStatus::Ok => {}
                EngineStatus::Closed => {
                    closed = true;
                    session.mark_inbound_closed();
                    break;
                }
                status => {
                    return Err(TlsError::Protocol(format!(
                        "unexpected {status:?} while unwrapping application data"
                    )));
                }
            }
        }

        let plaintext = output.filter(Buffer::has_remaining).map(|mut buffer| {
            buffer.trim();
            buffer
        });
        let remainder = input.filter(Buffer::has_remaining).map(|mut buffer| {
            buffer.shrink();
            buffer
        });
        Ok(UnwrapOutcome {
            plaintext,
            remainder,
            closed,
        })
    }

    /// 把明文加密为一条或多条记录。
    ///
    /// 每条记录写入一块从输出缓冲池租借的缓冲；多条记录以组合缓冲返回，
    /// 最后一块输出缓冲的标记被记在会话上，供写路径所有权策略判断是否需要复制。
    /// 调用方必须持有连接的写互斥。
    pub fn wrap_all(&self, session: &SessionContext, input: Buffer) -> Result<Message, TlsError> {
        let net_size = session.net_buffer_size().max(1);
        let allocator = OutputBufferAllocator;
        let mut input = input;
        let mut records = CompositeBuffer::new();
        let mut out = allocator.grow(session, None, net_size);
        let mut overflows = 0;

        loop {
            let result = session.with_engine(|engine| engine.wrap(input.chunk(), &mut out))??;
            input.advance(result.bytes_consumed);
            match result.status {
                EngineStatus::Ok => {
                    overflows = 0;
                    if !input.has_remaining() {
                        break;
                    }
                    if result.bytes_consumed == 0 && result.bytes_produced == 0 {
                        return Err(TlsError::Protocol("wrap made no progress".into()));
                    }
                    let mut full =
                        std::mem::replace(&mut out, allocator.grow(session, None, net_size));
                    full.trim();
                    records.append(full);
                }
                EngineStatus::BufferOverflow if overflows < MAX_WRAP_OVERFLOWS => {
                    overflows += 1;
                    let capacity = out.capacity() + net_size;
                    out = allocator.grow(session, Some(out), capacity);
                }
                EngineStatus::BufferOverflow => {
                    return Err(TlsError::Protocol(
                        "engine kept reporting BUFFER_OVERFLOW while wrapping".into(),
                    ));
                }
                EngineStatus::Closed => return Err(TlsError::Engine(EngineError::Closed)),
                EngineStatus::BufferUnderflow => {
                    return Err(TlsError::Protocol(
                        "unexpected BUFFER_UNDERFLOW while wrapping".into(),
                    ));
                }
            }
        }
        out.trim();
        records.append(out);

        let message = if records.segment_count() > 1 {
            Message::Composite(records)
        } else {
            Message::Buffer(records.into_contiguous())
        };
        match &message {
            Message::Buffer(buffer) => session.remember_last_output(buffer),
            Message::Composite(composite) => {
                if let Some(last) = composite.last() {
                    session.remember_last_output(last);
                }
            }
            Message::FileRegion(_) => {}
        }
        Ok(message)
    }
}
