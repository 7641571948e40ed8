//! 握手驱动器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 握手状态机由引擎维护，驱动器只负责“看状态、做一步”：解密一条完整记录、产出一条记录、
//!   执行委托任务，直到引擎不再处于握手中或必须等待更多网络数据；
//! - 事件驱动模式下“需要更多数据”即挂起点：驱动器返回剩余输入，由下一次读事件继续，
//!   不阻塞任何线程；同步模式在同一线程上以带超时的阻塞读补齐数据。
//!
//! ## 逻辑（How）
//! - `NeedUnwrap`：输入为空或不足一条完整记录时停止；否则把恰好一条记录交给引擎；
//! - `NeedWrap`：记录累积在同一块临时网络缓冲中，循环结束时一次性写出；
//! - `NeedTask`：在当前线程同步执行全部委托任务；
//! - 循环内的任何失败先通知监听器，再向调用方返回错误。
//!
//! ## 契约（What）
//! - 退出时已消费完的输入被释放，未消费的输入收缩到剩余字节后返回；
//! - 临时网络缓冲中的记录无论成功失败都会尝试写出，且只写一次；
//! - 同步模式在进入循环前安装阻塞读超时，并在任何结果下恢复原值。

use std::time::Duration;

use spark_buffer::Buffer;
use spark_filterchain::{Connection, FilterContext, Message};
use tracing::{debug, trace};

use crate::{
    allocator::{Allocator, OutputBufferAllocator},
    codec::MAX_WRAP_OVERFLOWS,
    context::SessionContext,
    engine::{EngineError, EngineStatus, HandshakeStatus},
    error::TlsError,
    filter::TlsFilter,
    record::packet_size,
};

impl TlsFilter {
    /// 事件驱动模式：执行一次握手循环，返回尚未消费的输入。
    pub fn handshake_step(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        input: Option<Buffer>,
    ) -> Result<Option<Buffer>, TlsError> {
        let mut scratch = None;
        self.handshake_step_with(session, ctx, input, &mut scratch)
    }

    /// 同步模式：交替执行握手循环与阻塞读，直到握手结束。
    ///
    /// 阻塞读超时以 [`TlsError::HandshakeTimeout`] 报告，其余读失败以 [`TlsError::Transport`] 报告。
    pub fn handshake_sync(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        input: Option<Buffer>,
        timeout: Option<Duration>,
    ) -> Result<Option<Buffer>, TlsError> {
        let connection = ctx.connection();
        let _timeout = ReadTimeoutGuard::install(connection, timeout);
        let mut scratch = Some(OutputBufferAllocator.grow(session, None, session.app_buffer_size()));

        let mut input = self.handshake_step_with(session, ctx, input, &mut scratch)?;
        while session.is_handshaking() {
            let fresh = match ctx.read() {
                Ok(fresh) => fresh,
                Err(err) => {
                    let err = TlsError::from_blocking_read(err, timeout);
                    debug!(
                        target: "spark::tls",
                        connection = %connection.id(),
                        error = %err,
                        "blocking handshake read failed"
                    );
                    self.notify_failure(session, connection, &err);
                    return Err(err);
                }
            };
            input = Some(Buffer::concat(input, fresh));
            input = self.handshake_step_with(session, ctx, input, &mut scratch)?;
        }
        Ok(input)
    }

    fn handshake_step_with(
        &self,
        session: &SessionContext,
        ctx: &FilterContext<'_>,
        input: Option<Buffer>,
        scratch: &mut Option<Buffer>,
    ) -> Result<Option<Buffer>, TlsError> {
        let connection = ctx.connection();
        let mut input = input;
        let mut pending_net = None;

        let outcome = drive(session, connection, &mut input, &mut pending_net, scratch);
        if let Err(err) = &outcome {
            debug!(
                target: "spark::tls",
                connection = %connection.id(),
                error = %err,
                "handshake failed"
            );
            self.notify_failure(session, connection, err);
        }

        let remainder = input.filter(Buffer::has_remaining).map(|mut buffer| {
            buffer.shrink();
            buffer
        });

        if let Some(net) = pending_net.filter(Buffer::has_remaining) {
            trace!(
                target: "spark::tls",
                connection = %connection.id(),
                bytes = net.remaining(),
                "flushing handshake records"
            );
            if let Err(err) = ctx.write(Message::Buffer(net)) {
                if outcome.is_ok() {
                    return Err(TlsError::Transport(err));
                }
                debug!(
                    target: "spark::tls",
                    connection = %connection.id(),
                    error = %err,
                    "failed to flush handshake records after handshake failure"
                );
            }
        }

        outcome.map(|()| remainder)
    }
}

fn drive(
    session: &SessionContext,
    connection: &Connection,
    input: &mut Option<Buffer>,
    pending_net: &mut Option<Buffer>,
    scratch: &mut Option<Buffer>,
) -> Result<(), TlsError> {
    loop {
        let status = session.handshake_status();
        trace!(target: "spark::tls", connection = %connection.id(), ?status, "handshake loop");
        match status {
            HandshakeStatus::NeedUnwrap => {
                let Some(buffer) = input.as_mut().filter(|buffer| buffer.has_remaining()) else {
                    return Ok(());
                };
                let Some(record_len) = packet_size(buffer.chunk())? else {
                    return Ok(());
                };
                if buffer.remaining() < record_len {
                    return Ok(());
                }
                unwrap_handshake_record(session, buffer, record_len, scratch)?;
            }
            HandshakeStatus::NeedWrap => wrap_handshake_record(session, pending_net)?,
            HandshakeStatus::NeedTask => {
                if session.run_delegated_tasks()? == 0 {
                    return Err(TlsError::Protocol(
                        "engine requested a delegated task but provided none".into(),
                    ));
                }
            }
            HandshakeStatus::Finished | HandshakeStatus::NotHandshaking => return Ok(()),
        }
    }
}

fn unwrap_handshake_record(
    session: &SessionContext,
    input: &mut Buffer,
    record_len: usize,
    scratch: &mut Option<Buffer>,
) -> Result<(), TlsError> {
    let target = scratch
        .get_or_insert_with(|| OutputBufferAllocator.grow(session, None, session.app_buffer_size()));
    target.clear();
    let record = &input.chunk()[..record_len];
    let result = session.with_engine(|engine| engine.unwrap(record, target))??;
    match result.status {
        EngineStatus::BufferUnderflow | EngineStatus::BufferOverflow => Err(TlsError::Protocol(
            format!("SSL unwrap error: {:?}", result.status),
        )),
        EngineStatus::Ok | EngineStatus::Closed if result.bytes_consumed == 0 => Err(
            TlsError::Protocol("handshake unwrap consumed no input".into()),
        ),
        EngineStatus::Ok | EngineStatus::Closed => {
            input.advance(result.bytes_consumed);
            Ok(())
        }
    }
}

fn wrap_handshake_record(
    session: &SessionContext,
    pending_net: &mut Option<Buffer>,
) -> Result<(), TlsError> {
    let net_size = session.net_buffer_size().max(1);
    if pending_net
        .as_ref()
        .is_some_and(|buffer| buffer.remaining_mut() < net_size)
    {
        let current = pending_net.take();
        let used = current.as_ref().map_or(0, Buffer::remaining);
        *pending_net = Some(OutputBufferAllocator.grow(session, current, used + net_size));
    }

    let mut overflows = 0;
    loop {
        let target =
            pending_net.get_or_insert_with(|| OutputBufferAllocator.grow(session, None, net_size));
        let result = session.with_engine(|engine| engine.wrap(&[], &mut *target))??;
        match result.status {
            EngineStatus::Ok if result.bytes_produced == 0 => {
                return Err(TlsError::Protocol(
                    "handshake wrap produced no records".into(),
                ));
            }
            EngineStatus::Ok => return Ok(()),
            EngineStatus::BufferOverflow if overflows < MAX_WRAP_OVERFLOWS => {
                overflows += 1;
                let capacity = target.capacity() + net_size;
                let current = pending_net.take();
                *pending_net = Some(OutputBufferAllocator.grow(session, current, capacity));
            }
            EngineStatus::BufferOverflow => {
                return Err(TlsError::Protocol(format!(
                    "handshake wrap overflowed {overflows} times in a row"
                )));
            }
            EngineStatus::Closed => return Err(TlsError::Engine(EngineError::Closed)),
            EngineStatus::BufferUnderflow => {
                return Err(TlsError::Protocol(
                    "unexpected BUFFER_UNDERFLOW while wrapping handshake data".into(),
                ));
            }
        }
    }
}

/// 安装阻塞读超时，离开作用域时恢复原值。
struct ReadTimeoutGuard<'a> {
    connection: &'a Connection,
    previous: Option<Duration>,
}

impl<'a> ReadTimeoutGuard<'a> {
    fn install(connection: &'a Connection, timeout: Option<Duration>) -> Self {
        let previous = connection.blocking_read_timeout();
        connection.set_blocking_read_timeout(timeout);
        Self {
            connection,
            previous,
        }
    }
}

impl Drop for ReadTimeoutGuard<'_> {
    fn drop(&mut self) {
        self.connection.set_blocking_read_timeout(self.previous);
    }
}
