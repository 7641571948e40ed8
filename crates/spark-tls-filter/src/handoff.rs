use spark_buffer::{Buffer, MemoryManager};
use spark_filterchain::{Connection, Message, WriteLifecycle};
use tracing::trace;

use crate::context::{OutputMark, SessionContext};

/// 加密输出移交异步写队列时的所有权策略。
///
/// # 设计背景（Why）
/// - 输出记录写在池化缓冲中，而池化缓冲在释放后会被后续 wrap 复用；
///   排队中的写若仍引用这块存储，就可能在真正写出之前被覆盖；
/// - 小负载没有必要长期占用一整块网络缓冲大小的池化存储。
///
/// # 逻辑（How）
/// 阈值为协商出的网络缓冲大小的一半：
/// 1. 消息可读字节少于阈值：整体搬到连接内存管理器分配的新缓冲，原池化缓冲随即归还；
/// 2. 否则若最近一次输出的标记显示它已接近耗尽：组合消息只把该分段替换为副本，
///    单块消息整体复制，被替换下来的池化缓冲随释放归还；
/// 3. 其余情况原样放行。
///
/// # 契约（What）
/// - 运行在执行移交的线程上，可能与产生该消息的线程不同；
/// - 最近一次输出的标记在每次移交开始时被原子地读取并清空。
#[derive(Debug, Default, Clone, Copy)]
pub struct WriteOwnershipPolicy;

impl WriteLifecycle for WriteOwnershipPolicy {
    fn on_thread_context_switch(&self, connection: &Connection, message: Message) -> Message {
        let Some(session) = SessionContext::get(connection) else {
            return message;
        };
        let threshold = session.net_buffer_size() / 2;
        let last = session.take_last_output();
        apply_policy(connection.memory_manager().as_ref(), message, threshold, last)
    }
}

pub(crate) fn apply_policy(
    manager: &dyn MemoryManager,
    message: Message,
    threshold: usize,
    last: Option<OutputMark>,
) -> Message {
    if message.is_file_region() {
        return message;
    }
    if message.remaining() < threshold {
        trace!(target: "spark::tls", bytes = message.remaining(), "relocating small output off the pool");
        return Message::Buffer(relocate(manager, &message));
    }
    match (message, last) {
        (Message::Composite(mut composite), Some(mark)) if mark.remaining < threshold => {
            let duplicate = composite
                .segments()
                .find(|segment| segment.id() == mark.id)
                .map(|stale| copy_into(manager, stale.chunk()));
            if let Some(duplicate) = duplicate {
                // 被替换下来的分段在此释放。
                let _ = composite.replace(mark.id, duplicate);
            }
            Message::Composite(composite)
        }
        (Message::Buffer(buffer), Some(mark)) if mark.remaining < threshold => {
            Message::Buffer(copy_into(manager, buffer.chunk()))
        }
        (message, _) => message,
    }
}

fn relocate(manager: &dyn MemoryManager, message: &Message) -> Buffer {
    match message {
        Message::Buffer(buffer) => copy_into(manager, buffer.chunk()),
        other => copy_into(manager, &other.to_vec()),
    }
}

fn copy_into(manager: &dyn MemoryManager, bytes: &[u8]) -> Buffer {
    let mut fresh = manager.allocate(bytes.len());
    fresh.append_slice(bytes);
    fresh
}
