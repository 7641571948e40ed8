use spark_buffer::Buffer;

use crate::context::SessionContext;

/// 缓冲增长策略：`(会话, 旧缓冲?, 目标容量) -> 新缓冲`。
///
/// # 契约说明（What）
/// - `old` 为 `None` 时返回逻辑容量为 `new_size` 的空缓冲；
/// - `old` 为 `Some` 时保留其全部可读字节，返回逻辑容量不小于 `new_size` 的缓冲，
///   旧缓冲随之被释放（池化缓冲归还所属池）；
/// - 两种实现分别服务于解密输入与加密输出，调用点固定其一，从不混用。
pub trait Allocator: Send + Sync {
    fn grow(&self, session: &SessionContext, old: Option<Buffer>, new_size: usize) -> Buffer;
}

/// 解密路径：使用连接的内存管理器。
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryManagerAllocator;

impl Allocator for MemoryManagerAllocator {
    fn grow(&self, session: &SessionContext, old: Option<Buffer>, new_size: usize) -> Buffer {
        let manager = session.memory_manager();
        match old {
            None => manager.allocate(new_size),
            Some(old) => manager.reallocate(old, new_size),
        }
    }
}

/// 加密路径：从过滤器持有的输出缓冲池租借。
#[derive(Debug, Default, Clone, Copy)]
pub struct OutputBufferAllocator;

impl Allocator for OutputBufferAllocator {
    fn grow(&self, session: &SessionContext, old: Option<Buffer>, new_size: usize) -> Buffer {
        let pool = session.output_pool();
        match old {
            None => pool.acquire(new_size),
            Some(old) => {
                let mut fresh = pool.acquire(new_size.max(old.remaining()));
                fresh.append_slice(old.chunk());
                fresh
            }
        }
    }
}
