use crate::buffer::Buffer;

/// 连接级内存管理器：解密路径上的缓冲来源。
///
/// # 契约（What）
/// - `allocate(size)` 返回逻辑容量恰为 `size` 的空缓冲；
/// - `reallocate(old, size)` 保留 `old` 的全部可读字节，返回逻辑容量不小于 `size` 的缓冲；
///   若 `old` 已足够大，可原样返回。
pub trait MemoryManager: Send + Sync + 'static {
    fn allocate(&self, size: usize) -> Buffer;

    fn reallocate(&self, old: Buffer, size: usize) -> Buffer;
}

/// 直接在堆上分配的默认内存管理器。
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapMemoryManager;

impl MemoryManager for HeapMemoryManager {
    fn allocate(&self, size: usize) -> Buffer {
        Buffer::with_capacity(size)
    }

    fn reallocate(&self, mut old: Buffer, size: usize) -> Buffer {
        old.ensure_capacity(size);
        old
    }
}
