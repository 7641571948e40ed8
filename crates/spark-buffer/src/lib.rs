//! `spark-buffer` 提供过滤链与 TLS 过滤器共享的缓冲抽象。
//!
//! # 模块定位（Why）
//! - TLS 记录层需要“可读区间 + 逻辑容量”的显式语义：引擎根据剩余可写空间判定
//!   `BUFFER_OVERFLOW`，驱动器根据可读字节判断记录是否完整；
//! - 解密输入与加密输出分属两种内存来源（内存管理器 / 输出池），二者必须可区分，
//!   以便写路径所有权策略判断是否需要把小负载搬离池化内存。
//!
//! # 设计概要（How）
//! - [`Buffer`]：基于 `bytes::BytesMut` 的连续缓冲，携带稳定的 [`BufferId`] 与可选租约，
//!   `Drop` 时自动归还池化内存；
//! - [`CompositeBuffer`]：按顺序拼接的多段缓冲，支持按 `BufferId` 原位替换某一段；
//! - [`MemoryManager`]：解密路径使用的堆分配器，[`HeapMemoryManager`] 为默认实现；
//! - [`SlabBufferPool`]：按容量分级的自由链表缓冲池，租借/归还均为显式的作用域资源。
//!
//! # 命名约定（Consistency）
//! - `remaining` 表示可读字节数，`remaining_mut` 表示逻辑容量内尚可写入的字节数，
//!   与 `bytes::Buf`/`bytes::BufMut` 的术语保持一致。

mod buffer;
mod composite;
mod memory;
mod pool;

pub use buffer::{Buffer, BufferId, BufferOverflow, BufferRecycler, ReclaimedBuffer};
pub use composite::CompositeBuffer;
pub use memory::{HeapMemoryManager, MemoryManager};
pub use pool::{PoolStats, SlabBufferPool};
