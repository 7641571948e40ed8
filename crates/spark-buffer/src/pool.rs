use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::BytesMut;
use spin::Mutex;

use crate::buffer::{Buffer, BufferRecycler, ReclaimedBuffer};

/// `SlabBufferPool` 提供按容量分级的自由链表（Free List）缓冲池，
/// 作为 TLS 输出记录的显式工作区。
///
/// # 模块角色（Why）
/// - 加密输出频繁以“一个网络缓冲大小”为单位申请，复用 `BytesMut` 能显著减少堆分配；
/// - 池实例由持有者显式创建并注入（每个 worker 或每个过滤器一份），
///   租借与归还都是可见的作用域资源，而非隐式的线程本地缓存。
///
/// # 核心机制（How）
/// - 自由链表以容量等级（2 的幂）为键：`acquire` 从不小于请求等级的最小桶中取块，
///   回收时按实际容量向下取整归桶，保证取出的块一定满足请求；
/// - `PoolMetrics` 通过原子计数跟踪 `allocated_bytes`、`available_bytes`、`active_leases`；
/// - 租出的 [`Buffer`] 持有回收句柄，`Drop` 时恰好归还一次。
///
/// # 契约说明（What）
/// - **线程安全**：共享状态由 `spin::Mutex` 与原子计数保护，满足 `Send + Sync + 'static`；
/// - **后置条件**：`acquire(n)` 返回的缓冲逻辑容量恰为 `n`，底层存储不小于 `n`。
///
/// # 设计权衡（Trade-offs）
/// - 使用自旋锁：临界区只有一次 `BTreeMap` 查找与 `Vec` 弹出，远短于线程切换成本；
/// - 冻结后的存储无法回收，仅更新统计，下次租借重新分配。
#[derive(Clone)]
pub struct SlabBufferPool {
    inner: Arc<PoolInner>,
}

impl Default for SlabBufferPool {
    fn default() -> Self {
        Self {
            inner: Arc::new(PoolInner::new()),
        }
    }
}

impl std::fmt::Debug for SlabBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlabBufferPool")
            .field("stats", &self.statistics())
            .finish()
    }
}

impl SlabBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 租借一块逻辑容量为 `capacity` 的空缓冲。
    pub fn acquire(&self, capacity: usize) -> Buffer {
        let raw = self.inner.acquire_buffer(capacity);
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        Buffer::pooled(raw, capacity, recycler)
    }

    /// 清空自由链表，返回归还给系统的字节数。
    pub fn shrink_to_fit(&self) -> usize {
        self.inner.shrink_free_list()
    }

    pub fn statistics(&self) -> PoolStats {
        self.inner.snapshot()
    }
}

/// 缓冲池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocated_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub free_slots: usize,
}

struct PoolInner {
    free_list: Mutex<BTreeMap<usize, Vec<BytesMut>>>,
    metrics: PoolMetrics,
}

impl PoolInner {
    fn new() -> Self {
        Self {
            free_list: Mutex::new(BTreeMap::new()),
            metrics: PoolMetrics::default(),
        }
    }

    /// 从自由链表或堆上获取一个满足容量的 `BytesMut`。
    fn acquire_buffer(&self, min_capacity: usize) -> BytesMut {
        let class = size_class(min_capacity);
        let reused = {
            let mut list = self.free_list.lock();
            let bucket = list
                .range(class..)
                .find(|(_, blocks)| !blocks.is_empty())
                .map(|(key, _)| *key);
            bucket.and_then(|key| {
                let blocks = list.get_mut(&key)?;
                let buf = blocks.pop();
                if blocks.is_empty() {
                    list.remove(&key);
                }
                buf
            })
        };

        let mut buffer = match reused {
            Some(buf) => {
                self.metrics.decrease_available(buf.capacity());
                buf
            }
            None => {
                let buf = BytesMut::with_capacity(class);
                self.metrics.increase_on_new_allocation(buf.capacity());
                buf
            }
        };
        buffer.clear();
        self.metrics.increase_active_leases();
        buffer
    }

    fn shrink_free_list(&self) -> usize {
        let mut list = self.free_list.lock();
        let reclaimed: usize = list
            .values()
            .flat_map(|blocks| blocks.iter().map(BytesMut::capacity))
            .sum();
        list.clear();
        self.metrics.decrease_on_shrink(reclaimed);
        reclaimed
    }

    fn snapshot(&self) -> PoolStats {
        let free_slots = self.free_list.lock().values().map(Vec::len).sum();
        PoolStats {
            allocated_bytes: self.metrics.allocated_bytes.load(Ordering::Relaxed),
            available_bytes: self.metrics.available_bytes.load(Ordering::Relaxed),
            active_leases: self.metrics.active_leases.load(Ordering::Relaxed),
            free_slots,
        }
    }
}

impl BufferRecycler for PoolInner {
    fn reclaim(&self, reclaimed: ReclaimedBuffer) {
        self.metrics.decrease_active_leases();
        let leased = reclaimed.capacity();
        match reclaimed.into_buffer() {
            Some(mut buf) => {
                buf.clear();
                let capacity = buf.capacity();
                if capacity < leased {
                    self.metrics.decrease_on_loss(leased - capacity);
                } else {
                    self.metrics.increase_on_new_allocation(capacity - leased);
                }
                self.metrics.increase_available(capacity);
                self.free_list
                    .lock()
                    .entry(floor_class(capacity))
                    .or_default()
                    .push(buf);
            }
            None => self.metrics.decrease_on_loss(leased),
        }
    }
}

/// 向上取整到 2 的幂，作为租借时的容量等级。
fn size_class(capacity: usize) -> usize {
    capacity.max(1).next_power_of_two()
}

/// 向下取整到 2 的幂，作为回收时的归桶等级。
fn floor_class(capacity: usize) -> usize {
    if capacity == 0 {
        return 0;
    }
    1usize << (usize::BITS - 1 - capacity.leading_zeros())
}

#[derive(Default)]
struct PoolMetrics {
    allocated_bytes: AtomicUsize,
    available_bytes: AtomicUsize,
    active_leases: AtomicUsize,
}

impl PoolMetrics {
    fn increase_on_new_allocation(&self, capacity: usize) {
        self.allocated_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn increase_available(&self, capacity: usize) {
        self.available_bytes.fetch_add(capacity, Ordering::Relaxed);
    }

    fn decrease_available(&self, capacity: usize) {
        saturating_sub(&self.available_bytes, capacity);
    }

    fn decrease_on_loss(&self, capacity: usize) {
        saturating_sub(&self.allocated_bytes, capacity);
    }

    fn decrease_on_shrink(&self, capacity: usize) {
        self.decrease_available(capacity);
        self.decrease_on_loss(capacity);
    }

    fn increase_active_leases(&self) {
        self.active_leases.fetch_add(1, Ordering::Relaxed);
    }

    fn decrease_active_leases(&self) {
        saturating_sub(&self.active_leases, 1);
    }
}

fn saturating_sub(target: &AtomicUsize, value: usize) {
    let _ = target.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(current.saturating_sub(value))
    });
}
