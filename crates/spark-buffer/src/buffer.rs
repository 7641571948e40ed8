use std::{
    fmt, io, mem,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Buf, Bytes, BytesMut};

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// 缓冲的稳定身份标识。
///
/// 组合缓冲的 `replace` 与写路径记住的“最近一次输出”都通过它定位具体分段，
/// 因此只比较身份，不持有缓冲本身，也不延长其生命周期。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    fn next() -> Self {
        Self(NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// 写入超出逻辑容量时返回的错误。
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("buffer overflow: requested {requested} bytes, only {available} writable")]
pub struct BufferOverflow {
    pub requested: usize,
    pub available: usize,
}

/// `BufferRecycler` 描述缓冲池在租借结束时的回收入口。
///
/// # 设计初衷（Why）
/// - 池化缓冲在 `Drop` 阶段统一通知所属池，调用方无需在 TLS 读写路径上显式归还；
/// - 写路径所有权策略依赖“释放即归还”的语义：把小负载搬到堆上后，原池化缓冲随即回到自由链表。
///
/// # 契约定义（What）
/// - 实现必须线程安全，且不得 panic（`Drop` 路径上的 panic 会直接终止进程）；
/// - 每个租约恰好回收一次。
pub trait BufferRecycler: Send + Sync + 'static {
    /// 通知池归还一次租约。
    fn reclaim(&self, reclaimed: ReclaimedBuffer);
}

/// 一次回收动作携带的上下文。
///
/// - `capacity`：租借时登记的容量，池据此维护统计；
/// - `buffer`：若底层 `BytesMut` 仍可复用则为 `Some`，被冻结或已被取走时为 `None`。
#[derive(Debug)]
pub struct ReclaimedBuffer {
    capacity: usize,
    buffer: Option<BytesMut>,
}

impl ReclaimedBuffer {
    pub fn new(capacity: usize, buffer: Option<BytesMut>) -> Self {
        Self { capacity, buffer }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn into_buffer(self) -> Option<BytesMut> {
        self.buffer
    }
}

struct Lease {
    recycler: Arc<dyn BufferRecycler>,
    capacity: usize,
}

/// 连续字节缓冲：可读区间 `[0, remaining)` 加上逻辑容量上限。
///
/// # 设计动机（Why）
/// - TLS 引擎需要明确的“剩余可写空间”来判定 `BUFFER_OVERFLOW`，而 `BytesMut` 会自动扩容，
///   因此额外维护 `limit` 作为逻辑容量，只有经由分配器 `grow` 才会提升；
/// - 读取侧通过 [`advance`](Self::advance) 消费前缀，剩余字节即为“未解密余量”，
///   可在多次读事件之间原样保留。
///
/// # 逻辑（How）
/// - `data` 保存已写入且尚未消费的字节，`limit` 始终不小于 `data.len()`；
/// - 池化缓冲携带 `Lease`，在 `Drop` 时把 `BytesMut` 交还池（恰好一次）；
/// - [`duplicate`](Self::duplicate) 与 [`shrink`](Self::shrink) 生成的新缓冲位于堆上且拥有新的 [`BufferId`]。
///
/// # 契约（What）
/// - 缓冲不可 `Clone`：所有权即释放责任，丢弃即处置；
/// - [`put_slice`](Self::put_slice) 超出逻辑容量时返回 [`BufferOverflow`]，不会隐式扩容。
pub struct Buffer {
    id: BufferId,
    data: BytesMut,
    limit: usize,
    lease: Option<Lease>,
}

impl Buffer {
    /// 分配一个空的堆缓冲，逻辑容量为 `capacity`。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            id: BufferId::next(),
            data: BytesMut::with_capacity(capacity),
            limit: capacity,
            lease: None,
        }
    }

    /// 拷贝 `src` 生成一个恰好装满的堆缓冲。
    pub fn copy_from_slice(src: &[u8]) -> Self {
        Self {
            id: BufferId::next(),
            data: BytesMut::from(src),
            limit: src.len(),
            lease: None,
        }
    }

    /// 接管已有的 `BytesMut`，逻辑容量取其实际容量。
    pub fn from_bytes_mut(data: BytesMut) -> Self {
        let limit = data.capacity().max(data.len());
        Self {
            id: BufferId::next(),
            data,
            limit,
            lease: None,
        }
    }

    pub(crate) fn pooled(
        data: BytesMut,
        limit: usize,
        recycler: Arc<dyn BufferRecycler>,
    ) -> Self {
        let capacity = data.capacity();
        Self {
            id: BufferId::next(),
            data,
            limit,
            lease: Some(Lease { recycler, capacity }),
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// 可读字节数。
    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn has_remaining(&self) -> bool {
        !self.data.is_empty()
    }

    /// 逻辑容量。
    pub fn capacity(&self) -> usize {
        self.limit
    }

    /// 逻辑容量内尚可写入的字节数。
    pub fn remaining_mut(&self) -> usize {
        self.limit - self.data.len()
    }

    /// 是否租借自缓冲池。
    pub fn is_pooled(&self) -> bool {
        self.lease.is_some()
    }

    pub fn chunk(&self) -> &[u8] {
        &self.data
    }

    /// 消费前 `cnt` 个可读字节。
    ///
    /// # Panics
    /// `cnt` 超过 [`remaining`](Self::remaining) 时 panic，与 `bytes::Buf::advance` 一致。
    pub fn advance(&mut self, cnt: usize) {
        self.data.advance(cnt);
        self.limit -= cnt;
    }

    /// 追加字节；超出逻辑容量时不写入任何内容并返回错误。
    pub fn put_slice(&mut self, src: &[u8]) -> Result<(), BufferOverflow> {
        let available = self.remaining_mut();
        if src.len() > available {
            return Err(BufferOverflow {
                requested: src.len(),
                available,
            });
        }
        self.data.extend_from_slice(src);
        Ok(())
    }

    /// 追加字节，逻辑容量不足时先扩容。
    pub fn append_slice(&mut self, src: &[u8]) {
        self.ensure_capacity(self.data.len() + src.len());
        self.data.extend_from_slice(src);
    }

    /// 丢弃全部可读字节，逻辑容量不变。
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// 把至多 `max` 字节的可写窗口交给 `fill`，并按其返回值提交写入长度。
    ///
    /// 窗口会被截断到 [`remaining_mut`](Self::remaining_mut)；`fill` 出错时不提交任何字节。
    /// 用于对接 `io::Read` 风格的生产者（例如 TLS 库的明文读取器）。
    pub fn fill_with<F>(&mut self, max: usize, fill: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let window = max.min(self.remaining_mut());
        let start = self.data.len();
        self.data.resize(start + window, 0);
        match fill(&mut self.data[start..]) {
            Ok(written) => {
                let written = written.min(window);
                self.data.truncate(start + written);
                Ok(written)
            }
            Err(err) => {
                self.data.truncate(start);
                Err(err)
            }
        }
    }

    /// 确保逻辑容量至少为 `capacity`，保留全部可读字节。
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.limit {
            self.data.reserve(capacity - self.data.len());
            self.limit = capacity;
        }
    }

    /// 把逻辑容量收紧到已写入的范围。
    pub fn trim(&mut self) {
        self.limit = self.data.len();
    }

    /// 将剩余字节压缩进一块恰好大小的堆缓冲，释放原有（可能是池化的）存储。
    pub fn shrink(&mut self) {
        if self.lease.is_none() && self.data.capacity() <= self.data.len().saturating_mul(2) {
            self.limit = self.data.len();
            return;
        }
        *self = Buffer::copy_from_slice(&self.data);
    }

    /// 拆出前 `at` 个可读字节，返回的前缀位于堆上且不携带租约。
    pub fn split_to(&mut self, at: usize) -> Buffer {
        let head = self.data.split_to(at);
        self.limit -= at;
        Buffer::from_bytes_mut(head)
    }

    /// 复制全部可读字节，生成一个新的堆缓冲。
    pub fn duplicate(&self) -> Buffer {
        Buffer::copy_from_slice(&self.data)
    }

    /// 把 `tail` 的可读字节追加到 `head` 之后；`head` 为 `None` 时直接返回 `tail`。
    pub fn concat(head: Option<Buffer>, tail: Buffer) -> Buffer {
        match head {
            None => tail,
            Some(head) if !head.has_remaining() => tail,
            Some(mut head) => {
                head.append_slice(&tail.data);
                head
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    /// 冻结为只读 `Bytes`；池化存储不再回收，仅更新池统计。
    pub fn freeze(mut self) -> Bytes {
        mem::take(&mut self.data).freeze()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            let data = mem::take(&mut self.data);
            let buffer = (data.capacity() > 0).then_some(data);
            lease
                .recycler
                .reclaim(ReclaimedBuffer::new(lease.capacity, buffer));
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("remaining", &self.remaining())
            .field("capacity", &self.limit)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

impl From<&[u8]> for Buffer {
    fn from(value: &[u8]) -> Self {
        Buffer::copy_from_slice(value)
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(value: Vec<u8>) -> Self {
        Buffer::from_bytes_mut(BytesMut::from(&value[..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_slice_respects_logical_capacity() {
        let mut buf = Buffer::with_capacity(4);
        buf.put_slice(&[1, 2, 3]).expect("容量内写入");
        let err = buf.put_slice(&[4, 5]).expect_err("超出逻辑容量");
        assert_eq!(err.available, 1);
        assert_eq!(buf.chunk(), &[1, 2, 3]);
    }

    #[test]
    fn advance_keeps_remainder_verbatim() {
        let mut buf = Buffer::copy_from_slice(b"header-payload");
        buf.advance(7);
        assert_eq!(buf.chunk(), b"payload");
        assert_eq!(buf.remaining_mut(), 0);
    }

    #[test]
    fn fill_with_commits_only_reported_bytes() {
        let mut buf = Buffer::with_capacity(8);
        let written = buf
            .fill_with(16, |window| {
                assert_eq!(window.len(), 8);
                window[..3].copy_from_slice(b"abc");
                Ok(3)
            })
            .expect("填充成功");
        assert_eq!(written, 3);
        assert_eq!(buf.chunk(), b"abc");

        let err = buf.fill_with(4, |_| Err(io::ErrorKind::WouldBlock.into()));
        assert!(err.is_err());
        assert_eq!(buf.remaining(), 3);
    }

    #[test]
    fn concat_appends_after_existing_remainder() {
        let mut head = Buffer::copy_from_slice(b"xxab");
        head.advance(2);
        let joined = Buffer::concat(Some(head), Buffer::copy_from_slice(b"cd"));
        assert_eq!(joined.chunk(), b"abcd");
    }

    #[test]
    fn duplicate_and_shrink_produce_new_identity() {
        let mut buf = Buffer::with_capacity(1024);
        buf.put_slice(b"tiny").expect("写入");
        let original = buf.id();
        let copy = buf.duplicate();
        assert_ne!(copy.id(), original);
        buf.shrink();
        assert_ne!(buf.id(), original);
        assert_eq!(buf.capacity(), 4);
        assert_eq!(buf.chunk(), b"tiny");
    }
}
