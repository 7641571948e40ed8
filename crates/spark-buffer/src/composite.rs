use std::collections::VecDeque;

use crate::buffer::{Buffer, BufferId};

/// 由多个 [`Buffer`] 顺序拼接而成的逻辑缓冲。
///
/// # 设计动机（Why）
/// - 大块明文会被加密为多条记录，每条记录写入一块独立的输出缓冲；
///   组合缓冲让这些记录以一次写操作交给传输层，而无需拼接拷贝；
/// - 写路径所有权策略需要把其中某一段替换为堆上的副本，
///   [`replace`](Self::replace) 以 [`BufferId`] 定位分段并原位替换。
///
/// # 契约（What）
/// - 空缓冲不会被追加；
/// - 分段顺序即字节顺序。
#[derive(Debug, Default)]
pub struct CompositeBuffer {
    segments: VecDeque<Buffer>,
}

impl CompositeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, segment: Buffer) {
        if segment.has_remaining() {
            self.segments.push_back(segment);
        }
    }

    /// 全部分段的可读字节总和。
    pub fn remaining(&self) -> usize {
        self.segments.iter().map(Buffer::remaining).sum()
    }

    pub fn has_remaining(&self) -> bool {
        self.segments.iter().any(Buffer::has_remaining)
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Buffer> {
        self.segments.iter()
    }

    pub fn last(&self) -> Option<&Buffer> {
        self.segments.back()
    }

    /// 将身份为 `target` 的分段替换为 `replacement`。
    ///
    /// 找到时返回被替换下来的旧分段（由调用方决定何时释放）；
    /// 找不到时把 `replacement` 原样退回。
    pub fn replace(&mut self, target: BufferId, replacement: Buffer) -> Result<Buffer, Buffer> {
        match self.segments.iter_mut().find(|segment| segment.id() == target) {
            Some(slot) => Ok(std::mem::replace(slot, replacement)),
            None => Err(replacement),
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.remaining());
        for segment in &self.segments {
            out.extend_from_slice(segment.chunk());
        }
        out
    }

    /// 合并为一块连续缓冲：单段时直接取出，多段时拷贝到堆上并释放原分段。
    pub fn into_contiguous(self) -> Buffer {
        if self.segments.len() == 1 {
            let mut segments = self.segments;
            if let Some(only) = segments.pop_front() {
                return only;
            }
            return Buffer::with_capacity(0);
        }
        Buffer::copy_from_slice(&self.to_vec())
    }

    pub fn into_segments(self) -> impl Iterator<Item = Buffer> {
        self.segments.into_iter()
    }
}

impl FromIterator<Buffer> for CompositeBuffer {
    fn from_iter<I: IntoIterator<Item = Buffer>>(iter: I) -> Self {
        let mut composite = CompositeBuffer::new();
        for segment in iter {
            composite.append(segment);
        }
        composite
    }
}
