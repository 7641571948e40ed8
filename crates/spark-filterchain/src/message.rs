use std::path::PathBuf;

use spark_buffer::{Buffer, CompositeBuffer};

/// 在过滤器之间流动的消息。
///
/// 读方向只会出现 `Buffer`；写方向可能出现多记录拼接的 `Composite`，
/// 以及由传输层零拷贝发送的 `FileRegion`。
#[derive(Debug)]
pub enum Message {
    Buffer(Buffer),
    Composite(CompositeBuffer),
    FileRegion(FileRegion),
}

impl Message {
    /// 可读字节数；文件区域返回待发送的长度。
    pub fn remaining(&self) -> usize {
        match self {
            Message::Buffer(buffer) => buffer.remaining(),
            Message::Composite(composite) => composite.remaining(),
            Message::FileRegion(region) => region.count as usize,
        }
    }

    pub fn is_file_region(&self) -> bool {
        matches!(self, Message::FileRegion(_))
    }

    /// 合并为一块连续缓冲；文件区域无法在内存中表示，原样退回。
    pub fn into_buffer(self) -> Result<Buffer, Message> {
        match self {
            Message::Buffer(buffer) => Ok(buffer),
            Message::Composite(composite) => Ok(composite.into_contiguous()),
            region @ Message::FileRegion(_) => Err(region),
        }
    }

    /// 复制内存中的字节；文件区域返回空。
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            Message::Buffer(buffer) => buffer.to_vec(),
            Message::Composite(composite) => composite.to_vec(),
            Message::FileRegion(_) => Vec::new(),
        }
    }
}

impl From<Buffer> for Message {
    fn from(value: Buffer) -> Self {
        Message::Buffer(value)
    }
}

impl From<CompositeBuffer> for Message {
    fn from(value: CompositeBuffer) -> Self {
        Message::Composite(value)
    }
}

/// 交由传输层直接从文件发送的区域（sendfile）。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRegion {
    pub path: PathBuf,
    pub position: u64,
    pub count: u64,
}

impl FileRegion {
    pub fn new(path: impl Into<PathBuf>, position: u64, count: u64) -> Self {
        Self {
            path: path.into(),
            position,
            count,
        }
    }
}
