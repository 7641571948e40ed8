use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use spark_buffer::{Buffer, HeapMemoryManager, MemoryManager};

use crate::{chain::FilterChain, error::Result, message::Message, transport::Transport};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// 连接标识，仅用于日志与诊断。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

type Attribute = Arc<dyn Any + Send + Sync>;

/// 一条逻辑连接：传输句柄、当前过滤链与按类型索引的连接属性。
///
/// # 设计背景（Why）
/// - TLS 会话上下文等“每连接一份”的状态以属性形式挂在连接上，随连接一起销毁；
/// - 过滤链可在握手完成后整体替换（协议协商后切换到新的链路），因此用 `ArcSwap` 持有；
/// - 写路径需要连接级互斥，保证同一连接上的加密与提交不会交错。
///
/// # 契约说明（What）
/// - `attribute_or_insert_with` 在属性表锁内执行初始化闭包，闭包不得再访问本连接的属性；
/// - 阻塞读超时只影响 [`read_blocking`](Self::read_blocking)，`None` 表示无限等待。
pub struct Connection {
    id: ConnectionId,
    transport: Arc<dyn Transport>,
    memory_manager: Arc<dyn MemoryManager>,
    chain: ArcSwap<FilterChain>,
    attributes: Mutex<HashMap<TypeId, Attribute>>,
    read_timeout: Mutex<Option<Duration>>,
    write_lock: Mutex<()>,
}

impl Connection {
    /// 使用堆内存管理器创建连接。
    pub fn new(transport: Arc<dyn Transport>, chain: Arc<FilterChain>) -> Arc<Self> {
        Self::with_memory_manager(transport, chain, Arc::new(HeapMemoryManager))
    }

    pub fn with_memory_manager(
        transport: Arc<dyn Transport>,
        chain: Arc<FilterChain>,
        memory_manager: Arc<dyn MemoryManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            transport,
            memory_manager,
            chain: ArcSwap::new(chain),
            attributes: Mutex::new(HashMap::new()),
            read_timeout: Mutex::new(None),
            write_lock: Mutex::new(()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn memory_manager(&self) -> &Arc<dyn MemoryManager> {
        &self.memory_manager
    }

    /// 当前生效的过滤链快照。
    pub fn filter_chain(&self) -> Arc<FilterChain> {
        self.chain.load_full()
    }

    /// 替换过滤链；已在执行中的任务继续使用旧链，新的读事件使用新链。
    pub fn set_filter_chain(&self, chain: Arc<FilterChain>) {
        self.chain.store(chain);
    }

    pub fn attribute<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let attribute = self.attributes.lock().get(&TypeId::of::<T>()).cloned()?;
        attribute.downcast::<T>().ok()
    }

    /// 读取属性，不存在时以 `init` 创建并登记。
    pub fn attribute_or_insert_with<T, F>(&self, init: F) -> Arc<T>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut attributes = self.attributes.lock();
        if let Some(existing) = attributes.get(&TypeId::of::<T>()).cloned()
            && let Ok(typed) = existing.downcast::<T>()
        {
            return typed;
        }
        let fresh = Arc::new(init());
        attributes.insert(TypeId::of::<T>(), fresh.clone());
        fresh
    }

    pub fn remove_attribute<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let attribute = self.attributes.lock().remove(&TypeId::of::<T>())?;
        attribute.downcast::<T>().ok()
    }

    pub fn blocking_read_timeout(&self) -> Option<Duration> {
        *self.read_timeout.lock()
    }

    pub fn set_blocking_read_timeout(&self, timeout: Option<Duration>) {
        *self.read_timeout.lock() = timeout;
    }

    /// 连接级写互斥。
    pub fn write_lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// 以当前阻塞读超时从传输层同步读取一块数据。
    pub fn read_blocking(&self) -> Result<Buffer> {
        self.transport.read_blocking(self, self.blocking_read_timeout())
    }

    /// 以新的读事件进入当前过滤链。
    pub fn fire_read(self: &Arc<Self>, message: Message) -> Result<()> {
        self.filter_chain().fire_read(self, message)
    }

    /// 从当前过滤链顶端发起写操作。
    pub fn fire_write(self: &Arc<Self>, message: Message) -> Result<()> {
        self.filter_chain().fire_write(self, message)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("chain_len", &self.chain.load().len())
            .finish()
    }
}
