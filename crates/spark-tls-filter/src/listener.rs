use std::sync::Arc;

use arc_swap::ArcSwap;
use spark_filterchain::Connection;

use crate::error::TlsError;

/// 握手生命周期监听器。
///
/// 每次握手（包括重协商）恰好触发一次 `on_start` 与一次 `on_complete`，
/// 且 `on_start` 严格先于 `on_complete`；握手循环内的失败在错误向上传递之前触发 `on_failure`。
pub trait HandshakeListener: Send + Sync + 'static {
    fn on_start(&self, connection: &Connection);

    fn on_complete(&self, connection: &Connection);

    fn on_failure(&self, _connection: &Connection, _error: &TlsError) {}
}

/// 监听器注册表。
///
/// # 逻辑（How）
/// - 注册表以 `ArcSwap<Vec<_>>` 保存，增删采用 RCU 复制；
/// - 通知遍历加载时刻的快照，监听器在回调中增删注册表不会影响本轮通知。
pub struct HandshakeListeners {
    inner: ArcSwap<Vec<Arc<dyn HandshakeListener>>>,
}

impl Default for HandshakeListeners {
    fn default() -> Self {
        Self {
            inner: ArcSwap::from_pointee(Vec::new()),
        }
    }
}

impl HandshakeListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn HandshakeListener>) {
        self.inner.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    /// 按身份移除；返回是否确实移除了监听器。
    pub fn remove(&self, listener: &Arc<dyn HandshakeListener>) -> bool {
        let before = self.inner.rcu(|current| {
            current
                .iter()
                .filter(|registered| !same_listener(registered, listener))
                .cloned()
                .collect::<Vec<_>>()
        });
        before.iter().any(|registered| same_listener(registered, listener))
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.load().is_empty()
    }

    pub(crate) fn notify_start(&self, connection: &Connection) {
        for listener in self.inner.load_full().iter() {
            listener.on_start(connection);
        }
    }

    pub(crate) fn notify_complete(&self, connection: &Connection) {
        for listener in self.inner.load_full().iter() {
            listener.on_complete(connection);
        }
    }

    pub(crate) fn notify_failure(&self, connection: &Connection, error: &TlsError) {
        for listener in self.inner.load_full().iter() {
            listener.on_failure(connection, error);
        }
    }
}

fn same_listener(a: &Arc<dyn HandshakeListener>, b: &Arc<dyn HandshakeListener>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
