use std::any::Any;

/// 沿过滤链向上传递的请求/通知事件。
///
/// 过滤器通过 `downcast_mut` 识别自己关心的事件类型，可就地填充输出字段后以
/// [`NextAction::Stop`](crate::NextAction::Stop) 截断传递，实现同步的请求/应答。
pub trait Event: Any + Send + 'static {
    fn event_type(&self) -> &'static str;
}

impl dyn Event {
    pub fn is<T: Event>(&self) -> bool {
        let any: &dyn Any = self;
        any.is::<T>()
    }

    pub fn downcast_mut<T: Event>(&mut self) -> Option<&mut T> {
        let any: &mut dyn Any = self;
        any.downcast_mut::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ping(u32);

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "ping"
        }
    }

    struct Other;

    impl Event for Other {
        fn event_type(&self) -> &'static str {
            "other"
        }
    }

    #[test]
    fn downcast_reaches_concrete_event() {
        let mut ping = Ping(1);
        let event: &mut dyn Event = &mut ping;
        assert!(event.is::<Ping>());
        assert!(event.downcast_mut::<Other>().is_none());
        if let Some(ping) = event.downcast_mut::<Ping>() {
            ping.0 += 1;
        }
        assert_eq!(ping.0, 2);
    }
}
