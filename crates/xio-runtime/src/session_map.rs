use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use tracing::trace;
use xio_transport::SessionId;

/// 会话到宿主对象的映射。
///
/// 宿主在 `on_new_session` 中登记自己的会话对象；会话关闭事件交付时，
/// 运行时自动移除对应条目。
#[derive(Default)]
pub struct SessionMap {
    entries: HashMap<SessionId, Box<dyn Any>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记会话对象，返回被替换的旧对象。
    pub fn insert<V: Any>(&mut self, session: SessionId, value: V) -> Option<Box<dyn Any>> {
        self.entries.insert(session, Box::new(value))
    }

    pub fn get<V: Any>(&self, session: SessionId) -> Option<&V> {
        self.entries.get(&session)?.downcast_ref()
    }

    pub fn get_mut<V: Any>(&mut self, session: SessionId) -> Option<&mut V> {
        self.entries.get_mut(&session)?.downcast_mut()
    }

    pub fn remove(&mut self, session: SessionId) -> Option<Box<dyn Any>> {
        self.entries.remove(&session)
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.entries.contains_key(&session)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SessionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl Drop for SessionMap {
    fn drop(&mut self) {
        trace!(entries = self.entries.len(), "session map released");
    }
}
