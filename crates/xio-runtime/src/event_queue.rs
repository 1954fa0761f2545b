//! 每次运行周期内的有界事件队列。
//!
//! # 模块定位（Why）
//! - 宿主桥接层在一次 `run_event_loop` 返回后按序读取本周期发生的事件；队列容量在构造时固定，
//!   运行期间不再分配内存。
//!
//! # 契约（What）
//! - 容量必须为正数，否则构造失败；内存预留失败同样以错误返回，绝不 panic；
//! - 队列满时 [`EventQueue::push`] 返回 `false` 并累加 `overflowed`，事件本身仍由调用方照常转发；
//! - [`EventQueue::reset`] 清空事件、读游标与溢出计数，幂等。

use std::collections::TryReserveError;

use thiserror::Error;
use tracing::trace;

use crate::events::LoopEvent;

/// 默认队列容量。
pub const DEFAULT_EVENT_QUEUE_CAPACITY: i32 = 1000;

/// 队列构造失败。
#[derive(Debug, Error)]
pub enum EventQueueError {
    #[error("event queue capacity must be positive, got {capacity}")]
    NonPositiveCapacity { capacity: i32 },
    #[error("cannot reserve {capacity} event slots: {source}")]
    Allocation {
        capacity: i32,
        #[source]
        source: TryReserveError,
    },
}

/// 有界事件队列。
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    events: Vec<LoopEvent>,
    offset: usize,
    overflowed: u64,
}

impl EventQueue {
    pub fn new(capacity: i32) -> Result<Self, EventQueueError> {
        if capacity <= 0 {
            return Err(EventQueueError::NonPositiveCapacity { capacity });
        }
        let slots = capacity as usize;
        let mut events = Vec::new();
        events
            .try_reserve_exact(slots)
            .map_err(|source| EventQueueError::Allocation { capacity, source })?;
        Ok(Self {
            capacity: slots,
            events,
            offset: 0,
            overflowed: 0,
        })
    }

    /// 追加事件；队列已满时丢弃并返回 `false`。
    pub fn push(&mut self, event: LoopEvent) -> bool {
        if self.is_full() {
            self.overflowed += 1;
            return false;
        }
        self.events.push(event);
        true
    }

    /// 清空事件、读游标与溢出计数，保留已预留的内存。
    pub fn reset(&mut self) {
        self.events.clear();
        self.offset = 0;
        self.overflowed = 0;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 宿主读游标。
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// 本周期因队列已满而未入队的事件数。
    pub fn overflowed(&self) -> u64 {
        self.overflowed
    }

    pub fn iter(&self) -> impl Iterator<Item = &LoopEvent> {
        self.events.iter()
    }

    /// 返回游标处的事件并前移游标。
    pub fn next_event(&mut self) -> Option<&LoopEvent> {
        let event = self.events.get(self.offset)?;
        self.offset += 1;
        Some(event)
    }

    /// 尚未被宿主读取的事件数。
    pub fn pending(&self) -> usize {
        self.events.len() - self.offset
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        trace!(capacity = self.capacity, "event queue released");
    }
}
