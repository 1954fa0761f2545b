//! 宿主回调桥接：fd 就绪通知与回调内可用的循环控制面。
//!
//! # 模块定位（Why）
//! - 应用通过 Context 注册的 fd 就绪后，运行时需要把“哪个 Context、哪个 fd、什么事件、
//!   注册时的 cookie”交给宿主；宿主在回调中常常需要继续注册/移除 fd 或请求停止，
//!   因此回调同时拿到一个 [`LoopControl`]。
//!
//! # 契约（What）
//! - 每次就绪恰好回调一次 [`EventSink::on_fd_ready`]；
//! - 回调在事件循环线程上同步执行，期间调用 `LoopControl` 的任何方法都是安全的；
//! - [`StopHandle`] 是唯一可以跨线程使用的对象。

use core::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use xio_transport::{EventMask, LoopStopper};

use crate::error::XioError;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的 Context 标识，在通知与日志中代替 Context 指针。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    pub(crate) fn next() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        ContextId(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// 应用 fd 的一次就绪通知。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FdReady {
    pub context: ContextId,
    pub fd: RawFd,
    pub events: EventMask,
    /// 注册时传入的 cookie，原样交还。
    pub cookie: u64,
}

/// 回调期间可用的循环控制面，由 `Context` 实现。
pub trait LoopControl {
    fn context_id(&self) -> ContextId;

    fn add_event_loop_fd(&self, fd: RawFd, events: EventMask, cookie: u64)
    -> Result<(), XioError>;

    fn del_event_loop_fd(&self, fd: RawFd) -> Result<(), XioError>;

    fn stop_event_loop(&self);

    fn stop_handle(&self) -> StopHandle;
}

/// 宿主回调。
///
/// 闭包 `Fn(&dyn LoopControl, &FdReady)` 自动实现本 trait。
pub trait EventSink: 'static {
    fn on_fd_ready(&self, control: &dyn LoopControl, ready: &FdReady);
}

impl<F> EventSink for F
where
    F: Fn(&dyn LoopControl, &FdReady) + 'static,
{
    fn on_fd_ready(&self, control: &dyn LoopControl, ready: &FdReady) {
        self(control, ready)
    }
}

/// 不处理任何通知的回调，用于未显式提供回调的 Context。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn on_fd_ready(&self, _control: &dyn LoopControl, _ready: &FdReady) {}
}

/// 跨线程停止句柄。
///
/// - **契约 (What)**：`stop` 幂等，可从任意线程调用；若循环正阻塞于等待则立即唤醒，
///   若当前没有运行，则下一次运行在等待前返回。
#[derive(Clone)]
pub struct StopHandle {
    context: ContextId,
    stopper: LoopStopper,
}

impl StopHandle {
    pub(crate) fn new(context: ContextId, stopper: LoopStopper) -> Self {
        Self { context, stopper }
    }

    pub fn context_id(&self) -> ContextId {
        self.context
    }

    pub fn stop(&self) {
        tracing::debug!(context = %self.context, "stop requested through handle");
        self.stopper.stop();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
