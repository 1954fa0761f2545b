//! Context：事件循环、传输上下文与每周期事件记账的所有者。
//!
//! # 模块定位（Why）
//! - 一个 Context 对应一个独立的事件驱动端点：它独占一个事件循环与绑定其上的传输上下文，
//!   并在每次 `run_event_loop` 中统计与缓存本周期发生的事件，供宿主在运行返回后读取；
//! - 构建过程按“循环 → 传输上下文 → 事件队列 → 聚合器”的顺序进行，任一步失败都会按逆序
//!   释放已创建的资源，调用方只会得到 `Err`，不存在“半初始化”的对象。
//!
//! # 架构关系（How）
//! - 资源释放次序由字段声明次序决定：会话映射 → 事件队列 → 聚合器 → 传输上下文 → 事件循环；
//! - 每周期状态放在 `Rc<CycleState>` 中，Server 包装的会话回调只持有 `Weak`，
//!   因此不会延长周期状态的生命周期；
//! - Context 含 `Rc`/`RefCell`，天然 `!Send + !Sync`，跨线程只能通过 [`StopHandle`] 请求停止。

use core::fmt;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use tracing::{debug, error, trace, warn};
use xio_transport::{
    EventLoop, EventMask, FdOwner, LoopExit, LoopTimeout, Readiness, SessionId, Transport,
    TransportContext,
};

use crate::config::ContextConfig;
use crate::error::XioError;
use crate::event_queue::{DEFAULT_EVENT_QUEUE_CAPACITY, EventQueue};
use crate::events::{EventTally, Events, LoopEvent};
use crate::session_map::SessionMap;
use crate::sink::{ContextId, EventSink, FdReady, LoopControl, NoopSink, StopHandle};

/// 一次运行的结束原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExit {
    TimedOut,
    Stopped,
    /// 没有已注册的 fd 且超时为无限，循环无事可等。
    Idle,
    /// 事件循环自身失败，返回值为已记录的事件数。
    Failed,
}

impl From<LoopExit> for RunExit {
    fn from(exit: LoopExit) -> Self {
        match exit {
            LoopExit::TimedOut => RunExit::TimedOut,
            LoopExit::Stopped => RunExit::Stopped,
            LoopExit::Idle => RunExit::Idle,
        }
    }
}

/// 每周期状态。字段声明次序即释放次序。
pub(crate) struct CycleState {
    context: ContextId,
    session_map: RefCell<Option<SessionMap>>,
    queue: RefCell<EventQueue>,
    events: RefCell<Events>,
    events_num: Cell<usize>,
    overflow_reported: Cell<bool>,
}

impl CycleState {
    fn new(context: ContextId, queue: EventQueue, events: Events) -> Self {
        Self {
            context,
            session_map: RefCell::new(None),
            queue: RefCell::new(queue),
            events: RefCell::new(events),
            events_num: Cell::new(0),
            overflow_reported: Cell::new(false),
        }
    }

    /// 计数并入队；队列溢出在每个周期只告警一次。
    pub(crate) fn record(&self, event: LoopEvent) {
        self.events_num.set(self.events_num.get() + 1);
        let stored = {
            let mut queue = self.queue.borrow_mut();
            self.events.borrow_mut().record(&mut queue, event)
        };
        if !stored && !self.overflow_reported.replace(true) {
            warn!(
                context = %self.context,
                capacity = self.queue.borrow().capacity(),
                "event queue full, further events this cycle are not queued"
            );
        }
    }

    /// 会话结束时移除会话映射中的条目。
    pub(crate) fn forget_session(&self, session: SessionId) {
        if let Some(map) = self.session_map.borrow_mut().as_mut() {
            if map.remove(session).is_some() {
                trace!(context = %self.context, %session, "session map entry removed");
            }
        }
    }

    fn reset(&self) {
        self.queue.borrow_mut().reset();
        self.events.borrow_mut().reset();
        self.events_num.set(0);
        self.overflow_reported.set(false);
    }
}

/// Context 构建器。
///
/// ```ignore
/// let ctx = Context::builder(TcpTransport::default())
///     .event_queue_capacity(64)
///     .sink(|control: &dyn LoopControl, ready: &FdReady| { /* ... */ })
///     .session_map(true)
///     .build()?;
/// ```
#[must_use]
pub struct ContextBuilder<T: Transport> {
    transport: T,
    capacity: i32,
    sink: Option<Box<dyn EventSink>>,
    session_map: bool,
}

impl<T: Transport> ContextBuilder<T> {
    pub fn event_queue_capacity(mut self, capacity: i32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn sink(mut self, sink: impl EventSink) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn boxed_sink(mut self, sink: Box<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn session_map(mut self, enabled: bool) -> Self {
        self.session_map = enabled;
        self
    }

    /// 按“循环 → 传输上下文 → 事件队列 → 聚合器”的顺序构建。
    ///
    /// 失败时已创建的局部资源随 `?` 提前返回而按逆序释放：
    /// 队列失败时先释放传输上下文，再释放事件循环。
    pub fn build(self) -> Result<Context<T>, XioError> {
        let ContextBuilder {
            transport,
            capacity,
            sink,
            session_map,
        } = self;
        let id = ContextId::next();

        let ev_loop = transport
            .loop_init()
            .map(Rc::new)
            .map_err(|source| creation_failed(id, XioError::LoopInit { source }))?;
        let transport_ctx = transport
            .ctx_open(&ev_loop)
            .map_err(|source| creation_failed(id, XioError::ContextOpen { source }))?;
        let queue = EventQueue::new(capacity)
            .map_err(|source| creation_failed(id, XioError::EventQueue { source }))?;
        let events = Events::new();

        let cycle = Rc::new(CycleState::new(id, queue, events));
        if session_map {
            *cycle.session_map.borrow_mut() = Some(SessionMap::new());
        }

        debug!(
            context = %id,
            scheme = transport.scheme(),
            capacity,
            session_map,
            "context created"
        );
        Ok(Context {
            id,
            cycle,
            transport_ctx,
            ev_loop,
            transport,
            sink: sink.unwrap_or_else(|| Box::new(NoopSink)),
            running: Cell::new(false),
            last_exit: Cell::new(None),
        })
    }
}

fn creation_failed(context: ContextId, err: XioError) -> XioError {
    let kind = err.kind();
    error!(
        %context,
        code = kind.code,
        error = %err,
        "{} failed, context not created",
        kind.message
    );
    err
}

/// 事件驱动端点。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将事件循环、传输上下文、事件队列与聚合器的所有权集中在一个对象上，
///   “每个资源至多释放一次”由所有权直接保证；
/// - 在每次运行开始时清零周期状态，使宿主读取到的事件计数只反映本次运行。
///
/// ## 契约（What）
/// - `run_event_loop`：阻塞至超时、停止或无事可等，返回本次运行记录的事件数；
///   同一 Context 上重入返回 [`XioError::AlreadyRunning`]；
/// - `stop_event_loop`：请求当前或下一次运行尽快返回；
/// - `add_event_loop_fd`/`del_event_loop_fd`：注册/移除应用 fd，失败不产生副作用，
///   在回调中调用同样安全；
/// - 应用 fd 的每次就绪先记入周期状态，再恰好一次回调 [`EventSink::on_fd_ready`]；
///   传输 fd 的就绪交给传输上下文处理，其错误只记录日志。
///
/// ## 风险提示（Trade-offs）
/// - 事件循环失败不会以 `Err` 返回，而是记录日志并返回已记录的事件数，
///   通过 [`Context::last_run_exit`] 区分；这样宿主在一次循环故障后仍能读取已发生的事件。
pub struct Context<T: Transport> {
    id: ContextId,
    cycle: Rc<CycleState>,
    transport_ctx: T::Context,
    ev_loop: Rc<T::Loop>,
    transport: T,
    sink: Box<dyn EventSink>,
    running: Cell<bool>,
    last_exit: Cell<Option<RunExit>>,
}

impl<T: Transport> Context<T> {
    pub fn builder(transport: T) -> ContextBuilder<T> {
        ContextBuilder {
            transport,
            capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            sink: None,
            session_map: false,
        }
    }

    pub fn new(transport: T, capacity: i32, sink: impl EventSink) -> Result<Self, XioError> {
        Self::builder(transport)
            .event_queue_capacity(capacity)
            .sink(sink)
            .build()
    }

    pub fn from_config(
        transport: T,
        config: &ContextConfig,
        sink: impl EventSink,
    ) -> Result<Self, XioError> {
        Self::builder(transport)
            .event_queue_capacity(config.event_queue_capacity)
            .session_map(config.session_map)
            .sink(sink)
            .build()
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn event_loop(&self) -> &T::Loop {
        &self.ev_loop
    }

    pub fn transport_context(&self) -> &T::Context {
        &self.transport_ctx
    }

    /// 运行事件循环并返回本次记录的事件数。
    pub fn run_event_loop(&self, timeout: impl Into<LoopTimeout>) -> Result<usize, XioError> {
        if self.running.replace(true) {
            warn!(context = %self.id, "run_event_loop called while already running");
            return Err(XioError::AlreadyRunning { context: self.id });
        }
        let _running = RunningGuard(&self.running);

        self.cycle.reset();
        let timeout = timeout.into();
        debug!(context = %self.id, ?timeout, "event loop run starting");

        let exit = match self
            .ev_loop
            .run_timeout(timeout, &mut |readiness| self.route(readiness))
        {
            Ok(exit) => RunExit::from(exit),
            Err(err) => {
                error!(context = %self.id, error = %err, "event loop run failed");
                RunExit::Failed
            }
        };
        self.last_exit.set(Some(exit));

        let events = self.cycle.events_num.get();
        debug!(context = %self.id, events, ?exit, "event loop run finished");
        Ok(events)
    }

    fn route(&self, readiness: Readiness) {
        match readiness.owner {
            FdOwner::Application(cookie) => {
                let ready = FdReady {
                    context: self.id,
                    fd: readiness.fd,
                    events: readiness.events,
                    cookie,
                };
                self.cycle.record(LoopEvent::FdReady(ready));
                self.sink.on_fd_ready(self, &ready);
            }
            FdOwner::Transport(tag) => {
                if let Err(err) = self.transport_ctx.dispatch(readiness) {
                    warn!(
                        context = %self.id,
                        fd = readiness.fd,
                        tag,
                        error = %err,
                        "transport dispatch failed"
                    );
                }
            }
        }
    }

    /// 请求当前或下一次运行返回。
    pub fn stop_event_loop(&self) {
        debug!(context = %self.id, "stop requested");
        self.ev_loop.stop();
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.id, self.ev_loop.stopper())
    }

    pub fn add_event_loop_fd(
        &self,
        fd: RawFd,
        events: EventMask,
        cookie: u64,
    ) -> Result<(), XioError> {
        if fd < 0 {
            return Err(XioError::InvalidFd { fd });
        }
        if events.is_empty() {
            return Err(XioError::InvalidInterest { fd });
        }
        if self.ev_loop.is_registered(fd) {
            return Err(XioError::FdAlreadyRegistered { fd });
        }
        self.ev_loop
            .add(fd, events, FdOwner::Application(cookie))
            .map_err(|err| XioError::from_register(fd, err))?;
        trace!(context = %self.id, fd, ?events, cookie, "fd registered");
        Ok(())
    }

    pub fn del_event_loop_fd(&self, fd: RawFd) -> Result<(), XioError> {
        if !self.ev_loop.is_registered(fd) {
            return Err(XioError::FdNotRegistered { fd });
        }
        self.ev_loop
            .del(fd)
            .map_err(|err| XioError::from_deregister(fd, err))?;
        trace!(context = %self.id, fd, "fd removed");
        Ok(())
    }

    /// 本周期已记录的事件数。
    pub fn events_num(&self) -> usize {
        self.cycle.events_num.get()
    }

    pub fn tally(&self) -> EventTally {
        self.cycle.events.borrow().tally()
    }

    /// 访问本周期的事件队列（宿主读取入口）。
    pub fn with_event_queue<R>(&self, f: impl FnOnce(&mut EventQueue) -> R) -> R {
        f(&mut self.cycle.queue.borrow_mut())
    }

    pub fn last_run_exit(&self) -> Option<RunExit> {
        self.last_exit.get()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    /// 安装会话映射；已安装时返回 `false`。
    pub fn install_session_map(&self) -> bool {
        let mut slot = self.cycle.session_map.borrow_mut();
        if slot.is_some() {
            return false;
        }
        *slot = Some(SessionMap::new());
        true
    }

    pub fn has_session_map(&self) -> bool {
        self.cycle.session_map.borrow().is_some()
    }

    pub fn with_session_map<R>(&self, f: impl FnOnce(&mut SessionMap) -> R) -> Option<R> {
        self.cycle.session_map.borrow_mut().as_mut().map(f)
    }

    pub(crate) fn cycle(&self) -> Weak<CycleState> {
        Rc::downgrade(&self.cycle)
    }
}

impl<T: Transport> LoopControl for Context<T> {
    fn context_id(&self) -> ContextId {
        self.id
    }

    fn add_event_loop_fd(&self, fd: RawFd, events: EventMask, cookie: u64) -> Result<(), XioError> {
        Context::add_event_loop_fd(self, fd, events, cookie)
    }

    fn del_event_loop_fd(&self, fd: RawFd) -> Result<(), XioError> {
        Context::del_event_loop_fd(self, fd)
    }

    fn stop_event_loop(&self) {
        Context::stop_event_loop(self)
    }

    fn stop_handle(&self) -> StopHandle {
        Context::stop_handle(self)
    }
}

impl<T: Transport> Drop for Context<T> {
    fn drop(&mut self) {
        debug!(context = %self.id, "context released");
    }
}

impl<T: Transport> fmt::Debug for Context<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("scheme", &self.transport.scheme())
            .field("running", &self.running.get())
            .field("events_num", &self.cycle.events_num.get())
            .field("last_exit", &self.last_exit.get())
            .finish_non_exhaustive()
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingTransport, FailurePlan, Released};
    use core::time::Duration;
    use std::cell::RefCell as StdRefCell;

    fn counting() -> CountingTransport {
        CountingTransport::new()
    }

    #[test]
    fn build_then_drop_releases_each_resource_once_in_order() {
        let transport = counting();
        let ledger = transport.ledger();
        let ctx = Context::new(transport, 16, NoopSink).expect("context");
        assert_eq!(ledger.live_loops(), 1);
        assert_eq!(ledger.live_contexts(), 1);
        drop(ctx);
        assert_eq!(ledger.live_loops(), 0);
        assert_eq!(ledger.live_contexts(), 0);
        assert_eq!(ledger.releases(), vec![Released::Context, Released::Loop]);
    }

    #[test]
    fn loop_init_failure_leaves_nothing_behind() {
        let transport = counting().with_plan(FailurePlan {
            fail_loop_init: true,
            ..FailurePlan::default()
        });
        let ledger = transport.ledger();
        let err = Context::new(transport, 16, NoopSink).expect_err("loop init fails");
        assert_eq!(err.code(), "xio.context.loop_init_failed");
        assert!(ledger.releases().is_empty());
        assert_eq!(ledger.live_loops(), 0);
    }

    #[test]
    fn ctx_open_failure_releases_loop() {
        let transport = counting().with_plan(FailurePlan {
            fail_ctx_open: true,
            ..FailurePlan::default()
        });
        let ledger = transport.ledger();
        let err = Context::new(transport, 16, NoopSink).expect_err("ctx open fails");
        assert!(matches!(err, XioError::ContextOpen { .. }));
        assert_eq!(ledger.releases(), vec![Released::Loop]);
    }

    #[test]
    fn queue_failure_releases_context_then_loop() {
        let transport = counting();
        let ledger = transport.ledger();
        let err = Context::new(transport, 0, NoopSink).expect_err("capacity 0");
        assert!(matches!(err, XioError::EventQueue { .. }));
        assert_eq!(ledger.releases(), vec![Released::Context, Released::Loop]);
        assert_eq!(ledger.live_loops(), 0);
        assert_eq!(ledger.live_contexts(), 0);
    }

    #[test]
    fn duplicate_add_and_missing_del_have_no_side_effects() {
        let ctx = Context::new(counting(), 8, NoopSink).expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 1).expect("first add");
        let err = ctx
            .add_event_loop_fd(5, EventMask::WRITABLE, 2)
            .expect_err("duplicate");
        assert!(matches!(err, XioError::FdAlreadyRegistered { fd: 5 }));
        assert_eq!(ctx.event_loop().registered(), 1);

        let err = ctx.del_event_loop_fd(6).expect_err("missing");
        assert!(matches!(err, XioError::FdNotRegistered { fd: 6 }));
        assert_eq!(ctx.event_loop().registered(), 1);

        ctx.del_event_loop_fd(5).expect("del");
        assert_eq!(ctx.event_loop().registered(), 0);
    }

    #[test]
    fn rejects_negative_fd_and_empty_interest() {
        let ctx = Context::new(counting(), 8, NoopSink).expect("context");
        assert!(matches!(
            ctx.add_event_loop_fd(-1, EventMask::READABLE, 0),
            Err(XioError::InvalidFd { fd: -1 })
        ));
        assert!(matches!(
            ctx.add_event_loop_fd(3, EventMask::empty(), 0),
            Err(XioError::InvalidInterest { fd: 3 })
        ));
        assert_eq!(ctx.event_loop().registered(), 0);
    }

    #[test]
    fn events_num_resets_at_each_run() {
        let ctx = Context::new(counting(), 8, NoopSink).expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        let injector = ctx.event_loop().injector();

        injector.inject(5, EventMask::READABLE);
        injector.inject(5, EventMask::READABLE);
        assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 2);
        assert_eq!(ctx.events_num(), 2);

        assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 0);
        assert_eq!(ctx.events_num(), 0);
        assert_eq!(ctx.with_event_queue(|q| q.len()), 0);
    }

    #[test]
    fn cookie_is_handed_back_unchanged() {
        let seen = Rc::new(StdRefCell::new(Vec::new()));
        let sink_seen = Rc::clone(&seen);
        let ctx = Context::new(
            counting(),
            8,
            move |_control: &dyn LoopControl, ready: &FdReady| {
                sink_seen.borrow_mut().push((ready.fd, ready.cookie));
            },
        )
        .expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0xdead_beef)
            .expect("add");
        ctx.event_loop().injector().inject(5, EventMask::READABLE);
        ctx.run_event_loop(LoopTimeout::Poll).expect("run");
        assert_eq!(*seen.borrow(), vec![(5, 0xdead_beef)]);
    }

    #[test]
    fn stop_from_handler_ends_run_early() {
        let ctx = Context::new(
            counting(),
            8,
            |control: &dyn LoopControl, _ready: &FdReady| control.stop_event_loop(),
        )
        .expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        ctx.event_loop().injector().inject(5, EventMask::READABLE);
        ctx.event_loop().injector().inject(5, EventMask::READABLE);

        let events = ctx
            .run_event_loop(Duration::from_secs(30))
            .expect("run");
        assert_eq!(events, 1);
        assert_eq!(ctx.last_run_exit(), Some(RunExit::Stopped));
    }

    #[test]
    fn pending_stop_returns_before_waiting() {
        let ctx = Context::new(counting(), 8, NoopSink).expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        ctx.stop_event_loop();
        let events = ctx.run_event_loop(LoopTimeout::Infinite).expect("run");
        assert_eq!(events, 0);
        assert_eq!(ctx.last_run_exit(), Some(RunExit::Stopped));
    }

    #[test]
    fn del_during_dispatch_suppresses_pending_readiness() {
        let ctx = Context::new(
            counting(),
            8,
            |control: &dyn LoopControl, ready: &FdReady| {
                if ready.fd == 5 {
                    control.del_event_loop_fd(6).expect("del peer");
                    control.del_event_loop_fd(5).expect("del self");
                }
            },
        )
        .expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add 5");
        ctx.add_event_loop_fd(6, EventMask::READABLE, 0).expect("add 6");
        let injector = ctx.event_loop().injector();
        injector.inject(5, EventMask::READABLE);
        injector.inject(6, EventMask::READABLE);
        injector.inject(5, EventMask::READABLE);

        assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 1);
        assert_eq!(ctx.tally().fd_ready, 1);
    }

    #[test]
    fn add_from_handler_is_allowed() {
        let ctx = Context::new(
            counting(),
            8,
            |control: &dyn LoopControl, ready: &FdReady| {
                if ready.fd == 5 {
                    control
                        .add_event_loop_fd(7, EventMask::WRITABLE, 70)
                        .expect("add from handler");
                }
            },
        )
        .expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        ctx.event_loop().injector().inject(5, EventMask::READABLE);
        ctx.run_event_loop(LoopTimeout::Poll).expect("run");
        assert!(ctx.event_loop().is_registered(7));
    }

    #[test]
    fn reentrant_run_is_rejected() {
        type Slot = Rc<StdRefCell<Option<Weak<Context<CountingTransport>>>>>;
        let slot: Slot = Rc::new(StdRefCell::new(None));
        let nested = Rc::new(StdRefCell::new(None));

        let sink_slot = Rc::clone(&slot);
        let sink_nested = Rc::clone(&nested);
        let ctx = Rc::new(
            Context::new(
                counting(),
                8,
                move |_control: &dyn LoopControl, _ready: &FdReady| {
                    let ctx = sink_slot.borrow().as_ref().and_then(Weak::upgrade);
                    if let Some(ctx) = ctx {
                        *sink_nested.borrow_mut() = ctx.run_event_loop(LoopTimeout::Poll).err();
                    }
                },
            )
            .expect("context"),
        );
        *slot.borrow_mut() = Some(Rc::downgrade(&ctx));

        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        ctx.event_loop().injector().inject(5, EventMask::READABLE);
        assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("outer run"), 1);
        assert!(matches!(
            nested.borrow().as_ref(),
            Some(XioError::AlreadyRunning { .. })
        ));
        assert!(!ctx.is_running());
    }

    #[test]
    fn queue_overflow_still_counts_and_forwards() {
        let forwarded = Rc::new(Cell::new(0usize));
        let sink_forwarded = Rc::clone(&forwarded);
        let ctx = Context::new(
            counting(),
            1,
            move |_control: &dyn LoopControl, _ready: &FdReady| {
                sink_forwarded.set(sink_forwarded.get() + 1)
            },
        )
        .expect("context");
        ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
        for _ in 0..3 {
            ctx.event_loop().injector().inject(5, EventMask::READABLE);
        }
        assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 3);
        assert_eq!(forwarded.get(), 3);
        assert_eq!(ctx.with_event_queue(|q| (q.len(), q.overflowed())), (1, 2));
    }

    #[test]
    fn session_map_install_is_idempotent() {
        let ctx = Context::new(counting(), 8, NoopSink).expect("context");
        assert!(!ctx.has_session_map());
        assert!(ctx.with_session_map(|map| map.len()).is_none());
        assert!(ctx.install_session_map());
        assert!(!ctx.install_session_map());
        assert_eq!(ctx.with_session_map(|map| map.len()), Some(0));
    }
}
