//! 计数传输：在无真实 fd 的环境下验证 Context/Server 生命周期。
//!
//! # 模块定位（Why）
//! - 生命周期属性（每个资源至多释放一次、构建失败按逆序回滚、绑定失败不调用解绑）
//!   需要观察协作者的创建与释放，本模块提供一组带账本的替身实现；
//! - [`ScriptedLoop`] 的就绪由测试通过 [`ReadinessInjector`] 注入，注入端 `Send + Sync`，
//!   可以从其他线程唤醒阻塞中的运行。
//!
//! # 契约（What）
//! - [`ResourceLedger`] 记录存活数量、释放顺序与 `bind`/`unbind` 调用次数；
//! - [`FailurePlan`] 决定各步骤是否失败；
//! - [`CountingContext::schedule`] 为每个已绑定监听器排入一条会话通知并使其伪 fd 就绪，
//!   通知在下一次运行中经由传输分发路径交付。

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::trace;
use xio_transport::{
    EventLoop, EventMask, FdOwner, Listener, LoopExit, LoopStopper, LoopTimeout, Msg, MsgError,
    NewSession, PortalUrl, Readiness, SendComplete, SessionEvent, SessionOps, StopSignal,
    Transport, TransportContext, TransportError,
};

/// 监听器伪 fd 的起始编号，避开测试中常用的小号 fd。
const LISTENER_FD_BASE: RawFd = 10_000;
/// 端口 0 请求被分配到的起始端口。
const EPHEMERAL_PORT_BASE: u16 = 40_000;

/// 被释放的资源类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Released {
    Loop,
    Context,
    Listener,
}

/// 各步骤的失败开关。
#[derive(Clone, Debug, Default)]
pub struct FailurePlan {
    pub fail_loop_init: bool,
    pub fail_ctx_open: bool,
    pub fail_bind: bool,
    pub fail_unbind: bool,
    /// 事件循环拒绝注册应用 fd。
    pub reject_application_fds: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    loops_created: usize,
    contexts_created: usize,
    live_loops: usize,
    live_contexts: usize,
    live_listeners: usize,
    releases: Vec<Released>,
    bind_calls: usize,
    unbind_calls: usize,
}

/// 协作者账本。克隆共享同一份状态。
#[derive(Clone, Default)]
pub struct ResourceLedger {
    state: Arc<Mutex<LedgerState>>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loops_created(&self) -> usize {
        self.state.lock().loops_created
    }

    pub fn contexts_created(&self) -> usize {
        self.state.lock().contexts_created
    }

    pub fn live_loops(&self) -> usize {
        self.state.lock().live_loops
    }

    pub fn live_contexts(&self) -> usize {
        self.state.lock().live_contexts
    }

    pub fn live_listeners(&self) -> usize {
        self.state.lock().live_listeners
    }

    /// 按发生顺序返回释放记录。
    pub fn releases(&self) -> Vec<Released> {
        self.state.lock().releases.clone()
    }

    pub fn bind_calls(&self) -> usize {
        self.state.lock().bind_calls
    }

    pub fn unbind_calls(&self) -> usize {
        self.state.lock().unbind_calls
    }

    fn created(&self, kind: Released) {
        let mut state = self.state.lock();
        match kind {
            Released::Loop => {
                state.loops_created += 1;
                state.live_loops += 1;
            }
            Released::Context => {
                state.contexts_created += 1;
                state.live_contexts += 1;
            }
            Released::Listener => state.live_listeners += 1,
        }
    }

    fn released(&self, kind: Released) {
        let mut state = self.state.lock();
        let live = match kind {
            Released::Loop => &mut state.live_loops,
            Released::Context => &mut state.live_contexts,
            Released::Listener => &mut state.live_listeners,
        };
        *live = live.saturating_sub(1);
        state.releases.push(kind);
    }
}

impl fmt::Debug for ResourceLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.state.lock(), f)
    }
}

/// 带账本的传输替身，协议名为 `rdma`。
#[derive(Debug, Default)]
pub struct CountingTransport {
    ledger: ResourceLedger,
    plan: FailurePlan,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: FailurePlan) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_ledger(mut self, ledger: ResourceLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> ResourceLedger {
        self.ledger.clone()
    }
}

fn scripted_failure(step: &str) -> TransportError {
    TransportError::Unavailable {
        detail: format!("scripted {step} failure"),
    }
}

impl Transport for CountingTransport {
    type Loop = ScriptedLoop;
    type Context = CountingContext;
    type Listener = CountingListener;

    fn scheme(&self) -> &'static str {
        "rdma"
    }

    fn loop_init(&self) -> Result<ScriptedLoop, TransportError> {
        if self.plan.fail_loop_init {
            return Err(scripted_failure("loop init"));
        }
        Ok(ScriptedLoop::new(
            self.ledger.clone(),
            self.plan.reject_application_fds,
        ))
    }

    fn ctx_open(&self, ev_loop: &Rc<ScriptedLoop>) -> Result<CountingContext, TransportError> {
        if self.plan.fail_ctx_open {
            return Err(scripted_failure("context open"));
        }
        self.ledger.created(Released::Context);
        Ok(CountingContext {
            ledger: self.ledger.clone(),
            ev_loop: Rc::clone(ev_loop),
            listeners: Rc::new(RefCell::new(HashMap::new())),
            next_tag: Cell::new(1),
        })
    }

    fn bind(
        &self,
        ctx: &CountingContext,
        url: &PortalUrl,
        ops: SessionOps,
    ) -> Result<CountingListener, TransportError> {
        self.ledger.state.lock().bind_calls += 1;
        if self.plan.fail_bind {
            return Err(scripted_failure("bind"));
        }

        let tag = ctx.next_tag.replace(ctx.next_tag.get() + 1);
        let fd = LISTENER_FD_BASE + tag as RawFd;
        let url = if url.port() == 0 {
            url.with_port(EPHEMERAL_PORT_BASE + tag as u16)
        } else {
            url.clone()
        };
        ctx.ev_loop
            .add(fd, EventMask::READABLE, FdOwner::Transport(tag))?;
        ctx.listeners.borrow_mut().insert(
            tag,
            ListenerEntry {
                fd,
                ops,
                pending: VecDeque::new(),
            },
        );
        self.ledger.created(Released::Listener);

        Ok(CountingListener {
            tag,
            fd,
            url,
            ledger: self.ledger.clone(),
            ev_loop: Rc::clone(&ctx.ev_loop),
            listeners: Rc::clone(&ctx.listeners),
            fail_unbind: self.plan.fail_unbind,
        })
    }
}

/// 排入 [`CountingContext::schedule`] 的会话通知。
#[derive(Clone, Debug)]
pub enum Scripted {
    NewSession(NewSession),
    Event(SessionEvent),
    Msg(Msg),
    MsgError(MsgError),
    SendComplete(SendComplete),
}

struct ListenerEntry {
    fd: RawFd,
    ops: SessionOps,
    pending: VecDeque<Scripted>,
}

/// 计数传输上下文，持有事件循环的 `Rc` 以保证循环晚于上下文释放。
pub struct CountingContext {
    ledger: ResourceLedger,
    ev_loop: Rc<ScriptedLoop>,
    listeners: Rc<RefCell<HashMap<u64, ListenerEntry>>>,
    next_tag: Cell<u64>,
}

impl CountingContext {
    /// 为每个已绑定监听器排入一条通知，并使其伪 fd 就绪。
    pub fn schedule(&self, item: Scripted) {
        let injector = self.ev_loop.injector();
        for entry in self.listeners.borrow_mut().values_mut() {
            entry.pending.push_back(item.clone());
            injector.inject(entry.fd, EventMask::READABLE);
        }
    }

    /// 已绑定的监听器数量。
    pub fn bound(&self) -> usize {
        self.listeners.borrow().len()
    }
}

impl TransportContext for CountingContext {
    fn dispatch(&self, readiness: Readiness) -> Result<(), TransportError> {
        let FdOwner::Transport(tag) = readiness.owner else {
            return Ok(());
        };
        let (ops, item) = {
            let mut listeners = self.listeners.borrow_mut();
            let entry = listeners
                .get_mut(&tag)
                .ok_or(TransportError::UnknownListener { tag })?;
            match entry.pending.pop_front() {
                Some(item) => (entry.ops.clone(), item),
                None => return Ok(()),
            }
        };
        match &item {
            Scripted::NewSession(session) => ops.deliver_new_session(session),
            Scripted::Event(event) => ops.deliver_session_event(event),
            Scripted::Msg(msg) => {
                ops.deliver_msg(msg);
            }
            Scripted::MsgError(error) => {
                ops.deliver_msg_error(error);
            }
            Scripted::SendComplete(complete) => {
                ops.deliver_send_complete(complete);
            }
        }
        Ok(())
    }
}

impl Drop for CountingContext {
    fn drop(&mut self) {
        self.ledger.released(Released::Context);
        trace!("counting context released");
    }
}

impl fmt::Debug for CountingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingContext")
            .field("bound", &self.bound())
            .finish_non_exhaustive()
    }
}

/// 计数监听器；释放（无论解绑成功与否）在 `Drop` 中记账。
pub struct CountingListener {
    tag: u64,
    fd: RawFd,
    url: PortalUrl,
    ledger: ResourceLedger,
    ev_loop: Rc<ScriptedLoop>,
    listeners: Rc<RefCell<HashMap<u64, ListenerEntry>>>,
    fail_unbind: bool,
}

impl CountingListener {
    pub fn tag(&self) -> u64 {
        self.tag
    }
}

impl Listener for CountingListener {
    fn url(&self) -> &PortalUrl {
        &self.url
    }

    fn unbind(self) -> Result<(), TransportError> {
        self.ledger.state.lock().unbind_calls += 1;
        if self.fail_unbind {
            return Err(scripted_failure("unbind"));
        }
        Ok(())
    }
}

impl Drop for CountingListener {
    fn drop(&mut self) {
        self.listeners.borrow_mut().remove(&self.tag);
        let _ = self.ev_loop.del(self.fd);
        self.ledger.released(Released::Listener);
    }
}

impl fmt::Debug for CountingListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingListener")
            .field("tag", &self.tag)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

struct Shared {
    ready: Mutex<VecDeque<(RawFd, EventMask)>>,
    wake: Condvar,
    stop: AtomicBool,
}

impl StopSignal for Shared {
    fn raise(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ready = self.ready.lock();
        self.wake.notify_all();
    }
}

/// 注入就绪的句柄，可跨线程使用。
#[derive(Clone)]
pub struct ReadinessInjector {
    shared: Arc<Shared>,
}

impl ReadinessInjector {
    /// 报告 `fd` 就绪；未注册的 fd 在分发时被忽略。
    pub fn inject(&self, fd: RawFd, events: EventMask) {
        self.shared.ready.lock().push_back((fd, events));
        self.shared.wake.notify_all();
    }

    /// 尚未分发的注入数量。
    pub fn pending(&self) -> usize {
        self.shared.ready.lock().len()
    }
}

impl fmt::Debug for ReadinessInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessInjector")
            .field("pending", &self.pending())
            .finish()
    }
}

/// 脚本化事件循环：就绪完全由 [`ReadinessInjector`] 决定。
pub struct ScriptedLoop {
    ledger: ResourceLedger,
    reject_application_fds: bool,
    registrations: RefCell<HashMap<RawFd, (EventMask, FdOwner)>>,
    shared: Arc<Shared>,
}

impl ScriptedLoop {
    fn new(ledger: ResourceLedger, reject_application_fds: bool) -> Self {
        ledger.created(Released::Loop);
        Self {
            ledger,
            reject_application_fds,
            registrations: RefCell::new(HashMap::new()),
            shared: Arc::new(Shared {
                ready: Mutex::new(VecDeque::new()),
                wake: Condvar::new(),
                stop: AtomicBool::new(false),
            }),
        }
    }

    pub fn injector(&self) -> ReadinessInjector {
        ReadinessInjector {
            shared: Arc::clone(&self.shared),
        }
    }

    fn take_stop(&self) -> bool {
        self.shared.stop.swap(false, Ordering::SeqCst)
    }

    /// 等待下一批就绪；`Err` 携带本次运行应返回的原因。
    fn next_batch(
        &self,
        deadline: Option<Instant>,
    ) -> Result<Vec<(RawFd, EventMask)>, LoopExit> {
        let mut ready = self.shared.ready.lock();
        loop {
            if self.take_stop() {
                return Err(LoopExit::Stopped);
            }
            if !ready.is_empty() {
                return Ok(ready.drain(..).collect());
            }
            match deadline {
                None if self.registrations.borrow().is_empty() => return Err(LoopExit::Idle),
                None => self.shared.wake.wait(&mut ready),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Err(LoopExit::TimedOut);
                    }
                    let _ = self.shared.wake.wait_until(&mut ready, deadline);
                }
            }
        }
    }

    fn requeue_front(&self, rest: impl DoubleEndedIterator<Item = (RawFd, EventMask)>) {
        let mut ready = self.shared.ready.lock();
        for item in rest.rev() {
            ready.push_front(item);
        }
    }
}

impl EventLoop for ScriptedLoop {
    fn add(&self, fd: RawFd, interest: EventMask, owner: FdOwner) -> Result<(), TransportError> {
        if fd < 0 {
            return Err(TransportError::InvalidFd { fd });
        }
        if interest.is_empty() {
            return Err(TransportError::InvalidInterest { fd });
        }
        if self.reject_application_fds && matches!(owner, FdOwner::Application(_)) {
            return Err(TransportError::io(
                "scripted.add",
                io::Error::from(io::ErrorKind::PermissionDenied),
            ));
        }
        let mut registrations = self.registrations.borrow_mut();
        if registrations.contains_key(&fd) {
            return Err(TransportError::AlreadyRegistered { fd });
        }
        registrations.insert(fd, (interest, owner));
        Ok(())
    }

    fn del(&self, fd: RawFd) -> Result<(), TransportError> {
        self.registrations
            .borrow_mut()
            .remove(&fd)
            .map(|_| ())
            .ok_or(TransportError::NotRegistered { fd })
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.borrow().contains_key(&fd)
    }

    fn registered(&self) -> usize {
        self.registrations.borrow().len()
    }

    fn run_timeout(
        &self,
        timeout: LoopTimeout,
        dispatch: &mut dyn FnMut(Readiness),
    ) -> Result<LoopExit, TransportError> {
        let deadline = timeout.deadline_from(Instant::now());
        loop {
            let batch = match self.next_batch(deadline) {
                Ok(batch) => batch,
                Err(exit) => return Ok(exit),
            };
            let mut batch = batch.into_iter();
            while let Some((fd, events)) = batch.next() {
                let registration = self.registrations.borrow().get(&fd).copied();
                let Some((interest, owner)) = registration else {
                    continue;
                };
                let events = events & (interest | EventMask::ERROR | EventMask::HANGUP);
                if events.is_empty() {
                    continue;
                }
                dispatch(Readiness { fd, events, owner });
                if self.take_stop() {
                    self.requeue_front(batch);
                    return Ok(LoopExit::Stopped);
                }
            }
            if timeout == LoopTimeout::Poll {
                return Ok(LoopExit::TimedOut);
            }
        }
    }

    fn stop(&self) {
        self.shared.raise();
    }

    fn stopper(&self) -> LoopStopper {
        LoopStopper::new(Arc::clone(&self.shared) as Arc<dyn StopSignal>)
    }
}

impl Drop for ScriptedLoop {
    fn drop(&mut self) {
        self.ledger.released(Released::Loop);
        trace!("scripted loop released");
    }
}

impl fmt::Debug for ScriptedLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedLoop")
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use std::thread;

    #[test]
    fn poll_dispatches_registered_fds_only() {
        let ev_loop = ScriptedLoop::new(ResourceLedger::new(), false);
        ev_loop
            .add(5, EventMask::READABLE, FdOwner::Application(9))
            .expect("add");
        let injector = ev_loop.injector();
        injector.inject(5, EventMask::READABLE | EventMask::WRITABLE);
        injector.inject(6, EventMask::READABLE);

        let mut seen = Vec::new();
        let exit = ev_loop
            .run_timeout(LoopTimeout::Poll, &mut |r| seen.push(r))
            .expect("run");
        assert_eq!(exit, LoopExit::TimedOut);
        assert_eq!(
            seen,
            vec![Readiness {
                fd: 5,
                events: EventMask::READABLE,
                owner: FdOwner::Application(9),
            }]
        );
    }

    #[test]
    fn infinite_without_registrations_is_idle() {
        let ev_loop = ScriptedLoop::new(ResourceLedger::new(), false);
        let exit = ev_loop
            .run_timeout(LoopTimeout::Infinite, &mut |_| {})
            .expect("run");
        assert_eq!(exit, LoopExit::Idle);
    }

    #[test]
    fn stopper_wakes_blocked_run_from_another_thread() {
        let ev_loop = ScriptedLoop::new(ResourceLedger::new(), false);
        ev_loop
            .add(5, EventMask::READABLE, FdOwner::Application(0))
            .expect("add");
        let stopper = ev_loop.stopper();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });
        let exit = ev_loop
            .run_timeout(LoopTimeout::Infinite, &mut |_| {})
            .expect("run");
        waker.join().expect("waker thread");
        assert_eq!(exit, LoopExit::Stopped);
    }

    #[test]
    fn ledger_tracks_loop_lifetime() {
        let ledger = ResourceLedger::new();
        let ev_loop = ScriptedLoop::new(ledger.clone(), false);
        assert_eq!(ledger.live_loops(), 1);
        drop(ev_loop);
        assert_eq!(ledger.live_loops(), 0);
        assert_eq!(ledger.loops_created(), 1);
        assert_eq!(ledger.releases(), vec![Released::Loop]);
    }
}
