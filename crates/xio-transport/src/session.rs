//! 会话事件负载与会话回调表。
//!
//! # 模块定位（Why）
//! - 传输库通过一张固定的回调表（`on_new_session`、`on_session_event`、`on_msg`、
//!   `on_msg_error`、`on_msg_send_complete`）向监听方交付会话事件；本模块以
//!   [`SessionOps`] 建模这张表，并定义各回调携带的负载类型。
//!
//! # 契约（What）
//! - 前两个槽位必填；后三个槽位各自可选，未设置的槽位表示该类事件**永远不会**交付给应用，
//!   这不是错误；
//! - 负载按传输层提供的标识原样转发，本模块不解释消息内容。

use core::fmt;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::Bytes;

/// 传输层分配的会话标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// 新会话的键：会话标识与其 URI。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub id: SessionId,
    pub uri: String,
}

/// `on_new_session` 负载。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSession {
    pub key: SessionKey,
    /// 对端地址；传输层无法提供时为 `None`。
    pub src_addr: Option<SocketAddr>,
}

/// 会话事件类别。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    SessionReject,
    SessionTeardown,
    SessionClosed,
    SessionError,
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionDisconnected,
    ConnectionRefused,
    ConnectionError,
    PortalClosed,
}

impl SessionEventKind {
    /// 该事件之后会话不再存在。
    pub fn ends_session(self) -> bool {
        matches!(
            self,
            SessionEventKind::SessionReject
                | SessionEventKind::SessionTeardown
                | SessionEventKind::SessionClosed
        )
    }
}

/// 事件原因码。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventReason {
    Success,
    Rejected,
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    Other(i32),
}

impl EventReason {
    /// 将 IO 错误归类为原因码，无法归类时保留原始 errno。
    pub fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => EventReason::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => EventReason::ConnectionReset,
            io::ErrorKind::TimedOut => EventReason::TimedOut,
            _ => EventReason::Other(error.raw_os_error().unwrap_or(-1)),
        }
    }
}

/// `on_session_event` 负载。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub kind: SessionEventKind,
    pub reason: EventReason,
}

/// `on_msg` 负载。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msg {
    pub session: SessionId,
    pub payload: Bytes,
}

/// `on_msg_error` 负载。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MsgError {
    pub session: SessionId,
    pub reason: EventReason,
}

/// `on_msg_send_complete` 负载。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendComplete {
    pub session: SessionId,
    pub len: usize,
}

/// 交付前后观察到的一条会话通知，供 [`SessionOps::intercept`] 使用。
#[derive(Clone, Copy, Debug)]
pub enum SessionNotice<'a> {
    NewSession(&'a NewSession),
    Event(&'a SessionEvent),
    Msg(&'a Msg),
    MsgError(&'a MsgError),
    SendComplete(&'a SendComplete),
}

type Callback<T> = Rc<dyn Fn(&T)>;

/// 会话回调表。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 以强类型闭包取代传输库的函数指针表，保留“槽位可空”的语义；
/// - 提供 [`SessionOps::intercept`]，让运行时在不改变槽位集合的前提下为每次交付插入记账逻辑。
///
/// ## 契约（What）
/// - `new`：两个必填回调；
/// - `with_on_msg`/`with_on_msg_error`/`with_on_msg_send_complete`：填充可选槽位；
/// - `deliver_*`：传输实现调用的交付入口，返回值表示是否真正交付（槽位为空时返回 `false`）。
///
/// ## 风险提示（Trade-offs）
/// - 回调使用 `Rc`，回调表只能在创建它的线程上使用，与单线程事件循环的模型一致。
#[derive(Clone)]
pub struct SessionOps {
    on_new_session: Callback<NewSession>,
    on_session_event: Callback<SessionEvent>,
    on_msg: Option<Callback<Msg>>,
    on_msg_error: Option<Callback<MsgError>>,
    on_msg_send_complete: Option<Callback<SendComplete>>,
}

impl SessionOps {
    pub fn new<N, E>(on_new_session: N, on_session_event: E) -> Self
    where
        N: Fn(&NewSession) + 'static,
        E: Fn(&SessionEvent) + 'static,
    {
        Self {
            on_new_session: Rc::new(on_new_session),
            on_session_event: Rc::new(on_session_event),
            on_msg: None,
            on_msg_error: None,
            on_msg_send_complete: None,
        }
    }

    pub fn with_on_msg(mut self, on_msg: impl Fn(&Msg) + 'static) -> Self {
        self.on_msg = Some(Rc::new(on_msg));
        self
    }

    pub fn with_on_msg_error(mut self, on_msg_error: impl Fn(&MsgError) + 'static) -> Self {
        self.on_msg_error = Some(Rc::new(on_msg_error));
        self
    }

    pub fn with_on_msg_send_complete(
        mut self,
        on_msg_send_complete: impl Fn(&SendComplete) + 'static,
    ) -> Self {
        self.on_msg_send_complete = Some(Rc::new(on_msg_send_complete));
        self
    }

    pub fn has_on_msg(&self) -> bool {
        self.on_msg.is_some()
    }

    pub fn has_on_msg_error(&self) -> bool {
        self.on_msg_error.is_some()
    }

    pub fn has_on_msg_send_complete(&self) -> bool {
        self.on_msg_send_complete.is_some()
    }

    pub fn deliver_new_session(&self, session: &NewSession) {
        (self.on_new_session)(session);
    }

    pub fn deliver_session_event(&self, event: &SessionEvent) {
        (self.on_session_event)(event);
    }

    pub fn deliver_msg(&self, msg: &Msg) -> bool {
        deliver(&self.on_msg, msg)
    }

    pub fn deliver_msg_error(&self, error: &MsgError) -> bool {
        deliver(&self.on_msg_error, error)
    }

    pub fn deliver_send_complete(&self, complete: &SendComplete) -> bool {
        deliver(&self.on_msg_send_complete, complete)
    }

    /// 返回新的回调表：每个已设置的槽位在交付前调用 `before`、交付后调用 `after`，
    /// 未设置的槽位保持为空。
    ///
    /// - **契约 (What)**：`before`、原回调与 `after` 各执行一次，顺序固定；
    ///   负载以引用传递，原回调收到的是未经修改的同一对象；
    /// - **用法 (How)**：`before` 适合记账，`after` 适合清理原回调仍可能读取的状态。
    pub fn intercept(
        self,
        before: impl Fn(SessionNotice<'_>) + 'static,
        after: impl Fn(SessionNotice<'_>) + 'static,
    ) -> SessionOps {
        let hooks = Rc::new(Hooks {
            before: Box::new(before),
            after: Box::new(after),
        });
        let SessionOps {
            on_new_session,
            on_session_event,
            on_msg,
            on_msg_error,
            on_msg_send_complete,
        } = self;

        let new_session_hooks = Rc::clone(&hooks);
        let event_hooks = Rc::clone(&hooks);
        SessionOps {
            on_new_session: Rc::new(move |session: &NewSession| {
                new_session_hooks.around(SessionNotice::NewSession(session), || {
                    on_new_session(session)
                });
            }),
            on_session_event: Rc::new(move |event: &SessionEvent| {
                event_hooks.around(SessionNotice::Event(event), || on_session_event(event));
            }),
            on_msg: on_msg.map(|inner| {
                let hooks = Rc::clone(&hooks);
                Rc::new(move |msg: &Msg| {
                    hooks.around(SessionNotice::Msg(msg), || inner(msg));
                }) as Callback<Msg>
            }),
            on_msg_error: on_msg_error.map(|inner| {
                let hooks = Rc::clone(&hooks);
                Rc::new(move |error: &MsgError| {
                    hooks.around(SessionNotice::MsgError(error), || inner(error));
                }) as Callback<MsgError>
            }),
            on_msg_send_complete: on_msg_send_complete.map(|inner| {
                let hooks = Rc::clone(&hooks);
                Rc::new(move |complete: &SendComplete| {
                    hooks.around(SessionNotice::SendComplete(complete), || inner(complete));
                }) as Callback<SendComplete>
            }),
        }
    }
}

struct Hooks {
    before: Box<dyn Fn(SessionNotice<'_>)>,
    after: Box<dyn Fn(SessionNotice<'_>)>,
}

impl Hooks {
    fn around(&self, notice: SessionNotice<'_>, deliver: impl FnOnce()) {
        (self.before)(notice);
        deliver();
        (self.after)(notice);
    }
}

fn deliver<T>(slot: &Option<Callback<T>>, payload: &T) -> bool {
    match slot {
        Some(callback) => {
            callback(payload);
            true
        }
        None => false,
    }
}

impl fmt::Debug for SessionOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOps")
            .field("on_msg", &self.has_on_msg())
            .field("on_msg_error", &self.has_on_msg_error())
            .field("on_msg_send_complete", &self.has_on_msg_send_complete())
            .finish_non_exhaustive()
    }
}
