//! 原生 TCP 传输（Linux）。
//!
//! # 模块定位（Why）
//! - 在没有 RDMA 硬件的环境下提供一个完整的 [`Transport`] 实现，使 Context/Server 可以端到端运行；
//! - 不定义任何线上协议：每次读取到的字节块原样作为一条 [`Msg`] 交付。
//!
//! # 执行逻辑（How）
//! - `bind`：`socket2` 创建监听套接字（`SO_REUSEADDR`、非阻塞、可配置 backlog），
//!   以 [`FdOwner::Transport`] 注册到事件循环；
//! - 监听套接字就绪 → 循环 `accept` 直到 `WouldBlock`，每个连接分配 [`SessionId`] 并注册读事件，
//!   随后交付 `on_new_session`；
//! - 会话就绪 → 读取一次：数据交付 `on_msg`，EOF 交付 `SessionClosed`，读错误依次交付
//!   `on_msg_error`、`ConnectionError` 与 `SessionTeardown`；注销失败不会吞掉这些通知，
//!   错误在通知交付后返回；
//! - 回调执行期间不持有任何内部借用，回调内可以安全地再次进入传输上下文。

use core::fmt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, trace};
use xio_transport::{
    EventLoop, EventMask, EventReason, FdOwner, Listener, Msg, MsgError, NewSession, PortalUrl,
    Readiness, SessionEvent, SessionEventKind, SessionId, SessionKey, SessionOps, Transport,
    TransportContext, TransportError,
};

use crate::epoll::EpollLoop;

/// 默认监听 backlog。
pub const DEFAULT_BACKLOG: i32 = 128;
const READ_CHUNK: usize = 64 * 1024;

/// 原生 TCP 传输，协议名 `tcp`。
#[derive(Clone, Copy, Debug)]
pub struct TcpTransport {
    backlog: i32,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl TcpTransport {
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn backlog(&self) -> i32 {
        self.backlog
    }
}

fn listen_socket(addr: SocketAddr, backlog: i32) -> Result<StdTcpListener, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|err| TransportError::io("tcp.socket", err))?;
    socket
        .set_reuse_address(true)
        .map_err(|err| TransportError::io("tcp.configure", err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| TransportError::io("tcp.configure", err))?;
    socket
        .bind(&addr.into())
        .map_err(|err| TransportError::io("tcp.bind", err))?;
    socket
        .listen(backlog)
        .map_err(|err| TransportError::io("tcp.listen", err))?;
    Ok(socket.into())
}

impl Transport for TcpTransport {
    type Loop = EpollLoop;
    type Context = TcpContext;
    type Listener = TcpListener;

    fn scheme(&self) -> &'static str {
        "tcp"
    }

    fn loop_init(&self) -> Result<EpollLoop, TransportError> {
        EpollLoop::new()
    }

    fn ctx_open(&self, ev_loop: &Rc<EpollLoop>) -> Result<TcpContext, TransportError> {
        Ok(TcpContext {
            ev_loop: Rc::clone(ev_loop),
            state: Rc::new(RefCell::new(TcpState::default())),
        })
    }

    fn bind(
        &self,
        ctx: &TcpContext,
        url: &PortalUrl,
        ops: SessionOps,
    ) -> Result<TcpListener, TransportError> {
        let mut last_err = None;
        let mut bound = None;
        for addr in url.socket_addrs()? {
            match listen_socket(addr, self.backlog) {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let socket = match (bound, last_err) {
            (Some(socket), _) => socket,
            (None, Some(err)) => return Err(err),
            (None, None) => {
                return Err(TransportError::InvalidUrl {
                    url: url.to_string(),
                    reason: "host resolves to no address",
                });
            }
        };
        let local = socket
            .local_addr()
            .map_err(|err| TransportError::io("tcp.local_addr", err))?;
        let url = url.with_port(local.port());

        let fd = socket.as_raw_fd();
        let tag = ctx.state.borrow_mut().allocate_tag();
        ctx.ev_loop
            .add(fd, EventMask::READABLE, FdOwner::Transport(tag))?;
        ctx.state.borrow_mut().entries.insert(
            tag,
            Entry::Listener(ListenerEntry {
                socket,
                url: url.clone(),
                ops,
                sessions: Vec::new(),
            }),
        );
        debug!(%url, fd, tag, "tcp listener bound");

        Ok(TcpListener {
            tag,
            url,
            ev_loop: Rc::clone(&ctx.ev_loop),
            state: Rc::clone(&ctx.state),
            released: false,
        })
    }
}

struct ListenerEntry {
    socket: StdTcpListener,
    url: PortalUrl,
    ops: SessionOps,
    sessions: Vec<u64>,
}

struct SessionEntry {
    stream: TcpStream,
    id: SessionId,
    listener: u64,
}

enum Entry {
    Listener(ListenerEntry),
    Session(SessionEntry),
}

#[derive(Default)]
struct TcpState {
    entries: HashMap<u64, Entry>,
    next_tag: u64,
    next_session: u64,
}

impl TcpState {
    fn allocate_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }

    fn ops_of(&self, listener: u64) -> Option<SessionOps> {
        match self.entries.get(&listener) {
            Some(Entry::Listener(entry)) => Some(entry.ops.clone()),
            _ => None,
        }
    }
}

/// 绑定到 [`EpollLoop`] 的 TCP 传输上下文。
pub struct TcpContext {
    ev_loop: Rc<EpollLoop>,
    state: Rc<RefCell<TcpState>>,
}

impl TcpContext {
    /// 当前存活的会话数。
    pub fn sessions(&self) -> usize {
        self.state
            .borrow()
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Session(_)))
            .count()
    }

    fn accept_all(&self, tag: u64) -> Result<(), TransportError> {
        loop {
            let accepted = {
                let state = self.state.borrow();
                match state.entries.get(&tag) {
                    Some(Entry::Listener(entry)) => entry.socket.accept(),
                    _ => return Ok(()),
                }
            };
            match accepted {
                Ok((stream, peer)) => self.admit(tag, stream, peer)?,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(TransportError::io("tcp.accept", err)),
            }
        }
    }

    fn admit(&self, listener: u64, stream: TcpStream, peer: SocketAddr) -> Result<(), TransportError> {
        stream
            .set_nonblocking(true)
            .map_err(|err| TransportError::io("tcp.configure", err))?;
        let fd = stream.as_raw_fd();
        let (tag, id, uri, ops) = {
            let mut state = self.state.borrow_mut();
            let tag = state.allocate_tag();
            state.next_session += 1;
            let id = SessionId(state.next_session);
            let Some(Entry::Listener(entry)) = state.entries.get_mut(&listener) else {
                return Ok(());
            };
            entry.sessions.push(tag);
            (tag, id, entry.url.to_string(), entry.ops.clone())
        };
        if let Err(err) = self
            .ev_loop
            .add(fd, EventMask::READABLE, FdOwner::Transport(tag))
        {
            self.forget(listener, tag);
            return Err(err);
        }
        self.state.borrow_mut().entries.insert(
            tag,
            Entry::Session(SessionEntry {
                stream,
                id,
                listener,
            }),
        );
        trace!(%id, %peer, fd, "tcp session accepted");
        ops.deliver_new_session(&NewSession {
            key: SessionKey { id, uri },
            src_addr: Some(peer),
        });
        Ok(())
    }

    fn forget(&self, listener: u64, session: u64) {
        if let Some(Entry::Listener(entry)) = self.state.borrow_mut().entries.get_mut(&listener) {
            entry.sessions.retain(|tag| *tag != session);
        }
    }

    fn read_session(&self, tag: u64) -> Result<(), TransportError> {
        let mut buf = vec![0u8; READ_CHUNK];
        let (read, id, listener) = {
            let state = self.state.borrow();
            let Some(Entry::Session(entry)) = state.entries.get(&tag) else {
                return Ok(());
            };
            ((&entry.stream).read(&mut buf), entry.id, entry.listener)
        };
        let Some(ops) = self.state.borrow().ops_of(listener) else {
            return Ok(());
        };
        match read {
            Ok(0) => {
                let torn_down = self.teardown(tag);
                ops.deliver_session_event(&SessionEvent {
                    session: id,
                    kind: SessionEventKind::SessionClosed,
                    reason: EventReason::Success,
                });
                return torn_down;
            }
            Ok(len) => {
                buf.truncate(len);
                ops.deliver_msg(&Msg {
                    session: id,
                    payload: Bytes::from(buf),
                });
            }
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(err) => {
                let reason = EventReason::from_io(&err);
                trace!(%id, error = %err, "tcp session read failed");
                let torn_down = self.teardown(tag);
                ops.deliver_msg_error(&MsgError {
                    session: id,
                    reason,
                });
                ops.deliver_session_event(&SessionEvent {
                    session: id,
                    kind: SessionEventKind::ConnectionError,
                    reason,
                });
                ops.deliver_session_event(&SessionEvent {
                    session: id,
                    kind: SessionEventKind::SessionTeardown,
                    reason,
                });
                return torn_down;
            }
        }
        Ok(())
    }

    /// 注销并关闭会话连接。
    ///
    /// 会话条目总会被移除；注销失败只影响返回值，调用方仍须交付会话结束通知。
    fn teardown(&self, tag: u64) -> Result<(), TransportError> {
        let Some(Entry::Session(entry)) = self.state.borrow_mut().entries.remove(&tag) else {
            return Ok(());
        };
        self.forget(entry.listener, tag);
        match self.ev_loop.del(entry.stream.as_raw_fd()) {
            Ok(()) | Err(TransportError::NotRegistered { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl TransportContext for TcpContext {
    fn dispatch(&self, readiness: Readiness) -> Result<(), TransportError> {
        let FdOwner::Transport(tag) = readiness.owner else {
            return Ok(());
        };
        let is_listener = match self.state.borrow().entries.get(&tag) {
            Some(Entry::Listener(_)) => true,
            Some(Entry::Session(_)) => false,
            None => return Err(TransportError::UnknownListener { tag }),
        };
        if is_listener {
            self.accept_all(tag)
        } else {
            self.read_session(tag)
        }
    }
}

impl fmt::Debug for TcpContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpContext")
            .field("sessions", &self.sessions())
            .finish_non_exhaustive()
    }
}

/// 已绑定的 TCP 监听器。
pub struct TcpListener {
    tag: u64,
    url: PortalUrl,
    ev_loop: Rc<EpollLoop>,
    state: Rc<RefCell<TcpState>>,
    released: bool,
}

impl TcpListener {
    /// 注销并关闭监听套接字及其全部会话，返回遇到的第一个注销错误。
    fn release(&mut self) -> Result<(), TransportError> {
        self.released = true;
        let Some(Entry::Listener(listener)) = self.state.borrow_mut().entries.remove(&self.tag)
        else {
            return Err(TransportError::UnknownListener { tag: self.tag });
        };

        let mut first_err = None;
        let mut deregister = |fd: RawFd| match self.ev_loop.del(fd) {
            Ok(()) | Err(TransportError::NotRegistered { .. }) => {}
            Err(err) => {
                first_err.get_or_insert(err);
            }
        };
        deregister(listener.socket.as_raw_fd());
        let closed = listener.sessions.len();
        for session in &listener.sessions {
            let entry = self.state.borrow_mut().entries.remove(session);
            if let Some(Entry::Session(entry)) = entry {
                deregister(entry.stream.as_raw_fd());
            }
        }
        debug!(url = %self.url, sessions = closed, "tcp listener released");
        first_err.map_or(Ok(()), Err)
    }
}

impl Listener for TcpListener {
    fn url(&self) -> &PortalUrl {
        &self.url
    }

    fn unbind(mut self) -> Result<(), TransportError> {
        self.release()
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.release() {
            error!(
                url = %self.url,
                tag = self.tag,
                error = %err,
                "tcp listener release failed during drop"
            );
        }
    }
}

impl fmt::Debug for TcpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpListener")
            .field("url", &self.url)
            .field("tag", &self.tag)
            .finish_non_exhaustive()
    }
}
