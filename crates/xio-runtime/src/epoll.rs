//! 基于 `nix` epoll 的原生事件循环（Linux）。
//!
//! # 模块定位（Why）
//! - 为运行时提供一个不依赖外部传输库的 [`EventLoop`] 实现，使 Context 可以直接驱动
//!   应用 fd 与原生 TCP 传输；
//! - 停止请求可能来自其他线程，因此循环内部注册一对非阻塞 `UnixStream` 作为唤醒通道。
//!
//! # 契约（What）
//! - 水平触发；fd 编号即 epoll token，唤醒通道使用保留 token [`WAKE_TOKEN`]；
//! - 上报的事件按注册兴趣过滤，`ERROR`/`HANGUP` 始终保留；
//! - 同一批次中已被移除的 fd 不再分发；`EINTR` 自动重试；超时向上取整到毫秒。

use core::fmt;
use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use tracing::{trace, warn};
use xio_transport::{
    EventLoop, EventMask, FdOwner, LoopExit, LoopStopper, LoopTimeout, Readiness, StopSignal,
    TransportError,
};

/// 唤醒通道的 epoll token；合法 fd 均为非负 `i32`，不会与之冲突。
const WAKE_TOKEN: u64 = u64::MAX;
/// 单次 `epoll_wait` 最多取回的事件数。
const MAX_EVENTS: usize = 256;

/// 将 `Errno` 转换为 `std::io::Error`。
fn nix_err_to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

struct StopState {
    requested: AtomicBool,
    wake_tx: UnixStream,
}

impl StopState {
    fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl StopSignal for StopState {
    fn raise(&self) {
        self.requested.store(true, Ordering::SeqCst);
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => {}
            // 通道已满说明已有未消费的唤醒。
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => warn!(error = %err, "failed to wake event loop"),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Registration {
    interest: EventMask,
    owner: FdOwner,
}

/// 原生 epoll 事件循环。
pub struct EpollLoop {
    epoll: Epoll,
    wake_rx: UnixStream,
    stop: Arc<StopState>,
    registrations: RefCell<HashMap<RawFd, Registration>>,
}

impl EpollLoop {
    pub fn new() -> Result<Self, TransportError> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)
            .map_err(|errno| TransportError::io("epoll_create", nix_err_to_io(errno)))?;
        let (wake_rx, wake_tx) =
            UnixStream::pair().map_err(|err| TransportError::io("wake_pair", err))?;
        wake_rx
            .set_nonblocking(true)
            .map_err(|err| TransportError::io("wake_pair", err))?;
        wake_tx
            .set_nonblocking(true)
            .map_err(|err| TransportError::io("wake_pair", err))?;
        epoll
            .add(&wake_rx, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(|errno| TransportError::io("epoll_ctl.add", nix_err_to_io(errno)))?;

        Ok(Self {
            epoll,
            wake_rx,
            stop: Arc::new(StopState {
                requested: AtomicBool::new(false),
                wake_tx,
            }),
            registrations: RefCell::new(HashMap::new()),
        })
    }

    fn drain_wake_channel(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }
}

fn interest_to_flags(interest: EventMask) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if interest.is_readable() {
        flags |= EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP;
    }
    if interest.is_writable() {
        flags |= EpollFlags::EPOLLOUT;
    }
    flags
}

fn flags_to_mask(flags: EpollFlags) -> EventMask {
    let mut mask = EventMask::empty();
    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLPRI) {
        mask |= EventMask::READABLE;
    }
    if flags.contains(EpollFlags::EPOLLOUT) {
        mask |= EventMask::WRITABLE;
    }
    if flags.contains(EpollFlags::EPOLLERR) {
        mask |= EventMask::ERROR;
    }
    if flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP) {
        mask |= EventMask::HANGUP;
    }
    mask
}

/// 剩余等待时间，向上取整到毫秒；`None` 表示无限等待。
fn wait_timeout(deadline: Option<Instant>) -> Result<EpollTimeout, TransportError> {
    let Some(deadline) = deadline else {
        return Ok(EpollTimeout::NONE);
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    let millis = remaining.as_micros().div_ceil(1_000).min(i32::MAX as u128) as i32;
    EpollTimeout::try_from(millis).map_err(|_| {
        TransportError::io(
            "epoll_wait",
            io::Error::new(ErrorKind::InvalidInput, "epoll timeout out of range"),
        )
    })
}

fn borrow_fd<'a>(fd: RawFd) -> BorrowedFd<'a> {
    // SAFETY: `fd` 非负，且只在本次 `epoll_ctl` 调用期间使用；描述符是否仍然打开由内核校验，
    // 已关闭的 fd 只会得到 `EBADF`。
    unsafe { BorrowedFd::borrow_raw(fd) }
}

impl EventLoop for EpollLoop {
    fn add(&self, fd: RawFd, interest: EventMask, owner: FdOwner) -> Result<(), TransportError> {
        if fd < 0 {
            return Err(TransportError::InvalidFd { fd });
        }
        if interest.is_empty() {
            return Err(TransportError::InvalidInterest { fd });
        }
        if self.registrations.borrow().contains_key(&fd) {
            return Err(TransportError::AlreadyRegistered { fd });
        }
        let event = EpollEvent::new(interest_to_flags(interest), fd as u64);
        match self.epoll.add(borrow_fd(fd), event) {
            Ok(()) => {}
            Err(Errno::EBADF) => return Err(TransportError::InvalidFd { fd }),
            Err(Errno::EEXIST) => return Err(TransportError::AlreadyRegistered { fd }),
            Err(errno) => {
                return Err(TransportError::io("epoll_ctl.add", nix_err_to_io(errno)));
            }
        }
        self.registrations
            .borrow_mut()
            .insert(fd, Registration { interest, owner });
        trace!(fd, ?interest, ?owner, "epoll registration added");
        Ok(())
    }

    fn del(&self, fd: RawFd) -> Result<(), TransportError> {
        if self.registrations.borrow_mut().remove(&fd).is_none() {
            return Err(TransportError::NotRegistered { fd });
        }
        match self.epoll.delete(borrow_fd(fd)) {
            // 应用可能先关闭 fd 再移除，内核此时已自动清理该注册。
            Ok(()) | Err(Errno::EBADF) | Err(Errno::ENOENT) => {
                trace!(fd, "epoll registration removed");
                Ok(())
            }
            Err(errno) => Err(TransportError::io("epoll_ctl.del", nix_err_to_io(errno))),
        }
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
        if self.stop.take() {
            return Ok(LoopExit::Stopped);
        }
        let deadline = timeout.deadline_from(Instant::now());
        let mut buffer = vec![EpollEvent::empty(); MAX_EVENTS];

        loop {
            if deadline.is_none() && self.registrations.borrow().is_empty() {
                return Ok(LoopExit::Idle);
            }
            let ready = match self.epoll.wait(&mut buffer, wait_timeout(deadline)?) {
                Ok(ready) => ready,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(TransportError::io("epoll_wait", nix_err_to_io(errno)));
                }
            };

            let batch: Vec<(u64, EpollFlags)> = buffer[..ready]
                .iter()
                .map(|event| (event.data(), event.events()))
                .collect();
            for (token, flags) in batch {
                if token == WAKE_TOKEN {
                    self.drain_wake_channel();
                    continue;
                }
                let fd = token as RawFd;
                let registration = self.registrations.borrow().get(&fd).copied();
                let Some(registration) = registration else {
                    continue;
                };
                let events = flags_to_mask(flags)
                    & (registration.interest | EventMask::ERROR | EventMask::HANGUP);
                if events.is_empty() {
                    continue;
                }
                dispatch(Readiness {
                    fd,
                    events,
                    owner: registration.owner,
                });
                if self.stop.take() {
                    return Ok(LoopExit::Stopped);
                }
            }

            if self.stop.take() {
                return Ok(LoopExit::Stopped);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(LoopExit::TimedOut);
                }
            }
        }
    }

    fn stop(&self) {
        self.stop.raise();
    }

    fn stopper(&self) -> LoopStopper {
        LoopStopper::new(Arc::clone(&self.stop) as Arc<dyn StopSignal>)
    }
}

impl fmt::Debug for EpollLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpollLoop")
            .field("registered", &self.registered())
            .finish_non_exhaustive()
    }
}
