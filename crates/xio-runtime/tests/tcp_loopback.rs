//! 原生 epoll + TCP 传输的端到端测试。
#![cfg(target_os = "linux")]

use std::cell::RefCell;
use std::io::Write;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use xio_runtime::{
    Context, EventMask, FdReady, LoopControl, LoopTimeout, NoopSink, RunExit, Server, SessionOps,
    TcpTransport,
};
use xio_transport::{EventLoop, SessionEventKind, SessionId};

fn drive_until(ctx: &Context<TcpTransport>, mut done: impl FnMut() -> bool) {
    for _ in 0..100 {
        if done() {
            return;
        }
        ctx.run_event_loop(Duration::from_millis(20)).expect("run");
    }
    panic!("condition not reached after 100 runs");
}

#[test]
fn session_lifecycle_over_loopback() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let (a, b, c) = (Rc::clone(&log), Rc::clone(&log), Rc::clone(&log));
    let ops = SessionOps::new(
        move |session| a.borrow_mut().push(format!("new {}", session.key.id)),
        move |event| b.borrow_mut().push(format!("{:?}", event.kind)),
    )
    .with_on_msg(move |msg| {
        c.borrow_mut()
            .push(format!("msg {}", String::from_utf8_lossy(&msg.payload)))
    });

    let ctx = Context::builder(TcpTransport::default())
        .event_queue_capacity(64)
        .session_map(true)
        .build()
        .expect("context");
    let server = Server::bind(&ctx, "tcp://127.0.0.1:0", ops).expect("bind");
    let port = server.url().port();
    assert_ne!(port, 0);
    assert_eq!(server.requested_url().port(), 0);

    let mut client = TcpStream::connect(("127.0.0.1", port)).expect("connect");
    drive_until(&ctx, || ctx.transport_context().sessions() == 1);
    ctx.with_session_map(|map| map.insert(SessionId(1), "peer"));

    client.write_all(b"hello").expect("write");
    drive_until(&ctx, || log.borrow().iter().any(|line| line == "msg hello"));
    assert!(ctx.tally().msg >= 1);

    drop(client);
    let closed = format!("{:?}", SessionEventKind::SessionClosed);
    drive_until(&ctx, || log.borrow().iter().any(|line| *line == closed));
    assert_eq!(ctx.transport_context().sessions(), 0);
    assert_eq!(ctx.with_session_map(|map| map.len()), Some(0));
    assert_eq!(log.borrow().first().map(String::as_str), Some("new session#1"));

    drop(server);
    assert_eq!(ctx.event_loop().registered(), 0);
}

#[test]
fn stop_from_session_callback_ends_run() {
    let ctx = Context::new(TcpTransport::default(), 16, NoopSink).expect("context");
    let stop = ctx.stop_handle();
    let ops = SessionOps::new(move |_| stop.stop(), |_| {});
    let server = Server::bind(&ctx, "tcp://127.0.0.1:0", ops).expect("bind");

    let _client = TcpStream::connect(("127.0.0.1", server.url().port())).expect("connect");
    let events = ctx.run_event_loop(Duration::from_secs(10)).expect("run");
    assert_eq!(ctx.last_run_exit(), Some(RunExit::Stopped));
    assert_eq!(events, 1);
}

#[test]
fn application_fd_and_removal_inside_handler() {
    let (rx, mut tx) = UnixStream::pair().expect("pair");
    rx.set_nonblocking(true).expect("nonblocking");
    let fd = rx.as_raw_fd();

    let ctx = Context::new(
        TcpTransport::default(),
        16,
        |control: &dyn LoopControl, ready: &FdReady| {
            assert!(ready.events.is_readable());
            control.del_event_loop_fd(ready.fd).expect("remove self");
        },
    )
    .expect("context");
    ctx.add_event_loop_fd(fd, EventMask::READABLE, 7).expect("add");
    tx.write_all(b"!").expect("write");

    assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 1);
    assert!(!ctx.event_loop().is_registered(fd));
    // 已移除的 fd 不再产生就绪，无限等待因此判定为无事可等。
    assert_eq!(ctx.run_event_loop(LoopTimeout::Infinite).expect("run"), 0);
    assert_eq!(ctx.last_run_exit(), Some(RunExit::Idle));
}

#[test]
fn unsupported_scheme_is_rejected_before_binding() {
    let ctx = Context::new(TcpTransport::default(), 16, NoopSink).expect("context");
    let err = Server::bind(&ctx, "rdma://127.0.0.1:0", SessionOps::new(|_| {}, |_| {}))
        .expect_err("scheme");
    assert_eq!(err.code(), "xio.server.bind_failed");
    assert_eq!(ctx.transport_context().sessions(), 0);
}
