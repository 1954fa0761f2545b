//! Context 生命周期集成测试。
//!
//! # 教案级注释概览
//!
//! - **核心目标 (Why)**：在计数传输上验证构建、运行、停止与释放的端到端契约，
//!   包括构建失败的逆序回滚、每次运行开始时的计数清零以及跨线程停止。
//! - **前置条件 (What)**：`ScriptedLoop` 的就绪完全由测试注入，因此 fd 编号（如 5）无需真实存在。

use std::cell::RefCell;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use tracing_test::traced_test;
use xio_runtime::testing::{CountingTransport, FailurePlan, Released};
use xio_runtime::{
    Context, ContextConfig, EventMask, FdReady, LoopControl, LoopEvent, LoopTimeout, NoopSink,
    RunExit, XioError,
};
use xio_transport::EventLoop;

#[test]
fn scenario_idle_run_times_out_then_releases_in_order() {
    let transport = CountingTransport::new();
    let ledger = transport.ledger();
    let ctx = Context::new(transport, 16, NoopSink).expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("register fd 5");

    let started = Instant::now();
    let events = ctx
        .run_event_loop(Duration::from_secs(1))
        .expect("run completes");
    let elapsed = started.elapsed();

    assert_eq!(events, 0);
    assert_eq!(ctx.last_run_exit(), Some(RunExit::TimedOut));
    assert!(elapsed >= Duration::from_secs(1), "returned after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "returned after {elapsed:?}");

    drop(ctx);
    assert_eq!(ledger.releases(), vec![Released::Context, Released::Loop]);
}

#[test]
fn every_construction_failure_rolls_back_completely() {
    let plans = [
        FailurePlan {
            fail_loop_init: true,
            ..FailurePlan::default()
        },
        FailurePlan {
            fail_ctx_open: true,
            ..FailurePlan::default()
        },
    ];
    for plan in plans {
        let transport = CountingTransport::new().with_plan(plan.clone());
        let ledger = transport.ledger();
        let err = Context::new(transport, 16, NoopSink).expect_err("construction fails");
        assert!(
            matches!(err, XioError::LoopInit { .. } | XioError::ContextOpen { .. }),
            "{plan:?}: {err}"
        );
        assert_eq!(ledger.live_loops(), 0, "{plan:?}");
        assert_eq!(ledger.live_contexts(), 0, "{plan:?}");
        assert_eq!(
            ledger.releases().len(),
            ledger.loops_created() + ledger.contexts_created(),
            "{plan:?}: every created resource is released exactly once"
        );
    }
}

#[test]
fn from_config_applies_capacity_and_session_map() {
    let config = ContextConfig {
        event_queue_capacity: 2,
        run_timeout_micros: 0,
        session_map: true,
    };
    let ctx = Context::from_config(CountingTransport::new(), &config, NoopSink).expect("context");
    assert!(ctx.has_session_map());
    assert_eq!(ctx.with_event_queue(|queue| queue.capacity()), 2);

    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
    let injector = ctx.event_loop().injector();
    for _ in 0..3 {
        injector.inject(5, EventMask::READABLE);
    }
    assert_eq!(ctx.run_event_loop(config.run_timeout()).expect("run"), 3);
    assert_eq!(ctx.with_event_queue(|queue| queue.overflowed()), 1);
}

#[test]
fn host_reads_cycle_events_after_run() {
    let ctx = Context::new(CountingTransport::new(), 8, NoopSink).expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 50).expect("add 5");
    ctx.add_event_loop_fd(6, EventMask::WRITABLE, 60).expect("add 6");
    let injector = ctx.event_loop().injector();
    injector.inject(6, EventMask::WRITABLE);
    injector.inject(5, EventMask::READABLE | EventMask::HANGUP);

    assert_eq!(ctx.run_event_loop(LoopTimeout::Poll).expect("run"), 2);
    let cookies: Vec<u64> = ctx.with_event_queue(|queue| {
        let mut cookies = Vec::new();
        while let Some(LoopEvent::FdReady(ready)) = queue.next_event() {
            cookies.push(ready.cookie);
        }
        cookies
    });
    assert_eq!(cookies, vec![60, 50]);
    assert_eq!(ctx.with_event_queue(|queue| queue.pending()), 0);
}

#[test]
fn stop_handle_wakes_an_infinite_run_from_another_thread() {
    let ctx = Context::new(CountingTransport::new(), 8, NoopSink).expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
    let handle = ctx.stop_handle();
    assert_eq!(handle.context_id(), ctx.id());

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.stop();
    });
    let events = ctx.run_event_loop(LoopTimeout::Infinite).expect("run");
    stopper.join().expect("stopper thread");

    assert_eq!(events, 0);
    assert_eq!(ctx.last_run_exit(), Some(RunExit::Stopped));
}

#[test]
fn infinite_run_without_fds_is_idle() {
    let ctx = Context::new(CountingTransport::new(), 8, NoopSink).expect("context");
    assert_eq!(ctx.run_event_loop(LoopTimeout::Infinite).expect("run"), 0);
    assert_eq!(ctx.last_run_exit(), Some(RunExit::Idle));
}

#[test]
fn loop_rejection_surfaces_as_register_error() {
    let transport = CountingTransport::new().with_plan(FailurePlan {
        reject_application_fds: true,
        ..FailurePlan::default()
    });
    let ctx = Context::new(transport, 8, NoopSink).expect("context");
    let err = ctx
        .add_event_loop_fd(5, EventMask::READABLE, 0)
        .expect_err("rejected");
    assert_eq!(err.code(), "xio.context.register_failed");
    assert!(!ctx.event_loop().is_registered(5));
}

#[test]
fn handler_sees_its_own_context() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink_seen = Rc::clone(&seen);
    let ctx = Context::new(
        CountingTransport::new(),
        8,
        move |control: &dyn LoopControl, ready: &FdReady| {
            assert_eq!(control.context_id(), ready.context);
            sink_seen.borrow_mut().push(ready.fd);
        },
    )
    .expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
    ctx.event_loop().injector().inject(5, EventMask::READABLE);
    ctx.run_event_loop(LoopTimeout::Poll).expect("run");
    assert_eq!(*seen.borrow(), vec![5]);
}

#[test]
fn duration_max_runs_until_stopped() {
    let ctx = Context::new(
        CountingTransport::new(),
        8,
        |control: &dyn LoopControl, _: &FdReady| control.stop_event_loop(),
    )
    .expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
    ctx.event_loop().injector().inject(5, EventMask::READABLE);

    assert_eq!(ctx.run_event_loop(Duration::MAX).expect("run"), 1);
    assert_eq!(ctx.last_run_exit(), Some(RunExit::Stopped));
}

#[test]
#[traced_test]
fn drop_releases_every_owned_resource_in_reverse_order() {
    let transport = CountingTransport::new();
    let ledger = transport.ledger();
    let ctx = Context::builder(transport)
        .event_queue_capacity(16)
        .session_map(true)
        .build()
        .expect("context");
    ctx.add_event_loop_fd(5, EventMask::READABLE, 0).expect("add");
    ctx.event_loop().injector().inject(5, EventMask::READABLE);
    ctx.run_event_loop(LoopTimeout::Poll).expect("run");

    drop(ctx);
    assert_eq!(ledger.releases(), vec![Released::Context, Released::Loop]);
    logs_assert(|lines: &[&str]| {
        let order = [
            "session map released",
            "event queue released",
            "event aggregator released",
            "counting context released",
            "scripted loop released",
        ];
        let mut positions = Vec::new();
        for needle in order {
            let hits: Vec<usize> = lines
                .iter()
                .enumerate()
                .filter(|(_, line)| line.contains(needle))
                .map(|(index, _)| index)
                .collect();
            match hits.as_slice() {
                [index] => positions.push(*index),
                _ => return Err(format!("`{needle}` logged {} times", hits.len())),
            }
        }
        if positions.windows(2).all(|pair| pair[0] < pair[1]) {
            Ok(())
        } else {
            Err(format!("release order by line: {positions:?}"))
        }
    });
}
