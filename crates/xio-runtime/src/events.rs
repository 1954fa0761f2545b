use tracing::trace;
use xio_transport::{Msg, MsgError, NewSession, SendComplete, SessionEvent};

use crate::event_queue::EventQueue;
use crate::sink::FdReady;

/// 一个运行周期内记录的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopEvent {
    FdReady(FdReady),
    NewSession(NewSession),
    Session(SessionEvent),
    Msg(Msg),
    MsgError(MsgError),
    SendComplete(SendComplete),
}

/// 按类别统计的事件数。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventTally {
    pub fd_ready: usize,
    pub new_session: usize,
    pub session_event: usize,
    pub msg: usize,
    pub msg_error: usize,
    pub send_complete: usize,
}

impl EventTally {
    pub fn total(&self) -> usize {
        self.fd_ready
            + self.new_session
            + self.session_event
            + self.msg
            + self.msg_error
            + self.send_complete
    }
}

/// 事件聚合器：统计每类事件并写入队列。
///
/// 计数不受队列容量影响，溢出的事件同样计入 [`EventTally`]。
#[derive(Debug, Default)]
pub struct Events {
    tally: EventTally,
}

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    /// 统计并入队，返回是否成功入队。
    pub fn record(&mut self, queue: &mut EventQueue, event: LoopEvent) -> bool {
        let slot = match &event {
            LoopEvent::FdReady(_) => &mut self.tally.fd_ready,
            LoopEvent::NewSession(_) => &mut self.tally.new_session,
            LoopEvent::Session(_) => &mut self.tally.session_event,
            LoopEvent::Msg(_) => &mut self.tally.msg,
            LoopEvent::MsgError(_) => &mut self.tally.msg_error,
            LoopEvent::SendComplete(_) => &mut self.tally.send_complete,
        };
        *slot += 1;
        queue.push(event)
    }

    pub fn tally(&self) -> EventTally {
        self.tally
    }

    pub fn reset(&mut self) {
        self.tally = EventTally::default();
    }
}

impl Drop for Events {
    fn drop(&mut self) {
        trace!(events = self.tally.total(), "event aggregator released");
    }
}
