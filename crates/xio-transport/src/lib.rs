#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]
#![doc = "xio-transport: 事件循环与传输上下文的协作者契约。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：`xio-runtime` 的 Context/Server 生命周期只依赖传输库暴露的一组原语（事件循环、上下文、监听器、会话回调表），本 crate 将这些原语固化为 trait，使原生实现与测试替身可以互换。"]
#![doc = "- **What**：定义 `EventLoop`/`Transport`/`TransportContext`/`Listener` 契约、就绪掩码 `EventMask`、会话回调表 `SessionOps`、地址 `PortalUrl` 与错误 `TransportError`。"]
#![doc = "- **How**：所有契约均为单线程语义（`&self` + 内部可变性），唯一跨线程原语是 `LoopStopper`。"]

pub mod error;
pub mod event_loop;
pub mod readiness;
pub mod session;
pub mod transport;
pub mod url;

pub use error::TransportError;
pub use event_loop::{EventLoop, LoopExit, LoopStopper, LoopTimeout, StopSignal};
pub use readiness::{EventMask, FdOwner, Readiness};
pub use session::{
    EventReason, Msg, MsgError, NewSession, SendComplete, SessionEvent, SessionEventKind,
    SessionId, SessionKey, SessionNotice, SessionOps,
};
pub use transport::{Listener, Transport, TransportContext};
pub use url::PortalUrl;
