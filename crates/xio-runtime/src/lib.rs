#![allow(clippy::result_large_err)]
#![doc = "xio-runtime: 事件驱动消息端点的生命周期管理。"]
#![doc = ""]
#![doc = "== 使命概述 =="]
#![doc = "- **Why**：端点由事件循环、绑定其上的传输上下文、每周期事件队列与可选的监听端组成；任何一步构建失败都必须按逆序回滚，任何资源都只能释放一次。"]
#![doc = "- **What**：提供 `Context`（构建/运行/停止/fd 注册）、`EventQueue` 与 `Events` 聚合器、`Server`（绑定/关闭）、宿主回调桥 `EventSink`、`SessionMap`、TOML 配置、日志初始化，以及 Linux 下的原生 epoll 事件循环与 TCP 传输。"]
#![doc = "- **How**：资源所有权即释放契约；Context 为单线程对象，跨线程仅通过 `StopHandle` 请求停止。"]
#![doc = ""]
#![doc = "== 特性开关 =="]
#![doc = "- `test-util`：暴露 `testing` 模块中的计数传输与脚本化事件循环。"]

pub mod config;
pub mod context;
pub mod error;
pub mod event_queue;
pub mod events;
pub mod observability;
pub mod server;
pub mod session_map;
pub mod sink;

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(target_os = "linux")]
pub mod tcp;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{ContextConfig, LoggingConfig, RuntimeConfig, ServerConfig};
pub use context::{Context, ContextBuilder, RunExit};
pub use error::XioError;
pub use event_queue::{DEFAULT_EVENT_QUEUE_CAPACITY, EventQueue, EventQueueError};
pub use events::{EventTally, Events, LoopEvent};
pub use observability::install_subscriber;
pub use server::{Server, ServerState};
pub use session_map::SessionMap;
pub use sink::{ContextId, EventSink, FdReady, LoopControl, NoopSink, StopHandle};

#[cfg(target_os = "linux")]
pub use epoll::EpollLoop;
#[cfg(target_os = "linux")]
pub use tcp::{TcpContext, TcpListener, TcpTransport};

pub use xio_transport::{EventMask, LoopTimeout, PortalUrl, SessionOps};
