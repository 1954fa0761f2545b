use std::io;
use std::os::fd::RawFd;
use std::path::PathBuf;

use thiserror::Error;
use xio_transport::TransportError;

use crate::event_queue::EventQueueError;
use crate::sink::ContextId;

/// 描述一次运行时操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const LOOP_INIT: OperationKind = OperationKind {
    code: "xio.context.loop_init_failed",
    message: "event loop init",
};
pub(crate) const CONTEXT_OPEN: OperationKind = OperationKind {
    code: "xio.context.ctx_open_failed",
    message: "transport context open",
};
pub(crate) const EVENT_QUEUE: OperationKind = OperationKind {
    code: "xio.context.event_queue_failed",
    message: "event queue allocation",
};
pub(crate) const ALREADY_RUNNING: OperationKind = OperationKind {
    code: "xio.context.already_running",
    message: "event loop run",
};
pub(crate) const FD_ALREADY_REGISTERED: OperationKind = OperationKind {
    code: "xio.context.fd_already_registered",
    message: "event loop add",
};
pub(crate) const FD_NOT_REGISTERED: OperationKind = OperationKind {
    code: "xio.context.fd_not_registered",
    message: "event loop del",
};
pub(crate) const INVALID_FD: OperationKind = OperationKind {
    code: "xio.context.invalid_fd",
    message: "event loop add",
};
pub(crate) const INVALID_INTEREST: OperationKind = OperationKind {
    code: "xio.context.invalid_interest",
    message: "event loop add",
};
pub(crate) const REGISTER: OperationKind = OperationKind {
    code: "xio.context.register_failed",
    message: "event loop add",
};
pub(crate) const DEREGISTER: OperationKind = OperationKind {
    code: "xio.context.deregister_failed",
    message: "event loop del",
};
pub(crate) const INVALID_URL: OperationKind = OperationKind {
    code: "xio.server.invalid_url",
    message: "server url parse",
};
pub(crate) const BIND: OperationKind = OperationKind {
    code: "xio.server.bind_failed",
    message: "server bind",
};
pub(crate) const UNBIND: OperationKind = OperationKind {
    code: "xio.server.unbind_failed",
    message: "server unbind",
};
pub(crate) const SERVER_CLOSED: OperationKind = OperationKind {
    code: "xio.server.closed",
    message: "server close",
};
pub(crate) const CONFIG: OperationKind = OperationKind {
    code: "xio.config.invalid",
    message: "config validate",
};
pub(crate) const CONFIG_IO: OperationKind = OperationKind {
    code: "xio.config.io_failed",
    message: "config read",
};
pub(crate) const CONFIG_PARSE: OperationKind = OperationKind {
    code: "xio.config.parse_failed",
    message: "config parse",
};
pub(crate) const LOGGING: OperationKind = OperationKind {
    code: "xio.logging.init_failed",
    message: "logging init",
};

/// 运行时统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 将构建失败、绑定失败、注册失败与配置/日志初始化失败归入同一枚举，
///   调用方通过 [`XioError::code`] 获取稳定错误码，用于告警聚合与日志检索；
/// - 传输层错误以 `#[source]` 保留，不在此处二次格式化。
///
/// ## 契约（What）
/// - 构建类错误（`LoopInit`/`ContextOpen`/`EventQueue`）只会由 Context 构造函数返回，
///   返回时所有已创建的资源均已按逆序释放；
/// - 注册类错误（`Fd*`/`Invalid*`/`Register`/`Deregister`）不改变 Context 状态；
/// - 错误码遵循 `xio.<域>.<事件>` 命名，发布后不可修改。
#[derive(Debug, Error)]
pub enum XioError {
    #[error("event loop init failed: {source}")]
    LoopInit {
        #[source]
        source: TransportError,
    },
    #[error("transport context open failed: {source}")]
    ContextOpen {
        #[source]
        source: TransportError,
    },
    #[error("event queue allocation failed: {source}")]
    EventQueue {
        #[from]
        source: EventQueueError,
    },
    #[error("event loop of {context} is already running")]
    AlreadyRunning { context: ContextId },
    #[error("fd {fd} is already registered")]
    FdAlreadyRegistered { fd: RawFd },
    #[error("fd {fd} is not registered")]
    FdNotRegistered { fd: RawFd },
    #[error("fd {fd} is not a valid descriptor")]
    InvalidFd { fd: RawFd },
    #[error("empty interest mask for fd {fd}")]
    InvalidInterest { fd: RawFd },
    #[error("event loop rejected fd {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: TransportError,
    },
    #[error("event loop failed to remove fd {fd}: {source}")]
    Deregister {
        fd: RawFd,
        #[source]
        source: TransportError,
    },
    #[error("invalid server url: {source}")]
    InvalidUrl {
        #[source]
        source: TransportError,
    },
    #[error("bind to `{url}` failed: {source}")]
    Bind {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("unbind of `{url}` failed: {source}")]
    Unbind {
        url: String,
        #[source]
        source: TransportError,
    },
    #[error("server `{url}` is already closed")]
    ServerClosed { url: String },
    #[error("invalid configuration: {reason}")]
    Config { reason: String },
    #[error("failed to read config `{}`: {source}", path.display())]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },
    #[error("logging init failed: {reason}")]
    Logging { reason: String },
}

impl XioError {
    /// 稳定错误码。
    pub fn code(&self) -> &'static str {
        self.kind().code
    }

    pub(crate) fn kind(&self) -> OperationKind {
        match self {
            XioError::LoopInit { .. } => LOOP_INIT,
            XioError::ContextOpen { .. } => CONTEXT_OPEN,
            XioError::EventQueue { .. } => EVENT_QUEUE,
            XioError::AlreadyRunning { .. } => ALREADY_RUNNING,
            XioError::FdAlreadyRegistered { .. } => FD_ALREADY_REGISTERED,
            XioError::FdNotRegistered { .. } => FD_NOT_REGISTERED,
            XioError::InvalidFd { .. } => INVALID_FD,
            XioError::InvalidInterest { .. } => INVALID_INTEREST,
            XioError::Register { .. } => REGISTER,
            XioError::Deregister { .. } => DEREGISTER,
            XioError::InvalidUrl { .. } => INVALID_URL,
            XioError::Bind { .. } => BIND,
            XioError::Unbind { .. } => UNBIND,
            XioError::ServerClosed { .. } => SERVER_CLOSED,
            XioError::Config { .. } => CONFIG,
            XioError::ConfigIo { .. } => CONFIG_IO,
            XioError::ConfigParse { .. } => CONFIG_PARSE,
            XioError::Logging { .. } => LOGGING,
        }
    }

    /// 将事件循环 `add` 的失败映射为注册类错误。
    pub(crate) fn from_register(fd: RawFd, error: TransportError) -> Self {
        match error {
            TransportError::AlreadyRegistered { fd } => XioError::FdAlreadyRegistered { fd },
            TransportError::InvalidFd { fd } => XioError::InvalidFd { fd },
            TransportError::InvalidInterest { fd } => XioError::InvalidInterest { fd },
            source => XioError::Register { fd, source },
        }
    }

    /// 将事件循环 `del` 的失败映射为注册类错误。
    pub(crate) fn from_deregister(fd: RawFd, error: TransportError) -> Self {
        match error {
            TransportError::NotRegistered { fd } => XioError::FdNotRegistered { fd },
            source => XioError::Deregister { fd, source },
        }
    }
}
