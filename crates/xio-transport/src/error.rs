use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// 传输协作者统一错误类型。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 事件循环、传输上下文与监听器来自同一个外部库，它们的失败需要以一种错误类型
///   向上传递，由 `xio-runtime` 再映射为带稳定错误码的 `XioError`；
/// - 将“重复注册”“未注册”等可判定的失败与底层 IO 错误区分开，便于调用方按类别处理。
///
/// ## 契约（What）
/// - `Io`：底层系统调用失败，`op` 为稳定的操作名（如 `"epoll_ctl.add"`），`source` 保留原始错误；
/// - 其余变体均为纯语义错误，不携带 IO 上下文；
/// - 所有变体满足 `Send + Sync + 'static`。
#[derive(Debug, Error)]
pub enum TransportError {
    /// 底层系统调用失败。
    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    /// 同一 fd 已注册在该事件循环中。
    #[error("fd {fd} is already registered")]
    AlreadyRegistered { fd: RawFd },
    /// fd 未注册，无法移除。
    #[error("fd {fd} is not registered")]
    NotRegistered { fd: RawFd },
    /// fd 不是合法的文件描述符编号。
    #[error("fd {fd} is not a valid descriptor")]
    InvalidFd { fd: RawFd },
    /// 就绪掩码为空，事件循环无法监听。
    #[error("empty interest mask for fd {fd}")]
    InvalidInterest { fd: RawFd },
    /// URL 协议与传输实现不匹配。
    #[error("unsupported scheme `{found}`, expected `{expected}`")]
    UnsupportedScheme {
        expected: &'static str,
        found: String,
    },
    /// URL 无法解析。
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: &'static str },
    /// 监听器句柄已失效（已解绑或从未登记）。
    #[error("listener {tag} is not bound")]
    UnknownListener { tag: u64 },
    /// 传输实现暂时无法提供资源。
    #[error("transport resource unavailable: {detail}")]
    Unavailable { detail: String },
}

impl TransportError {
    /// 以操作名包装 IO 错误。
    pub fn io(op: &'static str, source: io::Error) -> Self {
        Self::Io { op, source }
    }
}
