//! Server：绑定在 Context 上的监听端。
//!
//! # 模块定位（Why）
//! - Server 借用其 Context（`&'ctx Context<T>`），借用检查器因此禁止 Server 比 Context 活得更久；
//! - 应用提供的会话回调表在绑定前被包装：每条交付的通知先记入 Context 的本周期状态，
//!   再原样转发给应用，恰好一次。
//!
//! # 状态机（What）
//! - `Unbound → Binding → {Bound, Failed}`：`Failed` 即 [`Server::bind`] 返回的 `Err`，
//!   不存在需要解绑的对象；
//! - `Bound → Unbound`：[`Server::close`] 或 `Drop`；`Drop` 中的解绑失败只记录 `error` 日志。

use core::fmt;

use tracing::{debug, error, info, warn};
use xio_transport::{
    Listener, PortalUrl, SessionNotice, SessionOps, Transport, TransportError,
};

use crate::config::ServerConfig;
use crate::context::Context;
use crate::error::XioError;
use crate::events::LoopEvent;

/// Server 可观察的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Bound,
    Unbound,
}

pub struct Server<'ctx, T: Transport> {
    ctx: &'ctx Context<T>,
    listener: Option<T::Listener>,
    requested: PortalUrl,
    url: PortalUrl,
}

impl<'ctx, T: Transport> Server<'ctx, T> {
    /// 解析 `url` 并绑定。
    pub fn bind(ctx: &'ctx Context<T>, url: &str, ops: SessionOps) -> Result<Self, XioError> {
        let url = PortalUrl::parse(url).map_err(|source| {
            let err = XioError::InvalidUrl { source };
            error!(context = %ctx.id(), code = err.code(), error = %err, "server url rejected");
            err
        })?;
        Self::bind_url(ctx, &url, ops)
    }

    /// 按配置中的 URL 绑定。
    pub fn from_config(
        ctx: &'ctx Context<T>,
        config: &ServerConfig,
        ops: SessionOps,
    ) -> Result<Self, XioError> {
        Self::bind(ctx, &config.url, ops)
    }

    /// 在 `ctx` 上监听 `url`。
    ///
    /// # 教案级注释
    ///
    /// - **契约 (What)**：协议与 [`Transport::scheme`] 不一致时返回 [`XioError::Bind`]
    ///   （来源为 `UnsupportedScheme`），且不会调用传输层；传输层绑定失败同样返回
    ///   [`XioError::Bind`]，此时没有任何资源需要解绑；
    /// - **执行 (How)**：`ops` 经 [`SessionOps::intercept`] 包装，记账闭包只持有 Context 周期
    ///   状态的 `Weak`，Context 释放后记账自动失效，应用回调仍照常执行；会话结束事件的应用回调
    ///   返回后，若 Context 安装了会话映射，则移除对应条目。
    pub fn bind_url(
        ctx: &'ctx Context<T>,
        url: &PortalUrl,
        ops: SessionOps,
    ) -> Result<Self, XioError> {
        let expected = ctx.transport().scheme();
        if url.scheme() != expected {
            let err = XioError::Bind {
                url: url.to_string(),
                source: TransportError::UnsupportedScheme {
                    expected,
                    found: url.scheme().to_owned(),
                },
            };
            error!(context = %ctx.id(), code = err.code(), error = %err, "server bind rejected");
            return Err(err);
        }

        let ops = record_notifications(ctx, ops);
        let listener = ctx
            .transport()
            .bind(ctx.transport_context(), url, ops)
            .map_err(|source| {
                let err = XioError::Bind {
                    url: url.to_string(),
                    source,
                };
                error!(context = %ctx.id(), code = err.code(), error = %err, "server bind failed");
                err
            })?;

        let bound = listener.url().clone();
        info!(context = %ctx.id(), requested = %url, url = %bound, "server bound");
        Ok(Self {
            ctx,
            listener: Some(listener),
            requested: url.clone(),
            url: bound,
        })
    }

    /// 实际监听的地址；端口 0 的请求在这里已被替换为分配到的端口。
    pub fn url(&self) -> &PortalUrl {
        &self.url
    }

    pub fn requested_url(&self) -> &PortalUrl {
        &self.requested
    }

    pub fn state(&self) -> ServerState {
        if self.listener.is_some() {
            ServerState::Bound
        } else {
            ServerState::Unbound
        }
    }

    pub fn context(&self) -> &'ctx Context<T> {
        self.ctx
    }

    /// 解绑。第二次调用返回 [`XioError::ServerClosed`]。
    pub fn close(&mut self) -> Result<(), XioError> {
        let Some(listener) = self.listener.take() else {
            warn!(context = %self.ctx.id(), url = %self.url, "server is already closed");
            return Err(XioError::ServerClosed {
                url: self.url.to_string(),
            });
        };
        listener.unbind().map_err(|source| {
            let err = XioError::Unbind {
                url: self.url.to_string(),
                source,
            };
            error!(context = %self.ctx.id(), code = err.code(), error = %err, "server unbind failed");
            err
        })?;
        debug!(context = %self.ctx.id(), url = %self.url, "server closed");
        Ok(())
    }
}

fn record_notifications<T: Transport>(ctx: &Context<T>, ops: SessionOps) -> SessionOps {
    let recorder = ctx.cycle();
    let cleaner = ctx.cycle();
    ops.intercept(
        move |notice| {
            let Some(cycle) = recorder.upgrade() else {
                return;
            };
            let event = match notice {
                SessionNotice::NewSession(session) => LoopEvent::NewSession(session.clone()),
                SessionNotice::Event(event) => LoopEvent::Session(event.clone()),
                SessionNotice::Msg(msg) => LoopEvent::Msg(msg.clone()),
                SessionNotice::MsgError(error) => LoopEvent::MsgError(error.clone()),
                SessionNotice::SendComplete(complete) => LoopEvent::SendComplete(complete.clone()),
            };
            cycle.record(event);
        },
        // 应用在会话结束回调中仍可读取自己的会话映射条目，回调返回后才移除。
        move |notice| {
            if let SessionNotice::Event(event) = notice {
                if event.kind.ends_session() {
                    if let Some(cycle) = cleaner.upgrade() {
                        cycle.forget_session(event.session);
                    }
                }
            }
        },
    )
}

impl<T: Transport> Drop for Server<'_, T> {
    fn drop(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        match listener.unbind() {
            Ok(()) => debug!(context = %self.ctx.id(), url = %self.url, "server unbound on drop"),
            Err(source) => {
                let err = XioError::Unbind {
                    url: self.url.to_string(),
                    source,
                };
                error!(
                    context = %self.ctx.id(),
                    code = err.code(),
                    error = %err,
                    "server unbind failed during drop"
                );
            }
        }
    }
}

impl<T: Transport> fmt::Debug for Server<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("context", &self.ctx.id())
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}
