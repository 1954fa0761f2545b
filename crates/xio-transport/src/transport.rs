use std::rc::Rc;

use crate::{EventLoop, PortalUrl, Readiness, SessionOps, TransportError};

/// 传输库入口：创建事件循环、传输上下文与监听器。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 运行时的构建/回滚逻辑只依赖这里的四个步骤，原生实现（epoll + TCP）与测试替身
///   （计数传输）均实现同一契约，生命周期属性因此可以在无真实 fd 的环境下验证。
///
/// ## 契约（What）
/// - `loop_init`：创建事件循环；失败时不得遗留任何资源；
/// - `ctx_open`：创建绑定到 `ev_loop` 的传输上下文；上下文可以克隆 `Rc` 持有循环，
///   保证循环晚于上下文释放；
/// - `bind`：在上下文上监听 `url`，会话事件通过 `ops` 交付；URL 协议必须等于 [`Transport::scheme`]；
/// - 循环与上下文的释放由各自类型的 `Drop` 完成，监听器的释放通过显式的 [`Listener::unbind`]。
///
/// ## 风险提示（Trade-offs）
/// - 关联类型让运行时保持零成本静态分发，代价是 `Context<T>` 需要携带泛型参数。
pub trait Transport: 'static {
    type Loop: EventLoop;
    type Context: TransportContext;
    type Listener: Listener;

    /// URL 协议名，例如 `"tcp"`。
    fn scheme(&self) -> &'static str;

    fn loop_init(&self) -> Result<Self::Loop, TransportError>;

    fn ctx_open(&self, ev_loop: &Rc<Self::Loop>) -> Result<Self::Context, TransportError>;

    fn bind(
        &self,
        ctx: &Self::Context,
        url: &PortalUrl,
        ops: SessionOps,
    ) -> Result<Self::Listener, TransportError>;
}

/// 绑定到事件循环的传输上下文。
pub trait TransportContext: 'static {
    /// 处理一次传输自有 fd 的就绪（[`FdOwner::Transport`](crate::FdOwner::Transport)）。
    ///
    /// 错误由调用方记录，不会中止当前运行。
    fn dispatch(&self, readiness: Readiness) -> Result<(), TransportError>;
}

/// 已绑定的监听器。
pub trait Listener: 'static {
    /// 实际监听的地址（端口 0 已解析为系统分配的端口）。
    fn url(&self) -> &PortalUrl;

    /// 停止监听并释放其会话；失败需要上报，因此不放在 `Drop` 中。
    fn unbind(self) -> Result<(), TransportError>;
}
