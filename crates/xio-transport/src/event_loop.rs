use core::fmt;
use core::time::Duration;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

use crate::{EventMask, FdOwner, Readiness, TransportError};

/// 一次 `run_timeout` 的等待上限。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 传输库以微秒整数表达超时，`0` 既可能被理解为“轮询一次”也可能被理解为“无限阻塞”；
///   这里用枚举把约定固定下来：**`0` 表示轮询一次立即返回，无限阻塞必须显式使用
///   [`LoopTimeout::Infinite`]**。
///
/// ## 契约（What）
/// - `Poll`：等待一次（不阻塞），分发已就绪的事件后返回；
/// - `After(d)`：最多阻塞 `d`，`d` 必须非零（零值会被 [`LoopTimeout::from`] 归一为 `Poll`）；
/// - `Infinite`：直到停止信号或循环判定无事可等。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopTimeout {
    Poll,
    After(Duration),
    Infinite,
}

impl LoopTimeout {
    /// 以微秒构造，`0` 映射为 [`LoopTimeout::Poll`]。
    pub fn from_micros(micros: u64) -> Self {
        Self::from(Duration::from_micros(micros))
    }

    /// 返回有限超时的时长；`Infinite` 返回 `None`，`Poll` 返回零。
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            LoopTimeout::Poll => Some(Duration::ZERO),
            LoopTimeout::After(duration) => Some(*duration),
            LoopTimeout::Infinite => None,
        }
    }

    /// 从 `now` 起算的截止时间。
    ///
    /// `Infinite` 以及超出 [`Instant`] 可表示范围的等待（如 `Duration::MAX`）均返回 `None`，
    /// 循环应按无限等待处理。
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        self.as_duration().and_then(|wait| now.checked_add(wait))
    }
}

impl From<Duration> for LoopTimeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            LoopTimeout::Poll
        } else {
            LoopTimeout::After(duration)
        }
    }
}

/// `run_timeout` 正常返回的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopExit {
    /// 超时到达（`Poll` 模式下一次等待结束也归为此类）。
    TimedOut,
    /// 观察到停止信号。
    Stopped,
    /// 无限等待且没有任何已注册的 fd，循环判定无事可等。
    Idle,
}

/// 停止信号的实现端。
///
/// 实现必须可从任意线程调用，且在循环阻塞于等待时唤醒它。
pub trait StopSignal: Send + Sync + 'static {
    fn raise(&self);
}

/// 跨线程停止句柄。
///
/// # 教案级注释
///
/// - **意图 (Why)**：事件循环本身是单线程对象，而停止请求可能来自其他线程；
///   将“唤醒并置位”这一能力拆成可克隆、`Send + Sync` 的句柄，避免共享整个循环。
/// - **契约 (What)**：`stop` 幂等；停止只在控制流回到循环后生效，不会打断正在执行的回调。
#[derive(Clone)]
pub struct LoopStopper {
    signal: Arc<dyn StopSignal>,
}

impl LoopStopper {
    pub fn new(signal: Arc<dyn StopSignal>) -> Self {
        Self { signal }
    }

    /// 请求当前（或下一次）运行尽快返回。
    pub fn stop(&self) {
        self.signal.raise();
    }
}

impl fmt::Debug for LoopStopper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopStopper").finish_non_exhaustive()
    }
}

/// 传输库提供的事件循环原语。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 对应传输库的 `ev_loop_init/run/stop/add/del/destroy`；销毁由实现类型的 `Drop` 完成，
///   因此“只释放一次”由所有权保证而非调用约定。
///
/// ## 契约（What）
/// - `add`：同一 fd 重复注册返回 [`TransportError::AlreadyRegistered`] 且不产生副作用；
///   空掩码返回 [`TransportError::InvalidInterest`]；
/// - `del`：未注册返回 [`TransportError::NotRegistered`] 且不产生副作用；
/// - `run_timeout`：按就绪顺序对每个仍处于注册状态的 fd 调用一次 `dispatch`；
///   在回调中调用 `add`/`del`/`stop` 必须安全；同一批次中已被移除的 fd 不再分发；
/// - `stop`：在当前线程置位停止标志；`stopper` 返回可跨线程使用的句柄。
///
/// ## 风险提示（Trade-offs）
/// - 所有方法使用 `&self`，实现需借助内部可变性，并保证回调执行期间不持有内部借用，
///   否则回调内的 `add`/`del` 会触发 `RefCell` 冲突。
pub trait EventLoop: 'static {
    /// 注册 fd。
    fn add(&self, fd: RawFd, interest: EventMask, owner: FdOwner) -> Result<(), TransportError>;

    /// 移除 fd。
    fn del(&self, fd: RawFd) -> Result<(), TransportError>;

    /// fd 是否已注册。
    fn is_registered(&self, fd: RawFd) -> bool;

    /// 已注册 fd 的数量（不含内部唤醒通道）。
    fn registered(&self) -> usize;

    /// 阻塞运行，直到超时、停止或无事可等。
    fn run_timeout(
        &self,
        timeout: LoopTimeout,
        dispatch: &mut dyn FnMut(Readiness),
    ) -> Result<LoopExit, TransportError>;

    /// 请求停止。
    fn stop(&self);

    /// 返回跨线程停止句柄。
    fn stopper(&self) -> LoopStopper;
}
