use core::fmt;
use core::ops::{BitAnd, BitOr, BitOrAssign};
use std::os::fd::RawFd;

/// fd 就绪掩码。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 注册时表达“关心哪些事件”，分发时表达“实际发生了哪些事件”，两处共用一个类型，
///   避免在 epoll 标志、测试脚本与宿主回调之间各自维护一套位定义；
/// - 位值是稳定契约，宿主桥接层可以原样转发 [`EventMask::bits`]。
///
/// ## 契约（What）
/// - `READABLE`/`WRITABLE`：可读/可写；
/// - `ERROR`/`HANGUP`：错误与挂断，无论是否注册都可能被报告；
/// - 未定义的位在 [`EventMask::from_bits_truncate`] 中被丢弃。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u32);

impl EventMask {
    pub const READABLE: EventMask = EventMask(0b0001);
    pub const WRITABLE: EventMask = EventMask(0b0010);
    pub const ERROR: EventMask = EventMask(0b0100);
    pub const HANGUP: EventMask = EventMask(0b1000);

    const ALL_BITS: u32 = 0b1111;

    /// 空掩码。
    pub const fn empty() -> Self {
        EventMask(0)
    }

    /// 返回原始位值。
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// 从原始位值构造，丢弃未定义的位。
    pub const fn from_bits_truncate(bits: u32) -> Self {
        EventMask(bits & Self::ALL_BITS)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// 是否包含 `other` 的全部位。
    pub const fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// 是否与 `other` 存在交集。
    pub const fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Self::READABLE)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITABLE)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        EventMask(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, rhs: Self) -> Self::Output {
        EventMask(self.0 & rhs.0)
    }
}

impl fmt::Debug for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(EventMask, &str); 4] = [
            (EventMask::READABLE, "READABLE"),
            (EventMask::WRITABLE, "WRITABLE"),
            (EventMask::ERROR, "ERROR"),
            (EventMask::HANGUP, "HANGUP"),
        ];
        if self.is_empty() {
            return f.write_str("EventMask(empty)");
        }
        f.write_str("EventMask(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}

/// 注册方标签：决定一次就绪由谁处理。
///
/// - `Application(cookie)`：应用通过 Context 注册的 fd，`cookie` 原样交还给宿主回调；
/// - `Transport(tag)`：传输实现内部的 fd（监听套接字、会话连接），由
///   [`TransportContext::dispatch`](crate::TransportContext::dispatch) 处理。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FdOwner {
    Application(u64),
    Transport(u64),
}

/// 事件循环报告的一次就绪。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub events: EventMask,
    pub owner: FdOwner,
}
