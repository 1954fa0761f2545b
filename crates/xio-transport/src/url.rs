use core::fmt;
use core::str::FromStr;
use std::net::{SocketAddr, ToSocketAddrs};

use crate::TransportError;

/// 监听地址：`scheme://host:port[/path][?query]`。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 绑定时请求的端口可能为 0，监听器需要回写实际端口；将 URL 拆成结构化字段后，
///   “替换端口/主机”不再依赖字符串拼接。
///
/// ## 契约（What）
/// - `scheme` 统一小写；端口必须显式给出；IPv6 主机必须使用 `[...]` 包裹；
/// - `path` 从端口之后的第一个 `/` 或 `?` 开始（若存在），原样保留查询串；
/// - `Display` 输出可被 [`PortalUrl::parse`] 再次解析为相同的值。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PortalUrl {
    scheme: String,
    host: String,
    port: u16,
    path: String,
}

impl PortalUrl {
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &'static str| TransportError::InvalidUrl {
            url: input.to_owned(),
            reason,
        };

        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| invalid("missing `://` separator"))?;
        if !is_valid_scheme(scheme) {
            return Err(invalid("invalid scheme"));
        }

        let (authority, path) = match rest.find(['/', '?']) {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated `[` in host"))?;
            let port = tail
                .strip_prefix(':')
                .ok_or_else(|| invalid("missing port"))?;
            (host, port)
        } else {
            let (host, port) = authority
                .rsplit_once(':')
                .ok_or_else(|| invalid("missing port"))?;
            if host.contains(':') {
                return Err(invalid("ipv6 host must be enclosed in `[]`"));
            }
            (host, port)
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            host: host.to_owned(),
            port,
            path: path.to_owned(),
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 返回替换端口后的副本。
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }

    /// 解析主机为套接字地址，至少返回一个地址。
    pub fn socket_addrs(&self) -> Result<Vec<SocketAddr>, TransportError> {
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|source| TransportError::io("resolve", source))?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::InvalidUrl {
                url: self.to_string(),
                reason: "host resolves to no address",
            });
        }
        Ok(addrs)
    }
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

impl fmt::Display for PortalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}{}", self.scheme, self.host, self.port, self.path)
        } else {
            write!(f, "{}://{}:{}{}", self.scheme, self.host, self.port, self.path)
        }
    }
}

impl FromStr for PortalUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
