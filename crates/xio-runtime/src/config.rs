//! TOML 配置。
//!
//! ```toml
//! [context]
//! event_queue_capacity = 1000
//! run_timeout_micros = 1000000   # 0 表示轮询一次
//! session_map = false
//!
//! [server]
//! url = "tcp://127.0.0.1:0"
//!
//! [logging]
//! filter = "info"
//! ansi = true
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;
use xio_transport::{LoopTimeout, PortalUrl};

use crate::error::XioError;
use crate::event_queue::DEFAULT_EVENT_QUEUE_CAPACITY;

/// 顶层配置。
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub server: Option<ServerConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Context 构建参数。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ContextConfig {
    pub event_queue_capacity: i32,
    pub run_timeout_micros: u64,
    pub session_map: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            run_timeout_micros: 1_000_000,
            session_map: false,
        }
    }
}

impl ContextConfig {
    /// 单次运行的超时，`0` 映射为轮询一次。
    pub fn run_timeout(&self) -> LoopTimeout {
        LoopTimeout::from_micros(self.run_timeout_micros)
    }
}

/// 监听端配置。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub url: String,
}

/// 日志配置；`RUST_LOG` 优先于 `filter`。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    pub filter: String,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_owned(),
            ansi: true,
        }
    }
}

impl RuntimeConfig {
    /// 解析并校验。
    pub fn from_toml_str(input: &str) -> Result<Self, XioError> {
        let config: RuntimeConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, XioError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| XioError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), XioError> {
        if self.context.event_queue_capacity <= 0 {
            return Err(XioError::Config {
                reason: format!(
                    "context.event_queue_capacity must be positive, got {}",
                    self.context.event_queue_capacity
                ),
            });
        }
        if let Some(server) = &self.server {
            PortalUrl::parse(&server.url).map_err(|err| XioError::Config {
                reason: format!("server.url: {err}"),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;

    #[test]
    fn empty_document_uses_defaults() {
        let config = RuntimeConfig::from_toml_str("").expect("defaults");
        assert_eq!(config.context.event_queue_capacity, 1000);
        assert!(!config.context.session_map);
        assert!(config.server.is_none());
        assert_eq!(config.logging.filter, "info");
    }

    #[test]
    fn full_document_parses() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            [context]
            event_queue_capacity = 16
            run_timeout_micros = 0
            session_map = true

            [server]
            url = "tcp://127.0.0.1:0"

            [logging]
            filter = "xio_runtime=debug"
            ansi = false
            "#,
        )
        .expect("valid config");
        assert_eq!(config.context.run_timeout(), LoopTimeout::Poll);
        assert_eq!(
            config.server.as_ref().map(|s| s.url.as_str()),
            Some("tcp://127.0.0.1:0")
        );
        assert!(!config.logging.ansi);
    }

    #[test]
    fn rejects_bad_values_and_unknown_keys() {
        let err = RuntimeConfig::from_toml_str("[context]\nevent_queue_capacity = 0\n")
            .expect_err("capacity 0");
        assert_eq!(err.code(), "xio.config.invalid");

        let err = RuntimeConfig::from_toml_str("[server]\nurl = \"nope\"\n").expect_err("url");
        assert_eq!(err.code(), "xio.config.invalid");

        let err = RuntimeConfig::from_toml_str("[context]\nqueue = 1\n").expect_err("unknown");
        assert_eq!(err.code(), "xio.config.parse_failed");
    }

    #[test]
    fn timeout_is_microseconds() {
        let config = ContextConfig {
            run_timeout_micros: 2_500,
            ..ContextConfig::default()
        };
        assert_eq!(
            config.run_timeout(),
            LoopTimeout::After(Duration::from_micros(2_500))
        );
    }

    #[test]
    fn missing_file_reports_path() {
        let err = RuntimeConfig::from_path("/nonexistent/xio.toml").expect_err("missing");
        assert!(matches!(err, XioError::ConfigIo { .. }));
        assert!(err.to_string().contains("/nonexistent/xio.toml"));
    }
}
