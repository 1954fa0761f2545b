use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::XioError;

/// 安装全局 `fmt` 订阅者。
///
/// # 教案级注释
///
/// - **意图 (Why)**：运行时内部只使用 `tracing` 宏输出结构化字段，订阅者的选择留给进程入口；
///   本函数为不需要自定义订阅者的宿主提供一键安装。
/// - **契约 (What)**：`RUST_LOG` 存在且合法时优先生效，否则使用 `config.filter`；
///   全局订阅者已存在（包括重复调用）时返回 [`XioError::Logging`]。
pub fn install_subscriber(config: &LoggingConfig) -> Result<(), XioError> {
    tracing_subscriber::fmt()
        .with_env_filter(build_env_filter(config)?)
        .with_ansi(config.ansi)
        .try_init()
        .map_err(|err| XioError::Logging {
            reason: err.to_string(),
        })
}

fn build_env_filter(config: &LoggingConfig) -> Result<EnvFilter, XioError> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter).map_err(|err| XioError::Logging {
            reason: format!("invalid filter `{}`: {err}", config.filter),
        }),
    }
}
