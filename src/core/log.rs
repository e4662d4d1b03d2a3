//! 日志系统模块
//!
//! 基于 `tracing` 的结构化日志。提交核心按以下约定使用日志级别：
//!
//! - `trace`：每次提交、signal、列表打开/关闭
//! - `debug`：对象生命周期（池增长、缓冲区获取/放弃、释放堆清理）
//! - `info`：设备、上下文、交换链的创建与调整大小
//! - `warn` / `error`：失败与协议违背
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_on12::core::config::LogLevel;
//! use dist_on12::core::log;
//!
//! log::init_logger(LogLevel::Info, false, None).unwrap();
//! dist_on12::core_info!(frames = 120, "Demo finished");
//! ```

use std::path::Path;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use super::config::LogLevel;
use super::error::{On12Error, Result};

/// 初始化日志系统
///
/// 必须在程序开始时调用一次。`RUST_LOG` 环境变量存在时优先于 `level`。
///
/// * `level` - 日志级别
/// * `file_output` - 是否同时输出到按天滚动的文件
/// * `log_file_path` - 日志文件路径（默认为 "dist_on12.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(true);

    let result = if file_output {
        let log_path = log_file_path.unwrap_or("dist_on12.log");
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("dist_on12.log");

        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);
        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .try_init()
    };
    result.map_err(|e| On12Error::Log(e.to_string()))
}

/// 提交核心日志 - Info 级别
#[macro_export]
macro_rules! core_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_on12::core", $($arg)*)
    };
}

/// 提交核心日志 - Warn 级别
#[macro_export]
macro_rules! core_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_on12::core", $($arg)*)
    };
}

/// 提交核心日志 - Error 级别
#[macro_export]
macro_rules! core_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "dist_on12::core", $($arg)*)
    };
}

impl LogLevel {
    /// `EnvFilter` 使用的指令字符串
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(LogLevel::Trace.as_str(), "trace");
    }
}
