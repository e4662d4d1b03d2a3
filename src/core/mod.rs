//! 核心功能模块
//!
//! 与具体原生后端无关的基础设施：配置、日志和错误处理。
//!
//! # 模块组织
//!
//! - `config`：配置管理，从 TOML 加载提交核心的参数
//! - `log`：日志系统，基于 `tracing` 的结构化日志
//! - `error`：错误处理，定义统一的错误类型

pub mod config;
pub mod error;
pub mod log;

pub use config::Config;
pub use error::{ConfigError, GraphicsError, On12Error, Result};
