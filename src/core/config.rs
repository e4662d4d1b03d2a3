//! 配置管理模块
//!
//! 从 TOML 配置文件加载提交核心的参数，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [backend]
//! kind = "headless"          # 或 "dx12"（仅 Windows）
//! execution_mode = "threaded" # immediate, manual, threaded
//! latency_us = 500
//!
//! [submission]
//! max_commands_per_list = 2048
//! max_bytes_per_list = 1048576
//! initial_command_lists = 2
//! max_frame_latency = 2
//! fence_wait_slice_ms = 10
//! rtv_heap_capacity = 64
//!
//! [swap_chain]
//! width = 1280
//! height = 720
//! format = "b8g8r8a8_unorm"
//! buffer_count = 3
//! swap_effect = "flip_discard"
//! negotiation = "flip_model"
//! sync_interval = 1
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{ConfigError, Result};
use crate::gfx::backend::{Format, SwapChainDesc, SwapEffect};
use crate::gfx::headless::ExecutionMode;
use crate::renderer::{AutoSplitPolicy, ContextDesc, NegotiationKind};

/// 运行配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 原生后端配置
    #[serde(default)]
    pub backend: BackendConfig,

    /// 命令提交配置
    #[serde(default)]
    pub submission: SubmissionConfig,

    /// 交换链配置
    #[serde(default)]
    pub swap_chain: SwapChainConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 原生后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 软件 GPU
    Headless,
    /// DirectX 12（仅 Windows）
    Dx12,
}

/// 原生后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub kind: BackendKind,

    /// 软件 GPU 的执行模式
    #[serde(default = "default_execution_mode")]
    pub execution_mode: ExecutionMode,

    /// 软件 GPU 在线程模式下每批命令的模拟执行时间（微秒）
    #[serde(default = "default_latency_us")]
    pub latency_us: u64,
}

/// 命令提交配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// 自动拆分：单个列表的最大命令数（0 表示不限制）
    #[serde(default = "default_max_commands")]
    pub max_commands_per_list: usize,

    /// 自动拆分：单个列表的最大编码字节数（0 表示不限制）
    #[serde(default = "default_max_bytes")]
    pub max_bytes_per_list: usize,

    /// 每个池预先创建的命令列表数量
    #[serde(default = "default_initial_lists")]
    pub initial_command_lists: usize,

    /// 允许同时在 GPU 上的帧数
    #[serde(default = "default_frame_latency")]
    pub max_frame_latency: u32,

    /// 原生 Fence 等待时间片（毫秒）
    #[serde(default = "default_wait_slice")]
    pub fence_wait_slice_ms: u64,

    /// RTV 描述符堆容量
    #[serde(default = "default_rtv_capacity")]
    pub rtv_heap_capacity: u32,
}

/// 交换链配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapChainConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_format")]
    pub format: Format,

    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,

    /// 请求的交换效果（协商前）
    #[serde(default = "default_swap_effect")]
    pub swap_effect: SwapEffect,

    /// 交换效果协商策略
    #[serde(default)]
    pub negotiation: NegotiationKind,

    #[serde(default = "default_sync_interval")]
    pub sync_interval: u32,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend_kind() -> BackendKind { BackendKind::Headless }
fn default_execution_mode() -> ExecutionMode { ExecutionMode::Threaded }
fn default_latency_us() -> u64 { 500 }
fn default_max_commands() -> usize { AutoSplitPolicy::default().max_commands }
fn default_max_bytes() -> usize { AutoSplitPolicy::default().max_bytes }
fn default_initial_lists() -> usize { 2 }
fn default_frame_latency() -> u32 { 2 }
fn default_wait_slice() -> u64 { 10 }
fn default_rtv_capacity() -> u32 { 64 }
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_format() -> Format { Format::B8G8R8A8Unorm }
fn default_buffer_count() -> u32 { 3 }
fn default_swap_effect() -> SwapEffect { SwapEffect::FlipDiscard }
fn default_sync_interval() -> u32 { 1 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "dist_on12.log".to_string() }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            execution_mode: default_execution_mode(),
            latency_us: default_latency_us(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            max_commands_per_list: default_max_commands(),
            max_bytes_per_list: default_max_bytes(),
            initial_command_lists: default_initial_lists(),
            max_frame_latency: default_frame_latency(),
            fence_wait_slice_ms: default_wait_slice(),
            rtv_heap_capacity: default_rtv_capacity(),
        }
    }
}

impl Default for SwapChainConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            format: default_format(),
            buffer_count: default_buffer_count(),
            swap_effect: default_swap_effect(),
            negotiation: NegotiationKind::default(),
            sync_interval: default_sync_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl BackendConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_micros(self.latency_us)
    }
}

impl SubmissionConfig {
    pub fn split_policy(&self) -> AutoSplitPolicy {
        AutoSplitPolicy {
            max_commands: self.max_commands_per_list,
            max_bytes: self.max_bytes_per_list,
        }
    }

    /// 转换为即时上下文的创建参数
    pub fn context_desc(&self) -> ContextDesc {
        ContextDesc {
            split: self.split_policy(),
            initial_command_lists: self.initial_command_lists,
            max_frame_latency: self.max_frame_latency,
            fence_wait_slice: Duration::from_millis(self.fence_wait_slice_ms),
        }
    }
}

impl SwapChainConfig {
    /// 请求的交换链描述（协商前）
    pub fn desc(&self) -> SwapChainDesc {
        SwapChainDesc {
            width: self.width,
            height: self.height,
            format: self.format,
            buffer_count: self.buffer_count,
            swap_effect: self.swap_effect,
            flags: 0,
        }
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或无法解析则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12` / `--headless`: 选择原生后端
    /// - `--mode <immediate|manual|threaded>`: 软件 GPU 执行模式
    /// - `--width <value>` / `--height <value>`: 交换链尺寸
    /// - `--buffers <value>`: 交换链缓冲区数量
    /// - `--legacy-swap`: 使用不升级交换效果的协商策略
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        let value_of = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .and_then(|idx| args.get(idx + 1))
                .map(String::as_str)
        };

        if args.iter().any(|a| a == "--dx12") {
            self.backend.kind = BackendKind::Dx12;
        }
        if args.iter().any(|a| a == "--headless") {
            self.backend.kind = BackendKind::Headless;
        }
        if args.iter().any(|a| a == "--legacy-swap") {
            self.swap_chain.negotiation = NegotiationKind::Legacy;
        }

        match value_of("--mode") {
            Some("immediate") => self.backend.execution_mode = ExecutionMode::Immediate,
            Some("manual") => self.backend.execution_mode = ExecutionMode::Manual,
            Some("threaded") => self.backend.execution_mode = ExecutionMode::Threaded,
            _ => {}
        }
        if let Some(width) = value_of("--width").and_then(|v| v.parse().ok()) {
            self.swap_chain.width = width;
        }
        if let Some(height) = value_of("--height").and_then(|v| v.parse().ok()) {
            self.swap_chain.height = height;
        }
        if let Some(buffers) = value_of("--buffers").and_then(|v| v.parse().ok()) {
            self.swap_chain.buffer_count = buffers;
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        fn invalid(field: &str, reason: &str) -> Result<()> {
            Err(ConfigError::InvalidValue {
                field: field.to_string(),
                reason: reason.to_string(),
            }
            .into())
        }

        let swap = &self.swap_chain;
        if swap.width == 0 || swap.height == 0 {
            return invalid("swap_chain.width/height", "Swap chain dimensions must be greater than 0");
        }
        if !(1..=16).contains(&swap.buffer_count) {
            return invalid("swap_chain.buffer_count", "Buffer count must be between 1 and 16");
        }
        if swap.format == Format::Unknown {
            return invalid("swap_chain.format", "Format must be specified");
        }
        if swap.sync_interval > 4 {
            return invalid("swap_chain.sync_interval", "Sync interval must be between 0 and 4");
        }

        let submission = &self.submission;
        if !(1..=16).contains(&submission.max_frame_latency) {
            return invalid("submission.max_frame_latency", "Frame latency must be between 1 and 16");
        }
        if submission.fence_wait_slice_ms == 0 {
            return invalid("submission.fence_wait_slice_ms", "Wait slice must be greater than 0");
        }
        if submission.rtv_heap_capacity < swap.buffer_count.max(2) {
            return invalid(
                "submission.rtv_heap_capacity",
                "RTV heap must hold at least one view per back buffer",
            );
        }

        if self.backend.kind == BackendKind::Dx12 && !cfg!(target_os = "windows") {
            return invalid("backend.kind", "DX12 backend is only available on Windows");
        }
        Ok(())
    }
}

impl BackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Headless => "Headless",
            BackendKind::Dx12 => "DirectX 12",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.swap_chain.width, 1280);
        assert_eq!(config.swap_chain.buffer_count, 3);
        assert_eq!(config.backend.kind, BackendKind::Headless);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [submission]
            max_commands_per_list = 64

            [swap_chain]
            swap_effect = "sequential"
            negotiation = "legacy"
            "#,
        )
        .unwrap();
        assert_eq!(config.submission.max_commands_per_list, 64);
        assert_eq!(config.submission.max_frame_latency, 2);
        assert_eq!(config.swap_chain.swap_effect, SwapEffect::Sequential);
        assert_eq!(config.swap_chain.negotiation, NegotiationKind::Legacy);
        assert_eq!(config.backend.execution_mode, ExecutionMode::Threaded);
        assert_eq!(config.submission.split_policy().max_commands, 64);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.swap_chain.width = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.submission.rtv_heap_capacity = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.submission.max_frame_latency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["demo", "--mode", "manual", "--width", "640", "--buffers", "2", "--legacy-swap"]);
        assert_eq!(config.backend.execution_mode, ExecutionMode::Manual);
        assert_eq!(config.swap_chain.width, 640);
        assert_eq!(config.swap_chain.buffer_count, 2);
        assert_eq!(config.swap_chain.negotiation, NegotiationKind::Legacy);
        assert_eq!(config.submission.context_desc().fence_wait_slice, Duration::from_millis(10));
    }

    #[test]
    fn test_round_trip_through_file() {
        let path = std::env::temp_dir().join(format!("dist_on12_config_{}.toml", std::process::id()));
        let mut config = Config::default();
        config.swap_chain.sync_interval = 0;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.swap_chain.sync_interval, 0);
        std::fs::remove_file(&path).unwrap();
    }
}
