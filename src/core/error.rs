//! 错误处理模块
//!
//! 定义了提交层中使用的统一错误类型。
//!
//! # 设计原则
//!
//! - 创建失败携带底层 `HResult`，原样向调用者传播，从不自动重试
//! - 设备移除是整个上下文级别的致命错误
//! - 协议违背（例如在缓冲区仍存在时再次获取）使用断言，而不是可恢复错误

use std::fmt;

use crate::gfx::backend::{HResult, QueueType};

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, On12Error>;

/// DistOn12 的错误类型
#[derive(Debug)]
pub enum On12Error {
    /// 配置错误
    Config(ConfigError),

    /// 图形 API 错误
    Graphics(GraphicsError),

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphicsError {
    /// 设备创建失败
    DeviceCreation(HResult),

    /// 命令队列创建失败
    QueueCreation { queue: QueueType, hr: HResult },

    /// Fence 创建失败
    FenceCreation { queue: QueueType, hr: HResult },

    /// 命令列表或分配器创建失败
    CommandListCreation { queue: QueueType, hr: HResult },

    /// 命令分配器重置失败（致命）
    AllocatorReset { queue: QueueType, hr: HResult },

    /// 交换链创建失败
    SwapChainCreation(HResult),

    /// 资源或视图创建失败
    ResourceCreation { what: &'static str, hr: HResult },

    /// 描述符堆已耗尽
    DescriptorExhausted { capacity: u32 },

    /// 其他原生调用失败
    Native { op: &'static str, hr: HResult },

    /// 等待一个尚未提交到队列的 Fence 值
    FenceNotSubmitted { queue: QueueType, value: u64, last_signaled: u64 },

    /// 设备已移除或挂起
    DeviceRemoved(HResult),
}

impl GraphicsError {
    /// 该错误携带的原生结果码
    pub fn hresult(&self) -> HResult {
        match self {
            GraphicsError::DeviceCreation(hr)
            | GraphicsError::SwapChainCreation(hr)
            | GraphicsError::DeviceRemoved(hr) => *hr,
            GraphicsError::QueueCreation { hr, .. }
            | GraphicsError::FenceCreation { hr, .. }
            | GraphicsError::CommandListCreation { hr, .. }
            | GraphicsError::AllocatorReset { hr, .. }
            | GraphicsError::ResourceCreation { hr, .. }
            | GraphicsError::Native { hr, .. } => *hr,
            GraphicsError::DescriptorExhausted { .. } => HResult::E_OUTOFMEMORY,
            GraphicsError::FenceNotSubmitted { .. } => HResult::DXGI_ERROR_INVALID_CALL,
        }
    }

    /// 是否为设备移除类错误
    pub fn is_device_removed(&self) -> bool {
        matches!(self, GraphicsError::DeviceRemoved(_)) || self.hresult().is_device_removed()
    }
}

impl On12Error {
    /// 错误对应的原生结果码（非图形错误映射为 `E_FAIL`）
    pub fn hresult(&self) -> HResult {
        match self {
            On12Error::Graphics(e) => e.hresult(),
            _ => HResult::E_FAIL,
        }
    }

    /// 是否为设备移除类错误
    pub fn is_device_removed(&self) -> bool {
        matches!(self, On12Error::Graphics(e) if e.is_device_removed())
    }
}

impl fmt::Display for On12Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            On12Error::Config(e) => write!(f, "Configuration error: {}", e),
            On12Error::Graphics(e) => write!(f, "Graphics error: {}", e),
            On12Error::Io(e) => write!(f, "IO error: {}", e),
            On12Error::Log(msg) => write!(f, "Log error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for GraphicsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphicsError::DeviceCreation(hr) => write!(f, "Device creation failed: {}", hr),
            GraphicsError::QueueCreation { queue, hr } => {
                write!(f, "{:?} queue creation failed: {}", queue, hr)
            }
            GraphicsError::FenceCreation { queue, hr } => {
                write!(f, "{:?} fence creation failed: {}", queue, hr)
            }
            GraphicsError::CommandListCreation { queue, hr } => {
                write!(f, "{:?} command list creation failed: {}", queue, hr)
            }
            GraphicsError::AllocatorReset { queue, hr } => {
                write!(f, "{:?} command allocator reset failed: {}", queue, hr)
            }
            GraphicsError::SwapChainCreation(hr) => write!(f, "Swap chain creation failed: {}", hr),
            GraphicsError::ResourceCreation { what, hr } => {
                write!(f, "{} creation failed: {}", what, hr)
            }
            GraphicsError::DescriptorExhausted { capacity } => {
                write!(f, "Descriptor heap exhausted ({} slots)", capacity)
            }
            GraphicsError::Native { op, hr } => write!(f, "{} failed: {}", op, hr),
            GraphicsError::FenceNotSubmitted { queue, value, last_signaled } => write!(
                f,
                "{:?} fence value {} was never submitted (last signaled {})",
                queue, value, last_signaled
            ),
            GraphicsError::DeviceRemoved(hr) => write!(f, "Device removed: {}", hr),
        }
    }
}

impl std::error::Error for On12Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            On12Error::Io(e) => Some(e),
            On12Error::Config(e) => Some(e),
            On12Error::Graphics(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for GraphicsError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for On12Error {
    fn from(err: std::io::Error) -> Self {
        On12Error::Io(err)
    }
}

impl From<ConfigError> for On12Error {
    fn from(err: ConfigError) -> Self {
        On12Error::Config(err)
    }
}

impl From<GraphicsError> for On12Error {
    fn from(err: GraphicsError) -> Self {
        On12Error::Graphics(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_removed_classification() {
        let removed: On12Error = GraphicsError::DeviceRemoved(HResult::DXGI_ERROR_DEVICE_HUNG).into();
        assert!(removed.is_device_removed());
        assert_eq!(removed.hresult(), HResult::DXGI_ERROR_DEVICE_HUNG);

        let native: On12Error = GraphicsError::Native {
            op: "Signal",
            hr: HResult::DXGI_ERROR_DEVICE_REMOVED,
        }
        .into();
        assert!(native.is_device_removed());

        let reset: On12Error = GraphicsError::AllocatorReset {
            queue: QueueType::Graphics,
            hr: HResult::E_OUTOFMEMORY,
        }
        .into();
        assert!(!reset.is_device_removed());
        assert_eq!(reset.hresult(), HResult::E_OUTOFMEMORY);
    }

    #[test]
    fn test_display_carries_code() {
        let err = GraphicsError::SwapChainCreation(HResult::E_INVALIDARG);
        assert_eq!(err.to_string(), "Swap chain creation failed: 0x80070057");
    }
}
