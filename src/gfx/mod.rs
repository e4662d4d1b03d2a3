//! 原生图形后端模块
//!
//! - `backend`：提交核心依赖的原生接口（trait 与结果码）
//! - `headless`：软件 GPU，测试和演示程序使用
//! - `dx12`：基于 `windows` crate 的 Direct3D 12 实现（仅 Windows）

pub mod backend;
#[cfg(target_os = "windows")]
pub mod dx12;
pub mod headless;

pub use backend::{Backend, HResult, QueueType};
pub use headless::Headless;
#[cfg(target_os = "windows")]
pub use dx12::Dx12;
