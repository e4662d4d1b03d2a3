//! DistOn12 - D3D12 之上的 D3D11 即时上下文提交核心
//!
//! 在 D3D12 显式的命令分配器/命令列表/Fence 模型之上，提供 D3D11 风格的
//! 隐式即时上下文：命令列表池化与自动拆分、按队列的 Fence 同步、
//! 交换链缓冲区的获取/放弃协议以及基于 Fence 的延迟资源释放。
//!
//! # 模块结构
//!
//! - `core`: 配置、日志、错误处理
//! - `gfx`: 原生后端接口及其实现（软件 GPU、DX12）
//! - `renderer`: 提交核心（Fence、命令列表池、异步队列、设备、交换链、即时上下文）
//!
//! # 使用示例
//!
//! ```no_run
//! use std::time::Duration;
//! use dist_on12::gfx::backend::{Format, QueueType, SwapChainDesc, SwapEffect};
//! use dist_on12::gfx::headless::{ExecutionMode, Headless, HeadlessDevice, HeadlessFactory};
//! use dist_on12::renderer::{ContextDesc, Device, FlipModelPolicy, ImmediateContext};
//!
//! let gpu = HeadlessDevice::new(ExecutionMode::Threaded, Duration::from_micros(200));
//! let factory = HeadlessFactory::new(&gpu);
//! let device = Device::<Headless>::new(gpu, 16)?;
//! let mut context = ImmediateContext::new(device, &ContextDesc::default())?;
//! let desc = SwapChainDesc {
//!     width: 1280,
//!     height: 720,
//!     format: Format::B8G8R8A8Unorm,
//!     buffer_count: 3,
//!     swap_effect: SwapEffect::FlipDiscard,
//!     flags: 0,
//! };
//! context.create_swap_chain(&factory, &desc, &FlipModelPolicy)?;
//!
//! context.command_list(QueueType::Graphics)?.draw(3, 1);
//! let hr = context.present(1, 0);
//! assert!(hr.is_ok());
//! # Ok::<(), dist_on12::core::On12Error>(())
//! ```

pub mod core;
pub mod gfx;
pub mod renderer;
