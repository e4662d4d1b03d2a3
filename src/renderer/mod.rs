//! 提交核心模块
//!
//! 在 D3D12 的设备/队列/命令列表/Fence 之上模拟 D3D11 风格的即时上下文。
//! 所有组件对 `B: Backend` 泛型，底层原生实现位于 `gfx` 模块。
//!
//! # 组成
//!
//! - `sync`：每个队列的 Fence 与 `CommandListFenceSet`
//! - `command`：命令列表生命周期与命令列表池（含自动拆分）
//! - `queue`：带批处理的异步命令队列
//! - `device`：设备与资源释放堆
//! - `swap_chain`：交换链缓冲区的获取/放弃协议
//! - `context`：单录制线程的即时上下文门面

pub mod command;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod queue;
pub mod resource;
pub mod swap_chain;
pub mod sync;

pub use command::{AutoSplitPolicy, CommandList, CommandListPool, CommandListState, PoolStats};
pub use context::{ContextDesc, ImmediateContext};
pub use descriptor::{DescriptorAllocator, DescriptorHeapStats};
pub use device::{Device, ReleasePolicy, ReleasedObject};
pub use queue::AsyncCommandQueue;
pub use resource::{RenderTargetView, Resource, ResourceId};
pub use swap_chain::{
    BackBuffer, FlipModelPolicy, LegacyPolicy, NegotiationKind, SwapChain, SwapChainState,
    SwapEffectNegotiationPolicy,
};
pub use sync::{CommandListFenceSet, Fence, FenceStamp, FenceValue};
