//! DirectX 12 原生后端
//!
//! 通过 `windows` crate 调用 D3D12/DXGI，实现 `gfx::backend` 中的原生接口。
//!
//! # 主要组件
//!
//! - `Dx12Device`：D3D12 设备与 RTV 描述符堆
//! - `Dx12Queue` / `Dx12Fence`：命令队列与 Fence（事件 + 有界等待）
//! - `Dx12CommandList`：命令列表及其专属分配器
//! - `Dx12Factory` / `Dx12SwapChain`：DXGI 工厂与 `IDXGISwapChain3`
//!
//! COM 接口不是 `Send`/`Sync`，这里与提交层约定：所有访问都经过
//! 上层的互斥（即时上下文的独占借用），因此为包装类型手动实现 `Send`/`Sync`。

mod device;
mod swap_chain;

use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::*;

use crate::gfx::backend::{Backend, Format, HResult, QueueType, ResourceState};

pub use device::{Dx12CommandList, Dx12Device, Dx12Fence, Dx12Queue, Dx12Resource};
pub use swap_chain::{Dx12Factory, Dx12SwapChain};

/// DirectX 12 后端
pub struct Dx12;

impl Backend for Dx12 {
    type Device = Dx12Device;
    type Queue = Dx12Queue;
    type Fence = Dx12Fence;
    type CommandList = Dx12CommandList;
    type Resource = Dx12Resource;
    type SwapChain = Dx12SwapChain;
    type Factory = Dx12Factory;

    fn name() -> &'static str {
        "DirectX 12"
    }
}

/// `windows::core::Error` 转换为结果码
pub(crate) fn to_hresult(err: windows::core::Error) -> HResult {
    HResult(err.code().0)
}

pub(crate) fn dxgi_format(format: Format) -> DXGI_FORMAT {
    match format {
        Format::Unknown => DXGI_FORMAT_UNKNOWN,
        Format::R8G8B8A8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::B8G8R8A8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::R10G10B10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        Format::R16G16B16A16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
    }
}

pub(crate) fn command_list_type(queue_type: QueueType) -> D3D12_COMMAND_LIST_TYPE {
    match queue_type {
        QueueType::Graphics => D3D12_COMMAND_LIST_TYPE_DIRECT,
        QueueType::Copy => D3D12_COMMAND_LIST_TYPE_COPY,
    }
}

pub(crate) fn resource_state(state: ResourceState) -> D3D12_RESOURCE_STATES {
    match state {
        ResourceState::Common => D3D12_RESOURCE_STATE_COMMON,
        ResourceState::Present => D3D12_RESOURCE_STATE_PRESENT,
        ResourceState::RenderTarget => D3D12_RESOURCE_STATE_RENDER_TARGET,
        ResourceState::ShaderResource => D3D12_RESOURCE_STATE_ALL_SHADER_RESOURCE,
        ResourceState::CopySource => D3D12_RESOURCE_STATE_COPY_SOURCE,
        ResourceState::CopyDest => D3D12_RESOURCE_STATE_COPY_DEST,
    }
}
