//! D3D12 设备、队列、Fence、命令列表与资源

use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_11_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::System::Threading::{CreateEventA, WaitForSingleObject};

use super::{command_list_type, dxgi_format, resource_state, to_hresult, Dx12};
use crate::gfx::backend::{
    DescriptorHeapInfo, DescriptorSlot, FenceWait, GpuCommand, HResult, NativeCommandList,
    NativeDevice, NativeFence, NativeQueue, NativeResource, QueueType, ResourceDesc,
    ResourceDimension,
};

/// D3D12 设备
pub struct Dx12Device {
    device: ID3D12Device,
    rtv_heap: Mutex<Option<ID3D12DescriptorHeap>>,
}

unsafe impl Send for Dx12Device {}
unsafe impl Sync for Dx12Device {}

impl Dx12Device {
    /// 在默认适配器上创建特性级别 11_0 的设备
    ///
    /// Debug 构建下会先尝试启用 D3D12 调试层。
    pub fn new() -> Result<Self, HResult> {
        unsafe {
            #[cfg(debug_assertions)]
            {
                let mut debug: Option<ID3D12Debug> = None;
                match D3D12GetDebugInterface(&mut debug) {
                    Ok(()) => {
                        if let Some(debug) = debug {
                            debug.EnableDebugLayer();
                            tracing::debug!("DX12 Debug Layer enabled");
                        }
                    }
                    Err(_) => tracing::warn!("Failed to enable DX12 Debug Layer"),
                }
            }

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(None, D3D_FEATURE_LEVEL_11_0, &mut device).map_err(to_hresult)?;
            let device = device.ok_or(HResult::E_FAIL)?;

            info!("D3D12 Device created");

            Ok(Self {
                device,
                rtv_heap: Mutex::new(None),
            })
        }
    }

    pub fn raw(&self) -> &ID3D12Device {
        &self.device
    }
}

impl NativeDevice<Dx12> for Dx12Device {
    fn create_queue(&self, queue_type: QueueType) -> Result<Dx12Queue, HResult> {
        let desc = D3D12_COMMAND_QUEUE_DESC {
            Type: command_list_type(queue_type),
            Flags: D3D12_COMMAND_QUEUE_FLAG_NONE,
            ..Default::default()
        };
        let queue: ID3D12CommandQueue =
            unsafe { self.device.CreateCommandQueue(&desc) }.map_err(to_hresult)?;
        Ok(Dx12Queue { queue })
    }

    fn create_fence(&self, initial_value: u64) -> Result<Dx12Fence, HResult> {
        unsafe {
            let fence: ID3D12Fence = self
                .device
                .CreateFence(initial_value, D3D12_FENCE_FLAG_NONE)
                .map_err(to_hresult)?;
            let event = CreateEventA(None, false, false, None).map_err(to_hresult)?;
            Ok(Dx12Fence {
                fence,
                event: Mutex::new(event),
            })
        }
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<Dx12CommandList, HResult> {
        let list_type = command_list_type(queue_type);
        unsafe {
            let allocator: ID3D12CommandAllocator = self
                .device
                .CreateCommandAllocator(list_type)
                .map_err(to_hresult)?;
            let list: ID3D12GraphicsCommandList = self
                .device
                .CreateCommandList(0, list_type, &allocator, None::<&ID3D12PipelineState>)
                .map_err(to_hresult)?;
            // 新建的列表处于打开状态
            list.Close().map_err(to_hresult)?;
            Ok(Dx12CommandList { allocator, list })
        }
    }

    fn create_committed_resource(&self, desc: &ResourceDesc) -> Result<Dx12Resource, HResult> {
        let heap_props = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let resource_desc = match desc.dimension {
            ResourceDimension::Buffer => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
                Width: desc.width,
                Height: 1,
                DepthOrArraySize: 1,
                MipLevels: 1,
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
                ..Default::default()
            },
            ResourceDimension::Texture2D => D3D12_RESOURCE_DESC {
                Dimension: D3D12_RESOURCE_DIMENSION_TEXTURE2D,
                Width: desc.width,
                Height: desc.height,
                DepthOrArraySize: 1,
                MipLevels: 1,
                Format: dxgi_format(desc.format),
                SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
                Layout: D3D12_TEXTURE_LAYOUT_UNKNOWN,
                Flags: D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET,
                ..Default::default()
            },
        };

        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device
                .CreateCommittedResource(
                    &heap_props,
                    D3D12_HEAP_FLAG_NONE,
                    &resource_desc,
                    D3D12_RESOURCE_STATE_COMMON,
                    None,
                    &mut resource,
                )
                .map_err(to_hresult)?;
        }
        resource.map(Dx12Resource::from_raw).ok_or(HResult::E_FAIL)
    }

    fn create_rtv_heap(&self, capacity: u32) -> Result<DescriptorHeapInfo, HResult> {
        let desc = D3D12_DESCRIPTOR_HEAP_DESC {
            NumDescriptors: capacity,
            Type: D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            Flags: D3D12_DESCRIPTOR_HEAP_FLAG_NONE,
            NodeMask: 0,
        };
        unsafe {
            let heap: ID3D12DescriptorHeap =
                self.device.CreateDescriptorHeap(&desc).map_err(to_hresult)?;
            let increment = self
                .device
                .GetDescriptorHandleIncrementSize(D3D12_DESCRIPTOR_HEAP_TYPE_RTV);
            let cpu_start = heap.GetCPUDescriptorHandleForHeapStart().ptr;
            *self.rtv_heap.lock() = Some(heap);
            Ok(DescriptorHeapInfo {
                cpu_start,
                increment,
                capacity,
            })
        }
    }

    fn create_render_target_view(&self, resource: &Dx12Resource, slot: DescriptorSlot) -> HResult {
        if self.rtv_heap.lock().is_none() {
            return HResult::DXGI_ERROR_INVALID_CALL;
        }
        let handle = D3D12_CPU_DESCRIPTOR_HANDLE { ptr: slot.ptr };
        unsafe {
            self.device
                .CreateRenderTargetView(&resource.resource, None, handle);
        }
        HResult::S_OK
    }

    fn removed_reason(&self) -> HResult {
        match unsafe { self.device.GetDeviceRemovedReason() } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }
}

/// D3D12 命令队列
pub struct Dx12Queue {
    queue: ID3D12CommandQueue,
}

unsafe impl Send for Dx12Queue {}
unsafe impl Sync for Dx12Queue {}

impl Dx12Queue {
    pub fn raw(&self) -> &ID3D12CommandQueue {
        &self.queue
    }
}

impl NativeQueue<Dx12> for Dx12Queue {
    fn execute(&self, lists: &[&Dx12CommandList]) {
        let lists: Vec<Option<ID3D12CommandList>> = lists
            .iter()
            .map(|list| Some(list.list.clone().into()))
            .collect();
        unsafe {
            self.queue.ExecuteCommandLists(&lists);
        }
    }

    fn signal(&self, fence: &Dx12Fence, value: u64) -> HResult {
        match unsafe { self.queue.Signal(&fence.fence, value) } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }
}

/// D3D12 Fence
///
/// 等待使用一个自动重置事件；事件由互斥锁保护，同一时刻只有一个等待者。
pub struct Dx12Fence {
    fence: ID3D12Fence,
    event: Mutex<HANDLE>,
}

unsafe impl Send for Dx12Fence {}
unsafe impl Sync for Dx12Fence {}

impl NativeFence for Dx12Fence {
    fn completed_value(&self) -> u64 {
        unsafe { self.fence.GetCompletedValue() }
    }

    fn wait(&self, value: u64, slice: Duration) -> FenceWait {
        if self.completed_value() >= value {
            return FenceWait::Reached;
        }

        let event = self.event.lock();
        let timeout_ms = slice.as_millis().min(u32::MAX as u128 - 1) as u32;
        unsafe {
            if let Err(err) = self.fence.SetEventOnCompletion(value, *event) {
                return FenceWait::Failed(to_hresult(err));
            }
            let status = WaitForSingleObject(*event, timeout_ms);
            if status == WAIT_OBJECT_0 || status == WAIT_TIMEOUT {
                // 事件可能来自此前超时等待的登记，以完成值为准
                if self.fence.GetCompletedValue() >= value {
                    FenceWait::Reached
                } else {
                    FenceWait::TimedOut
                }
            } else {
                FenceWait::Failed(HResult::E_FAIL)
            }
        }
    }
}

impl Drop for Dx12Fence {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(*self.event.get_mut());
        }
    }
}

/// D3D12 命令列表及其专属分配器
pub struct Dx12CommandList {
    allocator: ID3D12CommandAllocator,
    list: ID3D12GraphicsCommandList,
}

unsafe impl Send for Dx12CommandList {}
unsafe impl Sync for Dx12CommandList {}

impl Dx12CommandList {
    pub fn raw(&self) -> &ID3D12GraphicsCommandList {
        &self.list
    }

    fn transition(&self, resource: &Dx12Resource, before: D3D12_RESOURCE_STATES, after: D3D12_RESOURCE_STATES) {
        let barrier = D3D12_RESOURCE_BARRIER {
            Type: D3D12_RESOURCE_BARRIER_TYPE_TRANSITION,
            Flags: D3D12_RESOURCE_BARRIER_FLAG_NONE,
            Anonymous: D3D12_RESOURCE_BARRIER_0 {
                Transition: std::mem::ManuallyDrop::new(D3D12_RESOURCE_TRANSITION_BARRIER {
                    // 借用资源指针，不增加引用计数
                    pResource: unsafe { std::mem::transmute_copy(&resource.resource) },
                    Subresource: D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: before,
                    StateAfter: after,
                }),
            },
        };
        unsafe {
            self.list.ResourceBarrier(&[barrier]);
        }
    }
}

impl NativeCommandList<Dx12> for Dx12CommandList {
    fn reset_allocator(&self) -> HResult {
        match unsafe { self.allocator.Reset() } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }

    fn reopen(&self) -> HResult {
        match unsafe { self.list.Reset(&self.allocator, None::<&ID3D12PipelineState>) } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }

    fn record(&self, command: &GpuCommand<'_, Dx12>) {
        unsafe {
            match command {
                // PIX 标记不进入原生命令流
                GpuCommand::Marker(_) => {}
                GpuCommand::Barrier { resource, before, after } => {
                    self.transition(resource, resource_state(*before), resource_state(*after));
                }
                GpuCommand::ClearRenderTarget { view, color } => {
                    let handle = D3D12_CPU_DESCRIPTOR_HANDLE { ptr: view.ptr };
                    self.list.ClearRenderTargetView(handle, color, None);
                }
                GpuCommand::Draw { vertex_count, instance_count } => {
                    self.list.DrawInstanced(*vertex_count, *instance_count, 0, 0);
                }
                GpuCommand::DrawIndexed { index_count, instance_count } => {
                    self.list.DrawIndexedInstanced(*index_count, *instance_count, 0, 0, 0);
                }
                GpuCommand::Dispatch { x, y, z } => {
                    self.list.Dispatch(*x, *y, *z);
                }
                GpuCommand::CopyResource { dst, src } => {
                    self.list.CopyResource(&dst.resource, &src.resource);
                }
                GpuCommand::CopyBufferRegion {
                    dst,
                    dst_offset,
                    src,
                    src_offset,
                    size,
                } => {
                    self.list.CopyBufferRegion(
                        &dst.resource,
                        *dst_offset,
                        &src.resource,
                        *src_offset,
                        *size,
                    );
                }
            }
        }
    }

    fn close(&self) -> HResult {
        match unsafe { self.list.Close() } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }
}

/// D3D12 资源
pub struct Dx12Resource {
    resource: ID3D12Resource,
}

unsafe impl Send for Dx12Resource {}
unsafe impl Sync for Dx12Resource {}

impl Dx12Resource {
    pub(crate) fn from_raw(resource: ID3D12Resource) -> Self {
        Self { resource }
    }

    pub fn raw(&self) -> &ID3D12Resource {
        &self.resource
    }
}

impl NativeResource for Dx12Resource {}
