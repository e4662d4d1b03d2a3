//! 原生图形 API 的统一抽象接口
//!
//! 提交层只通过本模块定义的 trait 与原生 API 打交道：设备、队列、Fence、
//! 命令列表（含其专属分配器）、资源、交换链和工厂。
//! 具体实现位于 `gfx::headless`（软件 GPU）和 `gfx::dx12`（仅 Windows）。
//!
//! 所有可能失败的原生调用都返回 `HResult`，创建类调用返回 `Result<T, HResult>`。

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 原生结果码
///
/// 与 Win32 `HRESULT` 同构：非负为成功，负数为失败。
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HResult(pub i32);

impl HResult {
    pub const S_OK: HResult = HResult(0);
    pub const E_FAIL: HResult = HResult(0x8000_4005_u32 as i32);
    pub const E_OUTOFMEMORY: HResult = HResult(0x8007_000E_u32 as i32);
    pub const E_INVALIDARG: HResult = HResult(0x8007_0057_u32 as i32);
    pub const DXGI_ERROR_INVALID_CALL: HResult = HResult(0x887A_0001_u32 as i32);
    pub const DXGI_ERROR_UNSUPPORTED: HResult = HResult(0x887A_0004_u32 as i32);
    pub const DXGI_ERROR_DEVICE_REMOVED: HResult = HResult(0x887A_0005_u32 as i32);
    pub const DXGI_ERROR_DEVICE_HUNG: HResult = HResult(0x887A_0006_u32 as i32);
    pub const DXGI_ERROR_DEVICE_RESET: HResult = HResult(0x887A_0007_u32 as i32);
    pub const DXGI_STATUS_OCCLUDED: HResult = HResult(0x087A_0001);

    /// 是否成功（包括 `DXGI_STATUS_*` 这类成功状态码）
    pub fn is_ok(self) -> bool {
        self.0 >= 0
    }

    /// 是否失败
    pub fn is_err(self) -> bool {
        self.0 < 0
    }

    /// 是否表示设备已丢失
    pub fn is_device_removed(self) -> bool {
        matches!(
            self,
            HResult::DXGI_ERROR_DEVICE_REMOVED
                | HResult::DXGI_ERROR_DEVICE_HUNG
                | HResult::DXGI_ERROR_DEVICE_RESET
        )
    }

    /// 转换为 `Result`
    pub fn ok(self) -> std::result::Result<(), HResult> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0 as u32)
    }
}

impl fmt::Debug for HResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HResult({})", self)
    }
}

/// 命令队列类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    /// 图形队列（Direct）
    Graphics,
    /// 复制队列
    Copy,
}

impl QueueType {
    pub const ALL: [QueueType; 2] = [QueueType::Graphics, QueueType::Copy];

    /// 在按队列类型索引的数组中的位置
    pub fn index(self) -> usize {
        match self {
            QueueType::Graphics => 0,
            QueueType::Copy => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            QueueType::Graphics => "graphics",
            QueueType::Copy => "copy",
        }
    }
}

/// 像素格式（只列出交换链需要的格式）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// 调整大小时表示"保持原格式"
    Unknown,
    #[serde(rename = "r8g8b8a8_unorm")]
    R8G8B8A8Unorm,
    #[serde(rename = "b8g8r8a8_unorm")]
    B8G8R8A8Unorm,
    #[serde(rename = "r10g10b10a2_unorm")]
    R10G10B10A2Unorm,
    #[serde(rename = "r16g16b16a16_float")]
    R16G16B16A16Float,
}

/// 交换效果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapEffect {
    /// 传统 blt 丢弃模式
    Discard,
    /// 传统 blt 顺序模式
    Sequential,
    /// 翻转顺序模式
    FlipSequential,
    /// 翻转丢弃模式
    FlipDiscard,
}

impl SwapEffect {
    /// 翻转模型至少需要两个缓冲区
    pub fn is_flip_model(self) -> bool {
        matches!(self, SwapEffect::FlipSequential | SwapEffect::FlipDiscard)
    }
}

/// 交换链描述
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapChainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: u32,
    pub swap_effect: SwapEffect,
    pub flags: u32,
}

/// 显示模式描述（`ResizeTarget` 使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub refresh_rate: (u32, u32),
}

/// 资源维度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceDimension {
    Buffer,
    Texture2D,
}

/// 资源描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub width: u64,
    pub height: u32,
    pub format: Format,
}

impl ResourceDesc {
    pub fn buffer(size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            width: size,
            height: 1,
            format: Format::Unknown,
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            width: width as u64,
            height,
            format,
        }
    }
}

/// 资源状态（屏障使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    ShaderResource,
    CopySource,
    CopyDest,
}

/// CPU 描述符句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSlot {
    /// 句柄指针值
    pub ptr: usize,
    /// 在堆中的索引
    pub index: u32,
}

/// 描述符堆信息
#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapInfo {
    pub cpu_start: usize,
    pub increment: u32,
    pub capacity: u32,
}

/// 录制到原生命令列表中的命令
///
/// 这是 D3D11 兼容层翻译后的最小命令集合。
pub enum GpuCommand<'a, B: Backend> {
    /// 调试标记，不算作"已使用"
    Marker(&'a str),
    Barrier {
        resource: &'a B::Resource,
        before: ResourceState,
        after: ResourceState,
    },
    ClearRenderTarget {
        view: DescriptorSlot,
        color: [f32; 4],
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyResource {
        dst: &'a B::Resource,
        src: &'a B::Resource,
    },
    CopyBufferRegion {
        dst: &'a B::Resource,
        dst_offset: u64,
        src: &'a B::Resource,
        src_offset: u64,
        size: u64,
    },
}

impl<B: Backend> GpuCommand<'_, B> {
    /// 是否是纯标记命令
    pub fn is_marker(&self) -> bool {
        matches!(self, GpuCommand::Marker(_))
    }

    /// 命令在原生命令流中的近似编码大小（字节），用于自动拆分
    pub fn encoded_size(&self) -> usize {
        match self {
            GpuCommand::Marker(text) => 16 + text.len(),
            GpuCommand::Barrier { .. } => 40,
            GpuCommand::ClearRenderTarget { .. } => 32,
            GpuCommand::Draw { .. } | GpuCommand::DrawIndexed { .. } => 24,
            GpuCommand::Dispatch { .. } => 16,
            GpuCommand::CopyResource { .. } => 24,
            GpuCommand::CopyBufferRegion { .. } => 48,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            GpuCommand::Marker(_) => "Marker",
            GpuCommand::Barrier { .. } => "Barrier",
            GpuCommand::ClearRenderTarget { .. } => "ClearRenderTarget",
            GpuCommand::Draw { .. } => "Draw",
            GpuCommand::DrawIndexed { .. } => "DrawIndexed",
            GpuCommand::Dispatch { .. } => "Dispatch",
            GpuCommand::CopyResource { .. } => "CopyResource",
            GpuCommand::CopyBufferRegion { .. } => "CopyBufferRegion",
        }
    }
}

/// 一次有界 Fence 等待的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    /// 已到达目标值
    Reached,
    /// 本次等待片段内未到达
    TimedOut,
    /// 原生等待失败
    Failed(HResult),
}

/// 原生后端
///
/// 用关联类型把一组相互配合的原生对象绑定在一起，
/// 上层组件对 `B: Backend` 泛型，不需要任何向下转型。
pub trait Backend: Sized + Send + Sync + 'static {
    type Device: NativeDevice<Self>;
    type Queue: NativeQueue<Self>;
    type Fence: NativeFence;
    type CommandList: NativeCommandList<Self>;
    type Resource: NativeResource;
    type SwapChain: NativeSwapChain<Self>;
    type Factory: NativeFactory<Self>;

    /// 后端名称，用于日志
    fn name() -> &'static str;
}

/// 原生设备
pub trait NativeDevice<B: Backend>: Send + Sync {
    fn create_queue(&self, queue_type: QueueType) -> Result<B::Queue, HResult>;

    fn create_fence(&self, initial_value: u64) -> Result<B::Fence, HResult>;

    /// 创建一个处于关闭状态的命令列表及其专属分配器
    fn create_command_list(&self, queue_type: QueueType) -> Result<B::CommandList, HResult>;

    fn create_committed_resource(&self, desc: &ResourceDesc) -> Result<B::Resource, HResult>;

    /// 创建 CPU 侧的 RTV 描述符堆
    fn create_rtv_heap(&self, capacity: u32) -> Result<DescriptorHeapInfo, HResult>;

    /// 在指定描述符槽写入渲染目标视图
    fn create_render_target_view(&self, resource: &B::Resource, slot: DescriptorSlot) -> HResult;

    /// 设备移除原因；设备正常时返回 `S_OK`
    fn removed_reason(&self) -> HResult;
}

/// 原生命令队列
pub trait NativeQueue<B: Backend>: Send + Sync {
    /// 按顺序提交一批已关闭的命令列表
    fn execute(&self, lists: &[&B::CommandList]);

    /// 在队列中所有已提交工作之后把 Fence 置为 `value`
    fn signal(&self, fence: &B::Fence, value: u64) -> HResult;
}

/// 原生 Fence
pub trait NativeFence: Send + Sync {
    /// GPU 已完成的值
    fn completed_value(&self) -> u64;

    /// 阻塞最多 `slice` 时长等待 `value`
    fn wait(&self, value: u64, slice: Duration) -> FenceWait;
}

/// 原生命令列表（含专属分配器）
pub trait NativeCommandList<B: Backend>: Send + Sync {
    /// 重置专属分配器；GPU 仍在读取时调用属于协议错误
    fn reset_allocator(&self) -> HResult;

    /// 在刚重置的分配器上重新打开列表
    fn reopen(&self) -> HResult;

    fn record(&self, command: &GpuCommand<'_, B>);

    fn close(&self) -> HResult;
}

/// 原生资源；最后一个句柄释放时销毁
pub trait NativeResource: Send + Sync {}

/// 原生交换链
pub trait NativeSwapChain<B: Backend>: Send + Sync {
    fn present(&self, sync_interval: u32, flags: u32) -> HResult;

    fn resize_buffers(
        &self,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> HResult;

    fn resize_target(&self, mode: &ModeDesc) -> HResult;

    fn get_buffer(&self, index: u32) -> Result<B::Resource, HResult>;

    fn current_back_buffer_index(&self) -> u32;
}

/// 原生交换链工厂
pub trait NativeFactory<B: Backend>: Send + Sync {
    fn create_swap_chain(&self, queue: &B::Queue, desc: &SwapChainDesc) -> Result<B::SwapChain, HResult>;
}
