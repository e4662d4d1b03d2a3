//! 交换链模块
//!
//! # 状态机
//!
//! ```text
//! Created → BuffersAcquired ⇄ BuffersForfeited → (Drop)
//! ```
//!
//! 后台缓冲区以托管 `Resource` 加一个渲染目标视图的形式持有。
//! 调整大小前必须先放弃全部缓冲区，并且引用它们的 GPU 工作必须已经退休；
//! 这一顺序由调用方（`ImmediateContext`）保证，这里只做断言。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::device::Device;
use super::queue::AsyncCommandQueue;
use super::resource::{RenderTargetView, Resource};
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{
    Backend, Format, HResult, ModeDesc, NativeFactory, NativeSwapChain, ResourceDesc,
    SwapChainDesc, SwapEffect,
};

/// 交换效果协商策略
///
/// 按顺序给出要尝试的描述，第一个创建成功的描述被采用。
pub trait SwapEffectNegotiationPolicy: Send + Sync {
    fn candidates(&self, requested: &SwapChainDesc) -> Vec<SwapChainDesc>;

    fn name(&self) -> &'static str;
}

/// 默认策略：优先翻转丢弃模型
///
/// 依次尝试：`FlipDiscard`（缓冲区至少 2 个）；调用方要求 `Sequential` 时
/// 退回 `FlipSequential`，否则退回调用方的原始描述。
#[derive(Debug, Clone, Copy, Default)]
pub struct FlipModelPolicy;

impl SwapEffectNegotiationPolicy for FlipModelPolicy {
    fn candidates(&self, requested: &SwapChainDesc) -> Vec<SwapChainDesc> {
        let flip = SwapChainDesc {
            swap_effect: SwapEffect::FlipDiscard,
            buffer_count: requested.buffer_count.max(2),
            ..*requested
        };
        let fallback = if requested.swap_effect == SwapEffect::Sequential {
            SwapChainDesc {
                swap_effect: SwapEffect::FlipSequential,
                buffer_count: requested.buffer_count.max(2),
                ..*requested
            }
        } else {
            *requested
        };

        let mut candidates = vec![flip];
        if fallback != flip {
            candidates.push(fallback);
        }
        candidates
    }

    fn name(&self) -> &'static str {
        "flip_model"
    }
}

/// 只使用调用方的描述，不做任何升级
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyPolicy;

impl SwapEffectNegotiationPolicy for LegacyPolicy {
    fn candidates(&self, requested: &SwapChainDesc) -> Vec<SwapChainDesc> {
        vec![*requested]
    }

    fn name(&self) -> &'static str {
        "legacy"
    }
}

/// 配置中选择的协商策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationKind {
    #[default]
    FlipModel,
    Legacy,
}

impl NegotiationKind {
    pub fn policy(self) -> Box<dyn SwapEffectNegotiationPolicy> {
        match self {
            NegotiationKind::FlipModel => Box::new(FlipModelPolicy),
            NegotiationKind::Legacy => Box::new(LegacyPolicy),
        }
    }
}

/// 交换链状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapChainState {
    /// 已创建，尚未获取缓冲区
    Created,
    BuffersAcquired,
    BuffersForfeited,
}

/// 一个后台缓冲区及其视图
pub struct BackBuffer<B: Backend> {
    pub resource: Resource<B>,
    pub view: RenderTargetView<B>,
}

/// 托管交换链
pub struct SwapChain<B: Backend> {
    device: Arc<Device<B>>,
    native: B::SwapChain,
    desc: SwapChainDesc,
    state: SwapChainState,
    back_buffers: Vec<BackBuffer<B>>,
}

impl<B: Backend> SwapChain<B> {
    /// 协商交换效果、创建原生交换链并获取缓冲区
    ///
    /// 所有候选描述都失败时返回 `SwapChainCreation`，不会重试。
    pub fn create(
        device: &Arc<Device<B>>,
        queue: &AsyncCommandQueue<B>,
        factory: &B::Factory,
        requested: &SwapChainDesc,
        policy: &dyn SwapEffectNegotiationPolicy,
    ) -> Result<Self> {
        let mut last_error = HResult::E_FAIL;
        let mut created = None;
        for candidate in policy.candidates(requested) {
            match factory.create_swap_chain(queue.native(), &candidate) {
                Ok(native) => {
                    created = Some((native, candidate));
                    break;
                }
                Err(hr) => {
                    debug!(effect = ?candidate.swap_effect, %hr, "Swap effect rejected");
                    last_error = hr;
                }
            }
        }
        let Some((native, desc)) = created else {
            error!(policy = policy.name(), hr = %last_error, "Swap chain creation failed");
            return Err(GraphicsError::SwapChainCreation(last_error).into());
        };

        info!(
            policy = policy.name(),
            effect = ?desc.swap_effect,
            buffers = desc.buffer_count,
            width = desc.width,
            height = desc.height,
            "Swap chain created"
        );
        let mut swap_chain = Self {
            device: Arc::clone(device),
            native,
            desc,
            state: SwapChainState::Created,
            back_buffers: Vec::new(),
        };
        swap_chain.acquire_buffers()?;
        Ok(swap_chain)
    }

    pub fn native(&self) -> &B::SwapChain {
        &self.native
    }

    /// 协商后的描述（调整大小后同步更新）
    pub fn desc(&self) -> &SwapChainDesc {
        &self.desc
    }

    pub fn state(&self) -> SwapChainState {
        self.state
    }

    pub fn back_buffers(&self) -> &[BackBuffer<B>] {
        &self.back_buffers
    }

    /// 从原生交换链获取所有后台缓冲区并创建视图
    pub fn acquire_buffers(&mut self) -> Result<()> {
        debug_assert!(self.back_buffers.is_empty(), "back buffers acquired twice");
        if !self.back_buffers.is_empty() {
            warn!(count = self.back_buffers.len(), "Acquiring buffers while buffers are still held");
            self.back_buffers.clear();
        }

        let desc = ResourceDesc::texture_2d(self.desc.width, self.desc.height, self.desc.format);
        let mut buffers = Vec::with_capacity(self.desc.buffer_count as usize);
        for index in 0..self.desc.buffer_count {
            let native = self
                .native
                .get_buffer(index)
                .map_err(|hr| GraphicsError::Native { op: "GetBuffer", hr })?;
            let resource = self
                .device
                .wrap_resource(native, desc.clone(), Some(format!("Back buffer {}", index)));
            let view = self.device.create_render_target_view(&resource)?;
            buffers.push(BackBuffer { resource, view });
        }
        self.back_buffers = buffers;
        self.state = SwapChainState::BuffersAcquired;
        debug!(count = self.back_buffers.len(), "Back buffers acquired");
        Ok(())
    }

    /// 放弃所有缓冲区和视图引用
    pub fn forfeit_buffers(&mut self) {
        let count = self.back_buffers.len();
        self.back_buffers.clear();
        self.state = SwapChainState::BuffersForfeited;
        debug!(count, "Back buffers forfeited");
    }

    /// 先 flush 呈现队列，再调用原生 Present；原样返回原生结果码
    pub fn present(&self, queue: &mut AsyncCommandQueue<B>, sync_interval: u32, flags: u32) -> HResult {
        if let Err(e) = queue.flush(None) {
            error!(error = %e, "Flush before present failed");
            return e.hresult();
        }
        self.native.present(sync_interval, flags)
    }

    /// 调整缓冲区大小；成功后重新获取缓冲区
    ///
    /// 调用前缓冲区必须已放弃。参数为 0（或 `Format::Unknown`）表示保持原值。
    pub fn resize_buffers(
        &mut self,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> HResult {
        debug_assert_ne!(
            self.state,
            SwapChainState::BuffersAcquired,
            "buffers must be forfeited before resizing"
        );
        if self.state == SwapChainState::BuffersAcquired {
            warn!("Resizing while back buffers are still acquired, forfeiting first");
            self.forfeit_buffers();
        }

        let hr = self
            .native
            .resize_buffers(buffer_count, width, height, format, flags);
        if hr.is_err() {
            warn!(%hr, buffer_count, width, height, "ResizeBuffers failed");
            return hr;
        }

        if buffer_count != 0 {
            self.desc.buffer_count = buffer_count;
        }
        if width != 0 {
            self.desc.width = width;
        }
        if height != 0 {
            self.desc.height = height;
        }
        if format != Format::Unknown {
            self.desc.format = format;
        }
        self.desc.flags = flags;
        info!(
            buffers = self.desc.buffer_count,
            width = self.desc.width,
            height = self.desc.height,
            "Swap chain resized"
        );

        if let Err(e) = self.acquire_buffers() {
            error!(error = %e, "Reacquiring back buffers failed");
            return e.hresult();
        }
        hr
    }

    pub fn resize_target(&self, mode: &ModeDesc) -> HResult {
        self.native.resize_target(mode)
    }

    /// 当前后台缓冲区索引；仅在持有缓冲区时有效
    pub fn current_back_buffer_index(&self) -> Option<u32> {
        if self.state != SwapChainState::BuffersAcquired {
            return None;
        }
        Some(self.native.current_back_buffer_index())
    }

    /// 当前后台缓冲区；仅在持有缓冲区时有效
    pub fn current_back_buffer(&self) -> Option<&BackBuffer<B>> {
        self.current_back_buffer_index()
            .and_then(|index| self.back_buffers.get(index as usize))
    }
}

impl<B: Backend> Drop for SwapChain<B> {
    fn drop(&mut self) {
        // 先于原生交换链放弃缓冲区
        if self.state == SwapChainState::BuffersAcquired {
            self.forfeit_buffers();
        }
    }
}
