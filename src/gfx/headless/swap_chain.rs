//! 软件 GPU 的交换链与工厂

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::device::{GpuShared, HeadlessDevice, HeadlessQueue, HeadlessResource};
use super::{Headless, NativeCall};
use crate::gfx::backend::{
    Format, HResult, ModeDesc, NativeFactory, NativeSwapChain, ResourceDesc, SwapChainDesc,
    SwapEffect,
};

/// 软件交换链工厂
pub struct HeadlessFactory {
    shared: Arc<GpuShared>,
    rejected: Mutex<Vec<SwapEffect>>,
    failure: Mutex<Option<HResult>>,
}

impl HeadlessFactory {
    pub fn new(device: &HeadlessDevice) -> Self {
        Self {
            shared: Arc::clone(&device.shared),
            rejected: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
        }
    }

    /// 模拟不支持某种交换效果的平台
    pub fn reject_swap_effect(&self, effect: SwapEffect) {
        self.rejected.lock().push(effect);
    }

    /// 之后所有创建调用都返回 `hr`（`None` 恢复正常）
    pub fn set_failure(&self, hr: Option<HResult>) {
        *self.failure.lock() = hr;
    }
}

impl NativeFactory<Headless> for HeadlessFactory {
    fn create_swap_chain(
        &self,
        _queue: &HeadlessQueue,
        desc: &SwapChainDesc,
    ) -> Result<HeadlessSwapChain, HResult> {
        if let Some(hr) = *self.failure.lock() {
            return Err(hr);
        }
        if self.rejected.lock().contains(&desc.swap_effect) {
            return Err(HResult::DXGI_ERROR_UNSUPPORTED);
        }
        if desc.buffer_count == 0
            || (desc.swap_effect.is_flip_model() && desc.buffer_count < 2)
            || desc.format == Format::Unknown
        {
            return Err(HResult::DXGI_ERROR_INVALID_CALL);
        }

        self.shared.log.push(NativeCall::CreateSwapChain {
            swap_effect: desc.swap_effect,
            buffer_count: desc.buffer_count,
        });
        debug!(effect = ?desc.swap_effect, buffers = desc.buffer_count, "Headless swap chain created");

        let buffers = make_buffers(&self.shared, desc);
        Ok(HeadlessSwapChain {
            shared: Arc::clone(&self.shared),
            state: Mutex::new(SwapState {
                desc: *desc,
                buffers,
                current: 0,
            }),
        })
    }
}

fn make_buffers(shared: &GpuShared, desc: &SwapChainDesc) -> Vec<HeadlessResource> {
    (0..desc.buffer_count)
        .map(|_| {
            HeadlessResource::new(
                shared,
                ResourceDesc::texture_2d(desc.width, desc.height, desc.format),
            )
        })
        .collect()
}

struct SwapState {
    desc: SwapChainDesc,
    buffers: Vec<HeadlessResource>,
    current: u32,
}

/// 软件交换链
pub struct HeadlessSwapChain {
    shared: Arc<GpuShared>,
    state: Mutex<SwapState>,
}

impl HeadlessSwapChain {
    /// 当前原生描述
    pub fn desc(&self) -> SwapChainDesc {
        self.state.lock().desc
    }
}

impl NativeSwapChain<Headless> for HeadlessSwapChain {
    fn present(&self, sync_interval: u32, flags: u32) -> HResult {
        let mut state = self.state.lock();
        self.shared.log.push(NativeCall::Present {
            sync_interval,
            flags,
            back_buffer: state.current,
        });
        let reason = self.shared.removed_reason();
        if reason.is_err() {
            return reason;
        }
        if let Some(hr) = self.shared.faults.lock().present {
            return hr;
        }
        if state.desc.swap_effect.is_flip_model() {
            state.current = (state.current + 1) % state.desc.buffer_count;
        }
        trace!(back_buffer = state.current, "Headless present");
        HResult::S_OK
    }

    fn resize_buffers(
        &self,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> HResult {
        let mut state = self.state.lock();
        let outstanding = state.buffers.iter().any(|b| b.ref_count() > 1);
        let injected = self.shared.faults.lock().resize_buffers;
        let mut desc = state.desc;
        if buffer_count != 0 {
            desc.buffer_count = buffer_count;
        }
        if width != 0 {
            desc.width = width;
        }
        if height != 0 {
            desc.height = height;
        }
        if format != Format::Unknown {
            desc.format = format;
        }
        desc.flags = flags;

        let result = if outstanding {
            HResult::DXGI_ERROR_INVALID_CALL
        } else if let Some(hr) = injected {
            hr
        } else if desc.swap_effect.is_flip_model() && desc.buffer_count < 2 {
            HResult::DXGI_ERROR_INVALID_CALL
        } else {
            self.shared.removed_reason()
        };

        self.shared.log.push(NativeCall::ResizeBuffers {
            buffer_count: desc.buffer_count,
            width: desc.width,
            height: desc.height,
            accepted: result.is_ok(),
        });
        if result.is_err() {
            return result;
        }

        state.buffers.clear();
        state.buffers = make_buffers(&self.shared, &desc);
        state.desc = desc;
        state.current = 0;
        HResult::S_OK
    }

    fn resize_target(&self, mode: &ModeDesc) -> HResult {
        self.shared.log.push(NativeCall::ResizeTarget {
            width: mode.width,
            height: mode.height,
        });
        self.shared.removed_reason()
    }

    fn get_buffer(&self, index: u32) -> Result<HeadlessResource, HResult> {
        let state = self.state.lock();
        let buffer = state
            .buffers
            .get(index as usize)
            .cloned()
            .ok_or(HResult::DXGI_ERROR_INVALID_CALL)?;
        self.shared.log.push(NativeCall::GetBuffer {
            index,
            resource: buffer.id(),
        });
        Ok(buffer)
    }

    fn current_back_buffer_index(&self) -> u32 {
        self.state.lock().current
    }
}

impl Drop for HeadlessSwapChain {
    fn drop(&mut self) {
        let state = self.state.lock();
        let outstanding_buffers = state.buffers.iter().any(|b| b.ref_count() > 1);
        self.shared
            .log
            .push(NativeCall::SwapChainDestroyed { outstanding_buffers });
    }
}
