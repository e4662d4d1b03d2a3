//! 即时上下文
//!
//! 单录制线程的门面：上层 D3D11 兼容层只通过它获取命令列表、插入 Fence、
//! 呈现和调整交换链大小。每个队列类型持有一个命令列表池和一个异步队列。
//!
//! # 调整大小协议
//!
//! 1. 解绑所有引用交换链缓冲区的渲染目标
//! 2. 提交并等待所有未完成的命令
//! 3. 放弃缓冲区
//! 4. 立即清理设备的释放堆
//! 5. 调用原生 ResizeBuffers，成功后重新获取缓冲区
//!
//! 一旦检测到设备移除，上下文被标记为丢失，之后的操作都返回移除错误。

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::command::{AutoSplitPolicy, CommandList, CommandListPool, PoolStats};
use super::device::{Device, ReleasePolicy};
use super::queue::AsyncCommandQueue;
use super::resource::{RenderTargetView, Resource};
use super::swap_chain::{BackBuffer, SwapChain, SwapEffectNegotiationPolicy};
use super::sync::{CommandListFenceSet, FenceStamp, FenceValue};
use crate::core::error::{GraphicsError, On12Error, Result};
use crate::gfx::backend::{Backend, Format, HResult, ModeDesc, QueueType, SwapChainDesc};

/// 上下文创建参数
#[derive(Debug, Clone, Copy)]
pub struct ContextDesc {
    pub split: AutoSplitPolicy,
    /// 每个池预先创建的命令列表数量
    pub initial_command_lists: usize,
    /// 允许同时在 GPU 上的帧数
    pub max_frame_latency: u32,
    /// 原生 Fence 等待的时间片
    pub fence_wait_slice: Duration,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            split: AutoSplitPolicy::default(),
            initial_command_lists: 2,
            max_frame_latency: 2,
            fence_wait_slice: Duration::from_millis(10),
        }
    }
}

struct Channel<B: Backend> {
    pool: CommandListPool<B>,
    queue: AsyncCommandQueue<B>,
}

impl<B: Backend> Channel<B> {
    fn close(&mut self) -> Result<Option<FenceValue>> {
        self.pool.close_command_list(&mut self.queue)
    }

    fn flush(&mut self) -> Result<Option<FenceValue>> {
        self.close()?;
        self.queue.flush(None)
    }
}

/// 即时上下文
pub struct ImmediateContext<B: Backend> {
    device: Arc<Device<B>>,
    fences: CommandListFenceSet<B>,
    channels: [Channel<B>; 2],
    swap_chain: Option<SwapChain<B>>,
    bound_targets: Vec<RenderTargetView<B>>,
    frame: u64,
    max_frame_latency: u64,
    lost: Option<HResult>,
}

impl<B: Backend> ImmediateContext<B> {
    pub fn new(device: Arc<Device<B>>, desc: &ContextDesc) -> Result<Self> {
        let max_frame_latency = u64::from(desc.max_frame_latency.max(1));
        let fences = device.create_fence_set(desc.fence_wait_slice, (max_frame_latency as usize + 1).max(8))?;

        let channel = |queue_type: QueueType| -> Result<Channel<B>> {
            Ok(Channel {
                pool: device.create_command_list_pool(queue_type, &fences, desc.split, desc.initial_command_lists)?,
                queue: device.create_queue(queue_type, &fences)?,
            })
        };
        let channels = [channel(QueueType::Graphics)?, channel(QueueType::Copy)?];

        info!(
            backend = B::name(),
            max_frame_latency,
            initial_command_lists = desc.initial_command_lists,
            "Immediate context created"
        );
        Ok(Self {
            device,
            fences,
            channels,
            swap_chain: None,
            bound_targets: Vec::new(),
            frame: 0,
            max_frame_latency,
            lost: None,
        })
    }

    /// 在图形队列上创建交换链，替换已有的交换链
    pub fn create_swap_chain(
        &mut self,
        factory: &B::Factory,
        desc: &SwapChainDesc,
        policy: &dyn SwapEffectNegotiationPolicy,
    ) -> Result<()> {
        self.check_lost()?;
        if self.swap_chain.is_some() {
            self.bound_targets.clear();
            self.wait_for_idle()?;
            self.swap_chain = None;
        }
        let swap_chain = SwapChain::create(
            &self.device,
            &self.channels[QueueType::Graphics.index()].queue,
            factory,
            desc,
            policy,
        )?;
        self.swap_chain = Some(swap_chain);
        Ok(())
    }

    pub fn device(&self) -> &Arc<Device<B>> {
        &self.device
    }

    pub fn fences(&self) -> &CommandListFenceSet<B> {
        &self.fences
    }

    pub fn swap_chain(&self) -> Option<&SwapChain<B>> {
        self.swap_chain.as_ref()
    }

    pub fn pool_stats(&self, queue_type: QueueType) -> PoolStats {
        self.channels[queue_type.index()].pool.stats()
    }

    pub fn pool_len(&self, queue_type: QueueType) -> usize {
        self.channels[queue_type.index()].pool.len()
    }

    /// 已呈现的帧数
    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_some()
    }

    /// 设备丢失时的移除原因
    pub fn lost_reason(&self) -> Option<HResult> {
        self.lost
    }

    fn check_lost(&self) -> Result<()> {
        match self.lost {
            Some(hr) => Err(GraphicsError::DeviceRemoved(hr).into()),
            None => Ok(()),
        }
    }

    fn note(lost: &mut Option<HResult>, e: &On12Error) {
        if e.is_device_removed() && lost.is_none() {
            error!(hr = %e.hresult(), "Device lost, immediate context is no longer usable");
            *lost = Some(e.hresult());
        }
    }

    fn track<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            Self::note(&mut self.lost, e);
        }
        result
    }

    /// 用于返回结果码的入口：记录设备丢失并取出结果码
    fn fail(&mut self, e: On12Error) -> HResult {
        Self::note(&mut self.lost, &e);
        e.hresult()
    }

    /// 当前录制的命令列表，必要时打开一个
    pub fn command_list(&mut self, queue_type: QueueType) -> Result<&mut CommandList<B>> {
        self.check_lost()?;
        let lost = &mut self.lost;
        let channel = &mut self.channels[queue_type.index()];
        match channel.pool.command_list(&mut channel.queue) {
            Ok(list) => Ok(list),
            Err(e) => {
                Self::note(lost, &e);
                Err(e)
            }
        }
    }

    /// 关闭当前列表并放入队列批次（不提交到硬件）
    pub fn close_command_list(&mut self, queue_type: QueueType) -> Result<Option<FenceValue>> {
        self.check_lost()?;
        let result = self.channels[queue_type.index()].close();
        self.track(result)
    }

    /// 关闭当前列表并提交批次
    pub fn flush(&mut self, queue_type: QueueType) -> Result<Option<FenceValue>> {
        self.check_lost()?;
        let result = self.channels[queue_type.index()].flush();
        self.track(result)
    }

    pub fn flush_all(&mut self) -> Result<()> {
        for queue_type in QueueType::ALL {
            self.flush(queue_type)?;
        }
        Ok(())
    }

    /// 覆盖到目前为止所录制工作的 Fence 值
    ///
    /// 打开的列表已使用、或批次中有待提交的列表时为当前值；
    /// 否则这些工作都不会推进 Fence，返回当前值减一。
    pub fn insert_fence(&self, queue_type: QueueType) -> FenceValue {
        let channel = &self.channels[queue_type.index()];
        let current = self.fences.current_value(queue_type);
        if channel.pool.is_current_utilized() || channel.queue.pending_len() > 0 {
            current
        } else {
            FenceValue::new(current.value() - 1)
        }
    }

    /// 提交生产者队列并阻塞到其最后一个值完成
    ///
    /// 这是图形队列和复制队列之间唯一的顺序保证。
    pub fn synchronize_queues(&mut self, producer: QueueType) -> Result<()> {
        self.flush(producer)?;
        let value = self.fences.last_signaled(producer);
        trace!(producer = producer.name(), value = value.value(), "Synchronizing queues");
        let result = self.fences.wait_for_fence(value, producer);
        self.track(result)
    }

    /// 提交并等待所有未完成的工作
    pub fn wait_for_idle(&mut self) -> Result<()> {
        self.flush_all()?;
        let result = self.fences.wait_for_all_signaled();
        self.track(result)?;
        for channel in &mut self.channels {
            channel.pool.recycle_retired();
        }
        debug!("Immediate context idle");
        Ok(())
    }

    fn release_stamp(&self) -> FenceStamp {
        FenceStamp {
            queue: QueueType::Graphics,
            value: self.insert_fence(QueueType::Graphics),
        }
    }

    /// 延迟释放资源，直到当前已录制的图形工作退休
    pub fn release_resource(&self, resource: Resource<B>) {
        self.device.release_deferred(resource, self.release_stamp());
    }

    pub fn release_view(&self, view: RenderTargetView<B>) {
        self.device.release_deferred(view, self.release_stamp());
    }

    /// 绑定渲染目标；调整大小时会被解绑
    pub fn set_render_targets(&mut self, views: &[RenderTargetView<B>]) {
        self.bound_targets = views.to_vec();
    }

    pub fn bound_render_targets(&self) -> &[RenderTargetView<B>] {
        &self.bound_targets
    }

    /// 呈现当前帧
    ///
    /// 关闭图形列表（未使用的不提交），flush 后调用原生 Present，
    /// 然后记录帧 Fence、限制在途帧数并做每帧的清理。
    pub fn present(&mut self, sync_interval: u32, flags: u32) -> HResult {
        if let Some(hr) = self.lost {
            return hr;
        }
        if self.swap_chain.is_none() {
            warn!("Present without a swap chain");
            return HResult::DXGI_ERROR_INVALID_CALL;
        }

        let graphics = QueueType::Graphics.index();
        if let Err(e) = self.channels[graphics].flush() {
            return self.fail(e);
        }
        let hr = match self.swap_chain.as_ref() {
            Some(swap_chain) => swap_chain.present(&mut self.channels[graphics].queue, sync_interval, flags),
            None => HResult::DXGI_ERROR_INVALID_CALL,
        };
        if hr.is_device_removed() {
            return self.fail(GraphicsError::DeviceRemoved(hr).into());
        }
        if hr.is_err() {
            warn!(%hr, frame = self.frame, "Present failed");
        }

        let value = self.fences.last_signaled(QueueType::Graphics);
        self.fences.record_frame(self.frame, value);
        trace!(frame = self.frame, value = value.value(), "Frame presented");
        if self.frame >= self.max_frame_latency {
            let result = self.fences.wait_for_frame(self.frame - self.max_frame_latency);
            if let Err(e) = result {
                return self.fail(e);
            }
        }
        self.frame += 1;

        if let Err(e) = self.device.flush_release_heap(ReleasePolicy::Deferred, &self.fences) {
            return self.fail(e);
        }
        for channel in &mut self.channels {
            channel.pool.trim();
        }
        hr
    }

    /// 按调整大小协议改变交换链缓冲区
    pub fn resize_buffers(
        &mut self,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> HResult {
        if let Some(hr) = self.lost {
            return hr;
        }
        if self.swap_chain.is_none() {
            return HResult::DXGI_ERROR_INVALID_CALL;
        }

        self.bound_targets.clear();
        if let Err(e) = self.wait_for_idle() {
            return self.fail(e);
        }
        if let Some(swap_chain) = self.swap_chain.as_mut() {
            swap_chain.forfeit_buffers();
        }
        match self.device.flush_release_heap(ReleasePolicy::Immediate, &self.fences) {
            Ok(released) => trace!(released, "Release heap flushed before resize"),
            Err(e) => return self.fail(e),
        }

        let hr = match self.swap_chain.as_mut() {
            Some(swap_chain) => swap_chain.resize_buffers(buffer_count, width, height, format, flags),
            None => HResult::DXGI_ERROR_INVALID_CALL,
        };
        if hr.is_device_removed() {
            return self.fail(GraphicsError::DeviceRemoved(hr).into());
        }
        hr
    }

    pub fn resize_target(&mut self, mode: &ModeDesc) -> HResult {
        if let Some(hr) = self.lost {
            return hr;
        }
        let hr = match self.swap_chain.as_ref() {
            Some(swap_chain) => swap_chain.resize_target(mode),
            None => HResult::DXGI_ERROR_INVALID_CALL,
        };
        if hr.is_device_removed() {
            return self.fail(GraphicsError::DeviceRemoved(hr).into());
        }
        hr
    }

    pub fn current_back_buffer(&self) -> Option<&BackBuffer<B>> {
        self.swap_chain.as_ref().and_then(SwapChain::current_back_buffer)
    }

    pub fn current_back_buffer_index(&self) -> Option<u32> {
        self.swap_chain.as_ref().and_then(SwapChain::current_back_buffer_index)
    }
}

impl<B: Backend> Drop for ImmediateContext<B> {
    fn drop(&mut self) {
        if self.lost.is_some() {
            return;
        }
        self.bound_targets.clear();
        if let Err(e) = self.wait_for_idle() {
            warn!(error = %e, "Failed to drain GPU work while dropping the immediate context");
        }
    }
}
