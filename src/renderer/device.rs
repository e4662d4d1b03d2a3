//! 设备模块
//!
//! `Device` 持有原生设备，是创建队列、Fence 集合、命令列表池、资源和视图的根对象。
//! 它还持有资源释放堆：资源在最后一个引用它的命令列表退休之前不能销毁，
//! 因此释放请求带着一个 Fence 标记排队，等标记完成后再真正丢弃句柄。
//!
//! # 释放策略
//!
//! - `Deferred`：只销毁标记已完成的条目，其余留在队列中（每帧调用）
//! - `Immediate`：阻塞等待所有条目的标记完成，然后全部销毁（交换链调整大小前调用）

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::command::{AutoSplitPolicy, CommandListPool};
use super::descriptor::{DescriptorAllocator, DescriptorHeapStats};
use super::queue::AsyncCommandQueue;
use super::resource::{RenderTargetView, Resource};
use super::sync::{CommandListFenceSet, FenceStamp, FenceValue};
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{Backend, HResult, NativeDevice, QueueType, ResourceDesc};

/// 释放堆的回收策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// 阻塞直到安全，然后同步销毁
    Immediate,
    /// 只销毁已经安全的条目
    Deferred,
}

/// 等待释放的对象
pub enum ReleasedObject<B: Backend> {
    Resource(Resource<B>),
    RenderTargetView(RenderTargetView<B>),
}

impl<B: Backend> From<Resource<B>> for ReleasedObject<B> {
    fn from(resource: Resource<B>) -> Self {
        ReleasedObject::Resource(resource)
    }
}

impl<B: Backend> From<RenderTargetView<B>> for ReleasedObject<B> {
    fn from(view: RenderTargetView<B>) -> Self {
        ReleasedObject::RenderTargetView(view)
    }
}

struct PendingRelease<B: Backend> {
    object: ReleasedObject<B>,
    stamp: FenceStamp,
}

/// 设备
pub struct Device<B: Backend> {
    native: Arc<B::Device>,
    rtv_allocator: Arc<Mutex<DescriptorAllocator>>,
    release_heap: Mutex<VecDeque<PendingRelease<B>>>,
}

impl<B: Backend> Device<B> {
    /// 包装原生设备并创建 RTV 描述符堆
    pub fn new(native: B::Device, rtv_capacity: u32) -> Result<Arc<Self>> {
        let reason = native.removed_reason();
        if reason.is_err() {
            return Err(GraphicsError::DeviceCreation(reason).into());
        }
        let heap = native
            .create_rtv_heap(rtv_capacity)
            .map_err(|hr| GraphicsError::ResourceCreation { what: "RTV descriptor heap", hr })?;
        info!(backend = B::name(), rtv_capacity, "Device created");
        Ok(Arc::new(Self {
            native: Arc::new(native),
            rtv_allocator: Arc::new(Mutex::new(DescriptorAllocator::new(heap))),
            release_heap: Mutex::new(VecDeque::new()),
        }))
    }

    pub fn native(&self) -> &Arc<B::Device> {
        &self.native
    }

    /// 设备移除原因；设备正常时为 `S_OK`
    pub fn removed_reason(&self) -> HResult {
        self.native.removed_reason()
    }

    /// 为每个队列类型创建 Fence
    pub fn create_fence_set(&self, wait_slice: Duration, max_tracked_frames: usize) -> Result<CommandListFenceSet<B>> {
        CommandListFenceSet::new(Arc::clone(&self.native), wait_slice, max_tracked_frames)
    }

    /// 创建异步命令队列，推进 `fences` 中对应类型的 Fence
    pub fn create_queue(&self, queue_type: QueueType, fences: &CommandListFenceSet<B>) -> Result<AsyncCommandQueue<B>> {
        let native = self
            .native
            .create_queue(queue_type)
            .map_err(|hr| GraphicsError::QueueCreation { queue: queue_type, hr })?;
        Ok(AsyncCommandQueue::new(queue_type, native, Arc::clone(fences.fence(queue_type))))
    }

    /// 创建命令列表池
    pub fn create_command_list_pool(
        self: &Arc<Self>,
        queue_type: QueueType,
        fences: &CommandListFenceSet<B>,
        split: AutoSplitPolicy,
        initial_capacity: usize,
    ) -> Result<CommandListPool<B>> {
        CommandListPool::new(
            Arc::clone(self),
            Arc::clone(fences.fence(queue_type)),
            split,
            initial_capacity,
        )
    }

    pub fn create_resource(&self, desc: &ResourceDesc, name: Option<&str>) -> Result<Resource<B>> {
        let native = self
            .native
            .create_committed_resource(desc)
            .map_err(|hr| GraphicsError::ResourceCreation { what: "Committed resource", hr })?;
        Ok(Resource::new(native, desc.clone(), name.map(str::to_owned)))
    }

    /// 包装一个已存在的原生资源（例如交换链后台缓冲区）
    pub fn wrap_resource(&self, native: B::Resource, desc: ResourceDesc, name: Option<String>) -> Resource<B> {
        Resource::new(native, desc, name)
    }

    /// 为资源创建渲染目标视图
    pub fn create_render_target_view(&self, resource: &Resource<B>) -> Result<RenderTargetView<B>> {
        let slot = self.rtv_allocator.lock().allocate()?;
        let hr = self.native.create_render_target_view(resource.native(), slot);
        if hr.is_err() {
            self.rtv_allocator.lock().free(slot);
            return Err(GraphicsError::ResourceCreation { what: "Render target view", hr }.into());
        }
        Ok(RenderTargetView::new(
            resource.clone(),
            slot,
            Arc::clone(&self.rtv_allocator),
        ))
    }

    pub fn rtv_stats(&self) -> DescriptorHeapStats {
        self.rtv_allocator.lock().stats()
    }

    /// 排队延迟释放；`stamp` 完成后对象才会被丢弃
    pub fn release_deferred(&self, object: impl Into<ReleasedObject<B>>, stamp: FenceStamp) {
        trace!(queue = stamp.queue.name(), value = stamp.value.value(), "Deferred release queued");
        self.release_heap.lock().push_back(PendingRelease {
            object: object.into(),
            stamp,
        });
    }

    /// 等待释放的条目数量
    pub fn pending_releases(&self) -> usize {
        self.release_heap.lock().len()
    }

    /// 按策略清理释放堆，返回被销毁的条目数量
    pub fn flush_release_heap(&self, policy: ReleasePolicy, fences: &CommandListFenceSet<B>) -> Result<usize> {
        match policy {
            ReleasePolicy::Deferred => {
                let mut heap = self.release_heap.lock();
                let before = heap.len();
                heap.retain(|entry| !fences.is_stamp_completed(entry.stamp));
                let released = before - heap.len();
                if released > 0 {
                    trace!(released, remaining = heap.len(), "Deferred release heap flushed");
                }
                Ok(released)
            }
            ReleasePolicy::Immediate => {
                let entries = std::mem::take(&mut *self.release_heap.lock());
                if entries.is_empty() {
                    return Ok(0);
                }

                let mut targets: [Option<FenceValue>; 2] = [None, None];
                for entry in &entries {
                    let target = &mut targets[entry.stamp.queue.index()];
                    *target = Some(target.map_or(entry.stamp.value, |v| v.max(entry.stamp.value)));
                }
                for queue in QueueType::ALL {
                    if let Some(value) = targets[queue.index()] {
                        if let Err(e) = fences.wait_for_fence(value, queue) {
                            let mut heap = self.release_heap.lock();
                            for entry in entries.into_iter().rev() {
                                heap.push_front(entry);
                            }
                            return Err(e);
                        }
                    }
                }

                let released = entries.len();
                let (resources, views) = entries.iter().fold((0, 0), |(r, v), e| match e.object {
                    ReleasedObject::Resource(_) => (r + 1, v),
                    ReleasedObject::RenderTargetView(_) => (r, v + 1),
                });
                drop(entries);
                debug!(resources, views, "Release heap flushed immediately");
                Ok(released)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::NativeQueue;
    use crate::gfx::headless::{ExecutionMode, Headless, HeadlessDevice, NativeCall};

    struct Fixture {
        headless: HeadlessDevice,
        device: Arc<Device<Headless>>,
        fences: CommandListFenceSet<Headless>,
    }

    fn fixture(mode: ExecutionMode) -> Fixture {
        let headless = HeadlessDevice::new(mode, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 16).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        Fixture { headless, device, fences }
    }

    fn destroyed(headless: &HeadlessDevice, id: u64) -> bool {
        headless.log().count(|c| *c == NativeCall::ResourceDestroyed { resource: id }) == 1
    }

    #[test]
    fn test_deferred_flush_keeps_unretired_entries() {
        let f = fixture(ExecutionMode::Manual);
        let queue = f.device.create_queue(QueueType::Graphics, &f.fences).unwrap();
        let fence = f.fences.fence(QueueType::Graphics);

        let resource = f.device.create_resource(&ResourceDesc::buffer(64), Some("staging")).unwrap();
        let native_id = resource.native().id();
        let value = fence.reserve_signal(None);
        queue.native().signal(fence.native(), value.value());
        fence.mark_signaled(value);
        f.device.release_deferred(resource, FenceStamp { queue: QueueType::Graphics, value });

        assert_eq!(f.device.flush_release_heap(ReleasePolicy::Deferred, &f.fences).unwrap(), 0);
        assert_eq!(f.device.pending_releases(), 1);
        assert!(!destroyed(&f.headless, native_id));

        f.headless.retire_all();
        assert_eq!(f.device.flush_release_heap(ReleasePolicy::Deferred, &f.fences).unwrap(), 1);
        assert!(destroyed(&f.headless, native_id));
    }

    #[test]
    fn test_immediate_flush_waits_then_destroys() {
        let f = fixture(ExecutionMode::Manual);
        let queue = f.device.create_queue(QueueType::Copy, &f.fences).unwrap();
        let fence = f.fences.fence(QueueType::Copy);

        let resource = f.device.create_resource(&ResourceDesc::buffer(64), None).unwrap();
        let native_id = resource.native().id();
        let value = fence.reserve_signal(None);
        queue.native().signal(fence.native(), value.value());
        fence.mark_signaled(value);
        f.device.release_deferred(resource, FenceStamp { queue: QueueType::Copy, value });

        assert_eq!(f.device.flush_release_heap(ReleasePolicy::Immediate, &f.fences).unwrap(), 1);
        assert!(f.fences.is_completed(value, QueueType::Copy));
        assert!(destroyed(&f.headless, native_id));
        assert_eq!(f.device.pending_releases(), 0);
    }

    #[test]
    fn test_immediate_flush_failure_keeps_entries() {
        let f = fixture(ExecutionMode::Manual);
        let resource = f.device.create_resource(&ResourceDesc::buffer(64), None).unwrap();
        let stamp = FenceStamp {
            queue: QueueType::Graphics,
            value: FenceValue::new(9),
        };
        f.device.release_deferred(resource, stamp);

        assert!(f.device.flush_release_heap(ReleasePolicy::Immediate, &f.fences).is_err());
        assert_eq!(f.device.pending_releases(), 1);
    }

    #[test]
    fn test_render_target_view_returns_slot() {
        let f = fixture(ExecutionMode::Immediate);
        let resource = f
            .device
            .create_resource(&ResourceDesc::texture_2d(8, 8, crate::gfx::backend::Format::R8G8B8A8Unorm), None)
            .unwrap();
        let view = f.device.create_render_target_view(&resource).unwrap();
        assert_eq!(f.device.rtv_stats().used, 1);
        let alias = view.clone();
        drop(view);
        assert_eq!(f.device.rtv_stats().used, 1);
        drop(alias);
        assert_eq!(f.device.rtv_stats().used, 0);
    }
}
