//! GPU 同步机制模块
//!
//! 每个队列一个 Fence：CPU 侧维护"下一个将被 signal 的值"，
//! GPU 侧通过原生 Fence 报告已完成的值。
//! `CommandListFenceSet` 把各队列的 Fence 聚合在一起，回答
//! "这个资源可以复用了吗"和"第 N 帧的图形工作退休了吗"。
//!
//! # 不变式
//!
//! - 已完成值 ≤ 已 signal 值
//! - 当前值单调不减
//! - 一个值一旦完成，在整个运行期内保持完成

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{Backend, FenceWait, NativeDevice, NativeFence, QueueType};

/// Fence 值
///
/// 用于CPU-GPU同步的单调递增值。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceValue(u64);

impl FenceValue {
    /// 创建新的Fence值
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// 获取内部值
    pub fn value(&self) -> u64 {
        self.0
    }

    /// 下一个Fence值
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// 标记在某个队列上的 Fence 值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceStamp {
    pub queue: QueueType,
    pub value: FenceValue,
}

/// 一个队列的完成计数器
///
/// CPU 侧状态用原子量保存，可以在池、队列和 Fence 集合之间共享。
pub struct Fence<B: Backend> {
    queue_type: QueueType,
    native: B::Fence,
    device: Arc<B::Device>,
    /// 下一次提交将 signal 的值
    next_value: AtomicU64,
    /// 最近一次 signal 的值
    last_signaled: AtomicU64,
    /// 观察到的最大完成值
    completed_cache: AtomicU64,
    wait_slice: Duration,
}

impl<B: Backend> Fence<B> {
    /// 创建 Fence，初始完成值为 0，第一次提交 signal 1
    pub fn new(device: Arc<B::Device>, queue_type: QueueType, wait_slice: Duration) -> Result<Self> {
        let native = device
            .create_fence(0)
            .map_err(|hr| GraphicsError::FenceCreation { queue: queue_type, hr })?;
        debug!(queue = queue_type.name(), "Fence created");
        Ok(Self {
            queue_type,
            native,
            device,
            next_value: AtomicU64::new(1),
            last_signaled: AtomicU64::new(0),
            completed_cache: AtomicU64::new(0),
            wait_slice,
        })
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn native(&self) -> &B::Fence {
        &self.native
    }

    /// 下一次提交将会 signal 的值
    pub fn current_value(&self) -> FenceValue {
        FenceValue(self.next_value.load(Ordering::Acquire))
    }

    /// 最近一次 signal 的值
    pub fn last_signaled(&self) -> FenceValue {
        FenceValue(self.last_signaled.load(Ordering::Acquire))
    }

    /// GPU 已完成的值（不阻塞）
    pub fn completed_value(&self) -> FenceValue {
        let native = self.native.completed_value();
        if native == u64::MAX {
            // D3D12 在设备移除后把完成值报告为 UINT64_MAX
            return FenceValue(u64::MAX);
        }
        let previous = self.completed_cache.fetch_max(native, Ordering::AcqRel);
        FenceValue(previous.max(native))
    }

    /// 判断 `value` 是否已完成，从不阻塞
    pub fn is_completed(&self, value: FenceValue) -> bool {
        self.completed_value() >= value
    }

    /// 为一次提交预留 signal 值
    ///
    /// 返回 `max(当前值, requested)`，之后当前值变为返回值加一。
    /// 原生 signal 成功后必须调用 `mark_signaled`，否则等待方看不到这个值。
    pub(crate) fn reserve_signal(&self, requested: Option<FenceValue>) -> FenceValue {
        let current = self.next_value.load(Ordering::Acquire);
        let value = requested.map_or(current, |r| r.0.max(current));
        self.next_value.store(value + 1, Ordering::Release);
        trace!(queue = self.queue_type.name(), value, "Fence value reserved");
        FenceValue(value)
    }

    /// 记录原生 signal 已成功入队
    pub(crate) fn mark_signaled(&self, value: FenceValue) {
        self.last_signaled.fetch_max(value.0, Ordering::AcqRel);
    }

    /// 设备已移除或挂起时返回 `DeviceRemoved`
    pub fn check_not_removed(&self) -> Result<()> {
        let reason = self.device.removed_reason();
        if reason.is_err() {
            error!(queue = self.queue_type.name(), %reason, "Device removed");
            return Err(GraphicsError::DeviceRemoved(reason).into());
        }
        Ok(())
    }

    /// 阻塞直到 `value` 完成
    ///
    /// 原生等待按时间片进行，每个时间片结束后查询设备移除原因：
    /// 设备挂起或移除时返回 `DeviceRemoved`，而不是无限等待。
    pub fn wait(&self, value: FenceValue) -> Result<()> {
        if self.is_completed(value) {
            return self.check_not_removed();
        }
        let last_signaled = self.last_signaled();
        if value > last_signaled {
            return Err(GraphicsError::FenceNotSubmitted {
                queue: self.queue_type,
                value: value.0,
                last_signaled: last_signaled.0,
            }
            .into());
        }

        trace!(queue = self.queue_type.name(), value = value.0, "Waiting for fence");
        let mut slices = 0u64;
        loop {
            match self.native.wait(value.0, self.wait_slice) {
                FenceWait::Reached => return self.check_not_removed(),
                FenceWait::TimedOut => {
                    self.check_not_removed()?;
                    slices += 1;
                    if slices == 1000 {
                        warn!(
                            queue = self.queue_type.name(),
                            value = value.0,
                            completed = self.completed_value().0,
                            "Fence wait is taking unusually long"
                        );
                    }
                }
                FenceWait::Failed(hr) => {
                    error!(queue = self.queue_type.name(), %hr, "Native fence wait failed");
                    return Err(GraphicsError::DeviceRemoved(hr).into());
                }
            }
        }
    }
}

/// 一帧的图形 Fence 值
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameFence {
    frame: u64,
    value: FenceValue,
}

/// 按队列类型聚合的 Fence 集合
pub struct CommandListFenceSet<B: Backend> {
    fences: [Arc<Fence<B>>; 2],
    frames: VecDeque<FrameFence>,
    max_tracked_frames: usize,
}

impl<B: Backend> CommandListFenceSet<B> {
    /// 为每个队列类型创建一个 Fence
    pub fn new(device: Arc<B::Device>, wait_slice: Duration, max_tracked_frames: usize) -> Result<Self> {
        let graphics = Arc::new(Fence::new(Arc::clone(&device), QueueType::Graphics, wait_slice)?);
        let copy = Arc::new(Fence::new(device, QueueType::Copy, wait_slice)?);
        Ok(Self {
            fences: [graphics, copy],
            frames: VecDeque::new(),
            max_tracked_frames: max_tracked_frames.max(1),
        })
    }

    pub fn fence(&self, queue: QueueType) -> &Arc<Fence<B>> {
        &self.fences[queue.index()]
    }

    /// 下一次提交将会 signal 的值
    pub fn current_value(&self, queue: QueueType) -> FenceValue {
        self.fence(queue).current_value()
    }

    pub fn last_signaled(&self, queue: QueueType) -> FenceValue {
        self.fence(queue).last_signaled()
    }

    pub fn completed_value(&self, queue: QueueType) -> FenceValue {
        self.fence(queue).completed_value()
    }

    pub fn is_completed(&self, value: FenceValue, queue: QueueType) -> bool {
        self.fence(queue).is_completed(value)
    }

    pub fn wait_for_fence(&self, value: FenceValue, queue: QueueType) -> Result<()> {
        self.fence(queue).wait(value)
    }

    pub fn is_stamp_completed(&self, stamp: FenceStamp) -> bool {
        self.is_completed(stamp.value, stamp.queue)
    }

    /// 等待所有队列上已 signal 的工作完成
    pub fn wait_for_all_signaled(&self) -> Result<()> {
        for fence in &self.fences {
            fence.wait(fence.last_signaled())?;
        }
        Ok(())
    }

    /// 记录某一帧的图形工作对应的 Fence 值
    pub fn record_frame(&mut self, frame: u64, value: FenceValue) {
        if let Some(last) = self.frames.back() {
            debug_assert!(frame > last.frame, "frames must be recorded in order");
            debug_assert!(value >= last.value, "frame fence values must not decrease");
        }
        self.frames.push_back(FrameFence { frame, value });
        while self.frames.len() > self.max_tracked_frames {
            self.frames.pop_front();
        }
    }

    /// 某一帧的 Fence 值；超出历史窗口的旧帧视为值 0
    fn frame_value(&self, frame: u64) -> Option<FenceValue> {
        match self.frames.front() {
            Some(oldest) if frame < oldest.frame => Some(FenceValue(0)),
            _ => self
                .frames
                .iter()
                .find(|f| f.frame == frame)
                .map(|f| f.value),
        }
    }

    /// 第 `frame` 帧的图形工作是否已退休；未记录的帧返回 false
    pub fn is_frame_retired(&self, frame: u64) -> bool {
        self.frame_value(frame)
            .map_or(false, |value| self.is_completed(value, QueueType::Graphics))
    }

    /// 阻塞直到第 `frame` 帧的图形工作退休
    pub fn wait_for_frame(&self, frame: u64) -> Result<()> {
        match self.frame_value(frame) {
            Some(value) => self.wait_for_fence(value, QueueType::Graphics),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::NativeQueue;
    use crate::gfx::headless::{ExecutionMode, Headless, HeadlessDevice};

    fn fence_set(mode: ExecutionMode) -> (Arc<HeadlessDevice>, CommandListFenceSet<Headless>) {
        let device = Arc::new(HeadlessDevice::new(mode, Duration::ZERO));
        let set = CommandListFenceSet::new(Arc::clone(&device), Duration::from_millis(1), 8).unwrap();
        (device, set)
    }

    fn signal(queue: &impl NativeQueue<Headless>, fence: &Fence<Headless>) -> FenceValue {
        let value = fence.reserve_signal(None);
        assert!(queue.signal(fence.native(), value.value()).is_ok());
        fence.mark_signaled(value);
        value
    }

    #[test]
    fn test_fence_value() {
        let fence = FenceValue::new(1);
        assert_eq!(fence.value(), 1);
        assert_eq!(fence.next().value(), 2);
        assert!(FenceValue::new(1) < FenceValue::new(2));
    }

    #[test]
    fn test_current_value_monotonic() {
        let (_device, set) = fence_set(ExecutionMode::Manual);
        let fence = set.fence(QueueType::Graphics);

        let mut previous = fence.current_value();
        assert_eq!(previous.value(), 1);
        for requested in [None, Some(FenceValue::new(10)), None, Some(FenceValue::new(3))] {
            let value = fence.reserve_signal(requested);
            fence.mark_signaled(value);
            let current = fence.current_value();
            assert!(current >= previous);
            previous = current;
        }
        assert_eq!(fence.last_signaled().value(), 12);
        assert_eq!(previous.value(), 13);
    }

    #[test]
    fn test_is_completed_tracks_native_counter() {
        let (device, set) = fence_set(ExecutionMode::Manual);
        let queue = device.create_queue(QueueType::Graphics).unwrap();
        let fence = set.fence(QueueType::Graphics);

        let value = signal(&queue, fence);
        assert!(!set.is_completed(value, QueueType::Graphics));

        device.retire_all();
        assert!(set.is_completed(value, QueueType::Graphics));
        assert!(set.is_completed(FenceValue::new(0), QueueType::Graphics));
        // 完成之后保持完成
        assert!(set.is_completed(value, QueueType::Graphics));
    }

    #[test]
    fn test_wait_rejects_unsubmitted_value() {
        let (_device, set) = fence_set(ExecutionMode::Immediate);
        let err = set
            .wait_for_fence(FenceValue::new(5), QueueType::Copy)
            .unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::On12Error::Graphics(GraphicsError::FenceNotSubmitted { value: 5, .. })
        ));
    }

    #[test]
    fn test_reserved_value_is_not_waitable_until_signaled() {
        let (_device, set) = fence_set(ExecutionMode::Manual);
        let fence = set.fence(QueueType::Graphics);

        let value = fence.reserve_signal(None);
        assert_eq!(fence.last_signaled(), FenceValue::new(0));
        assert_eq!(fence.current_value(), value.next());
        let err = fence.wait(value).unwrap_err();
        assert!(matches!(
            err,
            crate::core::error::On12Error::Graphics(GraphicsError::FenceNotSubmitted { value: 1, last_signaled: 0, .. })
        ));
        set.wait_for_all_signaled().unwrap();
    }

    #[test]
    fn test_wait_surfaces_hung_device() {
        let (device, set) = fence_set(ExecutionMode::Manual);
        let queue = device.create_queue(QueueType::Graphics).unwrap();
        let fence = set.fence(QueueType::Graphics);
        let value = signal(&queue, fence);

        device.hang();
        let err = set.wait_for_fence(value, QueueType::Graphics).unwrap_err();
        assert!(err.is_device_removed());
    }

    #[test]
    fn test_frame_tracking() {
        let (device, mut set) = fence_set(ExecutionMode::Manual);
        let queue = device.create_queue(QueueType::Graphics).unwrap();
        let fence = Arc::clone(set.fence(QueueType::Graphics));

        for frame in 0..3 {
            let value = signal(&queue, &fence);
            set.record_frame(frame, value);
        }
        assert!(!set.is_frame_retired(0));
        assert!(!set.is_frame_retired(7));

        set.wait_for_frame(1).unwrap();
        assert!(set.is_frame_retired(0));
        assert!(set.is_frame_retired(1));
    }
}
