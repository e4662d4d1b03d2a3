//! 异步命令队列
//!
//! `execute` 只把关闭的列表追加到待提交批次，`flush` 才真正调用原生
//! `ExecuteCommandLists` 并 signal 队列的 Fence。批次按提交顺序执行，
//! 不同批次之间不会重排。

use std::sync::Arc;

use tracing::{error, trace};

use super::command::CommandList;
use super::sync::{Fence, FenceValue};
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{Backend, NativeQueue, QueueType};

/// 带批处理的命令队列
pub struct AsyncCommandQueue<B: Backend> {
    queue_type: QueueType,
    native: B::Queue,
    fence: Arc<Fence<B>>,
    pending: Vec<Arc<B::CommandList>>,
    batches: u64,
}

impl<B: Backend> AsyncCommandQueue<B> {
    pub fn new(queue_type: QueueType, native: B::Queue, fence: Arc<Fence<B>>) -> Self {
        debug_assert_eq!(queue_type, fence.queue_type());
        Self {
            queue_type,
            native,
            fence,
            pending: Vec::new(),
            batches: 0,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn native(&self) -> &B::Queue {
        &self.native
    }

    pub fn fence(&self) -> &Arc<Fence<B>> {
        &self.fence
    }

    /// 待提交批次中的列表数量
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 已提交到硬件的批次数量
    pub fn batches_submitted(&self) -> u64 {
        self.batches
    }

    /// 把关闭的列表加入下一个批次，返回该批次将 signal 的 Fence 值
    pub fn execute(&mut self, list: &mut CommandList<B>) -> FenceValue {
        debug_assert_eq!(list.queue_type(), self.queue_type, "command list executed on the wrong queue");
        let value = self.fence.current_value();
        list.mark_submitted(value);
        self.pending.push(Arc::clone(list.native()));
        trace!(queue = self.queue_type.name(), list = list.id(), value = value.value(), "Command list batched");
        value
    }

    /// 提交待处理批次并 signal Fence
    ///
    /// 批次为空时什么都不做，返回 `None`。指定了 `value` 时，
    /// signal 的值至少为 `value`。任何 signal 失败都按设备移除处理。
    pub fn flush(&mut self, value: Option<FenceValue>) -> Result<Option<FenceValue>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let lists: Vec<&B::CommandList> = self.pending.iter().map(|l| l.as_ref()).collect();
        self.native.execute(&lists);
        drop(lists);

        let signaled = self.fence.reserve_signal(value);
        let hr = self.native.signal(self.fence.native(), signaled.value());
        let count = self.pending.len();
        self.pending.clear();
        if hr.is_err() {
            // 这个值永远不会完成，批次中的列表也不会退休
            error!(queue = self.queue_type.name(), %hr, value = signaled.value(), "Fence signal failed");
            return Err(GraphicsError::DeviceRemoved(hr).into());
        }
        self.fence.mark_signaled(signaled);

        self.batches += 1;
        trace!(queue = self.queue_type.name(), lists = count, value = signaled.value(), "Batch submitted");
        Ok(Some(signaled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::HResult;
    use crate::gfx::headless::{ExecutionMode, Headless, HeadlessDevice, NativeCall};
    use crate::renderer::command::AutoSplitPolicy;
    use crate::renderer::device::Device;
    use std::time::Duration;

    #[test]
    fn test_empty_flush_is_noop() {
        let headless = HeadlessDevice::new(ExecutionMode::Manual, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 4).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        let mut queue = device.create_queue(QueueType::Copy, &fences).unwrap();

        let before = fences.current_value(QueueType::Copy);
        let log_len = headless.log().len();
        assert_eq!(queue.flush(None).unwrap(), None);
        assert_eq!(queue.flush(None).unwrap(), None);
        assert_eq!(fences.current_value(QueueType::Copy), before);
        assert_eq!(headless.log().len(), log_len);
        assert_eq!(queue.batches_submitted(), 0);
    }

    #[test]
    fn test_batches_signal_in_order() {
        let headless = HeadlessDevice::new(ExecutionMode::Manual, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 4).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        let mut queue = device.create_queue(QueueType::Graphics, &fences).unwrap();
        let mut pool = device
            .create_command_list_pool(QueueType::Graphics, &fences, AutoSplitPolicy::disabled(), 2)
            .unwrap();

        for _ in 0..2 {
            pool.command_list(&mut queue).unwrap().draw(3, 1);
            pool.close_command_list(&mut queue).unwrap();
        }
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(queue.flush(None).unwrap(), Some(FenceValue::new(1)));
        assert_eq!(queue.pending_len(), 0);

        pool.command_list(&mut queue).unwrap().draw(3, 1);
        pool.close_command_list(&mut queue).unwrap();
        assert_eq!(queue.flush(Some(FenceValue::new(7))).unwrap(), Some(FenceValue::new(7)));
        assert_eq!(fences.current_value(QueueType::Graphics), FenceValue::new(8));

        let log = headless.log().snapshot();
        let signals: Vec<u64> = log
            .iter()
            .filter_map(|c| match c {
                NativeCall::Signal { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(signals, vec![1, 7]);
        let first_execute = log
            .iter()
            .position(|c| matches!(c, NativeCall::ExecuteCommandLists { lists, .. } if lists.len() == 2));
        let first_signal = log.iter().position(|c| matches!(c, NativeCall::Signal { .. }));
        assert!(first_execute < first_signal);
    }

    #[test]
    fn test_failed_signal_is_fatal_and_never_waited_on() {
        let headless = HeadlessDevice::new(ExecutionMode::Immediate, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 4).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        let mut queue = device.create_queue(QueueType::Graphics, &fences).unwrap();
        let mut pool = device
            .create_command_list_pool(QueueType::Graphics, &fences, AutoSplitPolicy::disabled(), 1)
            .unwrap();

        pool.command_list(&mut queue).unwrap().draw(3, 1);
        pool.close_command_list(&mut queue).unwrap();
        headless.fail_next_signal(HResult::E_OUTOFMEMORY);
        let err = queue.flush(None).unwrap_err();
        assert!(err.is_device_removed());
        assert_eq!(err.hresult(), HResult::E_OUTOFMEMORY);
        assert_eq!(queue.batches_submitted(), 0);
        assert_eq!(fences.last_signaled(QueueType::Graphics), FenceValue::new(0));
        assert_eq!(headless.log().count(|c| matches!(c, NativeCall::Signal { .. })), 0);

        // 失败的值不计入已 signal，等待立即返回
        fences.wait_for_all_signaled().unwrap();
        assert!(fences.wait_for_fence(FenceValue::new(1), QueueType::Graphics).is_err());

        // 之后成功的 signal 使用新的值
        pool.command_list(&mut queue).unwrap().draw(3, 1);
        pool.close_command_list(&mut queue).unwrap();
        assert_eq!(queue.flush(None).unwrap(), Some(FenceValue::new(2)));
        fences.wait_for_all_signaled().unwrap();
    }

    #[test]
    fn test_signal_on_removed_device() {
        let headless = HeadlessDevice::new(ExecutionMode::Immediate, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 4).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        let mut queue = device.create_queue(QueueType::Graphics, &fences).unwrap();
        let mut pool = device
            .create_command_list_pool(QueueType::Graphics, &fences, AutoSplitPolicy::disabled(), 1)
            .unwrap();

        pool.command_list(&mut queue).unwrap().draw(3, 1);
        pool.close_command_list(&mut queue).unwrap();
        headless.remove();
        let err = queue.flush(None).unwrap_err();
        assert!(err.is_device_removed());
        assert_eq!(queue.pending_len(), 0);
    }
}
