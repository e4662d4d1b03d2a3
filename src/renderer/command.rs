//! 命令列表管理模块
//!
//! 把 D3D12 显式的"分配器 + 命令列表 + Fence"模型隐藏在隐式的即时上下文之后。
//!
//! # 生命周期
//!
//! ```text
//! Initial → Recording → Closed → Submitted → (退休后可复用)
//! ```
//!
//! - `Initial → Recording`：池重置专属分配器并重新打开列表。
//!   前提是上一次提交分配到的 Fence 值已经完成。
//! - `Recording → Closed`：显式关闭（Present、Flush），或超过自动拆分阈值。
//! - `Closed → Submitted`：`AsyncCommandQueue::execute` 接收列表并分配 Fence 值。
//! - 退休是惰性检测的：只在查询或等待该 Fence 值时才知道。
//!
//! 一个没有录制任何真实 GPU 命令（只有标记）的列表视为"未使用"，关闭时不提交。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::device::Device;
use super::queue::AsyncCommandQueue;
use super::resource::{RenderTargetView, Resource};
use super::sync::{Fence, FenceValue};
use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{
    Backend, GpuCommand, NativeCommandList, NativeDevice, QueueType, ResourceState,
};

/// 命令列表状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListState {
    /// 空闲，可以被重新打开
    Initial,
    /// 正在录制
    Recording,
    /// 已关闭，等待交给队列
    Closed,
    /// 已进入队列批次
    Submitted,
}

/// 自动拆分阈值
///
/// 录制超过任一阈值时，池在下一次 `command_list` 调用中透明地关闭、
/// 提交当前列表并打开一个新的。阈值为 0 表示不限制。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSplitPolicy {
    /// 单个列表的最大命令数
    pub max_commands: usize,
    /// 单个列表的最大编码字节数
    pub max_bytes: usize,
}

impl Default for AutoSplitPolicy {
    fn default() -> Self {
        Self {
            max_commands: 2048,
            max_bytes: 1 << 20,
        }
    }
}

impl AutoSplitPolicy {
    /// 不拆分
    pub fn disabled() -> Self {
        Self {
            max_commands: 0,
            max_bytes: 0,
        }
    }

    pub fn should_split(&self, commands: usize, bytes: usize) -> bool {
        (self.max_commands > 0 && commands >= self.max_commands)
            || (self.max_bytes > 0 && bytes >= self.max_bytes)
    }
}

/// 一个命令列表及其专属分配器
pub struct CommandList<B: Backend> {
    id: usize,
    queue_type: QueueType,
    native: Arc<B::CommandList>,
    state: CommandListState,
    /// 最近一次提交分配到的 Fence 值
    fence_value: Option<FenceValue>,
    utilized: bool,
    command_count: usize,
    byte_count: usize,
    /// 录制期间引用的资源，列表退休前保持存活
    referenced: Vec<Resource<B>>,
}

impl<B: Backend> CommandList<B> {
    fn new(id: usize, queue_type: QueueType, native: B::CommandList) -> Self {
        Self {
            id,
            queue_type,
            native: Arc::new(native),
            state: CommandListState::Initial,
            fence_value: None,
            utilized: false,
            command_count: 0,
            byte_count: 0,
            referenced: Vec::new(),
        }
    }

    /// 池内编号
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn native(&self) -> &Arc<B::CommandList> {
        &self.native
    }

    /// 是否录制过至少一条真实 GPU 命令
    pub fn is_utilized(&self) -> bool {
        self.utilized
    }

    pub fn command_count(&self) -> usize {
        self.command_count
    }

    pub fn byte_count(&self) -> usize {
        self.byte_count
    }

    /// 最近一次提交分配到的 Fence 值
    pub fn fence_value(&self) -> Option<FenceValue> {
        self.fence_value
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32) {
        self.record(
            &GpuCommand::Draw {
                vertex_count,
                instance_count,
            },
            &[],
        );
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        self.record(
            &GpuCommand::DrawIndexed {
                index_count,
                instance_count,
            },
            &[],
        );
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        self.record(&GpuCommand::Dispatch { x, y, z }, &[]);
    }

    pub fn copy_resource(&mut self, dst: &Resource<B>, src: &Resource<B>) {
        self.record(
            &GpuCommand::CopyResource {
                dst: dst.native(),
                src: src.native(),
            },
            &[dst, src],
        );
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: &Resource<B>,
        dst_offset: u64,
        src: &Resource<B>,
        src_offset: u64,
        size: u64,
    ) {
        self.record(
            &GpuCommand::CopyBufferRegion {
                dst: dst.native(),
                dst_offset,
                src: src.native(),
                src_offset,
                size,
            },
            &[dst, src],
        );
    }

    pub fn resource_barrier(&mut self, resource: &Resource<B>, before: ResourceState, after: ResourceState) {
        if before == after {
            return;
        }
        self.record(
            &GpuCommand::Barrier {
                resource: resource.native(),
                before,
                after,
            },
            &[resource],
        );
    }

    pub fn clear_render_target(&mut self, view: &RenderTargetView<B>, color: [f32; 4]) {
        self.record(
            &GpuCommand::ClearRenderTarget {
                view: view.slot(),
                color,
            },
            &[view.resource()],
        );
    }

    /// 调试标记；不会让列表变为"已使用"
    pub fn set_marker(&mut self, text: &str) {
        self.record(&GpuCommand::Marker(text), &[]);
    }

    fn record(&mut self, command: &GpuCommand<'_, B>, resources: &[&Resource<B>]) {
        debug_assert_eq!(
            self.state,
            CommandListState::Recording,
            "recording into a command list that is not open"
        );
        if self.state != CommandListState::Recording {
            warn!(list = self.id, command = command.name(), state = ?self.state, "Command dropped, list is not recording");
            return;
        }
        self.native.record(command);
        self.command_count += 1;
        self.byte_count += command.encoded_size();
        if !command.is_marker() {
            self.utilized = true;
        }
        for resource in resources {
            if !self.referenced.iter().any(|r| r.ptr_eq(resource)) {
                self.referenced.push((*resource).clone());
            }
        }
    }

    /// 列表是否可以重新打开
    fn is_reusable(&self, fence: &Fence<B>) -> bool {
        match self.state {
            CommandListState::Initial => true,
            CommandListState::Submitted => self.fence_value.map_or(true, |v| fence.is_completed(v)),
            CommandListState::Recording | CommandListState::Closed => false,
        }
    }

    /// 重置分配器并打开列表
    fn begin(&mut self, fence: &Fence<B>) -> Result<()> {
        debug_assert!(self.is_reusable(fence), "allocator reset before its fence value was reached");

        let hr = self.native.reset_allocator();
        if hr.is_err() {
            return Err(GraphicsError::AllocatorReset {
                queue: self.queue_type,
                hr,
            }
            .into());
        }
        let hr = self.native.reopen();
        if hr.is_err() {
            return Err(GraphicsError::Native { op: "Reset", hr }.into());
        }

        self.referenced.clear();
        self.utilized = false;
        self.command_count = 0;
        self.byte_count = 0;
        self.state = CommandListState::Recording;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        debug_assert_eq!(self.state, CommandListState::Recording);
        let hr = self.native.close();
        if hr.is_err() {
            // 关闭失败的列表不能提交，下一次打开时会重置
            self.state = CommandListState::Initial;
            self.fence_value = None;
            return Err(GraphicsError::Native { op: "Close", hr }.into());
        }
        self.state = CommandListState::Closed;
        Ok(())
    }

    /// 由队列调用：列表进入批次并获得 Fence 值
    pub(crate) fn mark_submitted(&mut self, value: FenceValue) {
        debug_assert_eq!(self.state, CommandListState::Closed, "only closed lists can be executed");
        self.state = CommandListState::Submitted;
        self.fence_value = Some(value);
    }

    /// 未使用的列表关闭后直接回到空闲
    fn recycle_unused(&mut self) {
        debug_assert!(!self.utilized);
        self.state = CommandListState::Initial;
        self.referenced.clear();
    }
}

/// 命令列表池统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 创建的列表数量
    pub created: u64,
    /// 分配器重置次数
    pub resets: u64,
    /// 自动拆分次数
    pub splits: u64,
    /// 交给队列的列表数量
    pub submissions: u64,
    /// 被修剪掉的列表数量
    pub trimmed: u64,
}

/// 命令列表池
///
/// 一个队列类型一个池，由单个录制线程独占。
/// 所有列表都在等待退休时池会新建一个列表，而不是阻塞录制线程。
pub struct CommandListPool<B: Backend> {
    device: Arc<Device<B>>,
    fence: Arc<Fence<B>>,
    queue_type: QueueType,
    lists: Vec<CommandList<B>>,
    current: Option<usize>,
    split: AutoSplitPolicy,
    initial_capacity: usize,
    next_id: usize,
    stats: PoolStats,
}

impl<B: Backend> CommandListPool<B> {
    /// 创建池并预先分配 `initial_capacity` 个列表
    pub fn new(
        device: Arc<Device<B>>,
        fence: Arc<Fence<B>>,
        split: AutoSplitPolicy,
        initial_capacity: usize,
    ) -> Result<Self> {
        let queue_type = fence.queue_type();
        let mut pool = Self {
            device,
            fence,
            queue_type,
            lists: Vec::with_capacity(initial_capacity),
            current: None,
            split,
            initial_capacity,
            next_id: 0,
            stats: PoolStats::default(),
        };
        for _ in 0..initial_capacity {
            pool.create_list()?;
        }
        debug!(queue = queue_type.name(), initial_capacity, ?split, "Command list pool created");
        Ok(pool)
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    /// 池中列表总数
    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn split_policy(&self) -> AutoSplitPolicy {
        self.split
    }

    pub fn set_split_policy(&mut self, split: AutoSplitPolicy) {
        self.split = split;
    }

    /// 当前正在录制的列表
    pub fn current(&self) -> Option<&CommandList<B>> {
        self.current.map(|i| &self.lists[i])
    }

    /// 当前列表是否已使用；没有打开的列表时为 false
    pub fn is_current_utilized(&self) -> bool {
        self.current().map_or(false, CommandList::is_utilized)
    }

    /// 所有列表的状态
    pub fn states(&self) -> Vec<CommandListState> {
        self.lists.iter().map(CommandList::state).collect()
    }

    fn create_list(&mut self) -> Result<usize> {
        let native = self
            .device
            .native()
            .create_command_list(self.queue_type)
            .map_err(|hr| GraphicsError::CommandListCreation {
                queue: self.queue_type,
                hr,
            })?;
        let id = self.next_id;
        self.next_id += 1;
        self.lists.push(CommandList::new(id, self.queue_type, native));
        self.stats.created += 1;
        trace!(queue = self.queue_type.name(), list = id, "Command list created");
        Ok(self.lists.len() - 1)
    }

    /// 返回当前录制的列表，必要时打开一个
    ///
    /// 当前列表超过拆分阈值时，先把它关闭、提交并 flush，再打开新列表。
    /// 分配器重置失败是致命错误。
    pub fn command_list(&mut self, queue: &mut AsyncCommandQueue<B>) -> Result<&mut CommandList<B>> {
        if let Some(index) = self.current {
            let list = &self.lists[index];
            if !self.split.should_split(list.command_count(), list.byte_count()) {
                return Ok(&mut self.lists[index]);
            }
            debug!(
                queue = self.queue_type.name(),
                commands = list.command_count(),
                bytes = list.byte_count(),
                "Auto-splitting command list"
            );
            self.close_command_list(queue)?;
            queue.flush(None)?;
            self.stats.splits += 1;
        }

        // 设备移除后完成值报告为最大值，在途列表看起来都已退休
        self.fence.check_not_removed()?;
        let index = match self.lists.iter().position(|l| l.is_reusable(&self.fence)) {
            Some(index) => index,
            None => {
                let index = self.create_list()?;
                if self.lists.len() > self.initial_capacity {
                    debug!(
                        queue = self.queue_type.name(),
                        lists = self.lists.len(),
                        "All command lists in flight, pool grew"
                    );
                }
                index
            }
        };

        let list = &mut self.lists[index];
        list.begin(&self.fence)?;
        self.stats.resets += 1;
        self.current = Some(index);
        trace!(queue = self.queue_type.name(), list = list.id(), "Command list opened");
        Ok(list)
    }

    /// 关闭当前列表并交给队列的批次
    ///
    /// 返回该列表分配到的 Fence 值；没有打开的列表或列表未使用时返回 `None`，
    /// 此时不会产生任何提交。
    pub fn close_command_list(&mut self, queue: &mut AsyncCommandQueue<B>) -> Result<Option<FenceValue>> {
        let Some(index) = self.current.take() else {
            return Ok(None);
        };
        let list = &mut self.lists[index];
        list.close()?;

        if !list.is_utilized() {
            list.recycle_unused();
            trace!(queue = self.queue_type.name(), list = list.id(), "Unutilized command list recycled");
            return Ok(None);
        }
        let value = queue.execute(list);
        self.stats.submissions += 1;
        Ok(Some(value))
    }

    /// 把 Fence 已完成的已提交列表收回空闲状态，并释放它们引用的资源
    pub fn recycle_retired(&mut self) -> usize {
        let mut recycled = 0;
        for list in &mut self.lists {
            if list.state == CommandListState::Submitted && list.is_reusable(&self.fence) {
                list.state = CommandListState::Initial;
                list.referenced.clear();
                recycled += 1;
            }
        }
        recycled
    }

    /// 丢弃超过初始容量的空闲列表，返回丢弃数量
    pub fn trim(&mut self) -> usize {
        self.recycle_retired();
        let mut removed = 0;
        let mut i = 0;
        while i < self.lists.len() && self.lists.len() > self.initial_capacity {
            if Some(i) != self.current && self.lists[i].is_reusable(&self.fence) {
                self.lists.remove(i);
                if let Some(current) = self.current.as_mut() {
                    if *current > i {
                        *current -= 1;
                    }
                }
                removed += 1;
            } else {
                i += 1;
            }
        }
        if removed > 0 {
            self.stats.trimmed += removed as u64;
            debug!(queue = self.queue_type.name(), removed, remaining = self.lists.len(), "Command list pool trimmed");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::backend::ResourceDesc;
    use crate::gfx::headless::{ExecutionMode, Headless, HeadlessDevice, NativeCall};
    use crate::renderer::sync::CommandListFenceSet;
    use std::time::Duration;

    struct Fixture {
        headless: HeadlessDevice,
        device: Arc<Device<Headless>>,
        fences: CommandListFenceSet<Headless>,
        queue: AsyncCommandQueue<Headless>,
    }

    fn fixture(mode: ExecutionMode) -> Fixture {
        let headless = HeadlessDevice::new(mode, Duration::ZERO);
        let device = Device::<Headless>::new(headless.clone(), 8).unwrap();
        let fences = device.create_fence_set(Duration::from_millis(1), 4).unwrap();
        let queue = device.create_queue(QueueType::Graphics, &fences).unwrap();
        Fixture {
            headless,
            device,
            fences,
            queue,
        }
    }

    fn pool(f: &Fixture, split: AutoSplitPolicy, capacity: usize) -> CommandListPool<Headless> {
        f.device
            .create_command_list_pool(QueueType::Graphics, &f.fences, split, capacity)
            .unwrap()
    }

    #[test]
    fn test_state_machine() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);
        assert_eq!(pool.states(), vec![CommandListState::Initial]);

        let list = pool.command_list(&mut f.queue).unwrap();
        assert_eq!(list.state(), CommandListState::Recording);
        list.draw(3, 1);

        let value = pool.close_command_list(&mut f.queue).unwrap();
        assert_eq!(value, Some(FenceValue::new(1)));
        assert_eq!(pool.states(), vec![CommandListState::Submitted]);
        assert!(pool.current().is_none());
    }

    #[test]
    fn test_markers_do_not_utilize() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);

        let list = pool.command_list(&mut f.queue).unwrap();
        list.set_marker("frame begin");
        assert!(!list.is_utilized());
        assert_eq!(list.command_count(), 1);

        assert_eq!(pool.close_command_list(&mut f.queue).unwrap(), None);
        assert_eq!(pool.states(), vec![CommandListState::Initial]);
        assert_eq!(f.queue.pending_len(), 0);
        assert_eq!(pool.stats().submissions, 0);
    }

    #[test]
    fn test_pool_grows_instead_of_blocking() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);

        for _ in 0..3 {
            pool.command_list(&mut f.queue).unwrap().draw(3, 1);
            pool.close_command_list(&mut f.queue).unwrap();
            f.queue.flush(None).unwrap();
        }
        // GPU 没有推进，每一帧都需要新列表
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.stats().created, 3);

        f.headless.retire_all();
        pool.command_list(&mut f.queue).unwrap().draw(3, 1);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_reuse_waits_for_retirement() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 2);

        for _ in 0..6 {
            pool.command_list(&mut f.queue).unwrap().draw(3, 1);
            pool.close_command_list(&mut f.queue).unwrap();
            f.queue.flush(None).unwrap();
            f.headless.advance(QueueType::Graphics);
        }
        let unsafe_resets = f
            .headless
            .log()
            .count(|c| matches!(c, NativeCall::AllocatorReset { in_flight: true, .. }));
        assert_eq!(unsafe_resets, 0);
    }

    #[test]
    fn test_auto_split() {
        let mut f = fixture(ExecutionMode::Immediate);
        let split = AutoSplitPolicy {
            max_commands: 4,
            max_bytes: 0,
        };
        let mut pool = pool(&f, split, 2);

        for _ in 0..10 {
            pool.command_list(&mut f.queue).unwrap().draw(3, 1);
        }
        assert_eq!(pool.stats().splits, 2);
        assert_eq!(pool.current().map(CommandList::command_count), Some(2));
        assert_eq!(
            f.headless
                .log()
                .count(|c| matches!(c, NativeCall::ExecuteCommandLists { .. })),
            2
        );
        assert_eq!(f.fences.last_signaled(QueueType::Graphics), FenceValue::new(2));
    }

    #[test]
    fn test_allocator_reset_failure_is_fatal() {
        let mut f = fixture(ExecutionMode::Immediate);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);
        f.headless
            .fail_next_allocator_reset(crate::gfx::backend::HResult::E_OUTOFMEMORY);

        let err = pool.command_list(&mut f.queue).err().unwrap();
        assert!(matches!(
            err,
            crate::core::error::On12Error::Graphics(GraphicsError::AllocatorReset { .. })
        ));
    }

    #[test]
    fn test_removed_device_does_not_reset_in_flight_allocators() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);

        pool.command_list(&mut f.queue).unwrap().draw(3, 1);
        pool.close_command_list(&mut f.queue).unwrap();
        f.queue.flush(None).unwrap();
        f.headless.remove();

        let err = pool.command_list(&mut f.queue).err().unwrap();
        assert!(err.is_device_removed());
        assert_eq!(err.hresult(), crate::gfx::backend::HResult::DXGI_ERROR_DEVICE_REMOVED);
        assert_eq!(
            f.headless
                .log()
                .count(|c| matches!(c, NativeCall::AllocatorReset { in_flight: true, .. })),
            0
        );
        assert!(pool.current().is_none());
    }

    #[test]
    fn test_referenced_resources_live_until_recycled() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);
        let src = f.device.create_resource(&ResourceDesc::buffer(256), None).unwrap();
        let dst = f.device.create_resource(&ResourceDesc::buffer(256), None).unwrap();

        pool.command_list(&mut f.queue)
            .unwrap()
            .copy_buffer_region(&dst, 0, &src, 0, 128);
        assert_eq!(src.handle_count(), 2);
        pool.close_command_list(&mut f.queue).unwrap();
        f.queue.flush(None).unwrap();
        assert_eq!(src.handle_count(), 2);

        f.headless.retire_all();
        pool.command_list(&mut f.queue).unwrap();
        assert_eq!(src.handle_count(), 1);
        assert_eq!(dst.handle_count(), 1);
    }

    #[test]
    fn test_trim_drops_idle_lists() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);
        for _ in 0..4 {
            pool.command_list(&mut f.queue).unwrap().dispatch(1, 1, 1);
            pool.close_command_list(&mut f.queue).unwrap();
            f.queue.flush(None).unwrap();
        }
        assert_eq!(pool.len(), 4);
        assert_eq!(pool.trim(), 0);

        f.headless.retire_all();
        assert_eq!(pool.trim(), 3);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.stats().trimmed, 3);
    }

    #[test]
    fn test_recycle_retired_releases_references() {
        let mut f = fixture(ExecutionMode::Manual);
        let mut pool = pool(&f, AutoSplitPolicy::disabled(), 1);
        let buffer = f.device.create_resource(&ResourceDesc::buffer(64), None).unwrap();

        pool.command_list(&mut f.queue)
            .unwrap()
            .resource_barrier(&buffer, ResourceState::Common, ResourceState::CopyDest);
        pool.close_command_list(&mut f.queue).unwrap();
        f.queue.flush(None).unwrap();
        assert_eq!(pool.recycle_retired(), 0);
        assert_eq!(buffer.handle_count(), 2);

        f.headless.retire_all();
        assert_eq!(pool.recycle_retired(), 1);
        assert_eq!(buffer.handle_count(), 1);
        assert_eq!(pool.states(), vec![CommandListState::Initial]);
    }
}
