//! 软件 GPU：设备、队列时间线、Fence、命令列表和资源

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{CallLog, ExecutionMode, Headless, NativeCall};
use crate::gfx::backend::{
    DescriptorHeapInfo, DescriptorSlot, FenceWait, GpuCommand, HResult, NativeCommandList,
    NativeDevice, NativeFence, NativeQueue, NativeResource, QueueType, ResourceDesc,
};

/// 软件 GPU 的全局状态，由设备创建的所有对象共享
pub(crate) struct GpuShared {
    pub(crate) mode: ExecutionMode,
    latency: Duration,
    pub(crate) log: CallLog,
    next_id: AtomicU64,
    hung: AtomicBool,
    removed_reason: AtomicI32,
    timelines: Mutex<Vec<Weak<Timeline>>>,
    pub(crate) faults: Mutex<FaultInjection>,
}

/// 测试用的故障注入
#[derive(Default)]
pub(crate) struct FaultInjection {
    pub(crate) allocator_reset: Option<HResult>,
    pub(crate) signal: Option<HResult>,
    pub(crate) present: Option<HResult>,
    pub(crate) resize_buffers: Option<HResult>,
}

impl GpuShared {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn removed_reason(&self) -> HResult {
        HResult(self.removed_reason.load(Ordering::Acquire))
    }

    fn is_removed(&self) -> bool {
        self.removed_reason.load(Ordering::Acquire) == HResult::DXGI_ERROR_DEVICE_REMOVED.0
    }

    fn is_hung(&self) -> bool {
        self.hung.load(Ordering::Acquire)
    }

    /// 手动模式下推进所有队列，直到 `done` 返回 true 或没有可执行的操作
    fn drive_until<F: Fn() -> bool>(&self, done: F) -> bool {
        loop {
            if done() {
                return true;
            }
            if self.is_hung() {
                return false;
            }
            let timelines: Vec<Arc<Timeline>> =
                self.timelines.lock().iter().filter_map(Weak::upgrade).collect();
            let mut progressed = false;
            for timeline in &timelines {
                progressed |= timeline.step(self);
            }
            if !progressed {
                return done();
            }
        }
    }
}

/// 队列时间线上的一个 GPU 操作
enum GpuOp {
    Execute(Vec<Arc<ListState>>),
    Signal(Arc<FenceState>, u64),
}

fn process(op: GpuOp) {
    match op {
        GpuOp::Execute(lists) => {
            for list in lists {
                list.in_flight.fetch_sub(1, Ordering::AcqRel);
            }
        }
        GpuOp::Signal(fence, value) => fence.complete(value),
    }
}

/// 一个队列的执行时间线
struct Timeline {
    queue_type: QueueType,
    pending: Mutex<VecDeque<GpuOp>>,
    sender: Mutex<Option<Sender<GpuOp>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
}

impl Timeline {
    fn new(queue_type: QueueType, shared: &Arc<GpuShared>) -> Arc<Self> {
        let closing = Arc::new(AtomicBool::new(false));
        let (sender, worker) = if shared.mode == ExecutionMode::Threaded {
            let (tx, rx) = mpsc::channel::<GpuOp>();
            let gpu = Arc::clone(shared);
            let stop = Arc::clone(&closing);
            let handle = thread::Builder::new()
                .name(format!("headless-{}-queue", queue_type.name()))
                .spawn(move || {
                    for op in rx {
                        if matches!(op, GpuOp::Execute(_)) && !gpu.latency.is_zero() {
                            thread::sleep(gpu.latency);
                        }
                        while gpu.is_hung() {
                            if stop.load(Ordering::Acquire) {
                                return;
                            }
                            thread::park_timeout(Duration::from_millis(1));
                        }
                        process(op);
                    }
                })
                .ok();
            if handle.is_none() {
                warn!(queue = queue_type.name(), "Failed to spawn headless queue worker, falling back to immediate retirement");
            }
            (handle.as_ref().map(|_| tx), handle)
        } else {
            (None, None)
        };

        let timeline = Arc::new(Self {
            queue_type,
            pending: Mutex::new(VecDeque::new()),
            sender: Mutex::new(sender),
            worker: Mutex::new(worker),
            closing,
        });
        shared.timelines.lock().push(Arc::downgrade(&timeline));
        timeline
    }

    fn submit(&self, shared: &GpuShared, op: GpuOp) {
        match shared.mode {
            ExecutionMode::Manual => self.pending.lock().push_back(op),
            ExecutionMode::Threaded => {
                let sender = self.sender.lock();
                match sender.as_ref() {
                    Some(tx) => {
                        if let Err(mpsc::SendError(op)) = tx.send(op) {
                            process(op);
                        }
                    }
                    None => process(op),
                }
            }
            ExecutionMode::Immediate => {
                if shared.is_hung() {
                    self.pending.lock().push_back(op);
                } else {
                    process(op);
                }
            }
        }
    }

    /// 手动执行一个操作，返回是否有进展
    fn step(&self, shared: &GpuShared) -> bool {
        if shared.is_hung() {
            return false;
        }
        let op = self.pending.lock().pop_front();
        match op {
            Some(op) => {
                process(op);
                true
            }
            None => false,
        }
    }
}

impl Drop for Timeline {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.sender.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!(queue = self.queue_type.name(), "Headless queue worker panicked");
            }
        }
    }
}

/// 软件 GPU 设备
#[derive(Clone)]
pub struct HeadlessDevice {
    pub(crate) shared: Arc<GpuShared>,
}

impl HeadlessDevice {
    /// 创建设备
    ///
    /// * `mode` - 执行模式
    /// * `latency` - 线程模式下每批命令列表的模拟执行时间
    pub fn new(mode: ExecutionMode, latency: Duration) -> Self {
        debug!(?mode, ?latency, "Headless device created");
        Self {
            shared: Arc::new(GpuShared {
                mode,
                latency,
                log: CallLog::new(),
                next_id: AtomicU64::new(1),
                hung: AtomicBool::new(false),
                removed_reason: AtomicI32::new(HResult::S_OK.0),
                timelines: Mutex::new(Vec::new()),
                faults: Mutex::new(FaultInjection::default()),
            }),
        }
    }

    /// 原生调用日志
    pub fn log(&self) -> &CallLog {
        &self.shared.log
    }

    pub fn mode(&self) -> ExecutionMode {
        self.shared.mode
    }

    /// 处理所有队列上已提交的工作（手动模式）
    pub fn retire_all(&self) {
        self.shared.drive_until(|| false);
    }

    /// 在指定队列上执行一个操作（手动模式），返回是否有进展
    pub fn advance(&self, queue_type: QueueType) -> bool {
        let timelines: Vec<Arc<Timeline>> =
            self.shared.timelines.lock().iter().filter_map(Weak::upgrade).collect();
        timelines
            .iter()
            .filter(|t| t.queue_type == queue_type)
            .any(|t| t.step(&self.shared))
    }

    /// 模拟 GPU 挂起：停止推进，设备移除原因变为 `DXGI_ERROR_DEVICE_HUNG`
    pub fn hang(&self) {
        warn!("Headless GPU hung");
        self.shared.hung.store(true, Ordering::Release);
        self.shared
            .removed_reason
            .store(HResult::DXGI_ERROR_DEVICE_HUNG.0, Ordering::Release);
    }

    /// 模拟设备移除：Fence 完成值变为 `u64::MAX`
    pub fn remove(&self) {
        warn!("Headless device removed");
        self.shared
            .removed_reason
            .store(HResult::DXGI_ERROR_DEVICE_REMOVED.0, Ordering::Release);
    }

    /// 下一次分配器重置返回 `hr`
    pub fn fail_next_allocator_reset(&self, hr: HResult) {
        self.shared.faults.lock().allocator_reset = Some(hr);
    }

    /// 下一次队列 Signal 返回 `hr`，不入队
    pub fn fail_next_signal(&self, hr: HResult) {
        self.shared.faults.lock().signal = Some(hr);
    }

    /// 之后所有 Present 返回 `hr`（`None` 恢复正常）
    pub fn set_present_result(&self, hr: Option<HResult>) {
        self.shared.faults.lock().present = hr;
    }

    /// 之后所有 ResizeBuffers 返回 `hr`（`None` 恢复正常）
    pub fn set_resize_result(&self, hr: Option<HResult>) {
        self.shared.faults.lock().resize_buffers = hr;
    }
}

impl NativeDevice<Headless> for HeadlessDevice {
    fn create_queue(&self, queue_type: QueueType) -> Result<HeadlessQueue, HResult> {
        self.shared.removed_reason().ok()?;
        self.shared.log.push(NativeCall::CreateQueue(queue_type));
        Ok(HeadlessQueue {
            queue_type,
            timeline: Timeline::new(queue_type, &self.shared),
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_fence(&self, initial_value: u64) -> Result<HeadlessFence, HResult> {
        self.shared.removed_reason().ok()?;
        Ok(HeadlessFence(Arc::new(FenceState {
            completed: Mutex::new(initial_value),
            cond: Condvar::new(),
            shared: Arc::clone(&self.shared),
        })))
    }

    fn create_command_list(&self, queue_type: QueueType) -> Result<HeadlessCommandList, HResult> {
        self.shared.removed_reason().ok()?;
        let id = self.shared.next_id();
        self.shared.log.push(NativeCall::CreateCommandList { list: id, queue: queue_type });
        Ok(HeadlessCommandList(Arc::new(ListState {
            id,
            shared: Arc::clone(&self.shared),
            recording: Mutex::new(Recording::default()),
            in_flight: AtomicU32::new(0),
        })))
    }

    fn create_committed_resource(&self, desc: &ResourceDesc) -> Result<HeadlessResource, HResult> {
        self.shared.removed_reason().ok()?;
        if desc.width == 0 || desc.height == 0 {
            return Err(HResult::E_INVALIDARG);
        }
        Ok(HeadlessResource::new(&self.shared, desc.clone()))
    }

    fn create_rtv_heap(&self, capacity: u32) -> Result<DescriptorHeapInfo, HResult> {
        if capacity == 0 {
            return Err(HResult::E_INVALIDARG);
        }
        Ok(DescriptorHeapInfo {
            cpu_start: 0x1000_0000,
            increment: 32,
            capacity,
        })
    }

    fn create_render_target_view(&self, resource: &HeadlessResource, slot: DescriptorSlot) -> HResult {
        self.shared.log.push(NativeCall::CreateRenderTargetView {
            resource: resource.id(),
            slot: slot.index,
        });
        HResult::S_OK
    }

    fn removed_reason(&self) -> HResult {
        self.shared.removed_reason()
    }
}

/// 软件 GPU 命令队列
pub struct HeadlessQueue {
    queue_type: QueueType,
    timeline: Arc<Timeline>,
    shared: Arc<GpuShared>,
}

impl NativeQueue<Headless> for HeadlessQueue {
    fn execute(&self, lists: &[&HeadlessCommandList]) {
        let states: Vec<Arc<ListState>> = lists.iter().map(|l| Arc::clone(&l.0)).collect();
        for state in &states {
            state.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        self.shared.log.push(NativeCall::ExecuteCommandLists {
            queue: self.queue_type,
            lists: states.iter().map(|s| s.id).collect(),
        });
        trace!(queue = self.queue_type.name(), count = states.len(), "ExecuteCommandLists");
        self.timeline.submit(&self.shared, GpuOp::Execute(states));
    }

    fn signal(&self, fence: &HeadlessFence, value: u64) -> HResult {
        if self.shared.is_removed() {
            return HResult::DXGI_ERROR_DEVICE_REMOVED;
        }
        if let Some(hr) = self.shared.faults.lock().signal.take() {
            warn!(queue = self.queue_type.name(), value, %hr, "Injected signal failure");
            return hr;
        }
        self.shared.log.push(NativeCall::Signal { queue: self.queue_type, value });
        self.timeline
            .submit(&self.shared, GpuOp::Signal(Arc::clone(&fence.0), value));
        HResult::S_OK
    }
}

pub(crate) struct FenceState {
    completed: Mutex<u64>,
    cond: Condvar,
    shared: Arc<GpuShared>,
}

impl FenceState {
    fn complete(&self, value: u64) {
        let mut completed = self.completed.lock();
        if value > *completed {
            *completed = value;
        }
        self.cond.notify_all();
    }

    fn value(&self) -> u64 {
        if self.shared.is_removed() {
            return u64::MAX;
        }
        *self.completed.lock()
    }
}

/// 软件 GPU Fence
pub struct HeadlessFence(Arc<FenceState>);

impl NativeFence for HeadlessFence {
    fn completed_value(&self) -> u64 {
        self.0.value()
    }

    fn wait(&self, value: u64, slice: Duration) -> FenceWait {
        if self.0.value() >= value {
            return FenceWait::Reached;
        }
        match self.0.shared.mode {
            ExecutionMode::Manual => {
                if self.0.shared.drive_until(|| self.0.value() >= value) {
                    FenceWait::Reached
                } else {
                    thread::sleep(slice.min(Duration::from_millis(1)));
                    FenceWait::TimedOut
                }
            }
            ExecutionMode::Immediate | ExecutionMode::Threaded => {
                let mut completed = self.0.completed.lock();
                let removed = &self.0.shared;
                self.0
                    .cond
                    .wait_while_for(&mut completed, |c| *c < value && !removed.is_removed(), slice);
                if *completed >= value || removed.is_removed() {
                    FenceWait::Reached
                } else {
                    FenceWait::TimedOut
                }
            }
        }
    }
}

/// 录制到软件命令列表中的命令摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    pub name: &'static str,
    pub resources: Vec<u64>,
}

#[derive(Default)]
struct Recording {
    open: bool,
    invalid: bool,
    commands: Vec<RecordedCommand>,
}

pub(crate) struct ListState {
    id: u64,
    shared: Arc<GpuShared>,
    recording: Mutex<Recording>,
    in_flight: AtomicU32,
}

/// 软件 GPU 命令列表（含专属分配器）
pub struct HeadlessCommandList(Arc<ListState>);

impl HeadlessCommandList {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// 当前录制内容的快照
    pub fn recorded(&self) -> Vec<RecordedCommand> {
        self.0.recording.lock().commands.clone()
    }

    /// GPU 是否仍在执行这个列表
    pub fn is_in_flight(&self) -> bool {
        self.0.in_flight.load(Ordering::Acquire) > 0
    }
}

impl NativeCommandList<Headless> for HeadlessCommandList {
    fn reset_allocator(&self) -> HResult {
        let in_flight = self.is_in_flight();
        self.0.shared.log.push(NativeCall::AllocatorReset { list: self.0.id, in_flight });
        if in_flight {
            warn!(list = self.0.id, "Allocator reset while the GPU still executes from it");
            return HResult::DXGI_ERROR_INVALID_CALL;
        }
        if let Some(hr) = self.0.shared.faults.lock().allocator_reset.take() {
            return hr;
        }
        let mut recording = self.0.recording.lock();
        recording.commands.clear();
        recording.invalid = false;
        HResult::S_OK
    }

    fn reopen(&self) -> HResult {
        let mut recording = self.0.recording.lock();
        if recording.open {
            return HResult::DXGI_ERROR_INVALID_CALL;
        }
        recording.open = true;
        HResult::S_OK
    }

    fn record(&self, command: &GpuCommand<'_, Headless>) {
        let resources = match command {
            GpuCommand::Barrier { resource, .. } => vec![resource.id()],
            GpuCommand::CopyResource { dst, src } | GpuCommand::CopyBufferRegion { dst, src, .. } => {
                vec![dst.id(), src.id()]
            }
            _ => Vec::new(),
        };
        let mut recording = self.0.recording.lock();
        if !recording.open {
            recording.invalid = true;
            return;
        }
        recording.commands.push(RecordedCommand {
            name: command.name(),
            resources,
        });
    }

    fn close(&self) -> HResult {
        let mut recording = self.0.recording.lock();
        if !recording.open || recording.invalid {
            return HResult::DXGI_ERROR_INVALID_CALL;
        }
        recording.open = false;
        HResult::S_OK
    }
}

pub(crate) struct ResourceState {
    id: u64,
    desc: ResourceDesc,
    log: CallLog,
}

impl Drop for ResourceState {
    fn drop(&mut self) {
        self.log.push(NativeCall::ResourceDestroyed { resource: self.id });
    }
}

/// 软件 GPU 资源；克隆等同于增加引用计数
#[derive(Clone)]
pub struct HeadlessResource(Arc<ResourceState>);

impl HeadlessResource {
    pub(crate) fn new(shared: &GpuShared, desc: ResourceDesc) -> Self {
        Self(Arc::new(ResourceState {
            id: shared.next_id(),
            desc,
            log: shared.log.clone(),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.0.desc
    }

    /// 原生引用计数
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }
}

impl NativeResource for HeadlessResource {}
