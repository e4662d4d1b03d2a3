//! 无窗口的软件 GPU 后端
//!
//! 实现 `gfx::backend` 中的全部原生接口，不依赖任何图形驱动。
//! GPU 的"执行"只是按提交顺序处理队列时间线上的操作：执行命令列表、
//! 推进 Fence。每一次原生调用都会写入共享的调用日志，测试据此断言调用顺序。
//!
//! # 执行模式
//!
//! - `Immediate`：提交即完成
//! - `Manual`：只有显式 `retire_all` / `advance`，或 CPU 阻塞在 Fence 上时才推进
//! - `Threaded`：每个队列一个工作线程，按配置的延迟异步完成

mod device;
mod swap_chain;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::gfx::backend::{Backend, QueueType, SwapEffect};

pub use device::{
    HeadlessCommandList, HeadlessDevice, HeadlessFence, HeadlessQueue, HeadlessResource,
    RecordedCommand,
};
pub use swap_chain::{HeadlessFactory, HeadlessSwapChain};

/// 软件 GPU 后端
pub struct Headless;

impl Backend for Headless {
    type Device = HeadlessDevice;
    type Queue = HeadlessQueue;
    type Fence = HeadlessFence;
    type CommandList = HeadlessCommandList;
    type Resource = HeadlessResource;
    type SwapChain = HeadlessSwapChain;
    type Factory = HeadlessFactory;

    fn name() -> &'static str {
        "Headless"
    }
}

/// 软件 GPU 的执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Immediate,
    Manual,
    Threaded,
}

/// 一次被记录的原生调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    CreateQueue(QueueType),
    CreateCommandList { list: u64, queue: QueueType },
    AllocatorReset { list: u64, in_flight: bool },
    ExecuteCommandLists { queue: QueueType, lists: Vec<u64> },
    Signal { queue: QueueType, value: u64 },
    CreateRenderTargetView { resource: u64, slot: u32 },
    ResourceDestroyed { resource: u64 },
    CreateSwapChain { swap_effect: SwapEffect, buffer_count: u32 },
    GetBuffer { index: u32, resource: u64 },
    Present { sync_interval: u32, flags: u32, back_buffer: u32 },
    ResizeBuffers { buffer_count: u32, width: u32, height: u32, accepted: bool },
    ResizeTarget { width: u32, height: u32 },
    /// 原生交换链销毁；`outstanding_buffers` 表示此时仍有缓冲区引用未释放
    SwapChainDestroyed { outstanding_buffers: bool },
}

/// 共享的原生调用日志
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<NativeCall>>>);

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, call: NativeCall) {
        self.0.lock().push(call);
    }

    /// 当前日志的快照
    pub fn snapshot(&self) -> Vec<NativeCall> {
        self.0.lock().clone()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.0.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    /// 第一个满足条件的调用位置
    pub fn position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&NativeCall) -> bool,
    {
        self.0.lock().iter().position(pred)
    }

    /// 最后一个满足条件的调用位置
    pub fn last_position<F>(&self, pred: F) -> Option<usize>
    where
        F: Fn(&NativeCall) -> bool,
    {
        self.0.lock().iter().rposition(pred)
    }

    /// 满足条件的调用次数
    pub fn count<F>(&self, pred: F) -> usize
    where
        F: Fn(&NativeCall) -> bool,
    {
        self.0.lock().iter().filter(|call| pred(call)).count()
    }
}
