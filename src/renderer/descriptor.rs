//! 描述符管理模块
//!
//! 设备持有一个仅 CPU 可见的 RTV 描述符堆。交换链在每次获取缓冲区时
//! 为每个后台缓冲区分配一个槽位，视图释放时槽位归还，调整大小的
//! 反复获取/放弃不会耗尽堆。

use crate::core::error::{GraphicsError, Result};
use crate::gfx::backend::{DescriptorHeapInfo, DescriptorSlot};

/// 描述符堆统计信息
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DescriptorHeapStats {
    /// 总容量
    pub capacity: u32,
    /// 已使用数量
    pub used: u32,
    /// 使用率 (0.0 - 1.0)
    pub usage_ratio: f32,
}

/// RTV 描述符分配器
///
/// 线性增长加空闲链表：优先复用归还的槽位，其次使用未触及的槽位。
#[derive(Debug)]
pub struct DescriptorAllocator {
    heap: DescriptorHeapInfo,
    /// 从未分配过的第一个索引
    high_water: u32,
    /// 归还的槽位
    free: Vec<u32>,
}

impl DescriptorAllocator {
    pub fn new(heap: DescriptorHeapInfo) -> Self {
        Self {
            heap,
            high_water: 0,
            free: Vec::new(),
        }
    }

    /// 分配一个槽位
    pub fn allocate(&mut self) -> Result<DescriptorSlot> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.high_water < self.heap.capacity => {
                self.high_water += 1;
                self.high_water - 1
            }
            None => {
                return Err(GraphicsError::DescriptorExhausted {
                    capacity: self.heap.capacity,
                }
                .into())
            }
        };
        Ok(self.slot(index))
    }

    /// 归还一个槽位
    pub fn free(&mut self, slot: DescriptorSlot) {
        debug_assert!(slot.index < self.high_water, "slot was never allocated");
        debug_assert!(!self.free.contains(&slot.index), "slot freed twice");
        self.free.push(slot.index);
    }

    fn slot(&self, index: u32) -> DescriptorSlot {
        DescriptorSlot {
            ptr: self.heap.cpu_start + (index as usize) * (self.heap.increment as usize),
            index,
        }
    }

    /// 当前使用的槽位数量
    pub fn used(&self) -> u32 {
        self.high_water - self.free.len() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.heap.capacity
    }

    pub fn stats(&self) -> DescriptorHeapStats {
        let used = self.used();
        DescriptorHeapStats {
            capacity: self.heap.capacity,
            used,
            usage_ratio: if self.heap.capacity > 0 {
                used as f32 / self.heap.capacity as f32
            } else {
                0.0
            },
        }
    }
}
