//! 资源管理模块
//!
//! GPU 资源和渲染目标视图的共享句柄。
//! 句柄是普通的引用计数（`Arc`）：最后一个持有者释放时，原生对象随之销毁。
//! 命令列表在录制时克隆它引用的资源句柄，直到该列表的 Fence 退休才放手，
//! 因此一个资源不会在 GPU 仍读取它时被销毁。

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::descriptor::DescriptorAllocator;
use crate::gfx::backend::{Backend, DescriptorSlot, ResourceDesc};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// 资源标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    fn next() -> Self {
        Self(NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

struct ResourceInner<B: Backend> {
    id: ResourceId,
    desc: ResourceDesc,
    name: Option<String>,
    native: B::Resource,
}

/// 共享的 GPU 资源句柄
pub struct Resource<B: Backend>(Arc<ResourceInner<B>>);

impl<B: Backend> Clone for Resource<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> Resource<B> {
    pub(crate) fn new(native: B::Resource, desc: ResourceDesc, name: Option<String>) -> Self {
        Self(Arc::new(ResourceInner {
            id: ResourceId::next(),
            desc,
            name,
            native,
        }))
    }

    pub fn id(&self) -> ResourceId {
        self.0.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.0.desc
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn native(&self) -> &B::Resource {
        &self.0.native
    }

    /// 当前句柄数量
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: Backend> fmt::Debug for Resource<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("desc", &self.0.desc)
            .finish()
    }
}

struct ViewInner<B: Backend> {
    resource: Resource<B>,
    slot: DescriptorSlot,
    allocator: Arc<Mutex<DescriptorAllocator>>,
}

impl<B: Backend> Drop for ViewInner<B> {
    fn drop(&mut self) {
        self.allocator.lock().free(self.slot);
    }
}

/// 共享的渲染目标视图句柄；最后一个句柄释放时归还描述符槽位
pub struct RenderTargetView<B: Backend>(Arc<ViewInner<B>>);

impl<B: Backend> Clone for RenderTargetView<B> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<B: Backend> RenderTargetView<B> {
    pub(crate) fn new(
        resource: Resource<B>,
        slot: DescriptorSlot,
        allocator: Arc<Mutex<DescriptorAllocator>>,
    ) -> Self {
        Self(Arc::new(ViewInner {
            resource,
            slot,
            allocator,
        }))
    }

    pub fn resource(&self) -> &Resource<B> {
        &self.0.resource
    }

    pub fn slot(&self) -> DescriptorSlot {
        self.0.slot
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<B: Backend> fmt::Debug for RenderTargetView<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderTargetView")
            .field("resource", &self.0.resource.id())
            .field("slot", &self.0.slot.index)
            .finish()
    }
}
