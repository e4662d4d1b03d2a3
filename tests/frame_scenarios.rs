//! 即时上下文的整帧场景测试
//!
//! 全部运行在软件 GPU 上，通过原生调用日志断言提交顺序。

use std::time::Duration;

use dist_on12::gfx::backend::{
    Format, HResult, ModeDesc, QueueType, ResourceDesc, ResourceState, SwapChainDesc, SwapEffect,
};
use dist_on12::gfx::headless::{
    ExecutionMode, Headless, HeadlessDevice, HeadlessFactory, NativeCall,
};
use dist_on12::renderer::{
    AutoSplitPolicy, ContextDesc, Device, FenceValue, FlipModelPolicy, ImmediateContext,
    SwapChainState,
};

fn swap_chain_desc(buffer_count: u32) -> SwapChainDesc {
    SwapChainDesc {
        width: 64,
        height: 64,
        format: Format::B8G8R8A8Unorm,
        buffer_count,
        swap_effect: SwapEffect::FlipDiscard,
        flags: 0,
    }
}

fn setup_with(
    mode: ExecutionMode,
    desc: ContextDesc,
) -> (HeadlessDevice, HeadlessFactory, ImmediateContext<Headless>) {
    let gpu = HeadlessDevice::new(mode, Duration::from_micros(100));
    let factory = HeadlessFactory::new(&gpu);
    let device = Device::<Headless>::new(gpu.clone(), 16).unwrap();
    let mut context = ImmediateContext::new(device, &desc).unwrap();
    context
        .create_swap_chain(&factory, &swap_chain_desc(3), &FlipModelPolicy)
        .unwrap();
    (gpu, factory, context)
}

fn setup(mode: ExecutionMode) -> (HeadlessDevice, HeadlessFactory, ImmediateContext<Headless>) {
    let desc = ContextDesc {
        fence_wait_slice: Duration::from_millis(1),
        ..ContextDesc::default()
    };
    setup_with(mode, desc)
}

/// 录制一帧：屏障、清屏、绘制、屏障
fn render_frame(context: &mut ImmediateContext<Headless>) {
    let back_buffer = context.current_back_buffer().unwrap();
    let (target, view) = (back_buffer.resource.clone(), back_buffer.view.clone());
    context.set_render_targets(std::slice::from_ref(&view));

    let list = context.command_list(QueueType::Graphics).unwrap();
    list.resource_barrier(&target, ResourceState::Present, ResourceState::RenderTarget);
    list.clear_render_target(&view, [0.0, 0.0, 0.0, 1.0]);
    list.draw(3, 1);
    list.resource_barrier(&target, ResourceState::RenderTarget, ResourceState::Present);
}

#[test]
fn test_normal_frame_advances_fence_by_one() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Immediate);
    let before = context.fences().current_value(QueueType::Graphics);

    render_frame(&mut context);
    assert_eq!(context.present(1, 0), HResult::S_OK);

    assert_eq!(context.fences().current_value(QueueType::Graphics), before.next());
    assert_eq!(context.fences().last_signaled(QueueType::Graphics), before);
    assert_eq!(
        context.insert_fence(QueueType::Graphics),
        context.fences().last_signaled(QueueType::Graphics)
    );
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Present { .. })), 1);
    assert_eq!(context.frame_count(), 1);
}

#[test]
fn test_unutilized_frame_does_not_submit() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Immediate);
    context
        .command_list(QueueType::Graphics)
        .unwrap()
        .set_marker("empty frame");

    assert_eq!(context.present(1, 0), HResult::S_OK);

    let current = context.fences().current_value(QueueType::Graphics);
    assert_eq!(current, FenceValue::new(1));
    assert_eq!(
        context.insert_fence(QueueType::Graphics),
        FenceValue::new(current.value() - 1)
    );
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::ExecuteCommandLists { .. })), 0);
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Signal { .. })), 0);
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Present { .. })), 1);
}

#[test]
fn test_present_follows_submission() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    render_frame(&mut context);
    assert!(context.present(1, 0).is_ok());

    let log = gpu.log();
    let execute = log
        .position(|c| matches!(c, NativeCall::ExecuteCommandLists { queue: QueueType::Graphics, .. }))
        .unwrap();
    let signal = log
        .position(|c| matches!(c, NativeCall::Signal { queue: QueueType::Graphics, .. }))
        .unwrap();
    let present = log.position(|c| matches!(c, NativeCall::Present { .. })).unwrap();
    assert!(execute < signal);
    assert!(signal < present);
}

#[test]
fn test_resize_reacquires_buffers() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    for _ in 0..4 {
        render_frame(&mut context);
        assert!(context.present(1, 0).is_ok());
    }
    assert!(!context.bound_render_targets().is_empty());

    let hr = context.resize_buffers(2, 32, 16, Format::Unknown, 0);
    assert_eq!(hr, HResult::S_OK);

    assert!(context.bound_render_targets().is_empty());
    let swap_chain = context.swap_chain().unwrap();
    assert_eq!(swap_chain.state(), SwapChainState::BuffersAcquired);
    assert_eq!(swap_chain.back_buffers().len(), 2);
    assert_eq!(swap_chain.desc().width, 32);
    assert_eq!(swap_chain.desc().height, 16);
    assert_eq!(swap_chain.desc().format, Format::B8G8R8A8Unorm);
    assert_eq!(context.device().rtv_stats().used, 2);

    let resize = gpu
        .log()
        .last_position(|c| matches!(c, NativeCall::ResizeBuffers { .. }))
        .unwrap();
    assert_eq!(
        gpu.log().snapshot()[resize],
        NativeCall::ResizeBuffers {
            buffer_count: 2,
            width: 32,
            height: 16,
            accepted: true
        }
    );
    let reacquired = gpu
        .log()
        .last_position(|c| matches!(c, NativeCall::GetBuffer { index: 1, .. }))
        .unwrap();
    assert!(resize < reacquired);

    // 调整后继续渲染
    render_frame(&mut context);
    assert!(context.present(1, 0).is_ok());
}

#[test]
fn test_deferred_release_destroyed_before_resize() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Manual);
    let src = context
        .device()
        .create_resource(&ResourceDesc::buffer(256), Some("src"))
        .unwrap();
    let dst = context
        .device()
        .create_resource(&ResourceDesc::buffer(256), Some("dst"))
        .unwrap();
    let id = dst.native().id();

    context
        .command_list(QueueType::Graphics)
        .unwrap()
        .copy_resource(&dst, &src);
    context.release_resource(dst);
    assert_eq!(context.device().pending_releases(), 1);

    assert_eq!(context.resize_buffers(0, 48, 48, Format::Unknown, 0), HResult::S_OK);
    assert_eq!(context.device().pending_releases(), 0);

    let destroyed = gpu
        .log()
        .position(|c| *c == NativeCall::ResourceDestroyed { resource: id })
        .unwrap();
    let resize = gpu
        .log()
        .position(|c| matches!(c, NativeCall::ResizeBuffers { .. }))
        .unwrap();
    assert!(destroyed < resize);
}

#[test]
fn test_failed_resize_leaves_buffers_forfeited() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Immediate);
    render_frame(&mut context);
    assert!(context.present(1, 0).is_ok());

    gpu.set_resize_result(Some(HResult::E_OUTOFMEMORY));
    assert_eq!(
        context.resize_buffers(2, 32, 32, Format::Unknown, 0),
        HResult::E_OUTOFMEMORY
    );
    assert!(!context.is_lost());
    let swap_chain = context.swap_chain().unwrap();
    assert_eq!(swap_chain.state(), SwapChainState::BuffersForfeited);
    assert_eq!(swap_chain.desc().buffer_count, 3);
    assert!(context.current_back_buffer().is_none());

    gpu.set_resize_result(None);
    assert_eq!(context.resize_buffers(2, 32, 32, Format::Unknown, 0), HResult::S_OK);
    assert!(context.current_back_buffer().is_some());
}

#[test]
fn test_allocators_never_reset_in_flight() {
    for mode in [ExecutionMode::Threaded, ExecutionMode::Manual] {
        let (gpu, _factory, mut context) = setup(mode);
        for frame in 0..40 {
            render_frame(&mut context);
            if frame % 5 == 0 {
                context
                    .command_list(QueueType::Graphics)
                    .unwrap()
                    .dispatch(4, 4, 1);
                context.flush(QueueType::Graphics).unwrap();
                render_frame(&mut context);
            }
            assert!(context.present(1, 0).is_ok());
        }

        assert_eq!(
            gpu.log()
                .count(|c| matches!(c, NativeCall::AllocatorReset { in_flight: true, .. })),
            0,
            "allocator reset while in flight in {:?} mode",
            mode
        );
        assert_eq!(context.frame_count(), 40);
    }
}

#[test]
fn test_hung_device_loses_context() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    render_frame(&mut context);
    assert!(context.present(1, 0).is_ok());

    render_frame(&mut context);
    gpu.hang();
    assert_eq!(context.present(1, 0), HResult::DXGI_ERROR_DEVICE_HUNG);
    assert!(context.is_lost());

    assert_eq!(context.present(1, 0), HResult::DXGI_ERROR_DEVICE_HUNG);
    assert_eq!(
        context.resize_buffers(2, 32, 32, Format::Unknown, 0),
        HResult::DXGI_ERROR_DEVICE_HUNG
    );
    assert!(context.command_list(QueueType::Graphics).is_err());
    let mode = ModeDesc {
        width: 32,
        height: 32,
        format: Format::Unknown,
        refresh_rate: (60, 1),
    };
    assert_eq!(context.resize_target(&mode), HResult::DXGI_ERROR_DEVICE_HUNG);
}

#[test]
fn test_fence_values_are_monotonic() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    let mut last = FenceValue::new(0);
    for frame in 0..24 {
        if frame % 3 == 0 {
            let staging = context
                .device()
                .create_resource(&ResourceDesc::buffer(128), None)
                .unwrap();
            let target = context
                .device()
                .create_resource(&ResourceDesc::buffer(128), None)
                .unwrap();
            context
                .command_list(QueueType::Copy)
                .unwrap()
                .copy_buffer_region(&target, 0, &staging, 0, 128);
            context.synchronize_queues(QueueType::Copy).unwrap();
            context.release_resource(staging);
            context.release_resource(target);
        }
        render_frame(&mut context);
        assert!(context.present(1, 0).is_ok());

        let signaled = context.fences().last_signaled(QueueType::Graphics);
        assert!(signaled > last);
        assert!(context.fences().completed_value(QueueType::Graphics) <= signaled);
        last = signaled;
    }

    for queue in QueueType::ALL {
        let values: Vec<u64> = gpu
            .log()
            .snapshot()
            .into_iter()
            .filter_map(|c| match c {
                NativeCall::Signal { queue: q, value } if q == queue => Some(value),
                _ => None,
            })
            .collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]), "{:?}", values);
    }
}

#[test]
fn test_empty_flush_is_idempotent() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Immediate);
    let before = context.fences().current_value(QueueType::Graphics);

    assert_eq!(context.flush(QueueType::Graphics).unwrap(), None);
    assert_eq!(context.flush(QueueType::Graphics).unwrap(), None);
    context.flush_all().unwrap();

    assert_eq!(context.fences().current_value(QueueType::Graphics), before);
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Signal { .. })), 0);
}

#[test]
fn test_copy_queue_completes_before_graphics_consumes() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    let staging = context
        .device()
        .create_resource(&ResourceDesc::buffer(1024), None)
        .unwrap();
    let texture = context
        .device()
        .create_resource(&ResourceDesc::buffer(1024), None)
        .unwrap();

    context
        .command_list(QueueType::Copy)
        .unwrap()
        .copy_resource(&texture, &staging);
    context.synchronize_queues(QueueType::Copy).unwrap();
    let copy_value = context.fences().last_signaled(QueueType::Copy);
    assert!(context.fences().is_completed(copy_value, QueueType::Copy));

    context
        .command_list(QueueType::Graphics)
        .unwrap()
        .copy_resource(&staging, &texture);
    assert!(context.present(1, 0).is_ok());

    let copy_signal = gpu
        .log()
        .position(|c| matches!(c, NativeCall::Signal { queue: QueueType::Copy, .. }))
        .unwrap();
    let graphics_execute = gpu
        .log()
        .position(|c| matches!(c, NativeCall::ExecuteCommandLists { queue: QueueType::Graphics, .. }))
        .unwrap();
    assert!(copy_signal < graphics_execute);
}

#[test]
fn test_auto_split_during_frame() {
    let desc = ContextDesc {
        split: AutoSplitPolicy {
            max_commands: 8,
            max_bytes: 0,
        },
        fence_wait_slice: Duration::from_millis(1),
        ..ContextDesc::default()
    };
    let (_gpu, _factory, mut context) = setup_with(ExecutionMode::Threaded, desc);

    for _ in 0..20 {
        context.command_list(QueueType::Graphics).unwrap().draw(3, 1);
    }
    assert!(context.present(1, 0).is_ok());

    let stats = context.pool_stats(QueueType::Graphics);
    assert_eq!(stats.splits, 2);
    assert_eq!(stats.submissions, 3);
    assert_eq!(
        context.fences().last_signaled(QueueType::Graphics),
        FenceValue::new(3)
    );
}

#[test]
fn test_present_returns_native_status_unchanged() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Immediate);

    gpu.set_present_result(Some(HResult::DXGI_STATUS_OCCLUDED));
    render_frame(&mut context);
    assert_eq!(context.present(1, 0), HResult::DXGI_STATUS_OCCLUDED);

    gpu.set_present_result(Some(HResult::E_FAIL));
    render_frame(&mut context);
    assert_eq!(context.present(1, 0), HResult::E_FAIL);
    assert!(!context.is_lost());

    gpu.set_present_result(None);
    render_frame(&mut context);
    assert_eq!(context.present(1, 0), HResult::S_OK);
    assert_eq!(context.frame_count(), 3);
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Present { .. })), 3);
}

#[test]
fn test_present_throttles_to_frame_latency() {
    let desc = ContextDesc {
        max_frame_latency: 2,
        fence_wait_slice: Duration::from_millis(1),
        ..ContextDesc::default()
    };
    let (_gpu, _factory, mut context) = setup_with(ExecutionMode::Manual, desc);

    for frame in 0..6u64 {
        render_frame(&mut context);
        assert!(context.present(1, 0).is_ok());
        assert_eq!(context.frame_count(), frame + 1);
        if frame >= 2 {
            assert!(context.fences().is_frame_retired(frame - 2));
        } else {
            // 在途帧数未超过上限时不等待
            assert!(!context.fences().is_frame_retired(frame));
        }
    }
}

#[test]
fn test_failed_signal_during_present_loses_context() {
    let (gpu, _factory, mut context) = setup(ExecutionMode::Threaded);
    render_frame(&mut context);
    assert!(context.present(1, 0).is_ok());

    render_frame(&mut context);
    gpu.fail_next_signal(HResult::E_OUTOFMEMORY);
    assert_eq!(context.present(1, 0), HResult::E_OUTOFMEMORY);
    assert!(context.is_lost());
    assert_eq!(gpu.log().count(|c| matches!(c, NativeCall::Present { .. })), 1);
    assert!(context.wait_for_idle().is_err());
}
