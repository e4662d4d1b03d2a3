//! DistOn12 演示程序
//!
//! 用即时上下文驱动一段固定帧数的渲染循环：每帧清屏并绘制，
//! 定期经复制队列上传数据，中途按调整大小协议缩小交换链。
//!
//! 默认使用软件 GPU；`--dx12` 在 Windows 上使用 D3D12 设备做离屏渲染。

use std::time::Instant;

use anyhow::{Context as _, Result};
use dist_on12::core::config::BackendKind;
use dist_on12::core::{log, Config};
use dist_on12::gfx::backend::{Backend, Format, QueueType, ResourceDesc, ResourceState};
use dist_on12::gfx::headless::{Headless, HeadlessDevice, HeadlessFactory};
use dist_on12::renderer::{Device, ImmediateContext, RenderTargetView, Resource};
use dist_on12::{core_error, core_info, core_warn};

const FRAME_COUNT: u64 = 120;
const RESIZE_AT_FRAME: u64 = 60;
const UPLOAD_INTERVAL: u64 = 16;
const UPLOAD_SIZE: u64 = 64 * 1024;

fn main() -> Result<()> {
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args().skip(1));
    config.validate().context("Invalid configuration")?;

    log::init_logger(
        config.logging.level,
        config.logging.file_output,
        Some(&config.logging.log_file),
    )?;

    core_info!(
        backend = config.backend.kind.name(),
        width = config.swap_chain.width,
        height = config.swap_chain.height,
        buffers = config.swap_chain.buffer_count,
        "DistOn12 starting"
    );

    let result = match config.backend.kind {
        BackendKind::Headless => run_headless(&config),
        BackendKind::Dx12 => run_dx12(&config),
    };
    if let Err(e) = &result {
        core_error!(error = %e, "Demo failed");
    }
    result
}

fn run_headless(config: &Config) -> Result<()> {
    let gpu = HeadlessDevice::new(config.backend.execution_mode, config.backend.latency());
    let factory = HeadlessFactory::new(&gpu);
    let device = Device::<Headless>::new(gpu.clone(), config.submission.rtv_heap_capacity)?;
    let mut context = ImmediateContext::new(device, &config.submission.context_desc())?;

    let policy = config.swap_chain.negotiation.policy();
    context
        .create_swap_chain(&factory, &config.swap_chain.desc(), policy.as_ref())
        .context("Failed to create swap chain")?;
    if let Some(swap_chain) = context.swap_chain() {
        core_info!(
            policy = policy.name(),
            swap_effect = ?swap_chain.desc().swap_effect,
            buffers = swap_chain.desc().buffer_count,
            "Swap chain negotiated"
        );
    }

    let start = Instant::now();
    for frame in 0..FRAME_COUNT {
        if frame == RESIZE_AT_FRAME {
            resize(&mut context, config)?;
        }
        if frame % UPLOAD_INTERVAL == 0 {
            upload(&mut context)?;
        }

        let (target, view) = match context.current_back_buffer() {
            Some(back_buffer) => (back_buffer.resource.clone(), back_buffer.view.clone()),
            None => anyhow::bail!("Swap chain has no back buffers at frame {frame}"),
        };
        context.set_render_targets(std::slice::from_ref(&view));
        record_frame(&mut context, &target, &view, ResourceState::Present, frame)?;
        drop((target, view));

        let hr = context.present(config.swap_chain.sync_interval, 0);
        if hr.is_device_removed() {
            anyhow::bail!("Device removed while presenting frame {frame}: {hr}");
        }
        if hr.is_err() {
            core_warn!(frame, %hr, "Present failed");
        }
    }

    context.wait_for_idle()?;
    let graphics = context.pool_stats(QueueType::Graphics);
    let copy = context.pool_stats(QueueType::Copy);
    core_info!(
        frames = context.frame_count(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        graphics_lists = graphics.created,
        graphics_submissions = graphics.submissions,
        graphics_splits = graphics.splits,
        copy_submissions = copy.submissions,
        native_calls = gpu.log().len(),
        "Demo finished"
    );
    Ok(())
}

/// 按调整大小协议缩小交换链
fn resize<B: Backend>(context: &mut ImmediateContext<B>, config: &Config) -> Result<()> {
    let buffers = config.swap_chain.buffer_count.saturating_sub(1).max(2);
    let width = (config.swap_chain.width / 2).max(1);
    let height = (config.swap_chain.height / 2).max(1);

    let hr = context.resize_buffers(buffers, width, height, Format::Unknown, 0);
    if hr.is_err() {
        anyhow::bail!("ResizeBuffers failed: {hr}");
    }
    core_info!(buffers, width, height, "Swap chain resized");
    Ok(())
}

/// 在复制队列上做一次上传，并让图形队列等待它完成
fn upload<B: Backend>(context: &mut ImmediateContext<B>) -> Result<()> {
    let staging = context
        .device()
        .create_resource(&ResourceDesc::buffer(UPLOAD_SIZE), Some("Upload staging"))?;
    let target = context
        .device()
        .create_resource(&ResourceDesc::buffer(UPLOAD_SIZE), Some("Upload target"))?;

    context
        .command_list(QueueType::Copy)?
        .copy_buffer_region(&target, 0, &staging, 0, UPLOAD_SIZE);
    context.synchronize_queues(QueueType::Copy)?;

    context.release_resource(staging);
    context.release_resource(target);
    Ok(())
}

/// 录制一帧：转换到渲染目标状态、清屏、绘制、转换回静止状态
fn record_frame<B: Backend>(
    context: &mut ImmediateContext<B>,
    target: &Resource<B>,
    view: &RenderTargetView<B>,
    resting: ResourceState,
    frame: u64,
) -> Result<()> {
    let t = (frame % 60) as f32 / 60.0;
    let list = context.command_list(QueueType::Graphics)?;
    list.set_marker("Frame");
    list.resource_barrier(target, resting, ResourceState::RenderTarget);
    list.clear_render_target(view, [0.1, 0.2 + 0.3 * t, 0.4, 1.0]);
    for _ in 0..4 {
        context.command_list(QueueType::Graphics)?.draw_indexed(36, 16);
    }
    context
        .command_list(QueueType::Graphics)?
        .resource_barrier(target, ResourceState::RenderTarget, resting);
    Ok(())
}

#[cfg(target_os = "windows")]
fn run_dx12(config: &Config) -> Result<()> {
    use dist_on12::gfx::dx12::{Dx12, Dx12Device};
    use dist_on12::renderer::ReleasePolicy;

    // 没有宿主窗口，渲染到离屏纹理，不创建交换链
    let native = Dx12Device::new().map_err(|hr| anyhow::anyhow!("Failed to create D3D12 device: {hr}"))?;
    let device = Device::<Dx12>::new(native, config.submission.rtv_heap_capacity)?;
    let mut context = ImmediateContext::new(device, &config.submission.context_desc())?;

    let desc = ResourceDesc::texture_2d(config.swap_chain.width, config.swap_chain.height, config.swap_chain.format);
    let target = context.device().create_resource(&desc, Some("Offscreen target"))?;
    let view = context.device().create_render_target_view(&target)?;

    for frame in 0..FRAME_COUNT {
        if frame % UPLOAD_INTERVAL == 0 {
            upload(&mut context)?;
        }
        record_frame(&mut context, &target, &view, ResourceState::Common, frame)?;
        context.flush(QueueType::Graphics)?;
        context
            .device()
            .flush_release_heap(ReleasePolicy::Deferred, context.fences())?;
    }

    context.release_view(view);
    context.release_resource(target);
    context.wait_for_idle()?;
    context
        .device()
        .flush_release_heap(ReleasePolicy::Immediate, context.fences())?;

    let stats = context.pool_stats(QueueType::Graphics);
    core_info!(
        frames = FRAME_COUNT,
        submissions = stats.submissions,
        splits = stats.splits,
        "Offscreen DX12 run finished"
    );
    Ok(())
}

#[cfg(not(target_os = "windows"))]
fn run_dx12(_config: &Config) -> Result<()> {
    anyhow::bail!("DX12 backend is only available on Windows")
}
