//! DXGI 工厂与交换链

use raw_window_handle::RawWindowHandle;
use tracing::info;
use windows::core::Interface;
use windows::Win32::Foundation::HWND;
use windows::Win32::Graphics::Direct3D12::ID3D12Resource;
use windows::Win32::Graphics::Dxgi::Common::*;
use windows::Win32::Graphics::Dxgi::*;

use super::device::{Dx12Queue, Dx12Resource};
use super::{dxgi_format, to_hresult, Dx12};
use crate::gfx::backend::{
    Format, HResult, ModeDesc, NativeFactory, NativeSwapChain, SwapChainDesc, SwapEffect,
};

fn dxgi_swap_effect(effect: SwapEffect) -> DXGI_SWAP_EFFECT {
    match effect {
        SwapEffect::Discard => DXGI_SWAP_EFFECT_DISCARD,
        SwapEffect::Sequential => DXGI_SWAP_EFFECT_SEQUENTIAL,
        SwapEffect::FlipSequential => DXGI_SWAP_EFFECT_FLIP_SEQUENTIAL,
        SwapEffect::FlipDiscard => DXGI_SWAP_EFFECT_FLIP_DISCARD,
    }
}

/// DXGI 工厂，绑定一个目标窗口
pub struct Dx12Factory {
    factory: IDXGIFactory4,
    hwnd: HWND,
}

unsafe impl Send for Dx12Factory {}
unsafe impl Sync for Dx12Factory {}

impl Dx12Factory {
    /// 为给定窗口创建工厂；只接受 Win32 窗口句柄
    pub fn new(window: RawWindowHandle) -> Result<Self, HResult> {
        let hwnd = match window {
            RawWindowHandle::Win32(handle) => HWND(handle.hwnd.get() as *mut std::ffi::c_void),
            _ => return Err(HResult::E_INVALIDARG),
        };

        #[cfg(debug_assertions)]
        let flags = DXGI_CREATE_FACTORY_DEBUG;
        #[cfg(not(debug_assertions))]
        let flags = DXGI_CREATE_FACTORY_FLAGS(0);

        let factory: IDXGIFactory4 = unsafe { CreateDXGIFactory2(flags) }.map_err(to_hresult)?;
        Ok(Self { factory, hwnd })
    }
}

impl NativeFactory<Dx12> for Dx12Factory {
    fn create_swap_chain(&self, queue: &Dx12Queue, desc: &SwapChainDesc) -> Result<Dx12SwapChain, HResult> {
        let swap_chain_desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: desc.width,
            Height: desc.height,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                ..Default::default()
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: desc.buffer_count,
            SwapEffect: dxgi_swap_effect(desc.swap_effect),
            Flags: desc.flags,
            ..Default::default()
        };

        unsafe {
            let swap_chain: IDXGISwapChain1 = self
                .factory
                .CreateSwapChainForHwnd(queue.raw(), self.hwnd, &swap_chain_desc, None, None)
                .map_err(to_hresult)?;
            let swap_chain: IDXGISwapChain3 = swap_chain.cast().map_err(to_hresult)?;

            info!(
                width = desc.width,
                height = desc.height,
                buffers = desc.buffer_count,
                "DXGI swap chain created"
            );
            Ok(Dx12SwapChain { swap_chain })
        }
    }
}

/// `IDXGISwapChain3` 包装
pub struct Dx12SwapChain {
    swap_chain: IDXGISwapChain3,
}

unsafe impl Send for Dx12SwapChain {}
unsafe impl Sync for Dx12SwapChain {}

impl NativeSwapChain<Dx12> for Dx12SwapChain {
    fn present(&self, sync_interval: u32, flags: u32) -> HResult {
        let hr = unsafe { self.swap_chain.Present(sync_interval, DXGI_PRESENT(flags)) };
        HResult(hr.0)
    }

    fn resize_buffers(
        &self,
        buffer_count: u32,
        width: u32,
        height: u32,
        format: Format,
        flags: u32,
    ) -> HResult {
        let result = unsafe {
            self.swap_chain.ResizeBuffers(
                buffer_count,
                width,
                height,
                dxgi_format(format),
                DXGI_SWAP_CHAIN_FLAG(flags as i32),
            )
        };
        match result {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }

    fn resize_target(&self, mode: &ModeDesc) -> HResult {
        let desc = DXGI_MODE_DESC {
            Width: mode.width,
            Height: mode.height,
            RefreshRate: DXGI_RATIONAL {
                Numerator: mode.refresh_rate.0,
                Denominator: mode.refresh_rate.1,
            },
            Format: dxgi_format(mode.format),
            ..Default::default()
        };
        match unsafe { self.swap_chain.ResizeTarget(&desc) } {
            Ok(()) => HResult::S_OK,
            Err(err) => to_hresult(err),
        }
    }

    fn get_buffer(&self, index: u32) -> Result<Dx12Resource, HResult> {
        let buffer: ID3D12Resource = unsafe { self.swap_chain.GetBuffer(index) }.map_err(to_hresult)?;
        Ok(Dx12Resource::from_raw(buffer))
    }

    fn current_back_buffer_index(&self) -> u32 {
        unsafe { self.swap_chain.GetCurrentBackBufferIndex() }
    }
}
