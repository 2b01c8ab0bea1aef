//! Swapchain lifecycle.
//!
//! Back buffers are never created by the application, so the layer
//! registers them itself whenever the swapchain (re)allocates them: after
//! creation and after every resize. Buffer entries are owned by the
//! swapchain entry and removed with it. GetBuffer does not create anything
//! and goes through [`CaptureManager::post_process_get_buffer`].

use tracing::{debug, info, warn};

use dxcap_protocol::format::{
    CpuPageProperty, Format, HResult, HeapType, MemoryPool, PresentFlags, ResourceDesc,
    ResourceStates, SwapChainDesc,
};
use dxcap_protocol::{ApiCallId, HandleId, NativeHandle, ObjectKind};

use crate::call_scope::{CallScope, ParameterBuffer};
use crate::capture_manager::CaptureManager;
use crate::object_info::{ObjectInfo, ResourceInfo, SwapChainBuffer, SwapChainInfo};
use crate::state_tracker::{LiveObject, NewEntry};

/// Arguments of ResizeBuffers / ResizeBuffers1 that affect the buffers.
#[derive(Debug, Clone, Copy)]
pub struct ResizeArgs {
    /// 0 keeps the current count.
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    /// `Format::UNKNOWN` keeps the current format.
    pub format: Format,
    pub flags: u32,
}

impl CaptureManager {
    /// CreateSwapChain, CreateSwapChainForHwnd, CreateSwapChainForCoreWindow
    /// and CreateSwapChainForComposition.
    pub fn post_process_create_swap_chain(
        &self,
        scope: CallScope,
        factory: NativeHandle,
        queue: NativeHandle,
        desc: &SwapChainDesc,
        result: HResult,
        swap_chain: Option<NativeHandle>,
    ) -> Option<HandleId> {
        let registered = self.register_swap_chain(&scope, factory, queue, desc, result, swap_chain);
        self.write_call_record(&scope);
        registered
    }

    fn register_swap_chain(
        &self,
        scope: &CallScope,
        factory: NativeHandle,
        queue: NativeHandle,
        desc: &SwapChainDesc,
        result: HResult,
        swap_chain: Option<NativeHandle>,
    ) -> Option<HandleId> {
        if !self.is_tracking() || result.failed() {
            return None;
        }
        let native = swap_chain.filter(|h| !h.is_null())?;

        // Native calls happen before the structure is held.
        let natives = self.acquire_swap_chain_buffers(native, desc);

        let tracker = self.tracker()?;
        let _structure = tracker.hold_structure();
        let queue_id = self.lookup_id(queue);
        let object = self.register_created(
            scope,
            result,
            ObjectKind::SwapChain,
            Some(native),
            self.lookup_id(factory),
            ObjectInfo::SwapChain(SwapChainInfo::new(*desc, queue_id)),
        )?;
        let buffers = self.register_swap_chain_buffers(&object, desc, &natives);
        object.with_info(|info| {
            if let Some(sc) = info.as_swap_chain_mut() {
                sc.buffers = buffers;
            }
        });
        info!(
            "swapchain {} created: {}x{}, {} buffers",
            object.id, desc.width, desc.height, desc.buffer_count
        );
        Some(object.id)
    }

    /// Native handles of the buffers the application can reach; blit-model
    /// swapchains only expose buffer zero.
    fn acquire_swap_chain_buffers(
        &self,
        swap_chain: NativeHandle,
        desc: &SwapChainDesc,
    ) -> Vec<Option<NativeHandle>> {
        let count = desc.buffer_count as usize;
        let table = match self.dispatch().present() {
            Ok(table) => table,
            Err(e) => {
                warn!("cannot acquire swapchain buffers: {}", e);
                return vec![None; count];
            }
        };
        let accessible = if desc.swap_effect.is_flip_model() {
            desc.buffer_count
        } else {
            desc.buffer_count.min(1)
        };
        (0..desc.buffer_count)
            .map(|index| {
                if index >= accessible {
                    return None;
                }
                match table.swap_chain_buffer(swap_chain, index) {
                    Ok(buffer) if !buffer.is_null() => Some(buffer),
                    Ok(_) => None,
                    Err(hr) => {
                        warn!("GetBuffer({}) on {:#x} failed: {}", index, swap_chain.0, hr);
                        None
                    }
                }
            })
            .collect()
    }

    /// Register buffer entries under `swap_chain`. The caller holds the
    /// structure so the buffers appear together with the swapchain update.
    fn register_swap_chain_buffers(
        &self,
        swap_chain: &LiveObject,
        desc: &SwapChainDesc,
        natives: &[Option<NativeHandle>],
    ) -> Vec<Option<SwapChainBuffer>> {
        let Some(tracker) = self.tracker() else {
            return vec![None; natives.len()];
        };
        natives
            .iter()
            .enumerate()
            .map(|(index, native)| {
                let native = (*native)?;
                let mut parameters = ParameterBuffer::new();
                parameters.push_u32(index as u32);

                let mut info = ResourceInfo::new(
                    ResourceDesc::texture_2d(u64::from(desc.width), desc.height, desc.format, 1),
                    HeapType::Default,
                    CpuPageProperty::Unknown,
                    MemoryPool::Unknown,
                    ResourceStates::PRESENT,
                );
                info.swapchain_buffer = true;

                let entry = NewEntry::new(ObjectKind::Resource, native, ApiCallId::SwapChainGetBuffer)
                    .parameters(parameters.as_bytes().to_vec())
                    .parent(Some(swap_chain.id))
                    .info(ObjectInfo::Resource(info));
                match tracker.add_entry(entry) {
                    Ok(buffer) => Some(SwapChainBuffer {
                        id: buffer.id,
                        native,
                    }),
                    Err(e) => {
                        warn!("buffer {} of swapchain {} not tracked: {}", index, swap_chain.id, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub(crate) fn release_swap_chain_buffers(
        &self,
        buffers: impl IntoIterator<Item = SwapChainBuffer>,
    ) {
        for buffer in buffers {
            self.process_destroy(buffer.native);
        }
    }

    /// IDXGISwapChain::GetBuffer. Buffers are normally registered already;
    /// one that is not (a buffer the swapchain did not expose at creation)
    /// is registered on first access.
    pub fn post_process_get_buffer(
        &self,
        scope: CallScope,
        swap_chain: NativeHandle,
        index: u32,
        result: HResult,
        buffer: Option<NativeHandle>,
    ) {
        if let (true, true, Some(native)) = (self.is_tracking(), result.succeeded(), buffer) {
            if self.lookup(native).is_none() {
                self.register_late_buffer(swap_chain, index, native);
            }
        }
        self.end_call(scope);
    }

    fn register_late_buffer(&self, swap_chain: NativeHandle, index: u32, native: NativeHandle) {
        let (Some(object), Some(tracker)) = (self.lookup(swap_chain), self.tracker()) else {
            return;
        };
        let Some(desc) = object.with_info(|info| info.as_swap_chain().map(|sc| sc.desc)) else {
            return;
        };
        let mut natives = vec![None; desc.buffer_count as usize];
        let Some(slot) = natives.get_mut(index as usize) else {
            warn!("GetBuffer({}) beyond buffer count {}", index, desc.buffer_count);
            return;
        };
        *slot = Some(native);

        let _structure = tracker.hold_structure();
        let registered = self.register_swap_chain_buffers(&object, &desc, &natives);
        if let Some(Some(buffer)) = registered.get(index as usize).copied() {
            object.with_info(|info| {
                if let Some(slot) = info
                    .as_swap_chain_mut()
                    .and_then(|sc| sc.buffers.get_mut(index as usize))
                {
                    *slot = Some(buffer);
                }
            });
        }
    }

    // ── Resize ──────────────────────────────────────────────

    /// ResizeBuffers / ResizeBuffers1, before the native call: the current
    /// buffers are about to be destroyed.
    pub fn pre_process_resize_buffers(&self, swap_chain: NativeHandle) {
        let (Some(object), Some(tracker)) = (self.lookup(swap_chain), self.tracker()) else {
            return;
        };
        let buffers = object
            .with_info(|info| {
                info.as_swap_chain_mut()
                    .map(|sc| std::mem::take(&mut sc.buffers))
            })
            .unwrap_or_default();
        let _structure = tracker.hold_structure();
        self.release_swap_chain_buffers(buffers.into_iter().flatten());
    }

    /// ResizeBuffers / ResizeBuffers1, after the native call. On failure the
    /// swapchain keeps its previous buffers, which are re-acquired.
    pub fn post_process_resize_buffers(
        &self,
        swap_chain: NativeHandle,
        result: HResult,
        args: ResizeArgs,
    ) {
        let Some(object) = self.lookup(swap_chain) else {
            return;
        };
        let Some(previous) = object.with_info(|info| info.as_swap_chain().map(|sc| sc.desc)) else {
            return;
        };

        let desc = if result.succeeded() {
            self.resized_desc(swap_chain, &previous, &args)
        } else {
            warn!("resize of swapchain {} failed: {}", object.id, result);
            previous
        };

        let natives = self.acquire_swap_chain_buffers(swap_chain, &desc);
        let Some(tracker) = self.tracker() else {
            return;
        };
        let _structure = tracker.hold_structure();
        let buffers = self.register_swap_chain_buffers(&object, &desc, &natives);
        object.with_info(|info| {
            if let Some(sc) = info.as_swap_chain_mut() {
                sc.desc = desc;
                sc.buffers = buffers;
            }
        });
        debug!(
            "swapchain {} now {}x{} with {} buffers",
            object.id, desc.width, desc.height, desc.buffer_count
        );
    }

    fn resized_desc(
        &self,
        swap_chain: NativeHandle,
        previous: &SwapChainDesc,
        args: &ResizeArgs,
    ) -> SwapChainDesc {
        let mut desc = *previous;
        if args.buffer_count != 0 {
            desc.buffer_count = args.buffer_count;
        }
        if args.format != Format::UNKNOWN {
            desc.format = args.format;
        }
        desc.flags = args.flags;
        // Zero extents follow the window; the driver knows the result.
        let reported = self
            .dispatch()
            .present()
            .ok()
            .and_then(|table| table.swap_chain_desc(swap_chain).ok());
        match reported {
            Some(actual) => {
                desc.width = actual.width;
                desc.height = actual.height;
            }
            None => {
                if args.width != 0 {
                    desc.width = args.width;
                }
                if args.height != 0 {
                    desc.height = args.height;
                }
            }
        }
        desc
    }

    // ── Present ─────────────────────────────────────────────

    /// Present / Present1. Test presents, failed presents and presents issued
    /// from inside another intercepted call do not end a frame.
    pub fn post_process_present(
        &self,
        scope: &CallScope,
        swap_chain: NativeHandle,
        result: HResult,
        flags: PresentFlags,
    ) {
        if flags.contains(PresentFlags::TEST) || !scope.is_top_level() {
            return;
        }
        if result.failed() {
            debug!("present on {:#x} returned {}", swap_chain.0, result);
            return;
        }

        let frame = self.frame.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        let swap_chain_id = match self.lookup(swap_chain) {
            Some(object) => {
                object.with_info(|info| {
                    if let Some(sc) = info.as_swap_chain_mut() {
                        sc.frame += 1;
                    }
                });
                object.id
            }
            None => HandleId::NULL,
        };

        if self.config().screenshot_requested(frame) {
            match self.renderer() {
                Some(renderer) => {
                    if let Err(e) = renderer.capture_frame(swap_chain_id, swap_chain, frame) {
                        warn!("screenshot of frame {} failed: {}", frame, e);
                    }
                }
                None => debug!("screenshot requested for frame {} without a renderer", frame),
            }
        }

        if self.config().capture.trim_frame == Some(frame) && self.is_tracking() {
            if let Err(e) = self.write_tracked_state() {
                warn!("state snapshot at frame {} failed: {}", frame, e);
            }
        }
    }
}
