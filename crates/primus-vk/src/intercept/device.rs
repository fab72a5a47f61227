// SPDX-License-Identifier: CEPL-1.0
//! Device-level intercepts: render/display device pairing, the swapchain the
//! application sees, and the queue calls that share the render queue with the
//! swapchain workers.

use std::ptr;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use super::PrimusVK_GetInstanceProcAddr;
use crate::device::{pick_render_family, DeviceContext, DisplayPair, Pairing};
use crate::dispatch::{resolve_as, write_out, DeviceDispatch};
use crate::error::LayerError;
use crate::instance::{InstanceContext, Role};
use crate::loader::{DeviceChain, DispatchKey, PfnSetDeviceLoaderData};
use crate::pairing::PairingError;
use crate::registry;
use crate::swapchain::{backend_create_info, Backend, PrimusSwapchain};
use crate::worker::Devices;

const DISPLAY_QUEUE_PRIORITY: f32 = 0.0;

/// View a `(pointer, count)` pair from a create info as a slice.
///
/// # Safety
/// Unless null or `len == 0`, `data` must point at `len` initialized values
/// that outlive the returned slice.
unsafe fn raw_slice<'a, T>(data: *const T, len: u32) -> &'a [T] {
    if data.is_null() || len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(data, len as usize) }
    }
}

/// Tear down a device the layer created but could not finish setting up.
unsafe fn abandon_device(
    handle: vk::Device,
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    destroy: impl FnOnce(vk::Device, vk::PFN_vkDestroyDevice),
) {
    match unsafe { resolve_as::<vk::PFN_vkDestroyDevice>(gdpa(handle, c"vkDestroyDevice".as_ptr())) } {
        Some(f) => destroy(handle, f),
        None => error!("cannot destroy half-initialized device: no vkDestroyDevice"),
    }
}

/// Body of the pairing task: build the logical device on the display GPU.
fn create_display_device(instance: &Arc<InstanceContext>) -> Result<DisplayPair, LayerError> {
    let dispatch = &instance.dispatch;
    let render_memory = unsafe { dispatch.memory_properties(instance.render.handle) };
    let display_memory = unsafe { dispatch.memory_properties(instance.display.handle) };

    let priority = DISPLAY_QUEUE_PRIORITY;
    let queue_info = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: instance.display.queue_family,
        queue_count: 1,
        p_queue_priorities: &priority,
        ..Default::default()
    };
    let extensions = [c"VK_KHR_swapchain".as_ptr()];
    let info = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &queue_info,
        enabled_extension_count: extensions.len() as u32,
        pp_enabled_extension_names: extensions.as_ptr(),
        ..Default::default()
    };

    let mut handle = vk::Device::null();
    let mut gdpa = None;
    // Resolving through our own vkGetInstanceProcAddr makes the loader build
    // the chain from the layers below this one.
    unsafe {
        (instance.create_device)(
            dispatch.handle,
            instance.display.handle,
            &info,
            ptr::null(),
            &mut handle,
            PrimusVK_GetInstanceProcAddr,
            &mut gdpa,
        )
    }
    .result()
    .map_err(LayerError::vulkan("vkCreateDevice (display)"))?;
    let gdpa = gdpa.ok_or(LayerError::MissingEntryPoint("vkGetDeviceProcAddr"))?;

    let destroy = |handle: vk::Device, f: vk::PFN_vkDestroyDevice| unsafe {
        (instance.destroy_device)(handle, ptr::null(), f)
    };
    let device = match unsafe { DeviceDispatch::load(handle, gdpa, None) } {
        Ok(device) => Arc::new(device),
        Err(e) => {
            unsafe { abandon_device(handle, gdpa, destroy) };
            return Err(e);
        }
    };
    let queue = match unsafe { device.queue(instance.display.queue_family, 0) } {
        Ok(queue) => queue,
        Err(e) => {
            destroy(handle, device.fp.destroy_device);
            return Err(LayerError::Vulkan { call: "vkGetDeviceQueue (display)", result: e });
        }
    };

    let display = Arc::new(DeviceContext::new(
        device.clone(),
        instance.clone(),
        Role::Display,
        instance.display.queue_family,
        queue,
        None,
    ));
    registry::write().devices.register(device.key(), display.clone());
    info!("display device created");
    Ok(DisplayPair {
        display,
        render_memory,
        display_memory,
    })
}

unsafe fn register_render_device(
    instance: &Arc<InstanceContext>,
    handle: vk::Device,
    gdpa: vk::PFN_vkGetDeviceProcAddr,
    set_loader_data: Option<PfnSetDeviceLoaderData>,
    info: &vk::DeviceCreateInfo<'_>,
) -> Result<(), LayerError> {
    let dispatch = Arc::new(unsafe { DeviceDispatch::load(handle, gdpa, set_loader_data) }?);

    let requested: Vec<u32> = unsafe { raw_slice(info.p_queue_create_infos, info.queue_create_info_count) }
        .iter()
        .map(|q| q.queue_family_index)
        .collect();
    let family = pick_render_family(&requested, instance.render.queue_family)
        .ok_or(LayerError::NoQueueFamily(instance.render.handle))?;
    let queue = unsafe { dispatch.queue(family, 0) }.map_err(LayerError::vulkan("vkGetDeviceQueue"))?;

    let pairing = Arc::new(Pairing::new());
    let task_instance = instance.clone();
    pairing.start(move || {
        create_display_device(&task_instance).map(Arc::new).map_err(|e| {
            error!("display device creation failed: {e}");
            PairingError::DisplayDevice(e.as_vk_result())
        })
    })?;

    let ctx = DeviceContext::new(
        dispatch.clone(),
        instance.clone(),
        Role::Render,
        family,
        queue,
        Some(pairing),
    );
    registry::write().devices.register(dispatch.key(), Arc::new(ctx));
    debug!(family, "render device registered");
    Ok(())
}

pub unsafe extern "system" fn create_device(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_device: *mut vk::Device,
) -> vk::Result {
    let instance = match registry::instance(physical_device) {
        Ok(instance) => instance,
        Err(e) => return e.as_vk_result(),
    };
    let info = unsafe { &*p_create_info };
    let Some(chain) = (unsafe { DeviceChain::find(info.p_next) }) else {
        error!("{}", LayerError::MissingLayerLink);
        return LayerError::MissingLayerLink.as_vk_result();
    };
    let (gipa, gdpa) = unsafe { chain.take_next() };

    let next_create = unsafe {
        resolve_as::<vk::PFN_vkCreateDevice>(gipa(instance.dispatch.handle, c"vkCreateDevice".as_ptr()))
    };
    let Some(next_create) = next_create else {
        error!("{}", LayerError::MissingEntryPoint("vkCreateDevice"));
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let res = unsafe { next_create(physical_device, p_create_info, p_allocator, p_device) };
    if res != vk::Result::SUCCESS {
        error!("vkCreateDevice failed: {res}");
        return res;
    }

    let handle = unsafe { *p_device };
    match unsafe { register_render_device(&instance, handle, gdpa, chain.set_loader_data, info) } {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => {
            error!("render device setup failed: {e}");
            let destroy = |h: vk::Device, f: vk::PFN_vkDestroyDevice| unsafe { f(h, p_allocator) };
            unsafe { abandon_device(handle, gdpa, destroy) };
            unsafe { *p_device = vk::Device::null() };
            e.as_vk_result()
        }
    }
}

pub unsafe extern "system" fn destroy_device(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if device == vk::Device::null() {
        return;
    }
    let key = unsafe { DispatchKey::of(device) };
    let Some(ctx) = registry::write().devices.erase(key) else {
        error!(?key, "destroy of unknown device");
        return;
    };
    if let Some(pairing) = &ctx.pairing {
        match pairing.join() {
            Ok(pair) => {
                let display = &pair.display.dispatch;
                if let Err(e) = unsafe { display.wait_idle() } {
                    warn!("display device wait before destroy failed: {e}");
                }
                registry::write().devices.erase(display.key());
                unsafe { (ctx.instance.destroy_device)(display.handle, ptr::null(), display.fp.destroy_device) };
                info!("display device destroyed");
            }
            Err(e) => warn!("no display device to destroy: {e}"),
        }
    }
    unsafe { (ctx.dispatch.fp.destroy_device)(device, p_allocator) };
    debug!("render device destroyed");
}

pub unsafe extern "system" fn device_wait_idle(device: vk::Device) -> vk::Result {
    let ctx = match registry::device(device) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    let render = {
        let _queue = ctx.lock_queue();
        unsafe { ctx.dispatch.wait_idle() }
    };
    let display = match ctx.pairing.as_ref().map(|p| p.join()) {
        Some(Ok(pair)) => {
            let _queue = pair.display.lock_queue();
            unsafe { pair.display.dispatch.wait_idle() }
        }
        _ => Ok(()),
    };
    match render.and(display) {
        Ok(()) => vk::Result::SUCCESS,
        Err(e) => {
            error!("vkDeviceWaitIdle failed: {e}");
            e
        }
    }
}

unsafe fn build_swapchain(
    render: &Arc<DeviceContext>,
    info: &vk::SwapchainCreateInfoKHR<'_>,
) -> Result<vk::SwapchainKHR, vk::Result> {
    let Some(pairing) = &render.pairing else {
        error!("swapchain requested on a device without a display pairing");
        return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
    };
    let pair = pairing.join().map_err(|e| {
        error!("{e}");
        e.as_vk_result()
    })?;
    let display = &pair.display;

    let old_backend = if info.old_swapchain == vk::SwapchainKHR::null() {
        vk::SwapchainKHR::null()
    } else {
        registry::swapchain(info.old_swapchain)
            .map(|old| old.backend())
            .unwrap_or(vk::SwapchainKHR::null())
    };
    let backend_info = backend_create_info(info, old_backend);
    debug!(
        requested = info.min_image_count,
        backend = backend_info.min_image_count,
        ?old_backend,
        "creating backend swapchain"
    );

    let mut handle = vk::SwapchainKHR::null();
    unsafe {
        (display.dispatch.fp.create_swapchain_khr)(
            display.dispatch.handle,
            &backend_info,
            ptr::null(),
            &mut handle,
        )
    }
    .result()
    .map_err(|e| {
        error!("vkCreateSwapchainKHR on display device failed: {e}");
        e
    })?;
    let backend = Backend::new(&display.dispatch, handle);

    let devices = Devices {
        render: render.clone(),
        display: display.clone(),
        render_memory: pair.render_memory,
        display_memory: pair.display_memory,
    };
    let swapchain = PrimusSwapchain::new(devices, backend, info, render.instance.worker_threads)
        .map_err(|e| {
            error!("swapchain setup failed: {e:#}");
            vk::Result::ERROR_UNKNOWN
        })?;

    let handle = registry::next_swapchain_handle();
    registry::write().swapchains.register(handle, Arc::new(swapchain));
    Ok(handle)
}

pub unsafe extern "system" fn create_swapchain(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR<'_>,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let render = match registry::device(device) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    match unsafe { build_swapchain(&render, &*p_create_info) } {
        Ok(handle) => {
            unsafe { *p_swapchain = handle };
            vk::Result::SUCCESS
        }
        Err(e) => e,
    }
}

pub unsafe extern "system" fn destroy_swapchain(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
    _p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if swapchain == vk::SwapchainKHR::null() {
        return;
    }
    let Some(chain) = registry::write().swapchains.erase(swapchain) else {
        error!(?swapchain, "destroy of unknown swapchain");
        return;
    };
    chain.shutdown();
    debug!(?swapchain, "swapchain destroyed");
}

pub unsafe extern "system" fn get_swapchain_images(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
    p_count: *mut u32,
    p_images: *mut vk::Image,
) -> vk::Result {
    match registry::swapchain(swapchain) {
        Ok(chain) => unsafe { write_out(&chain.images(), p_count, p_images) },
        Err(e) => e.as_vk_result(),
    }
}

pub unsafe extern "system" fn acquire_next_image2(
    _device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR<'_>,
    p_image_index: *mut u32,
) -> vk::Result {
    let info = unsafe { &*p_acquire_info };
    let chain = match registry::swapchain(info.swapchain) {
        Ok(chain) => chain,
        Err(e) => return e.as_vk_result(),
    };
    match chain.acquire(info.timeout, info.semaphore, info.fence) {
        Ok((index, res)) => {
            unsafe { *p_image_index = index };
            res
        }
        Err(e @ (vk::Result::TIMEOUT | vk::Result::NOT_READY)) => e,
        Err(e) => {
            warn!("acquire failed: {e}");
            e
        }
    }
}

pub unsafe extern "system" fn acquire_next_image(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    let info = vk::AcquireNextImageInfoKHR {
        s_type: vk::StructureType::ACQUIRE_NEXT_IMAGE_INFO_KHR,
        swapchain,
        timeout,
        semaphore,
        fence,
        device_mask: 1,
        ..Default::default()
    };
    unsafe { acquire_next_image2(device, &info, p_image_index) }
}

pub unsafe extern "system" fn get_swapchain_status(
    _device: vk::Device,
    swapchain: vk::SwapchainKHR,
) -> vk::Result {
    match registry::swapchain(swapchain) {
        Ok(chain) => chain.status(),
        Err(e) => e.as_vk_result(),
    }
}

pub unsafe extern "system" fn queue_present(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR<'_>,
) -> vk::Result {
    let ctx = match registry::device(queue) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    let info = unsafe { &*p_present_info };
    let swapchains = unsafe { raw_slice(info.p_swapchains, info.swapchain_count) };
    let indices = unsafe { raw_slice(info.p_image_indices, info.swapchain_count) };
    let wait = unsafe { raw_slice(info.p_wait_semaphores, info.wait_semaphore_count) };
    let (Some(&handle), Some(&index)) = (swapchains.first(), indices.first()) else {
        return vk::Result::SUCCESS;
    };
    if swapchains.len() > 1 {
        warn!(count = swapchains.len(), "presenting to several swapchains at once is not supported, only the first is shown");
    }

    let _queue = ctx.lock_queue();
    let res = match registry::swapchain(handle) {
        Ok(chain) => match chain.present(queue, index, wait) {
            Ok(()) => vk::Result::SUCCESS,
            Err(e) => {
                error!(index, "present failed: {e}");
                e
            }
        },
        Err(e) => e.as_vk_result(),
    };
    if !info.p_results.is_null() {
        for i in 0..swapchains.len() {
            unsafe { *info.p_results.add(i) = res };
        }
    }
    trace!(index, "queue present");
    res
}

pub unsafe extern "system" fn queue_submit(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let ctx = match registry::device(queue) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    let _queue = ctx.lock_queue();
    unsafe { (ctx.dispatch.fp.queue_submit)(queue, submit_count, p_submits, fence) }
}

unsafe fn submit2_with(
    pick: fn(&DeviceDispatch) -> Option<vk::PFN_vkQueueSubmit2>,
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2<'_>,
    fence: vk::Fence,
) -> vk::Result {
    let ctx = match registry::device(queue) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    let Some(submit) = pick(&ctx.dispatch) else {
        return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
    };
    let _queue = ctx.lock_queue();
    unsafe { submit(queue, submit_count, p_submits, fence) }
}

pub unsafe extern "system" fn queue_submit2(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2<'_>,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { submit2_with(|d| d.fp.queue_submit2, queue, submit_count, p_submits, fence) }
}

pub unsafe extern "system" fn queue_submit2_khr(
    queue: vk::Queue,
    submit_count: u32,
    p_submits: *const vk::SubmitInfo2<'_>,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { submit2_with(|d| d.fp.queue_submit2_khr, queue, submit_count, p_submits, fence) }
}

pub unsafe extern "system" fn queue_wait_idle(queue: vk::Queue) -> vk::Result {
    let ctx = match registry::device(queue) {
        Ok(ctx) => ctx,
        Err(e) => return e.as_vk_result(),
    };
    let _queue = ctx.lock_queue();
    unsafe { (ctx.dispatch.fp.queue_wait_idle)(queue) }
}
