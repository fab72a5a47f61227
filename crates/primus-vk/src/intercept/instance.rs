// SPDX-License-Identifier: CEPL-1.0
//! Instance-level intercepts: instance lifetime, layer identity, the
//! physical device mask and the surface queries redirected to the display GPU.

use std::ffi::{c_char, CStr};
use std::sync::Arc;

use ash::vk;
use primus_core::LayerConfig;
use tracing::{error, info};

use crate::dispatch::{resolve_as, write_out, InstanceDispatch};
use crate::error::LayerError;
use crate::instance::InstanceContext;
use crate::loader::{DispatchKey, InstanceChain, PfnGetPhysicalDeviceProcAddr, PfnLayerCreateDevice, PfnLayerDestroyDevice};
use crate::registry;

pub const LAYER_NAME: &str = "VK_LAYER_PRIMUS_PrimusVK";
pub const LAYER_DESCRIPTION: &str = "Primus-vk - render on one GPU, present on another";
const IMPLEMENTATION_VERSION: u32 = 1;

/// Copy `s` into a fixed-size C string field, truncating if needed. The
/// result is always NUL terminated.
pub fn write_c_str(dst: &mut [c_char], s: &str) {
    let Some(room) = dst.len().checked_sub(1) else {
        return;
    };
    let n = s.len().min(room);
    for (d, &b) in dst.iter_mut().zip(&s.as_bytes()[..n]) {
        *d = b as c_char;
    }
    dst[n..].fill(0);
}

pub fn layer_properties() -> vk::LayerProperties {
    let mut props = vk::LayerProperties {
        spec_version: vk::API_VERSION_1_0,
        implementation_version: IMPLEMENTATION_VERSION,
        ..Default::default()
    };
    write_c_str(&mut props.layer_name, LAYER_NAME);
    write_c_str(&mut props.description, LAYER_DESCRIPTION);
    props
}

unsafe fn is_this_layer(p_layer_name: *const c_char) -> bool {
    !p_layer_name.is_null() && unsafe { CStr::from_ptr(p_layer_name) }.to_bytes() == LAYER_NAME.as_bytes()
}

/// Report exactly one device group holding `device`.
pub fn fill_single_group(group: &mut vk::PhysicalDeviceGroupProperties<'_>, device: vk::PhysicalDevice) {
    group.physical_device_count = 1;
    group.physical_devices = [vk::PhysicalDevice::null(); vk::MAX_DEVICE_GROUP_SIZE];
    group.physical_devices[0] = device;
    group.subset_allocation = vk::FALSE;
}

fn context<H: vk::Handle>(handle: H) -> Result<Arc<InstanceContext>, vk::Result> {
    registry::instance(handle).map_err(|e| e.as_vk_result())
}

unsafe fn setup(
    instance: vk::Instance,
    gipa: vk::PFN_vkGetInstanceProcAddr,
    gpdpa: Option<PfnGetPhysicalDeviceProcAddr>,
    callbacks: (PfnLayerCreateDevice, PfnLayerDestroyDevice),
) -> Result<(), LayerError> {
    let dispatch = unsafe { InstanceDispatch::load(instance, gipa, gpdpa) }?;
    let ctx = unsafe { InstanceContext::new(dispatch, callbacks, &LayerConfig::load()) }?;
    registry::write()
        .instances
        .register(unsafe { DispatchKey::of(instance) }, Arc::new(ctx));
    Ok(())
}

pub unsafe extern "system" fn create_instance(
    p_create_info: *const vk::InstanceCreateInfo<'_>,
    p_allocator: *const vk::AllocationCallbacks<'_>,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    primus_core::init_tracing();

    let chain = match unsafe { InstanceChain::find((*p_create_info).p_next) } {
        Some(chain) => chain,
        None => {
            error!("{}", LayerError::MissingLayerLink);
            return LayerError::MissingLayerLink.as_vk_result();
        }
    };
    let Some(callbacks) = chain.device_callbacks else {
        error!("{}", LayerError::MissingDeviceCallbacks);
        return LayerError::MissingDeviceCallbacks.as_vk_result();
    };
    let (gipa, gpdpa) = unsafe { chain.take_next() };

    let next_create = unsafe {
        resolve_as::<vk::PFN_vkCreateInstance>(gipa(vk::Instance::null(), c"vkCreateInstance".as_ptr()))
    };
    let Some(next_create) = next_create else {
        error!("{}", LayerError::MissingEntryPoint("vkCreateInstance"));
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    let res = unsafe { next_create(p_create_info, p_allocator, p_instance) };
    if res != vk::Result::SUCCESS {
        error!("vkCreateInstance failed: {res}");
        return res;
    }

    let instance = unsafe { *p_instance };
    match unsafe { setup(instance, gipa, gpdpa, callbacks) } {
        Ok(()) => {
            info!("instance ready");
            vk::Result::SUCCESS
        }
        Err(e) => {
            error!("instance setup failed: {e}");
            let destroy = unsafe {
                resolve_as::<vk::PFN_vkDestroyInstance>(gipa(instance, c"vkDestroyInstance".as_ptr()))
            };
            if let Some(destroy) = destroy {
                unsafe { destroy(instance, p_allocator) };
            }
            unsafe { *p_instance = vk::Instance::null() };
            e.as_vk_result()
        }
    }
}

pub unsafe extern "system" fn destroy_instance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks<'_>,
) {
    if instance == vk::Instance::null() {
        return;
    }
    let key = unsafe { DispatchKey::of(instance) };
    let Some(ctx) = registry::write().instances.erase(key) else {
        error!(?key, "destroy of unknown instance");
        return;
    };
    unsafe { (ctx.dispatch.fp.destroy_instance)(instance, p_allocator) };
    info!("instance destroyed");
}

pub unsafe extern "system" fn enumerate_instance_layer_properties(
    p_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    unsafe { write_out(&[layer_properties()], p_count, p_properties) }
}

pub unsafe extern "system" fn enumerate_device_layer_properties(
    _physical_device: vk::PhysicalDevice,
    p_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    unsafe { write_out(&[layer_properties()], p_count, p_properties) }
}

pub unsafe extern "system" fn enumerate_instance_extension_properties(
    p_layer_name: *const c_char,
    p_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if !unsafe { is_this_layer(p_layer_name) } {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    unsafe { *p_count = 0 };
    vk::Result::SUCCESS
}

pub unsafe extern "system" fn enumerate_device_extension_properties(
    physical_device: vk::PhysicalDevice,
    p_layer_name: *const c_char,
    p_count: *mut u32,
    p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    if unsafe { is_this_layer(p_layer_name) } {
        unsafe { *p_count = 0 };
        return vk::Result::SUCCESS;
    }
    if physical_device == vk::PhysicalDevice::null() {
        return vk::Result::ERROR_LAYER_NOT_PRESENT;
    }
    match context(physical_device) {
        Ok(ctx) => unsafe {
            (ctx.dispatch.fp.enumerate_device_extension_properties)(
                physical_device,
                p_layer_name,
                p_count,
                p_properties,
            )
        },
        Err(e) => e,
    }
}

pub unsafe extern "system" fn enumerate_physical_devices(
    instance: vk::Instance,
    p_count: *mut u32,
    p_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    match context(instance) {
        Ok(ctx) => unsafe { write_out(&[ctx.render.handle], p_count, p_devices) },
        Err(e) => e,
    }
}

pub unsafe extern "system" fn enumerate_physical_device_groups(
    instance: vk::Instance,
    p_count: *mut u32,
    p_groups: *mut vk::PhysicalDeviceGroupProperties<'_>,
) -> vk::Result {
    let ctx = match context(instance) {
        Ok(ctx) => ctx,
        Err(e) => return e,
    };
    unsafe {
        if p_groups.is_null() {
            *p_count = 1;
            return vk::Result::SUCCESS;
        }
        if *p_count == 0 {
            return vk::Result::INCOMPLETE;
        }
        fill_single_group(&mut *p_groups, ctx.render.handle);
        *p_count = 1;
    }
    vk::Result::SUCCESS
}

// Surface queries arrive for the render device the application sees and are
// answered by the display device.
macro_rules! on_display {
    ($pd:expr, $fp:ident, |$ctx:ident, $f:ident| $call:expr) => {{
        let $ctx = match context($pd) {
            Ok(ctx) => ctx,
            Err(e) => return e,
        };
        let Some($f) = $ctx.dispatch.fp.$fp else {
            return vk::Result::ERROR_EXTENSION_NOT_PRESENT;
        };
        unsafe { $call }
    }};
}

pub unsafe extern "system" fn surface_support(
    physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    surface: vk::SurfaceKHR,
    p_supported: *mut vk::Bool32,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_support_khr, |ctx, f| {
        f(ctx.display.handle, ctx.display.queue_family, surface, p_supported)
    })
}

pub unsafe extern "system" fn surface_capabilities(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_capabilities: *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_capabilities_khr, |ctx, f| {
        f(ctx.display.handle, surface, p_capabilities)
    })
}

pub unsafe extern "system" fn surface_formats(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_formats: *mut vk::SurfaceFormatKHR,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_formats_khr, |ctx, f| {
        f(ctx.display.handle, surface, p_count, p_formats)
    })
}

pub unsafe extern "system" fn surface_present_modes(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_modes: *mut vk::PresentModeKHR,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_present_modes_khr, |ctx, f| {
        f(ctx.display.handle, surface, p_count, p_modes)
    })
}

pub unsafe extern "system" fn surface_capabilities2_khr(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR<'_>,
    p_capabilities: *mut vk::SurfaceCapabilities2KHR<'_>,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_capabilities2_khr, |ctx, f| {
        f(ctx.display.handle, p_surface_info, p_capabilities)
    })
}

pub unsafe extern "system" fn surface_capabilities2_ext(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_capabilities: *mut vk::SurfaceCapabilities2EXT<'_>,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_capabilities2_ext, |ctx, f| {
        f(ctx.display.handle, surface, p_capabilities)
    })
}

pub unsafe extern "system" fn surface_formats2(
    physical_device: vk::PhysicalDevice,
    p_surface_info: *const vk::PhysicalDeviceSurfaceInfo2KHR<'_>,
    p_count: *mut u32,
    p_formats: *mut vk::SurfaceFormat2KHR<'_>,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_surface_formats2_khr, |ctx, f| {
        f(ctx.display.handle, p_surface_info, p_count, p_formats)
    })
}

pub unsafe extern "system" fn present_rectangles(
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
    p_count: *mut u32,
    p_rects: *mut vk::Rect2D,
) -> vk::Result {
    on_display!(physical_device, get_physical_device_present_rectangles_khr, |ctx, f| {
        f(ctx.display.handle, surface, p_count, p_rects)
    })
}

// Presentation support answers VK_FALSE when it cannot be asked.
macro_rules! supported_on_display {
    ($pd:expr, $fp:ident, |$ctx:ident, $f:ident| $call:expr) => {{
        let Ok($ctx) = context($pd) else {
            return vk::FALSE;
        };
        match $ctx.dispatch.fp.$fp {
            Some($f) => unsafe { $call },
            None => vk::FALSE,
        }
    }};
}

pub unsafe extern "system" fn xcb_presentation_support(
    physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    connection: *mut vk::xcb_connection_t,
    visual_id: vk::xcb_visualid_t,
) -> vk::Bool32 {
    supported_on_display!(physical_device, get_physical_device_xcb_presentation_support_khr, |ctx, f| {
        f(ctx.display.handle, ctx.display.queue_family, connection, visual_id)
    })
}

pub unsafe extern "system" fn xlib_presentation_support(
    physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    dpy: *mut vk::Display,
    visual_id: vk::VisualID,
) -> vk::Bool32 {
    supported_on_display!(physical_device, get_physical_device_xlib_presentation_support_khr, |ctx, f| {
        f(ctx.display.handle, ctx.display.queue_family, dpy, visual_id)
    })
}

pub unsafe extern "system" fn wayland_presentation_support(
    physical_device: vk::PhysicalDevice,
    _queue_family_index: u32,
    display: *mut vk::wl_display,
) -> vk::Bool32 {
    supported_on_display!(physical_device, get_physical_device_wayland_presentation_support_khr, |ctx, f| {
        f(ctx.display.handle, ctx.display.queue_family, display)
    })
}
