// SPDX-License-Identifier: CEPL-1.0
//! The entry points handed to the loader and the name routing behind them.
//!
//! Every name the layer replaces resolves to a function in [`instance`] or
//! [`device`]; anything else falls through to the next element of the chain.

mod device;
mod instance;

use std::ffi::{c_char, CStr};

use ash::vk;
use tracing::{debug, error};

use crate::loader::{
    NegotiateLayerInterface, CURRENT_LOADER_LAYER_INTERFACE_VERSION, LAYER_NEGOTIATE_INTERFACE_STRUCT,
};
use crate::registry;

fn erase(f: *const ()) -> unsafe extern "system" fn() {
    // SAFETY: only ever called with `extern "system"` function items.
    unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>(f) }
}

macro_rules! hooks {
    ($name:expr, { $($vk:literal => $f:path,)* }) => {
        match $name {
            $($vk => Some(erase($f as *const ())),)*
            _ => None,
        }
    };
}

/// Global and instance-level names.
fn instance_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    hooks!(name, {
        b"vkGetInstanceProcAddr" => PrimusVK_GetInstanceProcAddr,
        b"vkCreateInstance" => instance::create_instance,
        b"vkDestroyInstance" => instance::destroy_instance,
        b"vkEnumerateInstanceLayerProperties" => instance::enumerate_instance_layer_properties,
        b"vkEnumerateInstanceExtensionProperties" => instance::enumerate_instance_extension_properties,
        b"vkEnumerateDeviceLayerProperties" => instance::enumerate_device_layer_properties,
        b"vkEnumerateDeviceExtensionProperties" => instance::enumerate_device_extension_properties,
        b"vkEnumeratePhysicalDevices" => instance::enumerate_physical_devices,
        b"vkEnumeratePhysicalDeviceGroups" => instance::enumerate_physical_device_groups,
        b"vkEnumeratePhysicalDeviceGroupsKHR" => instance::enumerate_physical_device_groups,
        b"vkCreateDevice" => device::create_device,
    })
}

/// Physical-device names answered by the display GPU.
fn physical_device_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    hooks!(name, {
        b"vkGetPhysicalDeviceSurfaceSupportKHR" => instance::surface_support,
        b"vkGetPhysicalDeviceSurfaceCapabilitiesKHR" => instance::surface_capabilities,
        b"vkGetPhysicalDeviceSurfaceFormatsKHR" => instance::surface_formats,
        b"vkGetPhysicalDeviceSurfacePresentModesKHR" => instance::surface_present_modes,
        b"vkGetPhysicalDeviceSurfaceCapabilities2KHR" => instance::surface_capabilities2_khr,
        b"vkGetPhysicalDeviceSurfaceCapabilities2EXT" => instance::surface_capabilities2_ext,
        b"vkGetPhysicalDeviceSurfaceFormats2KHR" => instance::surface_formats2,
        b"vkGetPhysicalDevicePresentRectanglesKHR" => instance::present_rectangles,
        b"vkGetPhysicalDeviceXcbPresentationSupportKHR" => instance::xcb_presentation_support,
        b"vkGetPhysicalDeviceXlibPresentationSupportKHR" => instance::xlib_presentation_support,
        b"vkGetPhysicalDeviceWaylandPresentationSupportKHR" => instance::wayland_presentation_support,
    })
}

fn device_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    hooks!(name, {
        b"vkGetDeviceProcAddr" => PrimusVK_GetDeviceProcAddr,
        b"vkDestroyDevice" => device::destroy_device,
        b"vkDeviceWaitIdle" => device::device_wait_idle,
        b"vkCreateSwapchainKHR" => device::create_swapchain,
        b"vkDestroySwapchainKHR" => device::destroy_swapchain,
        b"vkGetSwapchainImagesKHR" => device::get_swapchain_images,
        b"vkAcquireNextImageKHR" => device::acquire_next_image,
        b"vkAcquireNextImage2KHR" => device::acquire_next_image2,
        b"vkGetSwapchainStatusKHR" => device::get_swapchain_status,
        b"vkQueuePresentKHR" => device::queue_present,
        b"vkQueueSubmit" => device::queue_submit,
        b"vkQueueSubmit2" => device::queue_submit2,
        b"vkQueueSubmit2KHR" => device::queue_submit2_khr,
        b"vkQueueWaitIdle" => device::queue_wait_idle,
    })
}

/// # Safety
/// Called by the loader with a valid negotiation struct.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_version: *mut NegotiateLayerInterface,
) -> vk::Result {
    primus_core::init_tracing();
    let Some(version) = (unsafe { p_version.as_mut() }) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };
    if version.s_type != LAYER_NEGOTIATE_INTERFACE_STRUCT {
        error!(s_type = version.s_type, "unexpected negotiation struct");
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if version.loader_layer_interface_version < CURRENT_LOADER_LAYER_INTERFACE_VERSION {
        error!(
            loader = version.loader_layer_interface_version,
            "loader interface too old, need version {CURRENT_LOADER_LAYER_INTERFACE_VERSION}"
        );
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    version.loader_layer_interface_version = CURRENT_LOADER_LAYER_INTERFACE_VERSION;
    version.pfn_get_instance_proc_addr = Some(PrimusVK_GetInstanceProcAddr);
    version.pfn_get_device_proc_addr = Some(PrimusVK_GetDeviceProcAddr);
    version.pfn_get_physical_device_proc_addr = Some(PrimusVK_GetPhysicalDeviceProcAddr);
    debug!("negotiated loader interface {CURRENT_LOADER_LAYER_INTERFACE_VERSION}");
    vk::Result::SUCCESS
}

/// # Safety
/// `p_name` must be a valid C string.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn PrimusVK_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(p_name) }.to_bytes();
    let hook = instance_hook(name)
        .or_else(|| physical_device_hook(name))
        .or_else(|| device_hook(name));
    if hook.is_some() || instance == vk::Instance::null() {
        return hook;
    }
    match registry::instance(instance) {
        Ok(ctx) => unsafe { ctx.dispatch.proc_addr(p_name) },
        Err(_) => None,
    }
}

/// # Safety
/// `p_name` must be a valid C string.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn PrimusVK_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(p_name) }.to_bytes();
    if let Some(hook) = device_hook(name) {
        return Some(hook);
    }
    if device == vk::Device::null() {
        return None;
    }
    match registry::device(device) {
        Ok(ctx) => unsafe { (ctx.dispatch.get_device_proc_addr)(device, p_name) },
        Err(_) => None,
    }
}

/// # Safety
/// `p_name` must be a valid C string.
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn PrimusVK_GetPhysicalDeviceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(p_name) }.to_bytes();
    if let Some(hook) = physical_device_hook(name) {
        return Some(hook);
    }
    let ctx = registry::instance(instance).ok()?;
    let next = ctx.dispatch.get_physical_device_proc_addr?;
    unsafe { next(instance, p_name) }
}
