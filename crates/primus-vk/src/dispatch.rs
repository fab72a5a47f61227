// SPDX-License-Identifier: CEPL-1.0
//! Function tables for the next element of the call chain.
//!
//! Tables are resolved once through the next link's `vkGet*ProcAddr` and never
//! change afterwards. Entry points the layer cannot work without are plain
//! function pointers; anything extension- or version-dependent is an `Option`.

use std::ffi::{c_char, c_void};
use std::ptr;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::error::LayerError;
use crate::loader::{DispatchKey, PfnGetPhysicalDeviceProcAddr, PfnSetDeviceLoaderData};

/// Reinterpret a resolved `PFN_vkVoidFunction` as its real signature.
///
/// # Safety
/// `F` must be the function pointer type matching the name it was resolved with.
unsafe fn cast<F: Copy>(f: unsafe extern "system" fn()) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of_val(&f));
    unsafe { std::mem::transmute_copy(&f) }
}

/// Typed view of a single resolved entry point.
///
/// # Safety
/// As for [`cast`].
pub unsafe fn resolve_as<F: Copy>(f: vk::PFN_vkVoidFunction) -> Option<F> {
    f.map(|f| unsafe { cast(f) })
}

macro_rules! fn_table {
    (
        $(#[$meta:meta])*
        pub struct $table:ident {
            required { $($req:ident: $req_ty:ident = $req_name:literal,)* }
            optional { $($opt:ident: $opt_ty:ident = $opt_name:literal,)* }
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy)]
        pub struct $table {
            $(pub $req: vk::$req_ty,)*
            $(pub $opt: Option<vk::$opt_ty>,)*
        }

        impl $table {
            /// # Safety
            /// `lookup` must behave like the `vkGet*ProcAddr` of a live object.
            pub unsafe fn resolve(
                mut lookup: impl FnMut(*const c_char) -> vk::PFN_vkVoidFunction,
            ) -> Result<Self, LayerError> {
                Ok(Self {
                    $($req: match lookup(concat!($req_name, "\0").as_ptr().cast()) {
                        Some(f) => unsafe { cast(f) },
                        None => return Err(LayerError::MissingEntryPoint($req_name)),
                    },)*
                    $($opt: lookup(concat!($opt_name, "\0").as_ptr().cast())
                        .map(|f| unsafe { cast(f) }),)*
                })
            }
        }
    };
}

fn_table! {
    pub struct InstanceFns {
        required {
            destroy_instance: PFN_vkDestroyInstance = "vkDestroyInstance",
            enumerate_physical_devices: PFN_vkEnumeratePhysicalDevices = "vkEnumeratePhysicalDevices",
            get_physical_device_properties: PFN_vkGetPhysicalDeviceProperties = "vkGetPhysicalDeviceProperties",
            get_physical_device_queue_family_properties: PFN_vkGetPhysicalDeviceQueueFamilyProperties = "vkGetPhysicalDeviceQueueFamilyProperties",
            get_physical_device_memory_properties: PFN_vkGetPhysicalDeviceMemoryProperties = "vkGetPhysicalDeviceMemoryProperties",
            enumerate_device_extension_properties: PFN_vkEnumerateDeviceExtensionProperties = "vkEnumerateDeviceExtensionProperties",
        }
        optional {
            enumerate_physical_device_groups: PFN_vkEnumeratePhysicalDeviceGroups = "vkEnumeratePhysicalDeviceGroups",
            enumerate_physical_device_groups_khr: PFN_vkEnumeratePhysicalDeviceGroups = "vkEnumeratePhysicalDeviceGroupsKHR",
            get_physical_device_surface_support_khr: PFN_vkGetPhysicalDeviceSurfaceSupportKHR = "vkGetPhysicalDeviceSurfaceSupportKHR",
            get_physical_device_surface_capabilities_khr: PFN_vkGetPhysicalDeviceSurfaceCapabilitiesKHR = "vkGetPhysicalDeviceSurfaceCapabilitiesKHR",
            get_physical_device_surface_formats_khr: PFN_vkGetPhysicalDeviceSurfaceFormatsKHR = "vkGetPhysicalDeviceSurfaceFormatsKHR",
            get_physical_device_surface_present_modes_khr: PFN_vkGetPhysicalDeviceSurfacePresentModesKHR = "vkGetPhysicalDeviceSurfacePresentModesKHR",
            get_physical_device_surface_capabilities2_khr: PFN_vkGetPhysicalDeviceSurfaceCapabilities2KHR = "vkGetPhysicalDeviceSurfaceCapabilities2KHR",
            get_physical_device_surface_capabilities2_ext: PFN_vkGetPhysicalDeviceSurfaceCapabilities2EXT = "vkGetPhysicalDeviceSurfaceCapabilities2EXT",
            get_physical_device_surface_formats2_khr: PFN_vkGetPhysicalDeviceSurfaceFormats2KHR = "vkGetPhysicalDeviceSurfaceFormats2KHR",
            get_physical_device_present_rectangles_khr: PFN_vkGetPhysicalDevicePresentRectanglesKHR = "vkGetPhysicalDevicePresentRectanglesKHR",
            get_physical_device_xcb_presentation_support_khr: PFN_vkGetPhysicalDeviceXcbPresentationSupportKHR = "vkGetPhysicalDeviceXcbPresentationSupportKHR",
            get_physical_device_xlib_presentation_support_khr: PFN_vkGetPhysicalDeviceXlibPresentationSupportKHR = "vkGetPhysicalDeviceXlibPresentationSupportKHR",
            get_physical_device_wayland_presentation_support_khr: PFN_vkGetPhysicalDeviceWaylandPresentationSupportKHR = "vkGetPhysicalDeviceWaylandPresentationSupportKHR",
        }
    }
}

fn_table! {
    pub struct DeviceFns {
        required {
            destroy_device: PFN_vkDestroyDevice = "vkDestroyDevice",
            device_wait_idle: PFN_vkDeviceWaitIdle = "vkDeviceWaitIdle",
            get_device_queue: PFN_vkGetDeviceQueue = "vkGetDeviceQueue",
            queue_submit: PFN_vkQueueSubmit = "vkQueueSubmit",
            queue_wait_idle: PFN_vkQueueWaitIdle = "vkQueueWaitIdle",

            create_image: PFN_vkCreateImage = "vkCreateImage",
            destroy_image: PFN_vkDestroyImage = "vkDestroyImage",
            get_image_memory_requirements: PFN_vkGetImageMemoryRequirements = "vkGetImageMemoryRequirements",
            get_image_subresource_layout: PFN_vkGetImageSubresourceLayout = "vkGetImageSubresourceLayout",
            allocate_memory: PFN_vkAllocateMemory = "vkAllocateMemory",
            free_memory: PFN_vkFreeMemory = "vkFreeMemory",
            bind_image_memory: PFN_vkBindImageMemory = "vkBindImageMemory",
            map_memory: PFN_vkMapMemory = "vkMapMemory",
            unmap_memory: PFN_vkUnmapMemory = "vkUnmapMemory",
            invalidate_mapped_memory_ranges: PFN_vkInvalidateMappedMemoryRanges = "vkInvalidateMappedMemoryRanges",

            create_command_pool: PFN_vkCreateCommandPool = "vkCreateCommandPool",
            destroy_command_pool: PFN_vkDestroyCommandPool = "vkDestroyCommandPool",
            allocate_command_buffers: PFN_vkAllocateCommandBuffers = "vkAllocateCommandBuffers",
            free_command_buffers: PFN_vkFreeCommandBuffers = "vkFreeCommandBuffers",
            begin_command_buffer: PFN_vkBeginCommandBuffer = "vkBeginCommandBuffer",
            end_command_buffer: PFN_vkEndCommandBuffer = "vkEndCommandBuffer",
            cmd_pipeline_barrier: PFN_vkCmdPipelineBarrier = "vkCmdPipelineBarrier",
            cmd_copy_image: PFN_vkCmdCopyImage = "vkCmdCopyImage",

            create_fence: PFN_vkCreateFence = "vkCreateFence",
            destroy_fence: PFN_vkDestroyFence = "vkDestroyFence",
            wait_for_fences: PFN_vkWaitForFences = "vkWaitForFences",
            reset_fences: PFN_vkResetFences = "vkResetFences",
            create_semaphore: PFN_vkCreateSemaphore = "vkCreateSemaphore",
            destroy_semaphore: PFN_vkDestroySemaphore = "vkDestroySemaphore",

            create_swapchain_khr: PFN_vkCreateSwapchainKHR = "vkCreateSwapchainKHR",
            destroy_swapchain_khr: PFN_vkDestroySwapchainKHR = "vkDestroySwapchainKHR",
            get_swapchain_images_khr: PFN_vkGetSwapchainImagesKHR = "vkGetSwapchainImagesKHR",
            acquire_next_image_khr: PFN_vkAcquireNextImageKHR = "vkAcquireNextImageKHR",
            queue_present_khr: PFN_vkQueuePresentKHR = "vkQueuePresentKHR",
        }
        optional {
            get_swapchain_status_khr: PFN_vkGetSwapchainStatusKHR = "vkGetSwapchainStatusKHR",
            queue_submit2: PFN_vkQueueSubmit2 = "vkQueueSubmit2",
            queue_submit2_khr: PFN_vkQueueSubmit2 = "vkQueueSubmit2KHR",
        }
    }
}

/// Read a `vkGet*`/`vkEnumerate*` style array with the count/fill protocol.
///
/// # Safety
/// `call` must forward to a driver query following that protocol.
pub unsafe fn read_into_vec<T: Default + Clone>(
    mut call: impl FnMut(*mut u32, *mut T) -> vk::Result,
) -> VkResult<Vec<T>> {
    loop {
        let mut count = 0;
        call(&mut count, ptr::null_mut()).result()?;
        let mut data = vec![T::default(); count as usize];
        match call(&mut count, data.as_mut_ptr()) {
            vk::Result::INCOMPLETE => continue,
            res => res.result()?,
        }
        data.truncate(count as usize);
        return Ok(data);
    }
}

/// Copy `items` out through a caller-supplied count/array pair.
///
/// # Safety
/// `p_count` must be valid; `p_items`, if non-null, must have room for `*p_count`.
pub unsafe fn write_out<T: Copy>(items: &[T], p_count: *mut u32, p_items: *mut T) -> vk::Result {
    unsafe {
        if p_items.is_null() {
            *p_count = items.len() as u32;
            return vk::Result::SUCCESS;
        }
        let n = (*p_count as usize).min(items.len());
        ptr::copy_nonoverlapping(items.as_ptr(), p_items, n);
        *p_count = n as u32;
        if n < items.len() {
            vk::Result::INCOMPLETE
        } else {
            vk::Result::SUCCESS
        }
    }
}

/// The next chain element for one instance.
pub struct InstanceDispatch {
    pub handle: vk::Instance,
    pub get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
    pub fp: InstanceFns,
}

impl InstanceDispatch {
    /// # Safety
    /// `gipa` must be the next link's resolver and `handle` the instance it created.
    pub unsafe fn load(
        handle: vk::Instance,
        gipa: vk::PFN_vkGetInstanceProcAddr,
        gpdpa: Option<PfnGetPhysicalDeviceProcAddr>,
    ) -> Result<Self, LayerError> {
        let fp = unsafe { InstanceFns::resolve(|name| gipa(handle, name)) }?;
        Ok(Self {
            handle,
            get_instance_proc_addr: gipa,
            get_physical_device_proc_addr: gpdpa,
            fp,
        })
    }

    pub unsafe fn proc_addr(&self, name: *const c_char) -> vk::PFN_vkVoidFunction {
        unsafe { (self.get_instance_proc_addr)(self.handle, name) }
    }

    pub unsafe fn enumerate_physical_devices(&self) -> VkResult<Vec<vk::PhysicalDevice>> {
        unsafe {
            read_into_vec(|count, data| (self.fp.enumerate_physical_devices)(self.handle, count, data))
        }
    }

    pub unsafe fn physical_device_properties(
        &self,
        pd: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        let mut props = vk::PhysicalDeviceProperties::default();
        unsafe { (self.fp.get_physical_device_properties)(pd, &mut props) };
        props
    }

    pub unsafe fn queue_family_properties(
        &self,
        pd: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        let f = self.fp.get_physical_device_queue_family_properties;
        let mut count = 0;
        unsafe { f(pd, &mut count, ptr::null_mut()) };
        let mut out = vec![vk::QueueFamilyProperties::default(); count as usize];
        unsafe { f(pd, &mut count, out.as_mut_ptr()) };
        out.truncate(count as usize);
        out
    }

    pub unsafe fn memory_properties(
        &self,
        pd: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        unsafe { (self.fp.get_physical_device_memory_properties)(pd, &mut props) };
        props
    }

    pub unsafe fn surface_capabilities(
        &self,
        pd: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<vk::SurfaceCapabilitiesKHR> {
        let f = self
            .fp
            .get_physical_device_surface_capabilities_khr
            .ok_or(vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let mut caps = vk::SurfaceCapabilitiesKHR::default();
        unsafe { f(pd, surface, &mut caps) }.result_with_success(caps)
    }
}

/// The next chain element for one logical device, plus the device handle.
pub struct DeviceDispatch {
    pub handle: vk::Device,
    pub get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
    pub fp: DeviceFns,
    set_loader_data: Option<PfnSetDeviceLoaderData>,
}

impl DeviceDispatch {
    /// # Safety
    /// `gdpa` must resolve entry points for `handle`.
    pub unsafe fn load(
        handle: vk::Device,
        gdpa: vk::PFN_vkGetDeviceProcAddr,
        set_loader_data: Option<PfnSetDeviceLoaderData>,
    ) -> Result<Self, LayerError> {
        let fp = unsafe { DeviceFns::resolve(|name| gdpa(handle, name)) }?;
        Ok(Self {
            handle,
            get_device_proc_addr: gdpa,
            fp,
            set_loader_data,
        })
    }

    pub fn key(&self) -> DispatchKey {
        unsafe { DispatchKey::of(self.handle) }
    }

    /// Give a dispatchable object the layer created itself a loader dispatch
    /// pointer, so it can be handed to layers and drivers below.
    ///
    /// # Safety
    /// `child` must be a freshly created dispatchable object of this device.
    pub unsafe fn adopt<H: Handle>(&self, child: H) -> VkResult<()> {
        match self.set_loader_data {
            Some(set) => unsafe { set(self.handle, child.as_raw() as usize as *mut c_void) }.result(),
            None => {
                unsafe { DispatchKey::inherit(self.handle, child) };
                Ok(())
            }
        }
    }

    pub unsafe fn wait_idle(&self) -> VkResult<()> {
        unsafe { (self.fp.device_wait_idle)(self.handle) }.result()
    }

    /// Fetch a queue for the layer's own use; the result is already adopted.
    pub unsafe fn queue(&self, family: u32, index: u32) -> VkResult<vk::Queue> {
        let mut queue = vk::Queue::null();
        unsafe { (self.fp.get_device_queue)(self.handle, family, index, &mut queue) };
        if queue == vk::Queue::null() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        unsafe { self.adopt(queue) }?;
        Ok(queue)
    }

    pub unsafe fn queue_submit(
        &self,
        queue: vk::Queue,
        submits: &[vk::SubmitInfo<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        unsafe { (self.fp.queue_submit)(queue, submits.len() as u32, submits.as_ptr(), fence) }
            .result()
    }

    /// Create an unsignaled fence.
    pub unsafe fn create_fence(&self) -> VkResult<vk::Fence> {
        let info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            ..Default::default()
        };
        let mut fence = vk::Fence::null();
        unsafe { (self.fp.create_fence)(self.handle, &info, ptr::null(), &mut fence) }
            .result_with_success(fence)
    }

    pub unsafe fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { (self.fp.wait_for_fences)(self.handle, 1, &fence, vk::TRUE, timeout_ns) }.result()
    }

    pub unsafe fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { (self.fp.reset_fences)(self.handle, 1, &fence) }.result()
    }

    pub unsafe fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { (self.fp.destroy_fence)(self.handle, fence, ptr::null()) }
    }

    pub unsafe fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        let mut sem = vk::Semaphore::null();
        unsafe { (self.fp.create_semaphore)(self.handle, &info, ptr::null(), &mut sem) }
            .result_with_success(sem)
    }

    pub unsafe fn destroy_semaphore(&self, sem: vk::Semaphore) {
        unsafe { (self.fp.destroy_semaphore)(self.handle, sem, ptr::null()) }
    }

    pub unsafe fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe {
            read_into_vec(|count, data| {
                (self.fp.get_swapchain_images_khr)(self.handle, swapchain, count, data)
            })
        }
    }
}
