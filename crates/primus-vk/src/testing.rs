// SPDX-License-Identifier: CEPL-1.0
//! In-process stand-ins for the next chain element, for unit tests.
//!
//! A fake device handle points at a [`FakeDevice`], whose first word doubles
//! as the loader dispatch word. Every entry point the layer resolves is a
//! plain function that finds its device through the handle, counts the
//! objects it hands out and records the synchronization calls it sees.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk::{self, Handle};
use primus_core::LayerConfig;

use crate::device::DeviceContext;
use crate::dispatch::{DeviceDispatch, InstanceDispatch};
use crate::instance::{InstanceContext, Role};
use crate::loader::{PfnLayerCreateDevice, PfnLayerDestroyDevice};
use crate::worker::Devices;

/// Every fake image is 4x4 texels of 4 bytes, rows tightly packed.
pub const EXTENT: vk::Extent2D = vk::Extent2D { width: 4, height: 4 };
const ROW_PITCH: u64 = 16;
const IMAGE_BYTES: u64 = 64;
pub const SWAPCHAIN_IMAGES: u32 = 3;
pub const SURFACE_MIN_IMAGES: u32 = 2;

const RENDER_GPU: u64 = 0x10;
const DISPLAY_GPU: u64 = 0x20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Call {
    Submit(vk::Fence),
    Wait(vk::Fence),
    Reset(vk::Fence),
    QueueWaitIdle,
    DestroySemaphore(vk::Semaphore),
    DestroySwapchain(vk::SwapchainKHR),
}

#[repr(C)]
struct FakeQueue {
    dispatch: usize,
    owner: *const FakeDevice,
}

#[repr(C)]
pub struct FakeDevice {
    dispatch: usize,
    queue: FakeQueue,
    next_handle: AtomicU64,
    live: AtomicI64,
    calls: Mutex<Vec<Call>>,
    allocations: Mutex<HashMap<u64, Vec<u8>>>,
    command_buffers: Mutex<Vec<u64>>,
}

impl FakeDevice {
    pub fn new() -> Box<Self> {
        let mut dev = Box::new(FakeDevice {
            dispatch: 0,
            queue: FakeQueue { dispatch: 0, owner: ptr::null() },
            next_handle: AtomicU64::new(0x1000),
            live: AtomicI64::new(0),
            calls: Mutex::new(Vec::new()),
            allocations: Mutex::new(HashMap::new()),
            command_buffers: Mutex::new(Vec::new()),
        });
        let this: *const FakeDevice = &*dev;
        dev.dispatch = this as usize;
        dev.queue.owner = this;
        dev
    }

    pub fn handle(&self) -> vk::Device {
        vk::Device::from_raw(self as *const FakeDevice as u64)
    }

    /// Objects created and not yet destroyed.
    pub fn live(&self) -> i64 {
        self.live.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn create<H: Handle>(&self) -> H {
        self.live.fetch_add(1, Ordering::SeqCst);
        H::from_raw(self.next_handle.fetch_add(1, Ordering::SeqCst))
    }

    fn release<H: Handle>(&self, handle: H) {
        if handle.as_raw() != 0 {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        for raw in self.command_buffers.get_mut().unwrap().drain(..) {
            drop(unsafe { Box::from_raw(raw as *mut usize) });
        }
    }
}

unsafe fn dev<'a>(device: vk::Device) -> &'a FakeDevice {
    unsafe { &*(device.as_raw() as *const FakeDevice) }
}

unsafe fn queue_owner<'a>(queue: vk::Queue) -> &'a FakeDevice {
    unsafe { &*(*(queue.as_raw() as *const FakeQueue)).owner }
}

fn void(f: *const ()) -> vk::PFN_vkVoidFunction {
    Some(unsafe { std::mem::transmute::<*const (), unsafe extern "system" fn()>(f) })
}

// Each entry is coerced to its `vk::PFN_*` type first so the signatures are
// checked against ash.
macro_rules! table {
    ($name:expr, { $($vk:literal => $f:ident: $ty:ty,)* }) => {
        match $name {
            $($vk => void($f as $ty as *const ()),)*
            _ => None,
        }
    };
}

unsafe extern "system" fn gdpa(_: vk::Device, name: *const c_char) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(name) }.to_bytes();
    table!(name, {
        b"vkDestroyDevice" => destroy_device: vk::PFN_vkDestroyDevice,
        b"vkDeviceWaitIdle" => device_wait_idle: vk::PFN_vkDeviceWaitIdle,
        b"vkGetDeviceQueue" => get_device_queue: vk::PFN_vkGetDeviceQueue,
        b"vkQueueSubmit" => queue_submit: vk::PFN_vkQueueSubmit,
        b"vkQueueWaitIdle" => queue_wait_idle: vk::PFN_vkQueueWaitIdle,
        b"vkCreateImage" => create_image: vk::PFN_vkCreateImage,
        b"vkDestroyImage" => destroy_image: vk::PFN_vkDestroyImage,
        b"vkGetImageMemoryRequirements" => image_memory_requirements: vk::PFN_vkGetImageMemoryRequirements,
        b"vkGetImageSubresourceLayout" => image_subresource_layout: vk::PFN_vkGetImageSubresourceLayout,
        b"vkAllocateMemory" => allocate_memory: vk::PFN_vkAllocateMemory,
        b"vkFreeMemory" => free_memory: vk::PFN_vkFreeMemory,
        b"vkBindImageMemory" => bind_image_memory: vk::PFN_vkBindImageMemory,
        b"vkMapMemory" => map_memory: vk::PFN_vkMapMemory,
        b"vkUnmapMemory" => unmap_memory: vk::PFN_vkUnmapMemory,
        b"vkInvalidateMappedMemoryRanges" => invalidate_ranges: vk::PFN_vkInvalidateMappedMemoryRanges,
        b"vkCreateCommandPool" => create_command_pool: vk::PFN_vkCreateCommandPool,
        b"vkDestroyCommandPool" => destroy_command_pool: vk::PFN_vkDestroyCommandPool,
        b"vkAllocateCommandBuffers" => allocate_command_buffers: vk::PFN_vkAllocateCommandBuffers,
        b"vkFreeCommandBuffers" => free_command_buffers: vk::PFN_vkFreeCommandBuffers,
        b"vkBeginCommandBuffer" => begin_command_buffer: vk::PFN_vkBeginCommandBuffer,
        b"vkEndCommandBuffer" => end_command_buffer: vk::PFN_vkEndCommandBuffer,
        b"vkCmdPipelineBarrier" => cmd_pipeline_barrier: vk::PFN_vkCmdPipelineBarrier,
        b"vkCmdCopyImage" => cmd_copy_image: vk::PFN_vkCmdCopyImage,
        b"vkCreateFence" => create_fence: vk::PFN_vkCreateFence,
        b"vkDestroyFence" => destroy_fence: vk::PFN_vkDestroyFence,
        b"vkWaitForFences" => wait_for_fences: vk::PFN_vkWaitForFences,
        b"vkResetFences" => reset_fences: vk::PFN_vkResetFences,
        b"vkCreateSemaphore" => create_semaphore: vk::PFN_vkCreateSemaphore,
        b"vkDestroySemaphore" => destroy_semaphore: vk::PFN_vkDestroySemaphore,
        b"vkCreateSwapchainKHR" => create_swapchain: vk::PFN_vkCreateSwapchainKHR,
        b"vkDestroySwapchainKHR" => destroy_swapchain: vk::PFN_vkDestroySwapchainKHR,
        b"vkGetSwapchainImagesKHR" => swapchain_images: vk::PFN_vkGetSwapchainImagesKHR,
        b"vkAcquireNextImageKHR" => acquire_next_image: vk::PFN_vkAcquireNextImageKHR,
        b"vkQueuePresentKHR" => queue_present: vk::PFN_vkQueuePresentKHR,
    })
}

unsafe extern "system" fn destroy_device(_: vk::Device, _: *const vk::AllocationCallbacks<'_>) {}

unsafe extern "system" fn device_wait_idle(_: vk::Device) -> vk::Result {
    vk::Result::SUCCESS
}

unsafe extern "system" fn get_device_queue(device: vk::Device, _: u32, _: u32, p_queue: *mut vk::Queue) {
    let d = unsafe { dev(device) };
    unsafe { *p_queue = vk::Queue::from_raw(&d.queue as *const FakeQueue as u64) };
}

unsafe extern "system" fn queue_submit(
    queue: vk::Queue,
    _: u32,
    _: *const vk::SubmitInfo<'_>,
    fence: vk::Fence,
) -> vk::Result {
    unsafe { queue_owner(queue) }.record(Call::Submit(fence));
    vk::Result::SUCCESS
}

unsafe extern "system" fn queue_wait_idle(queue: vk::Queue) -> vk::Result {
    unsafe { queue_owner(queue) }.record(Call::QueueWaitIdle);
    vk::Result::SUCCESS
}

unsafe extern "system" fn create_image(
    device: vk::Device,
    _: *const vk::ImageCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    p_image: *mut vk::Image,
) -> vk::Result {
    unsafe { *p_image = dev(device).create() };
    vk::Result::SUCCESS
}

unsafe extern "system" fn destroy_image(device: vk::Device, image: vk::Image, _: *const vk::AllocationCallbacks<'_>) {
    unsafe { dev(device) }.release(image);
}

unsafe extern "system" fn image_memory_requirements(
    _: vk::Device,
    _: vk::Image,
    p_req: *mut vk::MemoryRequirements,
) {
    unsafe {
        *p_req = vk::MemoryRequirements {
            size: IMAGE_BYTES,
            alignment: 1,
            memory_type_bits: u32::MAX,
        }
    };
}

unsafe extern "system" fn image_subresource_layout(
    _: vk::Device,
    _: vk::Image,
    _: *const vk::ImageSubresource,
    p_layout: *mut vk::SubresourceLayout,
) {
    unsafe {
        *p_layout = vk::SubresourceLayout {
            offset: 0,
            size: IMAGE_BYTES,
            row_pitch: ROW_PITCH,
            array_pitch: 0,
            depth_pitch: 0,
        }
    };
}

unsafe extern "system" fn allocate_memory(
    device: vk::Device,
    p_info: *const vk::MemoryAllocateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    p_memory: *mut vk::DeviceMemory,
) -> vk::Result {
    let d = unsafe { dev(device) };
    let bytes = vec![0u8; unsafe { (*p_info).allocation_size } as usize];
    let raw = bytes.as_ptr() as u64;
    d.allocations.lock().unwrap().insert(raw, bytes);
    d.live.fetch_add(1, Ordering::SeqCst);
    unsafe { *p_memory = vk::DeviceMemory::from_raw(raw) };
    vk::Result::SUCCESS
}

unsafe extern "system" fn free_memory(
    device: vk::Device,
    memory: vk::DeviceMemory,
    _: *const vk::AllocationCallbacks<'_>,
) {
    let d = unsafe { dev(device) };
    if d.allocations.lock().unwrap().remove(&memory.as_raw()).is_some() {
        d.release(memory);
    }
}

unsafe extern "system" fn bind_image_memory(
    _: vk::Device,
    _: vk::Image,
    _: vk::DeviceMemory,
    _: vk::DeviceSize,
) -> vk::Result {
    vk::Result::SUCCESS
}

unsafe extern "system" fn map_memory(
    _: vk::Device,
    memory: vk::DeviceMemory,
    _: vk::DeviceSize,
    _: vk::DeviceSize,
    _: vk::MemoryMapFlags,
    pp_data: *mut *mut c_void,
) -> vk::Result {
    // The allocation's buffer lives in the device's table until it is freed.
    unsafe { *pp_data = memory.as_raw() as *mut c_void };
    vk::Result::SUCCESS
}

unsafe extern "system" fn unmap_memory(_: vk::Device, _: vk::DeviceMemory) {}

unsafe extern "system" fn invalidate_ranges(
    _: vk::Device,
    _: u32,
    _: *const vk::MappedMemoryRange<'_>,
) -> vk::Result {
    vk::Result::SUCCESS
}

unsafe extern "system" fn create_command_pool(
    device: vk::Device,
    _: *const vk::CommandPoolCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    p_pool: *mut vk::CommandPool,
) -> vk::Result {
    unsafe { *p_pool = dev(device).create() };
    vk::Result::SUCCESS
}

unsafe extern "system" fn destroy_command_pool(
    device: vk::Device,
    pool: vk::CommandPool,
    _: *const vk::AllocationCallbacks<'_>,
) {
    unsafe { dev(device) }.release(pool);
}

unsafe extern "system" fn allocate_command_buffers(
    device: vk::Device,
    _: *const vk::CommandBufferAllocateInfo<'_>,
    p_buffers: *mut vk::CommandBuffer,
) -> vk::Result {
    let d = unsafe { dev(device) };
    // Dispatchable: needs a writable first word for the loader data.
    let raw = Box::into_raw(Box::new(0usize)) as u64;
    d.command_buffers.lock().unwrap().push(raw);
    d.live.fetch_add(1, Ordering::SeqCst);
    unsafe { *p_buffers = vk::CommandBuffer::from_raw(raw) };
    vk::Result::SUCCESS
}

unsafe extern "system" fn free_command_buffers(
    device: vk::Device,
    _: vk::CommandPool,
    count: u32,
    p_buffers: *const vk::CommandBuffer,
) {
    let d = unsafe { dev(device) };
    for &cb in unsafe { std::slice::from_raw_parts(p_buffers, count as usize) } {
        d.release(cb);
    }
}

unsafe extern "system" fn begin_command_buffer(
    _: vk::CommandBuffer,
    _: *const vk::CommandBufferBeginInfo<'_>,
) -> vk::Result {
    vk::Result::SUCCESS
}

unsafe extern "system" fn end_command_buffer(_: vk::CommandBuffer) -> vk::Result {
    vk::Result::SUCCESS
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn cmd_pipeline_barrier(
    _: vk::CommandBuffer,
    _: vk::PipelineStageFlags,
    _: vk::PipelineStageFlags,
    _: vk::DependencyFlags,
    _: u32,
    _: *const vk::MemoryBarrier<'_>,
    _: u32,
    _: *const vk::BufferMemoryBarrier<'_>,
    _: u32,
    _: *const vk::ImageMemoryBarrier<'_>,
) {
}

unsafe extern "system" fn cmd_copy_image(
    _: vk::CommandBuffer,
    _: vk::Image,
    _: vk::ImageLayout,
    _: vk::Image,
    _: vk::ImageLayout,
    _: u32,
    _: *const vk::ImageCopy,
) {
}

unsafe extern "system" fn create_fence(
    device: vk::Device,
    _: *const vk::FenceCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    p_fence: *mut vk::Fence,
) -> vk::Result {
    unsafe { *p_fence = dev(device).create() };
    vk::Result::SUCCESS
}

unsafe extern "system" fn destroy_fence(device: vk::Device, fence: vk::Fence, _: *const vk::AllocationCallbacks<'_>) {
    unsafe { dev(device) }.release(fence);
}

unsafe extern "system" fn wait_for_fences(
    device: vk::Device,
    count: u32,
    p_fences: *const vk::Fence,
    _: vk::Bool32,
    _: u64,
) -> vk::Result {
    let d = unsafe { dev(device) };
    for &f in unsafe { std::slice::from_raw_parts(p_fences, count as usize) } {
        d.record(Call::Wait(f));
    }
    vk::Result::SUCCESS
}

unsafe extern "system" fn reset_fences(device: vk::Device, count: u32, p_fences: *const vk::Fence) -> vk::Result {
    let d = unsafe { dev(device) };
    for &f in unsafe { std::slice::from_raw_parts(p_fences, count as usize) } {
        d.record(Call::Reset(f));
    }
    vk::Result::SUCCESS
}

unsafe extern "system" fn create_semaphore(
    device: vk::Device,
    _: *const vk::SemaphoreCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    p_semaphore: *mut vk::Semaphore,
) -> vk::Result {
    unsafe { *p_semaphore = dev(device).create() };
    vk::Result::SUCCESS
}

unsafe extern "system" fn destroy_semaphore(
    device: vk::Device,
    semaphore: vk::Semaphore,
    _: *const vk::AllocationCallbacks<'_>,
) {
    let d = unsafe { dev(device) };
    d.record(Call::DestroySemaphore(semaphore));
    d.release(semaphore);
}

unsafe extern "system" fn create_swapchain(
    _: vk::Device,
    _: *const vk::SwapchainCreateInfoKHR<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    _: *mut vk::SwapchainKHR,
) -> vk::Result {
    vk::Result::ERROR_FEATURE_NOT_PRESENT
}

unsafe extern "system" fn destroy_swapchain(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    _: *const vk::AllocationCallbacks<'_>,
) {
    unsafe { dev(device) }.record(Call::DestroySwapchain(swapchain));
}

unsafe extern "system" fn swapchain_images(
    _: vk::Device,
    _: vk::SwapchainKHR,
    p_count: *mut u32,
    p_images: *mut vk::Image,
) -> vk::Result {
    let images: Vec<_> = (0..SWAPCHAIN_IMAGES as u64).map(|i| vk::Image::from_raw(0xb000 + i)).collect();
    unsafe { crate::dispatch::write_out(&images, p_count, p_images) }
}

unsafe extern "system" fn acquire_next_image(
    _: vk::Device,
    _: vk::SwapchainKHR,
    _: u64,
    _: vk::Semaphore,
    _: vk::Fence,
    _: *mut u32,
) -> vk::Result {
    vk::Result::NOT_READY
}

unsafe extern "system" fn queue_present(_: vk::Queue, _: *const vk::PresentInfoKHR<'_>) -> vk::Result {
    vk::Result::SUCCESS
}

// Instance side: one discrete render GPU and one integrated display GPU,
// each with a single universal queue family.

unsafe extern "system" fn gipa(_: vk::Instance, name: *const c_char) -> vk::PFN_vkVoidFunction {
    let name = unsafe { CStr::from_ptr(name) }.to_bytes();
    table!(name, {
        b"vkDestroyInstance" => destroy_instance: vk::PFN_vkDestroyInstance,
        b"vkEnumeratePhysicalDevices" => enumerate_physical_devices: vk::PFN_vkEnumeratePhysicalDevices,
        b"vkGetPhysicalDeviceProperties" => physical_device_properties: vk::PFN_vkGetPhysicalDeviceProperties,
        b"vkGetPhysicalDeviceQueueFamilyProperties" => queue_family_properties: vk::PFN_vkGetPhysicalDeviceQueueFamilyProperties,
        b"vkGetPhysicalDeviceMemoryProperties" => memory_properties: vk::PFN_vkGetPhysicalDeviceMemoryProperties,
        b"vkEnumerateDeviceExtensionProperties" => device_extensions: vk::PFN_vkEnumerateDeviceExtensionProperties,
        b"vkGetPhysicalDeviceSurfaceCapabilitiesKHR" => surface_capabilities: vk::PFN_vkGetPhysicalDeviceSurfaceCapabilitiesKHR,
    })
}

unsafe extern "system" fn destroy_instance(_: vk::Instance, _: *const vk::AllocationCallbacks<'_>) {}

unsafe extern "system" fn enumerate_physical_devices(
    _: vk::Instance,
    p_count: *mut u32,
    p_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let gpus = [vk::PhysicalDevice::from_raw(RENDER_GPU), vk::PhysicalDevice::from_raw(DISPLAY_GPU)];
    unsafe { crate::dispatch::write_out(&gpus, p_count, p_devices) }
}

unsafe extern "system" fn physical_device_properties(
    pd: vk::PhysicalDevice,
    p_props: *mut vk::PhysicalDeviceProperties,
) {
    let (vendor_id, device_type) = if pd.as_raw() == RENDER_GPU {
        (0x10de, vk::PhysicalDeviceType::DISCRETE_GPU)
    } else {
        (0x8086, vk::PhysicalDeviceType::INTEGRATED_GPU)
    };
    unsafe {
        *p_props = vk::PhysicalDeviceProperties {
            vendor_id,
            device_id: 1,
            device_type,
            ..Default::default()
        }
    };
}

unsafe extern "system" fn queue_family_properties(
    _: vk::PhysicalDevice,
    p_count: *mut u32,
    p_props: *mut vk::QueueFamilyProperties,
) {
    let family = vk::QueueFamilyProperties {
        queue_flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        queue_count: 1,
        ..Default::default()
    };
    let _ = unsafe { crate::dispatch::write_out(&[family], p_count, p_props) };
}

unsafe extern "system" fn memory_properties(
    _: vk::PhysicalDevice,
    p_props: *mut vk::PhysicalDeviceMemoryProperties,
) {
    unsafe { *p_props = memory(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]) };
}

unsafe extern "system" fn device_extensions(
    _: vk::PhysicalDevice,
    _: *const c_char,
    p_count: *mut u32,
    _: *mut vk::ExtensionProperties,
) -> vk::Result {
    unsafe { *p_count = 0 };
    vk::Result::SUCCESS
}

unsafe extern "system" fn surface_capabilities(
    _: vk::PhysicalDevice,
    _: vk::SurfaceKHR,
    p_caps: *mut vk::SurfaceCapabilitiesKHR,
) -> vk::Result {
    unsafe {
        *p_caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: SURFACE_MIN_IMAGES,
            max_image_count: 8,
            current_extent: EXTENT,
            ..Default::default()
        }
    };
    vk::Result::SUCCESS
}

unsafe extern "system" fn layer_create_device(
    _: vk::Instance,
    _: vk::PhysicalDevice,
    _: *const vk::DeviceCreateInfo<'_>,
    _: *const vk::AllocationCallbacks<'_>,
    _: *mut vk::Device,
    _: vk::PFN_vkGetInstanceProcAddr,
    _: *mut Option<vk::PFN_vkGetDeviceProcAddr>,
) -> vk::Result {
    vk::Result::ERROR_INITIALIZATION_FAILED
}

unsafe extern "system" fn layer_destroy_device(
    _: vk::Device,
    _: *const vk::AllocationCallbacks<'_>,
    _: vk::PFN_vkDestroyDevice,
) {
}

pub fn memory(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
    let mut props = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: types.len() as u32,
        ..Default::default()
    };
    for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
        slot.property_flags = flags;
    }
    props
}

/// Render-side memory: VRAM plus cached system memory.
pub fn render_memory() -> vk::PhysicalDeviceMemoryProperties {
    type F = vk::MemoryPropertyFlags;
    memory(&[F::DEVICE_LOCAL, F::HOST_VISIBLE | F::HOST_CACHED])
}

/// Display-side memory: VRAM plus coherent system memory.
pub fn display_memory() -> vk::PhysicalDeviceMemoryProperties {
    type F = vk::MemoryPropertyFlags;
    memory(&[F::DEVICE_LOCAL, F::HOST_VISIBLE | F::HOST_COHERENT])
}

/// A render/display device pair on top of two [`FakeDevice`]s.
pub struct Rig {
    pub render: Arc<DeviceContext>,
    pub display: Arc<DeviceContext>,
    pub render_memory: vk::PhysicalDeviceMemoryProperties,
    pub display_memory: vk::PhysicalDeviceMemoryProperties,
    // Declared last: contexts and everything built from them go first.
    pub render_dev: Box<FakeDevice>,
    pub display_dev: Box<FakeDevice>,
}

impl Rig {
    pub fn new() -> Self {
        let render_dev = FakeDevice::new();
        let display_dev = FakeDevice::new();

        let instance = unsafe {
            let dispatch = InstanceDispatch::load(vk::Instance::from_raw(0x1), gipa, None).unwrap();
            InstanceContext::new(
                dispatch,
                (
                    layer_create_device as PfnLayerCreateDevice,
                    layer_destroy_device as PfnLayerDestroyDevice,
                ),
                &LayerConfig::default(),
            )
            .unwrap()
        };
        let instance = Arc::new(instance);

        let context = |fake: &FakeDevice, role| {
            let dispatch = Arc::new(unsafe { DeviceDispatch::load(fake.handle(), gdpa, None) }.unwrap());
            let queue = unsafe { dispatch.queue(0, 0) }.unwrap();
            Arc::new(DeviceContext::new(dispatch, instance.clone(), role, 0, queue, None))
        };
        Rig {
            render: context(&render_dev, Role::Render),
            display: context(&display_dev, Role::Display),
            render_memory: render_memory(),
            display_memory: display_memory(),
            render_dev,
            display_dev,
        }
    }

    pub fn devices(&self) -> Devices {
        Devices {
            render: self.render.clone(),
            display: self.display.clone(),
            render_memory: self.render_memory,
            display_memory: self.display_memory,
        }
    }
}
