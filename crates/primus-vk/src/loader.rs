// SPDX-License-Identifier: CEPL-1.0
//! Loader/layer interface structures (`vk_layer.h`) and the walk over a
//! create-info `pNext` chain that finds them.

use std::ffi::{c_char, c_void};

use ash::vk::{self, Handle};

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);

pub const LAYER_NEGOTIATE_INTERFACE_STRUCT: u32 = 1;
pub const CURRENT_LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

// `VkLayerFunction`
pub const LAYER_LINK_INFO: u32 = 0;
pub const LOADER_DATA_CALLBACK: u32 = 1;
pub const LOADER_LAYER_CREATE_DEVICE_CALLBACK: u32 = 2;

pub type PfnGetPhysicalDeviceProcAddr =
    unsafe extern "system" fn(vk::Instance, *const c_char) -> vk::PFN_vkVoidFunction;

pub type PfnSetDeviceLoaderData = unsafe extern "system" fn(vk::Device, *mut c_void) -> vk::Result;

pub type PfnLayerCreateDevice = unsafe extern "system" fn(
    vk::Instance,
    vk::PhysicalDevice,
    *const vk::DeviceCreateInfo,
    *const vk::AllocationCallbacks,
    *mut vk::Device,
    vk::PFN_vkGetInstanceProcAddr,
    *mut Option<vk::PFN_vkGetDeviceProcAddr>,
) -> vk::Result;

pub type PfnLayerDestroyDevice =
    unsafe extern "system" fn(vk::Device, *const vk::AllocationCallbacks, vk::PFN_vkDestroyDevice);

#[repr(C)]
pub struct LayerInstanceLink {
    pub p_next: *mut LayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LayerDeviceCallbacks {
    pub pfn_layer_create_device: Option<PfnLayerCreateDevice>,
    pub pfn_layer_destroy_device: Option<PfnLayerDestroyDevice>,
}

#[repr(C)]
pub union LayerInstanceInfo {
    pub p_layer_info: *mut LayerInstanceLink,
    pub pfn_set_instance_loader_data: *const c_void,
    pub layer_device: LayerDeviceCallbacks,
    pub loader_features: u32,
}

#[repr(C)]
pub struct LayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u: LayerInstanceInfo,
}

#[repr(C)]
pub struct LayerDeviceLink {
    pub p_next: *mut LayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub union LayerDeviceInfo {
    pub p_layer_info: *mut LayerDeviceLink,
    pub pfn_set_device_loader_data: Option<PfnSetDeviceLoaderData>,
}

#[repr(C)]
pub struct LayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u: LayerDeviceInfo,
}

#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<PfnGetPhysicalDeviceProcAddr>,
}

/// Identity of a dispatchable object: the loader's dispatch-table pointer
/// stored in the first machine word behind the handle.
///
/// Every object that shares a dispatch table (a device, its queues and its
/// command buffers; an instance and its physical devices) yields the same key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatchKey(usize);

impl DispatchKey {
    /// # Safety
    /// `handle` must be a live, non-null dispatchable handle created by the loader.
    pub unsafe fn of<H: Handle>(handle: H) -> Self {
        let raw = handle.as_raw() as usize as *const usize;
        debug_assert!(!raw.is_null());
        // SAFETY: dispatchable handles point at an object whose first word is
        // the loader dispatch pointer.
        DispatchKey(unsafe { raw.read() })
    }

    /// Copy `parent`'s loader dispatch word into `child`.
    ///
    /// # Safety
    /// Both must be live dispatchable handles; `child` must not yet have been
    /// handed to the loader.
    pub unsafe fn inherit<P: Handle, C: Handle>(parent: P, child: C) {
        let key = unsafe { Self::of(parent) };
        let slot = child.as_raw() as usize as *mut usize;
        // SAFETY: see above, the first word of `child` is the dispatch slot.
        unsafe { slot.write(key.0) };
    }
}

/// Everything a layer needs out of `VkInstanceCreateInfo::pNext`.
pub struct InstanceChain {
    pub link: *mut LayerInstanceCreateInfo,
    pub device_callbacks: Option<(PfnLayerCreateDevice, PfnLayerDestroyDevice)>,
}

impl InstanceChain {
    /// # Safety
    /// `p_next` must be a valid, loader-provided `pNext` chain.
    pub unsafe fn find(mut p_next: *const c_void) -> Option<Self> {
        let mut link: *mut LayerInstanceCreateInfo = std::ptr::null_mut();
        let mut device_callbacks = None;
        while !p_next.is_null() {
            let base = unsafe { &*(p_next as *const vk::BaseInStructure) };
            if base.s_type == LOADER_INSTANCE_CREATE_INFO {
                let info = p_next as *mut LayerInstanceCreateInfo;
                match unsafe { (*info).function } {
                    LAYER_LINK_INFO if link.is_null() => link = info,
                    LOADER_LAYER_CREATE_DEVICE_CALLBACK => {
                        let cb = unsafe { (*info).u.layer_device };
                        if let (Some(create), Some(destroy)) =
                            (cb.pfn_layer_create_device, cb.pfn_layer_destroy_device)
                        {
                            device_callbacks = Some((create, destroy));
                        }
                    }
                    _ => {}
                }
            }
            p_next = base.p_next as *const c_void;
        }
        if link.is_null() {
            return None;
        }
        Some(InstanceChain { link, device_callbacks })
    }

    /// Read the next link's resolvers and advance the chain for the layer below.
    ///
    /// # Safety
    /// Must be called exactly once, before forwarding `vkCreateInstance`.
    pub unsafe fn take_next(
        &self,
    ) -> (vk::PFN_vkGetInstanceProcAddr, Option<PfnGetPhysicalDeviceProcAddr>) {
        unsafe {
            let layer = (*self.link).u.p_layer_info;
            let gipa = (*layer).pfn_next_get_instance_proc_addr;
            let gpdpa = (*layer).pfn_next_get_physical_device_proc_addr;
            (*self.link).u.p_layer_info = (*layer).p_next;
            (gipa, gpdpa)
        }
    }
}

/// Everything a layer needs out of `VkDeviceCreateInfo::pNext`.
pub struct DeviceChain {
    pub link: *mut LayerDeviceCreateInfo,
    pub set_loader_data: Option<PfnSetDeviceLoaderData>,
}

impl DeviceChain {
    /// # Safety
    /// `p_next` must be a valid, loader-provided `pNext` chain.
    pub unsafe fn find(mut p_next: *const c_void) -> Option<Self> {
        let mut link: *mut LayerDeviceCreateInfo = std::ptr::null_mut();
        let mut set_loader_data = None;
        while !p_next.is_null() {
            let base = unsafe { &*(p_next as *const vk::BaseInStructure) };
            if base.s_type == LOADER_DEVICE_CREATE_INFO {
                let info = p_next as *mut LayerDeviceCreateInfo;
                match unsafe { (*info).function } {
                    LAYER_LINK_INFO if link.is_null() => link = info,
                    LOADER_DATA_CALLBACK => {
                        set_loader_data = unsafe { (*info).u.pfn_set_device_loader_data };
                    }
                    _ => {}
                }
            }
            p_next = base.p_next as *const c_void;
        }
        if link.is_null() {
            return None;
        }
        Some(DeviceChain { link, set_loader_data })
    }

    /// # Safety
    /// Must be called exactly once, before forwarding `vkCreateDevice`.
    pub unsafe fn take_next(&self) -> (vk::PFN_vkGetInstanceProcAddr, vk::PFN_vkGetDeviceProcAddr) {
        unsafe {
            let layer = (*self.link).u.p_layer_info;
            let gipa = (*layer).pfn_next_get_instance_proc_addr;
            let gdpa = (*layer).pfn_next_get_device_proc_addr;
            (*self.link).u.p_layer_info = (*layer).p_next;
            (gipa, gdpa)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "system" fn fake_gipa(_: vk::Instance, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn other_gipa(_: vk::Instance, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    #[test]
    fn key_reads_first_word() {
        let dispatch_word: usize = 0xdead_beef;
        let device = vk::Device::from_raw(&dispatch_word as *const usize as u64);
        let key = unsafe { DispatchKey::of(device) };
        assert_eq!(key, DispatchKey(0xdead_beef));
    }

    #[test]
    fn children_share_parent_key() {
        let device_word: usize = 0x1000;
        let mut queue_word: usize = 0;
        let device = vk::Device::from_raw(&device_word as *const usize as u64);
        let queue = vk::Queue::from_raw(&mut queue_word as *mut usize as u64);
        unsafe { DispatchKey::inherit(device, queue) };
        assert_eq!(unsafe { DispatchKey::of(queue) }, unsafe { DispatchKey::of(device) });

        let unrelated_word: usize = 0x2000;
        let unrelated = vk::Device::from_raw(&unrelated_word as *const usize as u64);
        assert_ne!(unsafe { DispatchKey::of(unrelated) }, unsafe { DispatchKey::of(device) });
    }

    #[test]
    fn instance_chain_is_found_and_advanced() {
        let mut second = LayerInstanceLink {
            p_next: std::ptr::null_mut(),
            pfn_next_get_instance_proc_addr: other_gipa,
            pfn_next_get_physical_device_proc_addr: None,
        };
        let mut first = LayerInstanceLink {
            p_next: std::ptr::addr_of_mut!(second),
            pfn_next_get_instance_proc_addr: fake_gipa,
            pfn_next_get_physical_device_proc_addr: None,
        };
        let second_ptr = std::ptr::addr_of_mut!(second);
        let mut link_info = LayerInstanceCreateInfo {
            s_type: LOADER_INSTANCE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LAYER_LINK_INFO,
            u: LayerInstanceInfo { p_layer_info: &mut first },
        };
        let unrelated = vk::ValidationFeaturesEXT {
            p_next: std::ptr::addr_of_mut!(link_info) as *const c_void,
            ..Default::default()
        };

        let chain = unsafe { InstanceChain::find(&unrelated as *const _ as *const c_void) }
            .expect("link info present");
        assert!(chain.device_callbacks.is_none());
        let (gipa, gpdpa) = unsafe { chain.take_next() };
        assert_eq!(gipa as usize, fake_gipa as vk::PFN_vkGetInstanceProcAddr as usize);
        assert!(gpdpa.is_none());
        assert_eq!(unsafe { link_info.u.p_layer_info }, second_ptr);
    }

    unsafe extern "system" fn fake_gdpa(_: vk::Device, _: *const c_char) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn fake_set_loader_data(_: vk::Device, _: *mut c_void) -> vk::Result {
        vk::Result::SUCCESS
    }

    #[test]
    fn device_chain_collects_link_and_loader_data() {
        let mut link = LayerDeviceLink {
            p_next: std::ptr::null_mut(),
            pfn_next_get_instance_proc_addr: fake_gipa,
            pfn_next_get_device_proc_addr: fake_gdpa,
        };
        let mut link_info = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: std::ptr::null(),
            function: LAYER_LINK_INFO,
            u: LayerDeviceInfo { p_layer_info: &mut link },
        };
        let loader_data = LayerDeviceCreateInfo {
            s_type: LOADER_DEVICE_CREATE_INFO,
            p_next: std::ptr::addr_of_mut!(link_info) as *const c_void,
            function: LOADER_DATA_CALLBACK,
            u: LayerDeviceInfo { pfn_set_device_loader_data: Some(fake_set_loader_data) },
        };

        let chain = unsafe { DeviceChain::find(&loader_data as *const _ as *const c_void) }
            .expect("link info present");
        assert_eq!(chain.link, std::ptr::addr_of_mut!(link_info));
        assert_eq!(
            chain.set_loader_data.map(|f| f as usize),
            Some(fake_set_loader_data as PfnSetDeviceLoaderData as usize)
        );
        let (gipa, gdpa) = unsafe { chain.take_next() };
        assert_eq!(gipa as usize, fake_gipa as vk::PFN_vkGetInstanceProcAddr as usize);
        assert_eq!(gdpa as usize, fake_gdpa as vk::PFN_vkGetDeviceProcAddr as usize);
        assert!(unsafe { link_info.u.p_layer_info }.is_null());
    }

    #[test]
    fn missing_link_is_reported() {
        let unrelated = vk::ValidationFeaturesEXT::default();
        assert!(unsafe { InstanceChain::find(&unrelated as *const _ as *const c_void) }.is_none());
        assert!(unsafe { DeviceChain::find(std::ptr::null()) }.is_none());
    }
}
