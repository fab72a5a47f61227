// SPDX-License-Identifier: CEPL-1.0
use std::sync::{Mutex, MutexGuard};

use ash::vk;
use primus_core::{DeviceId, LayerConfig, WorkerThreads};
use tracing::{debug, error, info};

use crate::dispatch::InstanceDispatch;
use crate::error::LayerError;
use crate::loader::{PfnLayerCreateDevice, PfnLayerDestroyDevice};

pub const REQUIRED_QUEUE_FLAGS: vk::QueueFlags = vk::QueueFlags::from_raw(
    vk::QueueFlags::GRAPHICS.as_raw() | vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
);

/// Which half of the pair a physical device plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Render,
    Display,
}

impl Role {
    fn default_type(self) -> vk::PhysicalDeviceType {
        match self {
            Role::Render => vk::PhysicalDeviceType::DISCRETE_GPU,
            Role::Display => vk::PhysicalDeviceType::INTEGRATED_GPU,
        }
    }

    fn missing(self) -> LayerError {
        match self {
            Role::Render => LayerError::NoRenderDevice,
            Role::Display => LayerError::NoDisplayDevice,
        }
    }
}

/// Index of the first device that fits `role`.
///
/// A pinned id with a non-zero vendor wins over the device type heuristic.
pub fn pick_device(
    props: &[vk::PhysicalDeviceProperties],
    pinned: Option<DeviceId>,
    role: Role,
) -> Result<usize, LayerError> {
    props
        .iter()
        .position(|p| match pinned {
            Some(id) if id.vendor != 0 => id.matches(p.vendor_id, p.device_id),
            _ => p.device_type == role.default_type(),
        })
        .ok_or_else(|| role.missing())
}

/// First family supporting graphics, compute and transfer.
pub fn find_queue_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|f| f.queue_flags.contains(REQUIRED_QUEUE_FLAGS))
        .map(|i| i as u32)
}

pub fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    props
        .device_name_as_c_str()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "<unnamed>".into())
}

#[derive(Clone, Copy, Debug)]
pub struct PhysicalSide {
    pub handle: vk::PhysicalDevice,
    pub queue_family: u32,
}

pub struct InstanceContext {
    pub dispatch: InstanceDispatch,
    pub render: PhysicalSide,
    pub display: PhysicalSide,
    pub create_device: PfnLayerCreateDevice,
    pub destroy_device: PfnLayerDestroyDevice,
    pub worker_threads: WorkerThreads,
    // One queue object is shared between the application and the swapchain workers.
    render_queue: Mutex<()>,
}

impl InstanceContext {
    /// Pick the render/display pair behind a freshly created instance.
    ///
    /// # Safety
    /// `dispatch` must belong to a live instance.
    pub unsafe fn new(
        dispatch: InstanceDispatch,
        (create_device, destroy_device): (PfnLayerCreateDevice, PfnLayerDestroyDevice),
        config: &LayerConfig,
    ) -> Result<Self, LayerError> {
        let devices = unsafe { dispatch.enumerate_physical_devices() }
            .map_err(LayerError::vulkan("vkEnumeratePhysicalDevices"))?;
        let props: Vec<_> = devices
            .iter()
            .map(|&pd| unsafe { dispatch.physical_device_properties(pd) })
            .collect();
        for p in &props {
            debug!(
                name = %device_name(p),
                kind = ?p.device_type,
                "found {:04x}:{:04x}",
                p.vendor_id,
                p.device_id
            );
        }

        let pick = |pinned, role| {
            pick_device(&props, pinned, role).map_err(|e| {
                error!("{e}");
                if let Ok(icds) = std::env::var("VK_ICD_FILENAMES") {
                    error!("VK_ICD_FILENAMES={icds}");
                }
                e
            })
        };
        let display = pick(config.display_id, Role::Display)?;
        let render = pick(config.render_id, Role::Render)?;
        for (role, i) in [(Role::Display, display), (Role::Render, render)] {
            let p = &props[i];
            info!(
                ?role,
                kind = ?p.device_type,
                "{} ({:04x}:{:04x})",
                device_name(p),
                p.vendor_id,
                p.device_id
            );
        }

        let side = |i: usize| -> Result<PhysicalSide, LayerError> {
            let handle = devices[i];
            let families = unsafe { dispatch.queue_family_properties(handle) };
            let queue_family =
                find_queue_family(&families).ok_or(LayerError::NoQueueFamily(handle))?;
            Ok(PhysicalSide { handle, queue_family })
        };
        let display = side(display)?;
        let render = side(render)?;

        Ok(Self {
            dispatch,
            render,
            display,
            create_device,
            destroy_device,
            worker_threads: config.worker_threads,
            render_queue: Mutex::new(()),
        })
    }

    /// Serializes every submission to the render queue.
    pub fn lock_render_queue(&self) -> MutexGuard<'_, ()> {
        self.render_queue.lock().unwrap_or_else(|e| e.into_inner())
    }
}
