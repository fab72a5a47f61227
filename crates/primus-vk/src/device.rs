// SPDX-License-Identifier: CEPL-1.0
use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;

use crate::dispatch::DeviceDispatch;
use crate::instance::{InstanceContext, Role};
use crate::pairing::DevicePairing;

/// What the background pairing task hands to the first swapchain.
pub struct DisplayPair {
    pub display: Arc<DeviceContext>,
    pub render_memory: vk::PhysicalDeviceMemoryProperties,
    pub display_memory: vk::PhysicalDeviceMemoryProperties,
}

pub type Pairing = DevicePairing<DisplayPair>;

/// A logical device seen by the layer: either one the application created
/// on the render GPU, or its shadow on the display GPU.
pub struct DeviceContext {
    pub dispatch: Arc<DeviceDispatch>,
    pub instance: Arc<InstanceContext>,
    pub role: Role,
    /// Family and queue the layer itself submits to.
    pub queue_family: u32,
    pub queue: vk::Queue,
    /// Present on render devices only.
    pub pairing: Option<Arc<Pairing>>,
    display_queue: Mutex<()>,
}

impl DeviceContext {
    pub fn new(
        dispatch: Arc<DeviceDispatch>,
        instance: Arc<InstanceContext>,
        role: Role,
        queue_family: u32,
        queue: vk::Queue,
        pairing: Option<Arc<Pairing>>,
    ) -> Self {
        Self {
            dispatch,
            instance,
            role,
            queue_family,
            queue,
            pairing,
            display_queue: Mutex::new(()),
        }
    }

    /// Every queue of a render device shares the instance-wide render queue
    /// lock; the display device only has the layer's own queue.
    pub fn lock_queue(&self) -> MutexGuard<'_, ()> {
        match self.role {
            Role::Render => self.instance.lock_render_queue(),
            Role::Display => self.display_queue.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Queue family for the layer's render-side submissions: the instance's
/// preferred family if the application asked for it, else the first family
/// it asked for.
pub fn pick_render_family(requested: &[u32], preferred: u32) -> Option<u32> {
    if requested.contains(&preferred) {
        Some(preferred)
    } else {
        requested.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_family_follows_application_request() {
        assert_eq!(pick_render_family(&[2, 0], 0), Some(0));
        assert_eq!(pick_render_family(&[2, 1], 0), Some(2));
        assert_eq!(pick_render_family(&[], 0), None);
    }
}
