// SPDX-License-Identifier: CEPL-1.0
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use crate::dispatch::DeviceDispatch;

/// Upper bound for every fence wait the layer does itself.
pub const FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Fence owned by the layer, destroyed on drop.
pub struct Fence {
    device: Arc<DeviceDispatch>,
    pub handle: vk::Fence,
}

impl Fence {
    pub fn new(device: &Arc<DeviceDispatch>) -> VkResult<Self> {
        let handle = unsafe { device.create_fence() }?;
        Ok(Self { device: device.clone(), handle })
    }

    pub fn wait(&self) -> VkResult<()> {
        unsafe { self.device.wait_for_fence(self.handle, FENCE_TIMEOUT_NS) }
    }

    pub fn reset(&self) -> VkResult<()> {
        unsafe { self.device.reset_fence(self.handle) }
    }

    pub fn wait_and_reset(&self) -> VkResult<()> {
        self.wait()?;
        self.reset()
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.destroy_fence(self.handle) }
    }
}

pub struct Semaphore {
    device: Arc<DeviceDispatch>,
    pub handle: vk::Semaphore,
}

impl Semaphore {
    pub fn new(device: &Arc<DeviceDispatch>) -> VkResult<Self> {
        let handle = unsafe { device.create_semaphore() }?;
        Ok(Self { device: device.clone(), handle })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.destroy_semaphore(self.handle) }
    }
}
