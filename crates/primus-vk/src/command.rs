// SPDX-License-Identifier: CEPL-1.0
//! Prerecorded command buffers: record once, resubmit every frame.

use std::ptr;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;

use crate::dispatch::DeviceDispatch;

pub const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

const COLOR_LAYER: vk::ImageSubresourceLayers = vk::ImageSubresourceLayers {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    mip_level: 0,
    base_array_layer: 0,
    layer_count: 1,
};

/// One image layout transition, as (before, after) pairs.
#[derive(Clone, Copy, Debug)]
pub struct Transition {
    pub access: (vk::AccessFlags, vk::AccessFlags),
    pub layout: (vk::ImageLayout, vk::ImageLayout),
    pub stage: (vk::PipelineStageFlags, vk::PipelineStageFlags),
}

/// A pool with a single primary buffer, left in the recording state by
/// [`CommandBuffer::begin`].
pub struct CommandBuffer {
    device: Arc<DeviceDispatch>,
    pool: vk::CommandPool,
    pub handle: vk::CommandBuffer,
}

impl CommandBuffer {
    pub fn begin(device: &Arc<DeviceDispatch>, queue_family: u32) -> VkResult<Self> {
        let d = device.handle;
        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            flags: vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            queue_family_index: queue_family,
            ..Default::default()
        };
        let mut pool = vk::CommandPool::null();
        unsafe { (device.fp.create_command_pool)(d, &pool_info, ptr::null(), &mut pool) }.result()?;
        let mut cmd = Self {
            device: device.clone(),
            pool,
            handle: vk::CommandBuffer::null(),
        };

        let alloc_info = vk::CommandBufferAllocateInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        unsafe { (device.fp.allocate_command_buffers)(d, &alloc_info, &mut cmd.handle) }.result()?;
        unsafe { device.adopt(cmd.handle) }?;

        let begin_info = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        unsafe { (device.fp.begin_command_buffer)(cmd.handle, &begin_info) }.result()?;
        Ok(cmd)
    }

    pub fn image_barrier(&self, image: vk::Image, t: Transition) {
        let barrier = vk::ImageMemoryBarrier {
            s_type: vk::StructureType::IMAGE_MEMORY_BARRIER,
            src_access_mask: t.access.0,
            dst_access_mask: t.access.1,
            old_layout: t.layout.0,
            new_layout: t.layout.1,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image,
            subresource_range: COLOR_RANGE,
            ..Default::default()
        };
        unsafe {
            (self.device.fp.cmd_pipeline_barrier)(
                self.handle,
                t.stage.0,
                t.stage.1,
                vk::DependencyFlags::empty(),
                0,
                ptr::null(),
                0,
                ptr::null(),
                1,
                &barrier,
            )
        }
    }

    /// Whole-extent copy; `src` must be in TRANSFER_SRC, `dst` in TRANSFER_DST.
    pub fn copy_image(&self, src: vk::Image, dst: vk::Image, extent: vk::Extent2D) {
        let region = vk::ImageCopy {
            src_subresource: COLOR_LAYER,
            src_offset: vk::Offset3D::default(),
            dst_subresource: COLOR_LAYER,
            dst_offset: vk::Offset3D::default(),
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
        };
        unsafe {
            (self.device.fp.cmd_copy_image)(
                self.handle,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                1,
                &region,
            )
        }
    }

    pub fn end(&self) -> VkResult<()> {
        unsafe { (self.device.fp.end_command_buffer)(self.handle) }.result()
    }

    /// Caller serializes access to `queue`.
    pub fn submit(
        &self,
        queue: vk::Queue,
        fence: vk::Fence,
        wait: &[vk::Semaphore],
        signal: &[vk::Semaphore],
    ) -> VkResult<()> {
        let stages = vec![vk::PipelineStageFlags::TRANSFER; wait.len()];
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            wait_semaphore_count: wait.len() as u32,
            p_wait_semaphores: wait.as_ptr(),
            p_wait_dst_stage_mask: stages.as_ptr(),
            command_buffer_count: 1,
            p_command_buffers: &self.handle,
            signal_semaphore_count: signal.len() as u32,
            p_signal_semaphores: signal.as_ptr(),
            ..Default::default()
        };
        unsafe { self.device.queue_submit(queue, std::slice::from_ref(&submit), fence) }
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        let d = self.device.handle;
        unsafe {
            if self.handle != vk::CommandBuffer::null() {
                (self.device.fp.free_command_buffers)(d, self.pool, 1, &self.handle);
            }
            (self.device.fp.destroy_command_pool)(d, self.pool, ptr::null());
        }
    }
}
