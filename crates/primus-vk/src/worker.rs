// SPDX-License-Identifier: CEPL-1.0
//! One image slot of a swapchain: the render target handed to the
//! application, two linear staging images and the prerecorded commands that
//! move a frame between them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use tracing::{trace, warn};

use crate::command::{CommandBuffer, Transition};
use crate::device::DeviceContext;
use crate::memory::{check_layouts, copy_rows, ImageDesc, ImageRole, PipelineImage, RowLayout};
use crate::sync::{Fence, Semaphore};

type A = vk::AccessFlags;
type L = vk::ImageLayout;
type S = vk::PipelineStageFlags;

const fn t(access: (A, A), layout: (L, L), stage: (S, S)) -> Transition {
    Transition { access, layout, stage }
}

// Render device: render target -> render copy.
const RC_COPY_TO_DST: Transition = t(
    (A::HOST_READ, A::TRANSFER_WRITE),
    (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
    (S::HOST, S::TRANSFER),
);
const RC_TARGET_TO_SRC: Transition = t(
    (A::MEMORY_READ, A::TRANSFER_READ),
    (L::PRESENT_SRC_KHR, L::TRANSFER_SRC_OPTIMAL),
    (S::TRANSFER, S::TRANSFER),
);
const RC_COPY_TO_HOST: Transition = t(
    (A::TRANSFER_WRITE, A::HOST_READ),
    (L::TRANSFER_DST_OPTIMAL, L::GENERAL),
    (S::TRANSFER, S::HOST),
);
const RC_TARGET_BACK: Transition = t(
    (A::TRANSFER_READ, A::MEMORY_READ),
    (L::TRANSFER_SRC_OPTIMAL, L::PRESENT_SRC_KHR),
    (S::TRANSFER, S::TRANSFER),
);

// Display device: display copy -> backend image.
const DC_INITIAL: Transition = t(
    (A::empty(), A::MEMORY_WRITE),
    (L::UNDEFINED, L::GENERAL),
    (S::TRANSFER, S::TRANSFER),
);
const DC_COPY_TO_SRC: Transition = t(
    (A::HOST_WRITE, A::TRANSFER_READ),
    (L::GENERAL, L::TRANSFER_SRC_OPTIMAL),
    (S::HOST, S::TRANSFER),
);
const DC_BACKEND_TO_DST: Transition = t(
    (A::MEMORY_READ, A::TRANSFER_WRITE),
    (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL),
    (S::TRANSFER, S::TRANSFER),
);
const DC_COPY_BACK: Transition = t(
    (A::TRANSFER_READ, A::HOST_WRITE),
    (L::TRANSFER_SRC_OPTIMAL, L::GENERAL),
    (S::TRANSFER, S::HOST),
);
const DC_BACKEND_TO_PRESENT: Transition = t(
    (A::TRANSFER_WRITE, A::MEMORY_READ),
    (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR),
    (S::TRANSFER, S::TRANSFER),
);

/// The two devices a swapchain spans, with the memory tables used to place
/// its images.
pub struct Devices {
    pub render: Arc<DeviceContext>,
    pub display: Arc<DeviceContext>,
    pub render_memory: vk::PhysicalDeviceMemoryProperties,
    pub display_memory: vk::PhysicalDeviceMemoryProperties,
}

#[derive(Clone, Copy, Debug)]
pub struct SlotDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    /// Usage the application asked for on its swapchain images.
    pub usage: vk::ImageUsageFlags,
}

pub struct ImageWorker {
    // Field order is drop order: commands, then sync objects, then images.
    render_copy_cmd: CommandBuffer,
    display_cmd: CommandBuffer,
    copy_fence: Fence,
    copy_pending: AtomicBool,
    display_fence: Fence,
    display_pending: AtomicBool,
    present_semaphore: Semaphore,
    render_layout: RowLayout,
    display_layout: RowLayout,
    render_target: PipelineImage,
    render_copy: PipelineImage,
    display_copy: PipelineImage,
}

impl ImageWorker {
    pub fn new(devices: &Devices, backend_image: vk::Image, desc: SlotDesc) -> Result<Self> {
        let render = &devices.render.dispatch;
        let display = &devices.display.dispatch;
        let image = |tiling, usage| ImageDesc {
            extent: desc.extent,
            format: desc.format,
            tiling,
            usage,
        };

        let render_target = PipelineImage::new(
            render,
            &devices.render_memory,
            image(
                vk::ImageTiling::OPTIMAL,
                desc.usage | vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            ),
            ImageRole::RenderTarget,
        )?;
        let mut render_copy = PipelineImage::new(
            render,
            &devices.render_memory,
            image(vk::ImageTiling::LINEAR, vk::ImageUsageFlags::TRANSFER_DST),
            ImageRole::RenderCopy,
        )?;
        let mut display_copy = PipelineImage::new(
            display,
            &devices.display_memory,
            image(vk::ImageTiling::LINEAR, vk::ImageUsageFlags::TRANSFER_SRC),
            ImageRole::Display,
        )?;
        render_copy.map().context("mapping render copy")?;
        display_copy.map().context("mapping display copy")?;

        let render_layout = render_copy.layout();
        let display_layout = display_copy.layout();
        check_layouts(render_layout, display_layout)?;
        trace!(?render_layout, ?display_layout, "staging layouts");

        // One-time baseline layout for the display copy.
        {
            let cmd = CommandBuffer::begin(display, devices.display.queue_family)
                .context("display transition command")?;
            cmd.image_barrier(display_copy.image, DC_INITIAL);
            cmd.end()?;
            let fence = Fence::new(display)?;
            {
                let _queue = devices.display.lock_queue();
                cmd.submit(devices.display.queue, fence.handle, &[], &[])
                    .context("submitting display transition")?;
            }
            fence.wait().context("waiting for display transition")?;
        }

        let render_copy_cmd = CommandBuffer::begin(render, devices.render.queue_family)
            .context("render copy command")?;
        render_copy_cmd.image_barrier(render_copy.image, RC_COPY_TO_DST);
        render_copy_cmd.image_barrier(render_target.image, RC_TARGET_TO_SRC);
        render_copy_cmd.copy_image(render_target.image, render_copy.image, desc.extent);
        render_copy_cmd.image_barrier(render_copy.image, RC_COPY_TO_HOST);
        render_copy_cmd.image_barrier(render_target.image, RC_TARGET_BACK);
        render_copy_cmd.end()?;

        let display_cmd = CommandBuffer::begin(display, devices.display.queue_family)
            .context("display command")?;
        display_cmd.image_barrier(display_copy.image, DC_COPY_TO_SRC);
        display_cmd.image_barrier(backend_image, DC_BACKEND_TO_DST);
        display_cmd.copy_image(display_copy.image, backend_image, desc.extent);
        display_cmd.image_barrier(display_copy.image, DC_COPY_BACK);
        display_cmd.image_barrier(backend_image, DC_BACKEND_TO_PRESENT);
        display_cmd.end()?;

        Ok(Self {
            render_copy_cmd,
            display_cmd,
            copy_fence: Fence::new(render)?,
            copy_pending: AtomicBool::new(false),
            display_fence: Fence::new(display)?,
            display_pending: AtomicBool::new(false),
            present_semaphore: Semaphore::new(display)?,
            render_layout,
            display_layout,
            render_target,
            render_copy,
            display_copy,
        })
    }

    /// The image the application renders into.
    pub fn render_target(&self) -> vk::Image {
        self.render_target.image
    }

    pub fn present_semaphore(&self) -> vk::Semaphore {
        self.present_semaphore.handle
    }

    /// Queue the render target -> render copy transfer behind `wait`.
    /// The caller holds the render queue lock.
    pub fn submit_render_copy(&self, devices: &Devices, wait: &[vk::Semaphore]) -> VkResult<()> {
        self.render_copy_cmd
            .submit(devices.render.queue, self.copy_fence.handle, wait, &[])?;
        self.copy_pending.store(true, Ordering::Release);
        Ok(())
    }

    /// Wait for the render copy, move the pixels through host memory and
    /// queue the transfer into the backend image, signalling the present
    /// semaphore.
    pub fn copy_to_display(&self, devices: &Devices) -> VkResult<()> {
        if self.copy_pending.swap(false, Ordering::AcqRel) {
            self.copy_fence.wait_and_reset()?;
        }
        // The previous display transfer of this slot still reads the copy.
        if self.display_pending.swap(false, Ordering::AcqRel) {
            self.display_fence.wait_and_reset()?;
        }

        self.render_copy.invalidate()?;
        // SAFETY: both fences above are idle, so no GPU work touches the
        // staging images, and the work queue gives this slot to one worker.
        unsafe {
            copy_rows(
                self.render_copy.bytes(),
                self.render_layout,
                self.display_copy.bytes_mut(),
                self.display_layout,
            );
        }

        let _queue = devices.display.lock_queue();
        self.display_cmd.submit(
            devices.display.queue,
            self.display_fence.handle,
            &[],
            &[self.present_semaphore.handle],
        )?;
        self.display_pending.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for ImageWorker {
    fn drop(&mut self) {
        for (pending, fence, what) in [
            (&self.display_pending, &self.display_fence, "display"),
            (&self.copy_pending, &self.copy_fence, "render copy"),
        ] {
            if pending.load(Ordering::Acquire) {
                if let Err(e) = fence.wait() {
                    warn!("{what} fence wait during teardown failed: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryError;
    use crate::testing::{memory, Call, Rig, EXTENT};
    use ash::vk::Handle;

    type F = vk::MemoryPropertyFlags;

    fn desc() -> SlotDesc {
        SlotDesc {
            extent: EXTENT,
            format: vk::Format::B8G8R8A8_UNORM,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        }
    }

    fn backend_image() -> vk::Image {
        vk::Image::from_raw(0xb000)
    }

    #[test]
    fn no_host_visible_render_memory_fails_without_leaks() {
        let mut rig = Rig::new();
        rig.render_memory = memory(&[F::DEVICE_LOCAL]);

        let err = ImageWorker::new(&rig.devices(), backend_image(), desc())
            .err()
            .expect("render copy has nowhere to live");
        assert_eq!(
            err.downcast_ref::<MemoryError>(),
            Some(&MemoryError::NoMemoryType { role: ImageRole::RenderCopy })
        );
        assert_eq!(rig.render_dev.live(), 0);
        assert_eq!(rig.display_dev.live(), 0);
    }

    #[test]
    fn no_coherent_display_memory_releases_render_side_too() {
        let mut rig = Rig::new();
        rig.display_memory = memory(&[F::DEVICE_LOCAL, F::HOST_VISIBLE | F::HOST_CACHED]);

        let err = ImageWorker::new(&rig.devices(), backend_image(), desc())
            .err()
            .expect("display copy has nowhere to live");
        assert_eq!(
            err.downcast_ref::<MemoryError>(),
            Some(&MemoryError::NoMemoryType { role: ImageRole::Display })
        );
        assert_eq!(rig.render_dev.live(), 0);
        assert_eq!(rig.display_dev.live(), 0);
    }

    #[test]
    fn display_fence_is_waited_and_reset_before_the_next_submit() {
        let rig = Rig::new();
        let devices = rig.devices();
        let worker = ImageWorker::new(&devices, backend_image(), desc()).unwrap();
        rig.display_dev.clear_calls();

        worker.copy_to_display(&devices).unwrap();
        worker.copy_to_display(&devices).unwrap();

        let fence = worker.display_fence.handle;
        assert_eq!(
            rig.display_dev.calls(),
            vec![Call::Submit(fence), Call::Wait(fence), Call::Reset(fence), Call::Submit(fence)]
        );
    }

    #[test]
    fn render_copy_completes_before_pixels_move() {
        let rig = Rig::new();
        let devices = rig.devices();
        let worker = ImageWorker::new(&devices, backend_image(), desc()).unwrap();
        rig.render_dev.clear_calls();

        {
            let _queue = devices.render.lock_queue();
            worker.submit_render_copy(&devices, &[]).unwrap();
        }
        unsafe { worker.render_copy.bytes_mut()[..4].copy_from_slice(&[1, 2, 3, 4]) };
        worker.copy_to_display(&devices).unwrap();

        let fence = worker.copy_fence.handle;
        assert_eq!(
            rig.render_dev.calls(),
            vec![Call::Submit(fence), Call::Wait(fence), Call::Reset(fence)]
        );
        assert_eq!(unsafe { &worker.display_copy.bytes()[..4] }, &[1, 2, 3, 4]);

        drop(worker);
        assert_eq!(rig.render_dev.live(), 0);
        assert_eq!(rig.display_dev.live(), 0);
    }
}
