// SPDX-License-Identifier: CEPL-1.0
//! The application-facing swapchain.
//!
//! The application renders into images on the render device. Each present is
//! queued here; worker threads copy the frame through host memory into the
//! backend swapchain on the display device and present it there, strictly in
//! the order the application presented.

pub mod queue;

use std::ptr;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use primus_core::WorkerThreads;
use tracing::{debug, error, info, trace, warn};

use crate::dispatch::DeviceDispatch;
use crate::sync::Fence;
use crate::worker::{Devices, ImageWorker, SlotDesc};
use queue::{Ticket, WorkQueue};

/// Backend images are never fewer than this, to absorb the extra copy hop.
pub const MIN_BACKEND_IMAGES: u32 = 3;

pub fn back_end_image_count(requested: u32) -> u32 {
    requested.max(MIN_BACKEND_IMAGES)
}

/// How many presents may be queued or in flight before acquire blocks.
pub fn in_flight_limit(image_count: usize, surface_min_images: u32) -> usize {
    image_count.saturating_sub(surface_min_images as usize)
}

/// Create info for the backend swapchain on the display device.
pub fn backend_create_info<'a>(
    app: &vk::SwapchainCreateInfoKHR<'a>,
    old_backend: vk::SwapchainKHR,
) -> vk::SwapchainCreateInfoKHR<'a> {
    vk::SwapchainCreateInfoKHR {
        min_image_count: back_end_image_count(app.min_image_count),
        image_usage: app.image_usage | vk::ImageUsageFlags::TRANSFER_DST,
        // Queue family indices name render-device families.
        image_sharing_mode: vk::SharingMode::EXCLUSIVE,
        queue_family_index_count: 0,
        p_queue_family_indices: ptr::null(),
        old_swapchain: old_backend,
        ..*app
    }
}

/// The real swapchain on the display device, destroyed on drop.
pub struct Backend {
    device: Arc<DeviceDispatch>,
    pub handle: vk::SwapchainKHR,
}

impl Backend {
    /// Take ownership of `handle`.
    pub fn new(device: &Arc<DeviceDispatch>, handle: vk::SwapchainKHR) -> Self {
        Self { device: device.clone(), handle }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        debug!(backend = ?self.handle, "destroying backend swapchain");
        unsafe { (self.device.fp.destroy_swapchain_khr)(self.device.handle, self.handle, ptr::null()) }
    }
}

#[derive(Clone, Copy, Debug)]
struct WorkItem {
    queue: vk::Queue,
    image_index: u32,
}

struct SwapchainShared {
    devices: Devices,
    queue: WorkQueue<WorkItem>,
    in_flight_limit: usize,
    // Dropped before the backend whose images they reference.
    workers: Vec<ImageWorker>,
    backend: Backend,
}

impl SwapchainShared {
    fn run(&self) {
        while let Some(ticket) = self.queue.pop() {
            self.process(ticket);
        }
        trace!("swapchain worker exiting");
    }

    fn process(&self, ticket: Ticket<WorkItem>) {
        let index = ticket.item.image_index;
        let worker = &self.workers[index as usize];
        trace!(index, queue = ?ticket.item.queue, "copying");
        let copied = worker.copy_to_display(&self.devices);
        if let Err(e) = &copied {
            error!(index, "copy to display device failed: {e}");
        }
        self.queue.complete_in_order(ticket, |_| {
            if copied.is_ok() {
                self.present_backend(index, worker.present_semaphore());
            }
        });
    }

    fn present_backend(&self, index: u32, wait: vk::Semaphore) {
        let info = vk::PresentInfoKHR {
            s_type: vk::StructureType::PRESENT_INFO_KHR,
            wait_semaphore_count: 1,
            p_wait_semaphores: &wait,
            swapchain_count: 1,
            p_swapchains: &self.backend.handle,
            p_image_indices: &index,
            ..Default::default()
        };
        let display = &self.devices.display;
        let res = {
            let _queue = display.lock_queue();
            unsafe { (display.dispatch.fp.queue_present_khr)(display.queue, &info) }
        };
        match res {
            vk::Result::SUCCESS => trace!(index, "presented"),
            vk::Result::SUBOPTIMAL_KHR => debug!(index, "presented (suboptimal)"),
            e => warn!(index, "vkQueuePresentKHR on display device failed: {e}"),
        }
    }
}

pub struct PrimusSwapchain {
    shared: Arc<SwapchainShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl PrimusSwapchain {
    /// Build the image slots for `backend` and start the workers.
    ///
    /// On error every resource created so far is released, `backend`
    /// included.
    pub fn new(
        devices: Devices,
        backend: Backend,
        info: &vk::SwapchainCreateInfoKHR<'_>,
        threads: WorkerThreads,
    ) -> Result<Self> {
        let instance = &devices.render.instance;
        let caps = unsafe {
            instance
                .dispatch
                .surface_capabilities(instance.display.handle, info.surface)
        }
        .context("querying display surface capabilities")?;

        let display_images = unsafe { devices.display.dispatch.swapchain_images(backend.handle) }
            .context("vkGetSwapchainImagesKHR on backend")?;
        info!(
            requested = info.min_image_count,
            granted = display_images.len(),
            surface_min = caps.min_image_count,
            "swapchain {}x{}",
            info.image_extent.width,
            info.image_extent.height
        );

        let desc = SlotDesc {
            extent: info.image_extent,
            format: info.image_format,
            usage: info.image_usage,
        };
        let workers = display_images
            .iter()
            .enumerate()
            .map(|(i, &image)| {
                ImageWorker::new(&devices, image, desc).with_context(|| format!("image slot {i}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let swapchain = PrimusSwapchain {
            shared: Arc::new(SwapchainShared {
                in_flight_limit: in_flight_limit(workers.len(), caps.min_image_count),
                devices,
                queue: WorkQueue::new(),
                workers,
                backend,
            }),
            threads: Mutex::new(Vec::new()),
        };
        let count = threads.count(swapchain.shared.workers.len());
        for i in 0..count {
            let shared = swapchain.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("primus-swapchain-{i}"))
                .spawn(move || shared.run())
                .context("spawning swapchain worker")?;
            swapchain.lock_threads().push(handle);
        }
        debug!(threads = count, limit = swapchain.shared.in_flight_limit, "swapchain workers started");
        Ok(swapchain)
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn backend(&self) -> vk::SwapchainKHR {
        self.shared.backend.handle
    }

    /// The render targets, in backend image order.
    pub fn images(&self) -> Vec<vk::Image> {
        self.shared.workers.iter().map(ImageWorker::render_target).collect()
    }

    /// Acquire on the backend, then signal the application's semaphore and
    /// fence from the render queue once the image is really available.
    ///
    /// `Ok` carries the index and `SUCCESS` or `SUBOPTIMAL_KHR`.
    pub fn acquire(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> VkResult<(u32, vk::Result)> {
        let shared = &self.shared;
        shared.queue.wait_ready(shared.in_flight_limit);

        let display = &shared.devices.display.dispatch;
        let acquired = Fence::new(display)?;
        let mut index = 0;
        let res = unsafe {
            (display.fp.acquire_next_image_khr)(
                display.handle,
                shared.backend.handle,
                timeout,
                vk::Semaphore::null(),
                acquired.handle,
                &mut index,
            )
        };
        match res {
            vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR => {}
            other => return Err(other),
        }
        acquired.wait()?;

        let render = &shared.devices.render;
        let submit = vk::SubmitInfo {
            s_type: vk::StructureType::SUBMIT_INFO,
            signal_semaphore_count: u32::from(semaphore != vk::Semaphore::null()),
            p_signal_semaphores: &semaphore,
            ..Default::default()
        };
        {
            let _queue = render.lock_queue();
            unsafe { render.dispatch.queue_submit(render.queue, std::slice::from_ref(&submit), fence) }?;
        }
        trace!(index, "acquired");
        Ok((index, res))
    }

    /// Queue the present of `image_index`. The caller holds the render queue
    /// lock; `wait` are the application's present wait semaphores.
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait: &[vk::Semaphore]) -> VkResult<()> {
        let shared = &self.shared;
        let Some(worker) = shared.workers.get(image_index as usize) else {
            error!(image_index, slots = shared.workers.len(), "present of unknown image index");
            return Err(vk::Result::ERROR_UNKNOWN);
        };
        shared.queue.push_with(WorkItem { queue, image_index }, |_| {
            worker.submit_render_copy(&shared.devices, wait)
        })?;
        trace!(image_index, "present queued");
        Ok(())
    }

    pub fn status(&self) -> vk::Result {
        let display = &self.shared.devices.display.dispatch;
        match display.fp.get_swapchain_status_khr {
            Some(f) => unsafe { f(display.handle, self.shared.backend.handle) },
            None => vk::Result::SUCCESS,
        }
    }

    /// Stop and join the workers, then drain the display queue so no
    /// backend present still waits on a slot's semaphore. Idempotent.
    pub fn shutdown(&self) {
        self.shared.queue.stop();
        let threads = std::mem::take(&mut *self.lock_threads());
        if threads.is_empty() {
            return;
        }
        for t in threads {
            if t.join().is_err() {
                error!("swapchain worker panicked");
            }
        }
        let display = &self.shared.devices.display;
        let res = {
            let _queue = display.lock_queue();
            unsafe { (display.dispatch.fp.queue_wait_idle)(display.queue) }
        };
        if res != vk::Result::SUCCESS {
            warn!("display queue wait during swapchain teardown failed: {res}");
        }
    }
}

impl Drop for PrimusSwapchain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
