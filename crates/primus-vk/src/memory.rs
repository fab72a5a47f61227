// SPDX-License-Identifier: CEPL-1.0
//! Backing images for the copy pipeline and the host-side row copy between
//! them.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::prelude::VkResult;
use ash::vk;
use thiserror::Error;
use tracing::trace;

use crate::dispatch::DeviceDispatch;

type Flags = vk::MemoryPropertyFlags;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageRole {
    /// What the application renders into.
    RenderTarget,
    /// Linear, host-readable staging image on the render device.
    RenderCopy,
    /// Linear, host-writable staging image on the display device.
    Display,
}

impl ImageRole {
    /// `(required, forbidden)` property pairs, best first.
    pub fn preferences(self) -> &'static [(Flags, Flags)] {
        const DEVICE_LOCAL: Flags = Flags::DEVICE_LOCAL;
        const HOST_VISIBLE: Flags = Flags::HOST_VISIBLE;
        const VISIBLE_CACHED: Flags =
            Flags::from_raw(Flags::HOST_VISIBLE.as_raw() | Flags::HOST_CACHED.as_raw());
        const VISIBLE_COHERENT: Flags =
            Flags::from_raw(Flags::HOST_VISIBLE.as_raw() | Flags::HOST_COHERENT.as_raw());
        const NONE: Flags = Flags::empty();

        match self {
            ImageRole::RenderTarget => &[(DEVICE_LOCAL, HOST_VISIBLE), (DEVICE_LOCAL, NONE)],
            ImageRole::RenderCopy => &[
                (VISIBLE_CACHED, Flags::HOST_COHERENT),
                (VISIBLE_CACHED, NONE),
                (HOST_VISIBLE, NONE),
            ],
            ImageRole::Display => &[(VISIBLE_COHERENT, NONE)],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("no suitable memory type for the {role:?} image")]
    NoMemoryType { role: ImageRole },
    #[error("image layouts do not match: {render_rows} rows on the render side, {display_rows} on the display side")]
    LayoutMismatch { render_rows: usize, display_rows: usize },
}

/// First memory type allowed by `type_bits` that satisfies the earliest
/// preference it can.
pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    preferences: &[(Flags, Flags)],
) -> Option<u32> {
    let count = (props.memory_type_count as usize).min(props.memory_types.len());
    preferences.iter().find_map(|&(required, forbidden)| {
        (0..count).find_map(|i| {
            let flags = props.memory_types[i].property_flags;
            let allowed = type_bits & (1 << i) != 0;
            (allowed && flags.contains(required) && !flags.intersects(forbidden)).then_some(i as u32)
        })
    })
}

/// Placement of the pixel rows inside a mapped linear image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RowLayout {
    pub offset: usize,
    pub size: usize,
    pub row_pitch: usize,
}

impl From<vk::SubresourceLayout> for RowLayout {
    fn from(l: vk::SubresourceLayout) -> Self {
        Self {
            offset: l.offset as usize,
            size: l.size as usize,
            row_pitch: l.row_pitch as usize,
        }
    }
}

impl RowLayout {
    pub fn rows(&self) -> usize {
        self.size.checked_div(self.row_pitch).unwrap_or(0)
    }
}

/// Both images must hold the same number of rows for a row copy to make sense.
pub fn check_layouts(render: RowLayout, display: RowLayout) -> Result<(), MemoryError> {
    let (render_rows, display_rows) = (render.rows(), display.rows());
    if render_rows == 0 || render_rows != display_rows {
        return Err(MemoryError::LayoutMismatch { render_rows, display_rows });
    }
    Ok(())
}

/// Copy pixel rows between two mapped images.
///
/// Equal pitches copy the whole block at once; otherwise every row is
/// truncated to the smaller pitch. Nothing is written outside either slice.
pub fn copy_rows(src: &[u8], src_layout: RowLayout, dst: &mut [u8], dst_layout: RowLayout) {
    let src = src.get(src_layout.offset..).unwrap_or_default();
    let dst = dst.get_mut(dst_layout.offset..).unwrap_or_default();

    if src_layout.row_pitch == dst_layout.row_pitch {
        let n = src_layout.size.min(dst_layout.size).min(src.len()).min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        return;
    }

    let width = src_layout.row_pitch.min(dst_layout.row_pitch);
    let rows = src_layout.rows().min(dst_layout.rows());
    for row in 0..rows {
        let s = row * src_layout.row_pitch;
        let d = row * dst_layout.row_pitch;
        let (Some(from), Some(to)) = (src.get(s..s + width), dst.get_mut(d..d + width)) else {
            break;
        };
        to.copy_from_slice(from);
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ImageDesc {
    pub extent: vk::Extent2D,
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
}

struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

/// An image with its own dedicated allocation, optionally kept mapped.
pub struct PipelineImage {
    device: Arc<DeviceDispatch>,
    pub image: vk::Image,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    mapping: Option<Mapping>,
}

// The mapping is only touched by the worker that currently owns the image
// slot; the work queue hands each slot to one worker at a time.
unsafe impl Send for PipelineImage {}
unsafe impl Sync for PipelineImage {}

impl PipelineImage {
    pub fn new(
        device: &Arc<DeviceDispatch>,
        memory_props: &vk::PhysicalDeviceMemoryProperties,
        desc: ImageDesc,
        role: ImageRole,
    ) -> Result<Self> {
        let d = device.handle;
        let info = vk::ImageCreateInfo {
            s_type: vk::StructureType::IMAGE_CREATE_INFO,
            image_type: vk::ImageType::TYPE_2D,
            format: desc.format,
            extent: vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: desc.tiling,
            usage: desc.usage,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let mut image = vk::Image::null();
        unsafe { (device.fp.create_image)(d, &info, ptr::null(), &mut image) }
            .result()
            .with_context(|| format!("vkCreateImage ({role:?})"))?;
        let mut this = Self {
            device: device.clone(),
            image,
            memory: vk::DeviceMemory::null(),
            size: 0,
            mapping: None,
        };

        let mut req = vk::MemoryRequirements::default();
        unsafe { (device.fp.get_image_memory_requirements)(d, image, &mut req) };
        let type_index = select_memory_type(memory_props, req.memory_type_bits, role.preferences())
            .ok_or(MemoryError::NoMemoryType { role })?;
        trace!(?role, type_index, size = req.size, "allocating image memory");

        let alloc = vk::MemoryAllocateInfo {
            s_type: vk::StructureType::MEMORY_ALLOCATE_INFO,
            allocation_size: req.size,
            memory_type_index: type_index,
            ..Default::default()
        };
        unsafe { (device.fp.allocate_memory)(d, &alloc, ptr::null(), &mut this.memory) }
            .result()
            .with_context(|| format!("vkAllocateMemory ({role:?})"))?;
        this.size = req.size;
        unsafe { (device.fp.bind_image_memory)(d, image, this.memory, 0) }
            .result()
            .context("vkBindImageMemory")?;
        Ok(this)
    }

    /// Keep the whole allocation mapped for the lifetime of the image.
    pub fn map(&mut self) -> VkResult<()> {
        if self.mapping.is_some() {
            return Ok(());
        }
        let mut data = ptr::null_mut();
        unsafe {
            (self.device.fp.map_memory)(
                self.device.handle,
                self.memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
                &mut data,
            )
        }
        .result()?;
        let ptr = NonNull::new(data.cast::<u8>()).ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        self.mapping = Some(Mapping { ptr, len: self.size as usize });
        Ok(())
    }

    pub fn layout(&self) -> RowLayout {
        let sub = vk::ImageSubresource {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            array_layer: 0,
        };
        let mut layout = vk::SubresourceLayout::default();
        unsafe {
            (self.device.fp.get_image_subresource_layout)(self.device.handle, self.image, &sub, &mut layout)
        };
        layout.into()
    }

    /// Make device writes visible to the host.
    pub fn invalidate(&self) -> VkResult<()> {
        let range = vk::MappedMemoryRange {
            s_type: vk::StructureType::MAPPED_MEMORY_RANGE,
            memory: self.memory,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        unsafe { (self.device.fp.invalidate_mapped_memory_ranges)(self.device.handle, 1, &range) }
            .result()
    }

    /// # Safety
    /// No GPU work may be writing the image and no other thread may hold a
    /// mutable view of it.
    pub unsafe fn bytes(&self) -> &[u8] {
        match &self.mapping {
            Some(m) => unsafe { std::slice::from_raw_parts(m.ptr.as_ptr(), m.len) },
            None => &[],
        }
    }

    /// # Safety
    /// Exclusive host access: no GPU work reading or writing the image and no
    /// other view alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        match &self.mapping {
            Some(m) => unsafe { std::slice::from_raw_parts_mut(m.ptr.as_ptr(), m.len) },
            None => &mut [],
        }
    }
}

impl Drop for PipelineImage {
    fn drop(&mut self) {
        let d = self.device.handle;
        unsafe {
            if self.mapping.take().is_some() {
                (self.device.fp.unmap_memory)(d, self.memory);
            }
            (self.device.fp.destroy_image)(d, self.image, ptr::null());
            if self.memory != vk::DeviceMemory::null() {
                (self.device.fp.free_memory)(d, self.memory, ptr::null());
            }
        }
    }
}
