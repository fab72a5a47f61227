// SPDX-License-Identifier: CEPL-1.0
//! Vulkan layer that renders on one GPU and presents on another.
//!
//! The application only ever sees the render GPU. Swapchains it creates are
//! backed by a real swapchain on the display GPU, and every presented frame
//! is copied across through host memory.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod command;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod intercept;
pub mod loader;
pub mod memory;
pub mod pairing;
pub mod registry;
pub mod swapchain;
pub mod sync;
pub mod worker;

#[cfg(test)]
mod testing;
