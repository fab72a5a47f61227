// SPDX-License-Identifier: CEPL-1.0
use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("create info carries no layer link for the next chain element")]
    MissingLayerLink,
    #[error("loader did not supply layer device creation callbacks (needs loader >= 1.1.108)")]
    MissingDeviceCallbacks,
    #[error("no physical device for rendering found; is the render driver installed?")]
    NoRenderDevice,
    #[error("no physical device for display found; is the display driver installed?")]
    NoDisplayDevice,
    #[error("no queue family with graphics, compute and transfer support on {0:?}")]
    NoQueueFamily(vk::PhysicalDevice),
    #[error("next chain element does not expose {0}")]
    MissingEntryPoint(&'static str),
    #[error("cannot spawn {0} thread: {1}")]
    Spawn(&'static str, #[source] std::io::Error),
    #[error("unknown {0} handle")]
    UnknownHandle(&'static str),
    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

impl LayerError {
    pub fn vulkan(call: &'static str) -> impl FnOnce(vk::Result) -> LayerError {
        move |result| LayerError::Vulkan { call, result }
    }

    /// The code handed back to the application for this failure.
    pub fn as_vk_result(&self) -> vk::Result {
        match self {
            LayerError::MissingDeviceCallbacks | LayerError::MissingEntryPoint(_) => {
                vk::Result::ERROR_INCOMPATIBLE_DRIVER
            }
            LayerError::Vulkan { result, .. } => *result,
            _ => vk::Result::ERROR_INITIALIZATION_FAILED,
        }
    }
}
