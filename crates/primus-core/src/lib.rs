// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
pub mod config;

pub use config::{DeviceId, LayerConfig, WorkerThreads};

/// Filter variable consulted by [`init_tracing`].
pub const LOG_ENV: &str = "PRIMUS_VK_LOG";

const DEFAULT_FILTER: &str = "warn,primus_vk=info";

/// Install the layer's stderr subscriber unless the host already has one.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
