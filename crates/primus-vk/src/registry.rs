// SPDX-License-Identifier: CEPL-1.0
//! Process-wide handle tables.
//!
//! The loader identifies objects only by handle, so every intercept starts by
//! looking its context up here. Entries are inserted by the matching create
//! intercept and erased by the matching destroy intercept, nothing else.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ash::vk::{self, Handle};
use once_cell::sync::Lazy;
use tracing::error;

use crate::device::DeviceContext;
use crate::error::LayerError;
use crate::instance::InstanceContext;
use crate::loader::DispatchKey;
use crate::swapchain::PrimusSwapchain;

pub struct Table<K, V> {
    kind: &'static str,
    entries: HashMap<K, Arc<V>>,
}

impl<K: Copy + Eq + Hash + std::fmt::Debug, V> Table<K, V> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, entries: HashMap::new() }
    }

    pub fn register(&mut self, key: K, value: Arc<V>) {
        if self.entries.insert(key, value).is_some() {
            error!(kind = self.kind, ?key, "handle registered twice; replacing stale entry");
        }
    }

    /// An absent key means the application used a handle we never saw created.
    pub fn lookup(&self, key: K) -> Result<Arc<V>, LayerError> {
        self.entries.get(&key).cloned().ok_or_else(|| {
            error!(kind = self.kind, ?key, "lookup of unknown handle");
            LayerError::UnknownHandle(self.kind)
        })
    }

    pub fn erase(&mut self, key: K) -> Option<Arc<V>> {
        self.entries.remove(&key)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct Registry {
    pub instances: Table<DispatchKey, InstanceContext>,
    pub devices: Table<DispatchKey, DeviceContext>,
    pub swapchains: Table<vk::SwapchainKHR, PrimusSwapchain>,
}

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    RwLock::new(Registry {
        instances: Table::new("instance"),
        devices: Table::new("device"),
        swapchains: Table::new("swapchain"),
    })
});

static NEXT_SWAPCHAIN: AtomicU64 = AtomicU64::new(1);

// Every critical section is a single map operation, so a poisoned lock still
// guards consistent tables.
pub fn read() -> RwLockReadGuard<'static, Registry> {
    REGISTRY.read().unwrap_or_else(|e| e.into_inner())
}

pub fn write() -> RwLockWriteGuard<'static, Registry> {
    REGISTRY.write().unwrap_or_else(|e| e.into_inner())
}

/// A fresh handle for a layer-owned swapchain; never null, never reused.
pub fn next_swapchain_handle() -> vk::SwapchainKHR {
    vk::SwapchainKHR::from_raw(NEXT_SWAPCHAIN.fetch_add(1, Ordering::Relaxed))
}

pub fn instance<H: Handle>(handle: H) -> Result<Arc<InstanceContext>, LayerError> {
    read().instances.lookup(unsafe { DispatchKey::of(handle) })
}

pub fn device<H: Handle>(handle: H) -> Result<Arc<DeviceContext>, LayerError> {
    read().devices.lookup(unsafe { DispatchKey::of(handle) })
}

pub fn swapchain(handle: vk::SwapchainKHR) -> Result<Arc<PrimusSwapchain>, LayerError> {
    read().swapchains.lookup(handle)
}
