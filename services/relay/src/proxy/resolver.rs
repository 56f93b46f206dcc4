//! Backend resolution: device GUID to tunnel endpoint.
//!
//! The relay depends on resolution only through the [`BackendResolver`]
//! trait, invoked once per accepted connection. A request line with no
//! GUID always resolves to the configured default backend (the management
//! service); device-tunnel routing applies only when a GUID was found.
//!
//! [`DeviceTable`] is the shipped implementation: an in-process map from
//! GUID to endpoint, keyed by the canonical form so any spelling of a
//! device's GUID resolves identically. Deployments that resolve against a
//! live tunnel registry implement the trait themselves.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use fleet_guid::DeviceGuid;

/// Errors produced while resolving a backend address.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The GUID is well-formed but names no known device.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceGuid),

    /// The device is known but has no live tunnel endpoint right now.
    #[error("device {0} has no active tunnel")]
    TunnelDown(DeviceGuid),
}

/// Maps a device GUID (or its absence) to the backend address to dial.
///
/// Implementations are shared across all sessions and must tolerate
/// concurrent lookups without blocking steady-state reads.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    /// Resolve the backend address for one connection.
    ///
    /// `guid` is `None` when the request line carried no GUID; resolution
    /// then falls back to `default_addr` rather than failing.
    async fn resolve(
        &self,
        guid: Option<&DeviceGuid>,
        default_addr: SocketAddr,
    ) -> Result<SocketAddr, ResolveError>;
}

/// Shared resolver reference.
pub type SharedResolver = Arc<dyn BackendResolver>;

/// Immutable snapshot of device endpoints for lock-free reads.
#[derive(Debug, Default)]
struct DeviceSnapshot {
    by_device: HashMap<Uuid, SocketAddr>,
}

/// Device table mapping GUIDs to tunnel endpoints.
///
/// Uses ArcSwap for lock-free atomic updates. Sessions resolving against
/// the table get consistent snapshots without blocking; updates swap in a
/// new snapshot in a single pointer store.
pub struct DeviceTable {
    snapshot: ArcSwap<DeviceSnapshot>,
}

impl DeviceTable {
    /// Create a new empty device table.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(DeviceSnapshot::default()),
        }
    }

    /// Load a device table from a JSON file mapping GUIDs to addresses.
    ///
    /// Expected shape: `{ "<guid>": "<host:port>", ... }`.
    pub fn from_map_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read device map {}", path.display()))?;
        let devices: HashMap<DeviceGuid, SocketAddr> = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid device map {}", path.display()))?;

        let table = Self::new();
        table.update(devices.into_iter().collect());
        Ok(table)
    }

    /// Replace the entire device set atomically.
    ///
    /// Existing readers continue to see the old snapshot until they finish,
    /// then the old snapshot is dropped.
    pub fn update(&self, devices: Vec<(DeviceGuid, SocketAddr)>) {
        let device_count = devices.len();
        let by_device = devices
            .into_iter()
            .map(|(guid, addr)| (guid.uuid(), addr))
            .collect();

        self.snapshot.store(Arc::new(DeviceSnapshot { by_device }));

        info!(device_count = device_count, "Device table updated");
    }

    /// Add or update a single device atomically.
    pub fn upsert(&self, guid: &DeviceGuid, addr: SocketAddr) {
        let current = self.snapshot.load();
        let mut by_device = current.by_device.clone();
        by_device.insert(guid.uuid(), addr);
        self.snapshot.store(Arc::new(DeviceSnapshot { by_device }));
    }

    /// Remove a device atomically.
    pub fn remove(&self, guid: &DeviceGuid) {
        let current = self.snapshot.load();
        let mut by_device = current.by_device.clone();
        by_device.remove(&guid.uuid());
        self.snapshot.store(Arc::new(DeviceSnapshot { by_device }));
    }

    /// Get the endpoint for a device.
    pub fn get(&self, guid: &DeviceGuid) -> Option<SocketAddr> {
        let snapshot = self.snapshot.load();
        snapshot.by_device.get(&guid.uuid()).copied()
    }

    /// Get the number of devices in the table.
    pub fn len(&self) -> usize {
        let snapshot = self.snapshot.load();
        snapshot.by_device.len()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        let snapshot = self.snapshot.load();
        snapshot.by_device.is_empty()
    }
}

impl Default for DeviceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackendResolver for DeviceTable {
    async fn resolve(
        &self,
        guid: Option<&DeviceGuid>,
        default_addr: SocketAddr,
    ) -> Result<SocketAddr, ResolveError> {
        let guid = match guid {
            Some(guid) => guid,
            None => {
                debug!(backend_addr = %default_addr, "No GUID, using default backend");
                return Ok(default_addr);
            }
        };

        match self.get(guid) {
            Some(addr) => {
                debug!(guid = %guid, backend_addr = %addr, "Device resolved");
                Ok(addr)
            }
            None => Err(ResolveError::UnknownDevice(guid.clone())),
        }
    }
}
