//! In-process session store with lazy expiry

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::router::DistributedRouter;
use crate::domain::{Device, GatewayError, Result};

/// Device sessions owned by this instance, mirrored into the router.
pub struct SessionStore {
    devices: DashMap<String, Arc<Device>>,
    router: Arc<DistributedRouter>,
}

impl SessionStore {
    pub fn new(router: Arc<DistributedRouter>) -> Self {
        Self {
            devices: DashMap::new(),
            router,
        }
    }

    pub fn router(&self) -> &Arc<DistributedRouter> {
        &self.router
    }

    /// Upsert a session and mirror it. A router failure is logged by the
    /// router and does not fail the local store.
    pub async fn store(&self, device: Device, ttl: Duration) -> Result<Arc<Device>> {
        if device.device_id.is_empty() {
            return Err(GatewayError::Parameter("device id is empty".to_string()));
        }

        let device = Arc::new(device);
        self.devices
            .insert(device.device_id.clone(), device.clone());
        self.router.register(&device, ttl).await;

        debug!(device_id = %device.device_id, addr = %device.addr, "Session stored");
        Ok(device)
    }

    /// Valid session for `device_id`; an expired one is evicted locally and
    /// from the router before reporting `None`.
    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        let device = self.devices.get(device_id).map(|d| d.value().clone())?;
        if device.is_valid() {
            return Some(device);
        }

        info!(device_id = %device_id, "Session expired");
        self.evict(&device).await;
        None
    }

    pub async fn exist(&self, device_id: &str) -> bool {
        self.get(device_id).await.is_some()
    }

    /// Current entry regardless of validity. Used to carry state across a
    /// re-registration.
    pub fn peek(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    /// Local eviction. The distributed route goes too unless another
    /// instance has taken the device over since.
    pub async fn remove(&self, device_id: &str) -> Option<Arc<Device>> {
        let removed = self.devices.remove(device_id).map(|(_, d)| d);
        let (register_time, channel_ids) = match &removed {
            Some(device) => (Some(device.register_time), device.channel_ids().await),
            None => (None, vec![device_id.to_string()]),
        };
        self.router
            .remove_route(device_id, register_time, &channel_ids)
            .await;
        removed
    }

    async fn evict(&self, device: &Arc<Device>) {
        // A concurrent re-registration may already have replaced the entry
        let removed = self
            .devices
            .remove_if(&device.device_id, |_, current| Arc::ptr_eq(current, device))
            .is_some();
        if removed {
            let channel_ids = device.channel_ids().await;
            self.router
                .remove_route(&device.device_id, Some(device.register_time), &channel_ids)
                .await;
        }
    }

    /// Snapshot of every locally held session.
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
