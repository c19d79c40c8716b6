//! Periodic catalog sweep over every local session

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::device_service::DeviceService;

pub struct KeepaliveScheduler {
    service: DeviceService,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepaliveScheduler {
    pub fn new(service: DeviceService, period: Duration) -> Self {
        Self {
            service,
            period,
            task: Mutex::new(None),
        }
    }

    /// Fan a catalog query out to every local device without waiting for
    /// the answers. Returns the number of devices queried.
    pub fn sweep(&self) -> usize {
        let devices = self.service.sessions().devices();
        let count = devices.len();
        metrics::gauge!("gb_sessions").set(count as f64);
        for device in devices {
            self.service.spawn_query(device);
        }
        debug!(devices = count, "Keepalive sweep");
        count
    }

    /// First sweep one period after start.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let period = self.period;
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.sweep();
            }
        });

        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
        info!("Keepalive sweep every {:?}", period);
    }

    pub fn stop(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}
