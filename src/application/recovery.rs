//! Startup recovery of sessions from the shared store

use std::collections::HashSet;
use tracing::{info, warn};

use super::device_service::DeviceService;
use crate::infrastructure::persistence::SessionRecord;

/// Keys read per pipelined batch
pub const RECOVERY_BATCH: usize = 500;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub restored: usize,
    pub removed: usize,
    pub failed_batches: usize,
}

/// Rebuild local sessions from every `sips:` hash in the shared store.
///
/// Records missing `from`, `rt` or `exp`, and records already past their
/// lifetime, are deleted. A failing batch is logged and skipped. Each
/// restored device gets a catalog query.
pub async fn recover(service: &DeviceService) -> RecoveryReport {
    let sessions = service.sessions();
    let router = sessions.router();
    let mut report = RecoveryReport::default();

    let keys = match router.scan_sessions(RECOVERY_BATCH).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!("Session recovery scan failed: {}", e);
            report.failed_batches += 1;
            return report;
        }
    };
    let mut seen = HashSet::new();
    let keys: Vec<String> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
    report.scanned = keys.len();

    for batch in keys.chunks(RECOVERY_BATCH) {
        let hashes = match router.load_sessions(batch).await {
            Ok(hashes) => hashes,
            Err(e) => {
                warn!(keys = batch.len(), "Session recovery batch failed: {}", e);
                report.failed_batches += 1;
                continue;
            }
        };

        let mut stale = Vec::new();
        for (key, fields) in batch.iter().zip(hashes.iter()) {
            // Key expired between SCAN and the read
            if fields.is_empty() {
                continue;
            }
            let record = match SessionRecord::from_fields(key, fields) {
                Ok(record) => record,
                Err(reason) => {
                    warn!(key = %key, "Dropping invalid session record: {}", reason);
                    stale.push(key.clone());
                    continue;
                }
            };

            let device = record.into_device();
            if !device.is_valid() {
                stale.push(key.clone());
                continue;
            }

            let ttl = device.remaining_ttl();
            match sessions.store(device, ttl).await {
                Ok(device) => {
                    report.restored += 1;
                    service.spawn_query(device);
                }
                Err(e) => {
                    warn!(key = %key, "Failed to restore session: {}", e);
                    stale.push(key.clone());
                }
            }
        }

        if !stale.is_empty() {
            report.removed += stale.len();
            if let Err(e) = router.remove_keys(&stale).await {
                warn!("Failed to delete invalid session records: {}", e);
            }
        }
    }

    info!(
        scanned = report.scanned,
        restored = report.restored,
        removed = report.removed,
        failed_batches = report.failed_batches,
        "Session recovery finished"
    );
    report
}
