//! Reassembly of catalogs split over several MESSAGE bodies
//!
//! A device with many channels answers one catalog query with a run of
//! `Response` documents sharing an `SN`, each listing a slice of the
//! `SumNum` channels. Fragments are buffered per device until every channel
//! has been seen.

use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::CatalogEntry;

/// How long a partial catalog waits for its remaining fragments
pub const CATALOG_FRAGMENT_WINDOW: Duration = Duration::from_secs(10);

struct Pending {
    sn: u32,
    sum_num: u32,
    items: Vec<CatalogEntry>,
    index: HashMap<String, usize>,
    started: Instant,
}

impl Pending {
    fn new(sn: u32, sum_num: u32) -> Self {
        Self {
            sn,
            sum_num,
            items: Vec::new(),
            index: HashMap::new(),
            started: Instant::now(),
        }
    }

    fn add(&mut self, entry: CatalogEntry) {
        match self.index.get(&entry.channel_id) {
            Some(&at) => self.items[at] = entry,
            None => {
                self.index.insert(entry.channel_id.clone(), self.items.len());
                self.items.push(entry);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.items.len() >= self.sum_num as usize
    }
}

pub struct CatalogAssembler {
    pending: DashMap<String, Pending>,
    window: Duration,
}

impl Default for CatalogAssembler {
    fn default() -> Self {
        Self::new(CATALOG_FRAGMENT_WINDOW)
    }
}

impl CatalogAssembler {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            window,
        }
    }

    /// Buffer one fragment. Returns the whole catalog once `sum_num`
    /// distinct channels have arrived for `sn`.
    ///
    /// A fragment with a different `sn`, or one arriving after the window
    /// lapsed, starts over.
    pub fn push(
        &self,
        device_id: &str,
        sn: u32,
        sum_num: u32,
        items: Vec<CatalogEntry>,
    ) -> Option<Vec<CatalogEntry>> {
        let complete = {
            let mut pending = self
                .pending
                .entry(device_id.to_string())
                .or_insert_with(|| Pending::new(sn, sum_num));
            if pending.sn != sn || pending.started.elapsed() > self.window {
                debug!(device_id = %device_id, dropped = pending.items.len(), "Restarting catalog assembly");
                *pending = Pending::new(sn, sum_num);
            }
            pending.sum_num = sum_num;
            for entry in items.into_iter().filter(|e| !e.channel_id.is_empty()) {
                pending.add(entry);
            }
            debug!(
                device_id = %device_id,
                sn,
                received = pending.items.len(),
                sum_num,
                "Catalog fragment"
            );
            pending.is_complete()
        };

        if !complete {
            return None;
        }
        self.pending
            .remove_if(device_id, |_, p| p.sn == sn && p.is_complete())
            .map(|(_, p)| p.items)
    }

    /// Devices with a catalog still being assembled.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
