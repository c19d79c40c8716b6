//! Distributed session routing table
//!
//! Mirrors device ownership and in-flight dialogs into the shared store so
//! any gateway instance can locate a device's owner or tear down a call it
//! did not start.
//!
//! Layout:
//! - `sips:<device>` hash `{from, send, rt, exp, addr, CSeq}`, TTL = session lifetime
//! - `sipc:<channel>` hash `{callId, fTag, tTag}`, no TTL

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::store::{SharedStore, StoreResult};
use crate::domain::{ChannelInfo, Device};

pub const SESSION_PREFIX: &str = "sips:";
pub const CHANNEL_PREFIX: &str = "sipc:";

pub const FIELD_FROM: &str = "from";
pub const FIELD_SEND: &str = "send";
pub const FIELD_REGISTER_TIME: &str = "rt";
pub const FIELD_EXPIRES: &str = "exp";
pub const FIELD_OWNER: &str = "addr";
pub const FIELD_CSEQ: &str = "CSeq";

pub fn session_key(device_id: &str) -> String {
    format!("{}{}", SESSION_PREFIX, device_id)
}

pub fn channel_key(channel_id: &str) -> String {
    format!("{}{}", CHANNEL_PREFIX, channel_id)
}

/// A session hash read back from the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub device_id: String,
    pub from: String,
    pub send: String,
    pub register_time: DateTime<Utc>,
    pub expires: Duration,
    pub owner: Option<String>,
    pub cseq: u32,
}

impl SessionRecord {
    /// Parse a `sips:` hash. `from`, `rt` and `exp` are required; `CSeq`
    /// defaults to 1.
    pub fn from_fields(key: &str, fields: &HashMap<String, String>) -> Result<Self, String> {
        let device_id = key
            .strip_prefix(SESSION_PREFIX)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| format!("not a session key: {}", key))?;

        let from = fields
            .get(FIELD_FROM)
            .filter(|v| !v.is_empty())
            .ok_or("missing from")?;
        let rt: i64 = fields
            .get(FIELD_REGISTER_TIME)
            .ok_or("missing rt")?
            .parse()
            .map_err(|_| "invalid rt")?;
        let register_time = Utc
            .timestamp_millis_opt(rt)
            .single()
            .ok_or("rt out of range")?;
        let exp: u64 = fields
            .get(FIELD_EXPIRES)
            .ok_or("missing exp")?
            .parse()
            .map_err(|_| "invalid exp")?;
        let cseq = fields
            .get(FIELD_CSEQ)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Ok(Self {
            device_id: device_id.to_string(),
            from: from.clone(),
            send: fields.get(FIELD_SEND).cloned().unwrap_or_default(),
            register_time,
            expires: Duration::from_secs(exp),
            owner: fields.get(FIELD_OWNER).cloned(),
            cseq,
        })
    }

    pub fn into_device(self) -> Device {
        Device::new(self.device_id, self.from, self.send, self.expires)
            .with_register_time(self.register_time)
            .with_cseq(self.cseq)
    }
}

pub struct DistributedRouter {
    store: Arc<dyn SharedStore>,
    /// Address this instance writes as the owner of its sessions
    instance_addr: String,
    channel_cache: DashMap<String, ChannelInfo>,
}

impl DistributedRouter {
    pub fn new(store: Arc<dyn SharedStore>, instance_addr: impl Into<String>) -> Self {
        Self {
            store,
            instance_addr: instance_addr.into(),
            channel_cache: DashMap::new(),
        }
    }

    pub fn instance_addr(&self) -> &str {
        &self.instance_addr
    }

    /// Mirror a session. Failures are logged and reported as `false`.
    pub async fn register(&self, device: &Device, ttl: Duration) -> bool {
        let key = session_key(&device.device_id);
        let fields = vec![
            (FIELD_FROM.to_string(), device.from.clone()),
            (FIELD_SEND.to_string(), device.addr.clone()),
            (
                FIELD_REGISTER_TIME.to_string(),
                device.register_time.timestamp_millis().to_string(),
            ),
            (FIELD_EXPIRES.to_string(), device.expires.as_secs().to_string()),
            (FIELD_OWNER.to_string(), self.instance_addr.clone()),
        ];

        let result: StoreResult<bool> = async {
            self.store.hset_all(&key, &fields, Some(ttl)).await?;
            // Never rewind a sequence another instance already advanced
            self.store
                .hset_nx(&key, FIELD_CSEQ, &device.cseq().to_string())
                .await
        }
        .await;

        match result {
            Ok(_) => {
                debug!(device_id = %device.device_id, ttl = ?ttl, "Session mirrored");
                true
            }
            Err(e) => {
                warn!(device_id = %device.device_id, "Failed to mirror session: {}", e);
                false
            }
        }
    }

    /// Owning instance of a device, `None` when unknown.
    pub async fn get_route(&self, device_id: &str) -> Option<String> {
        match self.store.hget(&session_key(device_id), FIELD_OWNER).await {
            Ok(owner) => owner.filter(|o| !o.is_empty()),
            Err(e) => {
                warn!(device_id = %device_id, "Route lookup failed: {}", e);
                None
            }
        }
    }

    /// Delete a session and the dialog records of its channels, but only
    /// while the stored session is still ours.
    ///
    /// The record belongs to this instance when it is absent, names this
    /// instance as owner, or carries `register_time`. A record another
    /// instance rewrote after a re-registration is left alone and only the
    /// local dialog cache is cleared. Returns whether keys were deleted.
    pub async fn remove_route(
        &self,
        device_id: &str,
        register_time: Option<DateTime<Utc>>,
        channel_ids: &[String],
    ) -> bool {
        for channel_id in channel_ids {
            self.channel_cache.remove(channel_id);
        }

        let key = session_key(device_id);
        let fields = match self.store.hget_all(&key).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!(device_id = %device_id, "Failed to read route before removal: {}", e);
                return false;
            }
        };
        if !self.owns(&fields, register_time) {
            debug!(
                device_id = %device_id,
                owner = ?fields.get(FIELD_OWNER),
                "Route re-registered elsewhere, keeping it"
            );
            return false;
        }

        let mut keys = vec![key];
        keys.extend(channel_ids.iter().map(|id| channel_key(id)));
        match self.store.del(&keys).await {
            Ok(()) => true,
            Err(e) => {
                warn!(device_id = %device_id, "Failed to remove route: {}", e);
                false
            }
        }
    }

    fn owns(&self, fields: &HashMap<String, String>, register_time: Option<DateTime<Utc>>) -> bool {
        if fields.is_empty() {
            return true;
        }
        if fields.get(FIELD_OWNER).map(String::as_str) == Some(self.instance_addr.as_str()) {
            return true;
        }
        match (register_time, fields.get(FIELD_REGISTER_TIME)) {
            (Some(rt), Some(stored)) => stored.parse::<i64>().ok() == Some(rt.timestamp_millis()),
            _ => false,
        }
    }

    /// Next CSeq for a device, incremented in the shared store.
    ///
    /// Falls back to the local counter if the store is unreachable or the
    /// session key is gone; a missing key is never recreated here.
    pub async fn next_cseq(&self, device: &Device) -> u32 {
        let key = session_key(&device.device_id);
        match self.store.hincr_existing(&key, FIELD_CSEQ, 1).await {
            Ok(Some(value)) if value > 0 && value <= u32::MAX as i64 => {
                let cseq = value as u32;
                if cseq > device.cseq() {
                    device.observe_cseq(cseq);
                    return cseq;
                }
                // Store was reset behind us; keep the local sequence moving
                let local = device.next_local_cseq();
                self.resync_cseq(&key, local).await;
                local
            }
            Ok(Some(value)) => {
                warn!(device_id = %device.device_id, value, "CSeq out of range in store");
                device.next_local_cseq()
            }
            Ok(None) => {
                debug!(device_id = %device.device_id, "No stored session, using local CSeq");
                device.next_local_cseq()
            }
            Err(e) => {
                warn!(device_id = %device.device_id, "CSeq increment failed: {}", e);
                device.next_local_cseq()
            }
        }
    }

    async fn resync_cseq(&self, key: &str, cseq: u32) {
        let fields = [(FIELD_CSEQ.to_string(), cseq.to_string())];
        if let Err(e) = self.store.hset_all(key, &fields, None).await {
            warn!("CSeq resync failed for {}: {}", key, e);
        }
    }

    pub async fn add_channel_info(&self, channel_id: &str, info: ChannelInfo) -> bool {
        let fields = info.to_fields();
        self.channel_cache.insert(channel_id.to_string(), info);
        match self
            .store
            .hset_all(&channel_key(channel_id), &fields, None)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(channel_id = %channel_id, "Failed to persist dialog record: {}", e);
                false
            }
        }
    }

    /// Read and evict a channel's dialog record.
    ///
    /// The shared store is authoritative: another instance may have
    /// replaced or consumed the dialog since it was cached here. The local
    /// copy is only used when the store cannot be read.
    pub async fn take_channel_info(&self, channel_id: &str) -> Option<ChannelInfo> {
        let key = channel_key(channel_id);
        let local = self.channel_cache.remove(channel_id).map(|(_, info)| info);

        let fields = match self.store.hget_all(&key).await {
            Ok(fields) => fields,
            Err(e) => {
                warn!(channel_id = %channel_id, "Failed to read dialog record, using local copy: {}", e);
                return local;
            }
        };
        if fields.is_empty() {
            return None;
        }

        if let Err(e) = self.store.del(&[key]).await {
            warn!(channel_id = %channel_id, "Failed to delete dialog record: {}", e);
        }
        let remote = ChannelInfo::from_fields(&fields);
        if let (Some(local), Some(remote)) = (&local, &remote) {
            if local.call_id != remote.call_id {
                debug!(
                    channel_id = %channel_id,
                    cached = %local.call_id,
                    stored = %remote.call_id,
                    "Dialog replaced by another instance"
                );
            }
        }
        remote
    }

    /// Every session key currently in the store.
    pub async fn scan_sessions(&self, batch: usize) -> StoreResult<Vec<String>> {
        self.store
            .scan(&format!("{}*", SESSION_PREFIX), batch)
            .await
    }

    pub async fn load_sessions(&self, keys: &[String]) -> StoreResult<Vec<HashMap<String, String>>> {
        self.store.hget_all_many(keys).await
    }

    pub async fn remove_keys(&self, keys: &[String]) -> StoreResult<()> {
        self.store.del(keys).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::persistence::MemoryStore;

    fn device(id: &str) -> Device {
        Device::new(id, format!("sip:{}@3402000000", id), "10.0.0.9:5060", Duration::from_secs(3600))
    }

    fn info(call_id: &str) -> ChannelInfo {
        ChannelInfo {
            call_id: call_id.into(),
            from_tag: "f".into(),
            to_tag: "t".into(),
        }
    }

    #[tokio::test]
    async fn test_register_and_route() {
        let store = Arc::new(MemoryStore::new());
        let router = DistributedRouter::new(store.clone(), "10.0.0.1:8080");
        let dev = device("d1");

        assert!(router.register(&dev, Duration::from_secs(3600)).await);
        assert_eq!(router.get_route("d1").await.as_deref(), Some("10.0.0.1:8080"));
        assert_eq!(router.get_route("nobody").await, None);

        let fields = store.hget_all("sips:d1").await.unwrap();
        assert_eq!(fields["from"], "sip:d1@3402000000");
        assert_eq!(fields["send"], "10.0.0.9:5060");
        assert_eq!(fields["exp"], "3600");
        assert_eq!(fields["CSeq"], "1");

        assert!(router.remove_route("d1", None, &["d1".to_string()]).await);
        assert_eq!(router.get_route("d1").await, None);
    }

    #[tokio::test]
    async fn test_remove_route_spares_newer_owner() {
        let store = MemoryStore::new();
        let a = DistributedRouter::new(Arc::new(store.clone()), "10.0.0.1:8080");
        let b = DistributedRouter::new(Arc::new(store.clone()), "10.0.0.2:8080");
        let old = device("d1").with_register_time(Utc::now() - chrono::Duration::seconds(120));
        let new = device("d1");

        a.register(&old, Duration::from_secs(3600)).await;
        b.register(&new, Duration::from_secs(3600)).await;
        b.add_channel_info("ch1", info("call-b")).await;

        let channels = vec!["ch1".to_string()];
        assert!(!a.remove_route("d1", Some(old.register_time), &channels).await);
        assert_eq!(a.get_route("d1").await.as_deref(), Some("10.0.0.2:8080"));
        assert!(!store.hget_all("sipc:ch1").await.unwrap().is_empty());

        // The stored registration time is enough to claim it
        assert!(a.remove_route("d1", Some(new.register_time), &channels).await);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_cseq_monotonic_across_instances() {
        let store = MemoryStore::new();
        let a = DistributedRouter::new(Arc::new(store.clone()), "10.0.0.1:8080");
        let b = DistributedRouter::new(Arc::new(store.clone()), "10.0.0.2:8080");

        let dev_a = device("d1");
        let dev_b = device("d1");
        a.register(&dev_a, Duration::from_secs(3600)).await;

        let mut seen = Vec::new();
        for i in 0..10 {
            let cseq = if i % 2 == 0 {
                a.next_cseq(&dev_a).await
            } else {
                b.next_cseq(&dev_b).await
            };
            seen.push(cseq);
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{:?}", seen);

        // Re-registration must not rewind the shared counter
        b.register(&dev_b, Duration::from_secs(3600)).await;
        let next = a.next_cseq(&dev_a).await;
        assert!(next > *seen.last().unwrap());
    }

    #[tokio::test]
    async fn test_cseq_without_session_key_stays_local() {
        let store = MemoryStore::new();
        let router = DistributedRouter::new(Arc::new(store.clone()), "10.0.0.1:8080");
        let dev = device("d1");

        assert_eq!(router.next_cseq(&dev).await, 2);
        assert_eq!(router.next_cseq(&dev).await, 3);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_channel_info_store_is_authoritative() {
        let store = MemoryStore::new();
        let a = DistributedRouter::new(Arc::new(store.clone()), "a");
        let b = DistributedRouter::new(Arc::new(store.clone()), "b");

        assert!(a.add_channel_info("ch1", info("call-1")).await);
        // Another instance can reclaim it from the store
        assert_eq!(b.take_channel_info("ch1").await, Some(info("call-1")));
        // A's cached copy is stale once the store record is gone
        assert_eq!(a.take_channel_info("ch1").await, None);
        assert!(store.is_empty());

        // A dialog replaced elsewhere wins over the local cache
        assert!(a.add_channel_info("ch1", info("call-1")).await);
        assert!(b.add_channel_info("ch1", info("call-2")).await);
        assert_eq!(a.take_channel_info("ch1").await.map(|i| i.call_id), Some("call-2".into()));
        assert_eq!(b.take_channel_info("ch1").await, None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_session_record_parsing() {
        let mut fields = HashMap::new();
        fields.insert("from".to_string(), "sip:d1@h".to_string());
        fields.insert("send".to_string(), "10.0.0.9:5060".to_string());
        fields.insert("rt".to_string(), "1700000000000".to_string());
        fields.insert("exp".to_string(), "3600".to_string());

        let record = SessionRecord::from_fields("sips:d1", &fields).unwrap();
        assert_eq!(record.device_id, "d1");
        assert_eq!(record.cseq, 1);
        assert_eq!(record.register_time.timestamp_millis(), 1_700_000_000_000);

        fields.remove("rt");
        assert!(SessionRecord::from_fields("sips:d1", &fields).is_err());
    }
}
