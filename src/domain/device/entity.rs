//! Device entity

use super::channel::{CatalogEntry, Channel, ChannelSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A registered edge endpoint and its channel topology.
#[derive(Debug)]
pub struct Device {
    pub device_id: String,
    /// `From` URI of the REGISTER
    pub from: String,
    /// `host:port` requests are sent to
    pub addr: String,
    pub register_time: DateTime<Utc>,
    pub expires: Duration,
    cseq: AtomicU32,
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl Device {
    pub fn new(
        device_id: impl Into<String>,
        from: impl Into<String>,
        addr: impl Into<String>,
        expires: Duration,
    ) -> Self {
        let device_id = device_id.into();
        let mut channels = HashMap::new();
        channels.insert(
            device_id.clone(),
            Arc::new(Channel::self_channel(&device_id)),
        );

        Self {
            device_id,
            from: from.into(),
            addr: addr.into(),
            register_time: Utc::now(),
            expires,
            cseq: AtomicU32::new(1),
            channels: RwLock::new(channels),
        }
    }

    pub fn with_register_time(mut self, register_time: DateTime<Utc>) -> Self {
        self.register_time = register_time;
        self
    }

    pub fn with_cseq(self, cseq: u32) -> Self {
        self.cseq.store(cseq, Ordering::Release);
        self
    }

    /// `now - register_time <= expires`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.expires) {
            Ok(expires) => now.signed_duration_since(self.register_time) <= expires,
            Err(_) => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Lifetime left before the session lapses, zero once expired.
    pub fn remaining_ttl(&self) -> Duration {
        let elapsed = Utc::now()
            .signed_duration_since(self.register_time)
            .to_std()
            .unwrap_or_default();
        self.expires.saturating_sub(elapsed)
    }

    pub fn cseq(&self) -> u32 {
        self.cseq.load(Ordering::Acquire)
    }

    /// Local increment, used when the shared store is unreachable.
    pub fn next_local_cseq(&self) -> u32 {
        self.cseq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a sequence number handed out by the shared store.
    pub fn observe_cseq(&self, cseq: u32) {
        self.cseq.fetch_max(cseq, Ordering::AcqRel);
    }

    /// Host part of the `From` URI, used as the request-URI domain.
    pub fn from_host(&self) -> &str {
        uri_host(&self.from).unwrap_or(&self.addr)
    }

    pub async fn channel(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(channel_id).cloned()
    }

    pub async fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn channel_ids(&self) -> Vec<String> {
        self.channels.read().await.keys().cloned().collect()
    }

    /// True once a catalog response has listed any channel besides the device itself.
    pub async fn has_catalog(&self) -> bool {
        self.channels
            .read()
            .await
            .keys()
            .any(|id| id != &self.device_id)
    }

    /// Replace the channel map with a fresh catalog.
    ///
    /// Channels that survive the refresh keep their live call state. The
    /// self-channel is always present afterwards.
    pub async fn replace_channels(&self, entries: Vec<CatalogEntry>) {
        let mut channels = self.channels.write().await;
        let mut next = HashMap::with_capacity(entries.len() + 1);

        for entry in entries {
            if entry.channel_id.is_empty() {
                continue;
            }
            let channel = match channels.get(&entry.channel_id) {
                Some(old) => Channel::with_live(entry, &self.device_id, old.live()),
                None => Channel::new(entry, self.device_id.as_str()),
            };
            next.insert(channel.id().to_string(), Arc::new(channel));
        }

        if !next.contains_key(&self.device_id) {
            let own = channels
                .get(&self.device_id)
                .cloned()
                .unwrap_or_else(|| Arc::new(Channel::self_channel(&self.device_id)));
            next.insert(self.device_id.clone(), own);
        }

        *channels = next;
    }

    /// Take over the channel map and sequence of a previous session of the
    /// same device.
    pub async fn adopt(&self, previous: &Device) {
        self.observe_cseq(previous.cseq());
        let old = previous.channels.read().await;
        let mut channels = self.channels.write().await;
        for (id, channel) in old.iter() {
            channels.insert(id.clone(), channel.clone());
        }
    }

    pub async fn find_channel_by_call_id(&self, call_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .await
            .values()
            .find(|ch| ch.dialog().map(|d| d.call_id == call_id).unwrap_or(false))
            .cloned()
    }

    pub async fn snapshot(&self) -> DeviceSnapshot {
        let mut channels: Vec<ChannelSnapshot> = self
            .channels
            .read()
            .await
            .values()
            .map(|ch| ch.snapshot())
            .collect();
        channels.sort_by(|a, b| a.meta.channel_id.cmp(&b.meta.channel_id));

        DeviceSnapshot {
            device_id: self.device_id.clone(),
            from: self.from.clone(),
            addr: self.addr.clone(),
            register_time: self.register_time,
            expires: self.expires.as_secs(),
            cseq: self.cseq(),
            channels,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub device_id: String,
    pub from: String,
    pub addr: String,
    pub register_time: DateTime<Utc>,
    pub expires: u64,
    pub cseq: u32,
    pub channels: Vec<ChannelSnapshot>,
}

/// `sip:user@host:port;params` -> `host:port`
pub fn uri_host(uri: &str) -> Option<&str> {
    let rest = uri.split_once('@').map(|(_, r)| r)?;
    let end = rest.find([';', '>', '?']).unwrap_or(rest.len());
    let host = &rest[..end];
    (!host.is_empty()).then_some(host)
}

/// `sip:user@host` -> `user`
pub fn uri_user(uri: &str) -> Option<&str> {
    let trimmed = uri.trim().trim_start_matches('<');
    let (scheme_user, _) = trimmed.split_once('@')?;
    let user = scheme_user
        .strip_prefix("sips:")
        .or_else(|| scheme_user.strip_prefix("sip:"))
        .unwrap_or(scheme_user);
    (!user.is_empty()).then_some(user)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str) -> CatalogEntry {
        CatalogEntry {
            channel_id: id.to_string(),
            name: format!("cam-{}", id),
            ..Default::default()
        }
    }

    #[test]
    fn test_validity_boundary() {
        let t0 = Utc::now();
        let device = Device::new("dev", "sip:dev@10.0.0.1:5060", "10.0.0.1:5060", Duration::from_secs(60))
            .with_register_time(t0);
        assert!(device.is_valid_at(t0 + chrono::Duration::seconds(60)));
        assert!(!device.is_valid_at(t0 + chrono::Duration::milliseconds(60_001)));
    }

    #[test]
    fn test_uri_helpers() {
        assert_eq!(uri_host("sip:34020000001320000001@3402000000"), Some("3402000000"));
        assert_eq!(uri_host("sip:a@10.0.0.1:5060;transport=udp"), Some("10.0.0.1:5060"));
        assert_eq!(uri_user("<sip:34020000001320000001@3402000000>"), Some("34020000001320000001"));
        assert_eq!(uri_user("no-at-sign"), None);
    }

    #[test]
    fn test_cseq_observe_never_decreases() {
        let device = Device::new("dev", "sip:dev@h", "h:5060", Duration::from_secs(60)).with_cseq(5);
        device.observe_cseq(3);
        assert_eq!(device.cseq(), 5);
        assert_eq!(device.next_local_cseq(), 6);
    }

    #[tokio::test]
    async fn test_replace_channels_is_authoritative() {
        let device = Device::new("dev", "sip:dev@h", "h:5060", Duration::from_secs(60));
        device.replace_channels(vec![entry("A"), entry("B")]).await;
        assert!(device.has_catalog().await);

        let a = device.channel("A").await.unwrap();
        assert!(a.guard().try_begin());

        device.replace_channels(vec![entry("A"), entry("C")]).await;
        let mut ids = device.channel_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["A", "C", "dev"]);

        let a = device.channel("A").await.unwrap();
        assert_eq!(a.device_id, "dev");
        assert!(!a.guard().is_idle());
        assert_eq!(device.channel("C").await.unwrap().device_id, "dev");
    }

    #[tokio::test]
    async fn test_self_channel_retained() {
        let device = Device::new("dev", "sip:dev@h", "h:5060", Duration::from_secs(60));
        assert!(!device.has_catalog().await);
        device.replace_channels(vec![]).await;
        assert!(device.channel("dev").await.is_some());
    }
}
