//! Shared fixtures for the gateway integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use gbgate::application::DeviceService;
use gbgate::config::SipConfig;
use gbgate::domain::{CatalogEntry, Device};
use gbgate::infrastructure::facade::MediaAllocator;
use gbgate::infrastructure::persistence::{DistributedRouter, MemoryStore, SessionStore};
use gbgate::infrastructure::protocols::sip::{
    ProvisionalHandler, ResponseBuilder, SipClient, SipError, SipMethod, SipRequest, SipResponse,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEVICE: &str = "34020000001320000001";
pub const DEVICE_FROM: &str = "sip:34020000001320000001@3402000000";
pub const DEVICE_ADDR: &str = "192.168.1.64:5060";

/// How the fake peer answers a method
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Status(u16),
    Delayed(Duration, u16),
    /// Never answers
    Hang,
}

/// Counts requests that are waiting on the fake peer.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Scripted stand-in for the transaction layer
#[derive(Default)]
pub struct FakeSipClient {
    replies: Mutex<HashMap<SipMethod, Reply>>,
    sent: Mutex<Vec<SipRequest>>,
    in_flight: Arc<AtomicUsize>,
}

impl FakeSipClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, method: SipMethod, reply: Reply) {
        self.replies.lock().unwrap().insert(method, reply);
    }

    pub fn sent(&self) -> Vec<SipRequest> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with(&self, method: SipMethod) -> Vec<SipRequest> {
        self.sent()
            .into_iter()
            .filter(|r| r.method() == Some(method))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait (bounded) until `count` requests of `method` went out.
    pub async fn wait_for(&self, method: SipMethod, count: usize) -> bool {
        for _ in 0..100 {
            if self.sent_with(method).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

#[async_trait]
impl SipClient for FakeSipClient {
    async fn request(
        &self,
        request: SipRequest,
        _destination: &str,
        _on_provisional: Option<ProvisionalHandler>,
    ) -> Result<SipResponse, SipError> {
        self.sent.lock().unwrap().push(request.clone());
        let reply = request
            .method()
            .and_then(|m| self.replies.lock().unwrap().get(&m).copied())
            .unwrap_or(Reply::Status(200));

        let _guard = InFlight::enter(&self.in_flight);
        let status = match reply {
            Reply::Status(status) => status,
            Reply::Delayed(delay, status) => {
                tokio::time::sleep(delay).await;
                status
            }
            Reply::Hang => std::future::pending().await,
        };
        ResponseBuilder::new(status).build_for_request(&request)
    }

    async fn send(&self, request: SipRequest, _destination: &str) -> Result<(), SipError> {
        self.sent.lock().unwrap().push(request);
        Ok(())
    }
}

/// Media server that always allocates the same port
pub struct FixedMedia(pub u32);

#[async_trait]
impl MediaAllocator for FixedMedia {
    async fn create_channel(&self, _channel_id: &str) -> gbgate::Result<u32> {
        Ok(self.0)
    }
}

pub fn service(store: &MemoryStore, instance: &str, client: Arc<FakeSipClient>) -> DeviceService {
    let router = Arc::new(DistributedRouter::new(Arc::new(store.clone()), instance));
    DeviceService::new(
        Arc::new(SipConfig::default()),
        Arc::new(SessionStore::new(router)),
        client,
        Arc::new(FixedMedia(10_001)),
    )
}

pub fn catalog(ids: &[&str]) -> Vec<CatalogEntry> {
    ids.iter()
        .map(|id| CatalogEntry {
            channel_id: id.to_string(),
            parent_id: DEVICE.to_string(),
            name: format!("camera {}", id),
            status: "ON".to_string(),
            ..Default::default()
        })
        .collect()
}

/// Register the test device with the given channels.
pub async fn register(service: &DeviceService, channels: &[&str]) -> Arc<Device> {
    let device = service
        .sessions()
        .store(
            Device::new(DEVICE, DEVICE_FROM, DEVICE_ADDR, Duration::from_secs(3600)),
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
    device.replace_channels(catalog(channels)).await;
    device
}
