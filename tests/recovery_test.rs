//! Startup recovery from the shared store

mod common;

use chrono::Utc;
use common::*;
use gbgate::application::{recover, RecoveryReport};
use gbgate::infrastructure::persistence::{MemoryStore, SharedStore};
use gbgate::infrastructure::protocols::sip::{HeaderAccess, SipMethod};
use std::time::Duration;

fn fields(pairs: &[(&str, String)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

async fn seed(store: &MemoryStore, device_id: &str, rt_millis: i64, exp: u64, cseq: u32) {
    let record = fields(&[
        ("from", format!("sip:{}@3402000000", device_id)),
        ("send", "192.168.1.70:5060".to_string()),
        ("rt", rt_millis.to_string()),
        ("exp", exp.to_string()),
        ("addr", "10.0.0.9:8080".to_string()),
        ("CSeq", cseq.to_string()),
    ]);
    store
        .hset_all(&format!("sips:{}", device_id), &record, Some(Duration::from_secs(exp)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_recover_restores_valid_sessions() {
    let store = MemoryStore::new();
    let now = Utc::now().timestamp_millis();
    let ids = ["34020000001320000101", "34020000001320000102", "34020000001320000103"];
    for id in ids {
        seed(&store, id, now, 3600, 7).await;
    }

    let client = FakeSipClient::new();
    let service = service(&store, "10.0.0.1:8080", client.clone());
    let report = recover(&service).await;
    assert_eq!(
        report,
        RecoveryReport {
            scanned: 3,
            restored: 3,
            removed: 0,
            failed_batches: 0
        }
    );

    for id in ids {
        let device = service.sessions().get(id).await.unwrap();
        assert_eq!(device.from, format!("sip:{}@3402000000", id));
        assert_eq!(device.addr, "192.168.1.70:5060");
        assert_eq!(device.register_time.timestamp_millis(), now);
        assert_eq!(device.expires, Duration::from_secs(3600));
        assert!(device.cseq() >= 7);
    }

    // One catalog query per restored device, continuing the stored sequence
    assert!(client.wait_for(SipMethod::Message, 3).await);
    let queries = client.sent_with(SipMethod::Message);
    assert_eq!(queries.len(), 3);
    assert!(queries.iter().all(|q| q.cseq().map(|(seq, _)| seq > 7).unwrap_or(false)));

    // The restored sessions now belong to this instance
    let owner = store.hget("sips:34020000001320000101", "addr").await.unwrap();
    assert_eq!(owner.as_deref(), Some("10.0.0.1:8080"));
}

#[tokio::test]
async fn test_recover_removes_invalid_records() {
    let store = MemoryStore::new();
    let now = Utc::now().timestamp_millis();
    seed(&store, "34020000001320000201", now, 3600, 1).await;

    // Registered two hours ago with a one hour lifetime
    let stale = fields(&[
        ("from", "sip:34020000001320000202@3402000000".to_string()),
        ("send", "192.168.1.71:5060".to_string()),
        ("rt", (now - 7_200_000).to_string()),
        ("exp", "3600".to_string()),
    ]);
    store.hset_all("sips:34020000001320000202", &stale, None).await.unwrap();

    let missing_from = fields(&[("rt", now.to_string()), ("exp", "3600".to_string())]);
    store.hset_all("sips:34020000001320000203", &missing_from, None).await.unwrap();

    let garbage_rt = fields(&[
        ("from", "sip:34020000001320000204@3402000000".to_string()),
        ("rt", "yesterday".to_string()),
        ("exp", "3600".to_string()),
    ]);
    store.hset_all("sips:34020000001320000204", &garbage_rt, None).await.unwrap();

    let client = FakeSipClient::new();
    let service = service(&store, "10.0.0.1:8080", client.clone());
    let report = recover(&service).await;
    assert_eq!(report.scanned, 4);
    assert_eq!(report.restored, 1);
    assert_eq!(report.removed, 3);

    for id in ["34020000001320000202", "34020000001320000203", "34020000001320000204"] {
        assert!(service.sessions().get(id).await.is_none());
        assert!(store.hget_all(&format!("sips:{}", id)).await.unwrap().is_empty());
    }
    assert!(service.sessions().get("34020000001320000201").await.is_some());
}

#[tokio::test]
async fn test_recover_empty_store() {
    let store = MemoryStore::new();
    let client = FakeSipClient::new();
    let service = service(&store, "10.0.0.1:8080", client.clone());

    assert_eq!(recover(&service).await, RecoveryReport::default());
    assert!(service.sessions().is_empty());
    assert!(client.sent().is_empty());
}
