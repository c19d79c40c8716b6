//! Client transactions for requests the gateway originates
//!
//! Responses are matched to requests by the top Via branch. Over UDP the
//! request is retransmitted on Timer A/E (T1 doubling, capped at T2 for
//! non-INVITE) until a response arrives, and the whole transaction is
//! bounded by Timer B/F (64*T1). Dropping the future returned by
//! [`SipClient::request`] abandons the transaction.

use super::message::{HeaderAccess, SipError, SipMethod, SipRequest, SipResponse};
use super::transport::{resolve, Transport};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

pub const T1: Duration = Duration::from_millis(500);
pub const T2: Duration = Duration::from_secs(4);

/// Called for each 1xx response of a pending request
pub type ProvisionalHandler = Box<dyn Fn(&SipResponse) + Send + Sync>;

/// Outbound signaling used by the device state machine
#[async_trait]
pub trait SipClient: Send + Sync {
    /// Send a request and wait for its final response.
    async fn request(
        &self,
        request: SipRequest,
        destination: &str,
        on_provisional: Option<ProvisionalHandler>,
    ) -> Result<SipResponse, SipError>;

    /// Send without waiting for a response (ACK).
    async fn send(&self, request: SipRequest, destination: &str) -> Result<(), SipError>;
}

type PendingMap = DashMap<String, mpsc::UnboundedSender<SipResponse>>;

/// Removes the pending entry when the transaction ends or is dropped.
struct PendingGuard {
    pending: Arc<PendingMap>,
    branch: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.branch);
    }
}

pub struct TransactionClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    t1: Duration,
    t2: Duration,
}

impl TransactionClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            pending: Arc::new(DashMap::new()),
            t1: T1,
            t2: T2,
        }
    }

    pub fn with_timers(mut self, t1: Duration, t2: Duration) -> Self {
        self.t1 = t1;
        self.t2 = t2;
        self
    }

    /// Hand a received response to its transaction. Returns false when no
    /// transaction is waiting for it.
    pub fn deliver(&self, response: SipResponse) -> bool {
        let Some(branch) = response.branch() else {
            return false;
        };
        match self.pending.get(&branch) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl SipClient for TransactionClient {
    async fn request(
        &self,
        request: SipRequest,
        destination: &str,
        on_provisional: Option<ProvisionalHandler>,
    ) -> Result<SipResponse, SipError> {
        let branch = request
            .branch()
            .ok_or_else(|| SipError::InvalidMessage("request has no Via branch".to_string()))?;
        let is_invite = request.method() == Some(SipMethod::Invite);
        let method = request.method_name();
        let dest = resolve(destination).await?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(branch.clone(), tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            branch: branch.clone(),
        };

        let data = request.to_bytes();
        self.transport.send(data.clone(), dest).await?;
        debug!(branch = %branch, "{} sent to {}", method, dest);

        let retransmits = !self.transport.protocol().is_reliable();
        let mut interval = self.t1;
        let mut provisional_seen = false;
        let retransmit = sleep(interval);
        let deadline = sleep(self.t1 * 64);
        tokio::pin!(retransmit);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                response = rx.recv() => match response {
                    Some(response) if response.is_provisional() => {
                        provisional_seen = true;
                        if !is_invite {
                            interval = self.t2;
                        }
                        if let Some(callback) = &on_provisional {
                            callback(&response);
                        }
                    }
                    Some(response) => return Ok(response),
                    None => {
                        return Err(SipError::TransactionError(format!(
                            "{} transaction {} closed",
                            method, branch
                        )))
                    }
                },
                _ = &mut retransmit, if retransmits && !(is_invite && provisional_seen) => {
                    if let Err(e) = self.transport.send(data.clone(), dest).await {
                        warn!(branch = %branch, "Retransmission failed: {}", e);
                    }
                    interval = if is_invite {
                        interval * 2
                    } else {
                        (interval * 2).min(self.t2)
                    };
                    retransmit.as_mut().reset(Instant::now() + interval);
                }
                _ = &mut deadline => {
                    return Err(SipError::Timeout(format!("{} to {}", method, destination)));
                }
            }
        }
    }

    async fn send(&self, request: SipRequest, destination: &str) -> Result<(), SipError> {
        let dest = resolve(destination).await?;
        self.transport.send(request.to_bytes(), dest).await
    }
}
