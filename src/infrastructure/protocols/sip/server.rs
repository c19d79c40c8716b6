//! SIP server: transport receive loop and per-request dispatch

use super::builder::ResponseBuilder;
use super::client::TransactionClient;
use super::handler::SipHandler;
use super::message::{SipError, SipMessage, SipMethod, SipRequest};
use super::transport::{IncomingMessage, TcpTransport, Transport, UdpTransport};
use crate::config::SipConfig;
use futures::FutureExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type HandlerMap = Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>;

/// SIP server
pub struct SipServer {
    transport: Arc<dyn Transport>,
    client: Arc<TransactionClient>,
    handlers: HandlerMap,
    incoming: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SipServer {
    /// Bind the configured transport.
    pub async fn bind(config: &SipConfig) -> Result<Self, SipError> {
        let addr: SocketAddr = config.listen_address.parse().map_err(|e| {
            SipError::TransportError(format!("Invalid listen address {}: {}", config.listen_address, e))
        })?;

        let (transport, rx): (Arc<dyn Transport>, _) = if config.is_tcp() {
            let (t, rx) = TcpTransport::bind(addr).await?;
            (t, rx)
        } else {
            let (t, rx) = UdpTransport::bind(addr).await?;
            (t, rx)
        };
        Ok(Self::with_transport(transport, rx))
    }

    pub fn with_transport(
        transport: Arc<dyn Transport>,
        incoming: mpsc::Receiver<IncomingMessage>,
    ) -> Self {
        Self {
            client: Arc::new(TransactionClient::new(transport.clone())),
            transport,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            incoming: Mutex::new(Some(incoming)),
            task: Mutex::new(None),
        }
    }

    /// Client transactions share the server's transport
    pub fn client(&self) -> Arc<TransactionClient> {
        self.client.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.insert(method, handler);
        info!("Registered handler for SIP method: {}", method);
    }

    pub fn start(&self) -> Result<(), SipError> {
        let mut rx = self
            .incoming
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or_else(|| SipError::Internal("SIP server already started".to_string()))?;

        let handlers = self.handlers.clone();
        let transport = self.transport.clone();
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                match incoming.message {
                    SipMessage::Request(request) => {
                        let handlers = handlers.clone();
                        let transport = transport.clone();
                        tokio::spawn(async move {
                            Self::dispatch(request, incoming.source, handlers, transport).await;
                        });
                    }
                    SipMessage::Response(response) => {
                        let status = response.status_code();
                        if !client.deliver(response) {
                            debug!("Dropping unmatched {} response from {}", status, incoming.source);
                        }
                    }
                }
            }
        });

        if let Ok(mut slot) = self.task.lock() {
            *slot = Some(task);
        }
        info!(
            "SIP server started on {} ({})",
            self.transport
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            self.transport.protocol().as_str()
        );
        Ok(())
    }

    /// Run the handler for one request. Handler errors and panics become a
    /// 500; nothing escapes the task.
    async fn dispatch(
        request: SipRequest,
        source: SocketAddr,
        handlers: HandlerMap,
        transport: Arc<dyn Transport>,
    ) {
        let handler = match request.method() {
            Some(method) => handlers.read().await.get(&method).cloned(),
            None => None,
        };

        let response = match handler {
            Some(handler) => {
                let outcome = AssertUnwindSafe(handler.handle_request(request.clone(), source))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        error!("Handler error for {}: {}", request.method_name(), e);
                        ResponseBuilder::server_internal_error()
                            .build_for_request(&request)
                            .ok()
                    }
                    Err(_) => {
                        error!("Handler panicked on {} from {}", request.method_name(), source);
                        ResponseBuilder::server_internal_error()
                            .build_for_request(&request)
                            .ok()
                    }
                }
            }
            // ACK never gets a response
            None if request.method() == Some(SipMethod::Ack) => None,
            None => {
                warn!("No handler registered for method: {}", request.method_name());
                ResponseBuilder::new(501).build_for_request(&request).ok()
            }
        };

        if let Some(response) = response {
            if let Err(e) = transport.send(response.to_bytes(), source).await {
                error!("Failed to send response to {}: {}", source, e);
            }
        }
    }

    pub fn stop(&self) {
        info!("Stopping SIP server");
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
        self.transport.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::protocols::sip::message::SipResponse;
    use async_trait::async_trait;
    use tokio::net::UdpSocket;

    struct PanickingHandler;

    #[async_trait]
    impl SipHandler for PanickingHandler {
        async fn handle_request(
            &self,
            _request: SipRequest,
            _source: SocketAddr,
        ) -> Result<Option<SipResponse>, SipError> {
            panic!("boom");
        }
    }

    fn options() -> String {
        "OPTIONS sip:34020000002000000001@127.0.0.1 SIP/2.0\r\n\
         Via: SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bK-srv\r\n\
         From: <sip:34020000001320000001@3402000000>;tag=1\r\n\
         To: <sip:34020000002000000001@3402000000>\r\n\
         Call-ID: srv-1\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
            .to_string()
    }

    async fn exchange(server: &SipServer, data: &str) -> SipResponse {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(data.as_bytes(), server.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; 4096];
        let (size, _) = peer.recv_from(&mut buf).await.unwrap();
        SipResponse::parse(&buf[..size]).unwrap()
    }

    async fn server() -> SipServer {
        let (transport, rx) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let server = SipServer::with_transport(transport, rx);
        server.start().unwrap();
        server
    }

    #[tokio::test]
    async fn test_unhandled_method_gets_501() {
        let server = server().await;
        let response = exchange(&server, &options()).await;
        assert_eq!(response.status_code(), 501);
        server.stop();
    }

    #[tokio::test]
    async fn test_panic_becomes_500() {
        let server = server().await;
        server
            .register_handler(SipMethod::Options, Arc::new(PanickingHandler))
            .await;

        let response = exchange(&server, &options()).await;
        assert_eq!(response.status_code(), 500);

        // The server keeps serving after a panic
        let response = exchange(&server, &options()).await;
        assert_eq!(response.status_code(), 500);
        server.stop();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = server().await;
        assert!(server.start().is_err());
        server.stop();
    }
}
