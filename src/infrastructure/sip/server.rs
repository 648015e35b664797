//! SIP server: transport aggregation and method dispatch
//!
//! All three listeners feed one dispatcher. Requests are keyed on method;
//! unknown methods get 501, OPTIONS is answered in place. Responses are
//! routed to the client transaction that owns their Via branch.

use rsip::Header;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::builder::ResponseBuilder;
use super::message::{SipError, SipMessage, SipMethod, SipRequest, SipResponse};
use super::transport::{
    IncomingMessage, ParseFailures, TcpTransport, TlsIdentity, TlsTransport, TransportProtocol,
    UdpTransport,
};
use crate::config::SipConfig;

/// Methods advertised in OPTIONS responses
const ALLOWED_METHODS: &str = "INVITE, ACK, CANCEL, BYE, REGISTER, OPTIONS, NOTIFY, REFER, INFO";

/// A registered request handler. Returning `Ok(None)` means the handler
/// owns the response lifecycle itself (INVITE forking).
#[async_trait::async_trait]
pub trait SipHandler: Send + Sync {
    async fn handle_request(
        &self,
        request: SipRequest,
        source: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<Option<SipResponse>, SipError>;
}

/// Sends SIP messages out of the server's sockets.
#[derive(Clone)]
pub struct SipSender {
    udp: Arc<UdpSocket>,
}

impl SipSender {
    pub fn new(udp: Arc<UdpSocket>) -> Self {
        Self { udp }
    }

    /// The UDP socket messages are sent from; tests and client loops read
    /// replies off it directly when no server dispatch loop is running.
    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.udp.clone()
    }

    pub async fn send(
        &self,
        data: Bytes,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<(), SipError> {
        match protocol {
            TransportProtocol::Udp => {
                self.udp
                    .send_to(&data, destination)
                    .await
                    .map_err(|e| SipError::Transport(format!("UDP send: {}", e)))?;
                Ok(())
            }
            TransportProtocol::Tcp | TransportProtocol::Tls => {
                use tokio::io::AsyncWriteExt;
                let mut stream = tokio::net::TcpStream::connect(destination)
                    .await
                    .map_err(|e| SipError::Transport(format!("TCP connect: {}", e)))?;
                stream
                    .write_all(&data)
                    .await
                    .map_err(|e| SipError::Transport(format!("TCP send: {}", e)))?;
                Ok(())
            }
        }
    }

    pub async fn send_request(
        &self,
        request: &SipRequest,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<(), SipError> {
        self.send(request.to_bytes(), destination, protocol).await
    }

    pub async fn send_response(
        &self,
        response: &SipResponse,
        destination: SocketAddr,
        protocol: TransportProtocol,
    ) -> Result<(), SipError> {
        self.send(response.to_bytes(), destination, protocol).await
    }
}

/// Routes responses to pending client transactions by Via branch.
pub struct TransactionRegistry {
    pending: Mutex<HashMap<String, mpsc::Sender<SipResponse>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self, branch: &str) -> mpsc::Receiver<SipResponse> {
        let (tx, rx) = mpsc::channel(8);
        self.pending.lock().await.insert(branch.to_string(), tx);
        rx
    }

    pub async fn deregister(&self, branch: &str) {
        self.pending.lock().await.remove(branch);
    }

    pub async fn route(&self, response: SipResponse) {
        let branch = match response.via_branch() {
            Some(branch) => branch,
            None => {
                debug!("response without Via branch dropped");
                return;
            }
        };
        let tx = self.pending.lock().await.get(&branch).cloned();
        match tx {
            Some(tx) => {
                if tx.send(response).await.is_err() {
                    debug!(branch, "client transaction gone, response dropped");
                }
            }
            None => debug!(branch, "no transaction for response, dropped"),
        }
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The SIP server
pub struct SipServer {
    config: SipConfig,
    handlers: Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>,
    transactions: Arc<TransactionRegistry>,
    failures: Arc<ParseFailures>,
    incoming_tx: mpsc::Sender<IncomingMessage>,
    incoming_rx: Option<mpsc::Receiver<IncomingMessage>>,
    sender: Option<SipSender>,
    shutdown_tx: watch::Sender<bool>,
    /// Prepared TLS config from the ACME collaborator, if any
    tls_identity: Option<TlsIdentity>,
}

impl SipServer {
    pub fn new(config: SipConfig) -> Self {
        let (incoming_tx, incoming_rx) = mpsc::channel(1024);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            transactions: Arc::new(TransactionRegistry::new()),
            failures: Arc::new(ParseFailures::default()),
            incoming_tx,
            incoming_rx: Some(incoming_rx),
            sender: None,
            shutdown_tx,
            tls_identity: None,
        }
    }

    /// Install a prepared TLS config (from the external ACME collaborator)
    /// instead of loading cert files.
    pub fn with_tls_identity(mut self, identity: TlsIdentity) -> Self {
        self.tls_identity = Some(identity);
        self
    }

    pub async fn register_handler(&self, method: SipMethod, handler: Arc<dyn SipHandler>) {
        self.handlers.write().await.insert(method, handler);
        info!("registered handler for {}", method);
    }

    pub fn transactions(&self) -> Arc<TransactionRegistry> {
        self.transactions.clone()
    }

    /// Available after `start`.
    pub fn sender(&self) -> Option<SipSender> {
        self.sender.clone()
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        info!("starting SIP server, realm {}", self.config.realm);

        let mut udp = UdpTransport::new(
            self.config.udp_bind,
            self.incoming_tx.clone(),
            self.failures.clone(),
        );
        udp.start().await?;
        let udp_socket = udp
            .socket()
            .ok_or_else(|| SipError::Internal("UDP socket missing after start".into()))?;
        let sender = SipSender::new(udp_socket);
        self.sender = Some(sender.clone());

        if self.config.enable_tcp {
            let mut tcp = TcpTransport::new(
                self.config.tcp_bind,
                self.incoming_tx.clone(),
                self.failures.clone(),
            );
            tcp.start().await?;
        }

        if self.config.enable_tls {
            let identity = self.tls_identity.take().unwrap_or(TlsIdentity::CertFiles {
                cert_path: self.config.tls_cert_path.clone(),
                key_path: self.config.tls_key_path.clone(),
            });
            let mut tls = TlsTransport::new(
                self.config.tls_bind,
                identity,
                self.incoming_tx.clone(),
                self.failures.clone(),
            );
            match tls.start().await {
                Ok(()) => {}
                Err(e) => warn!("TLS transport unavailable: {}", e),
            }
        }

        let mut rx = self
            .incoming_rx
            .take()
            .ok_or_else(|| SipError::Internal("server already started".into()))?;
        let handlers = self.handlers.clone();
        let transactions = self.transactions.clone();
        let dispatch_sender = sender.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    incoming = rx.recv() => match incoming {
                        Some(incoming) => incoming,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                };
                match incoming.message {
                    SipMessage::Request(request) => {
                        let handlers = handlers.clone();
                        let sender = dispatch_sender.clone();
                        tokio::spawn(async move {
                            dispatch_request(
                                request,
                                incoming.source,
                                incoming.protocol,
                                handlers,
                                sender,
                            )
                            .await;
                        });
                    }
                    SipMessage::Response(response) => {
                        transactions.route(response).await;
                    }
                }
            }
            debug!("SIP dispatch loop ended");
        });

        // parse failure rate monitor
        let failures = self.failures.clone();
        let threshold = self.config.parse_failure_warn_threshold;
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let count = failures.take();
                        if count > threshold {
                            warn!(count, threshold, "high SIP parse failure rate");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        });

        info!("SIP server started");
        Ok(())
    }

    pub fn stop(&self) {
        info!("stopping SIP server");
        let _ = self.shutdown_tx.send(true);
    }
}

async fn dispatch_request(
    request: SipRequest,
    source: SocketAddr,
    protocol: TransportProtocol,
    handlers: Arc<RwLock<HashMap<SipMethod, Arc<dyn SipHandler>>>>,
    sender: SipSender,
) {
    let method = match request.method() {
        Some(method) => method,
        None => {
            reply(&request, ResponseBuilder::not_implemented(), &sender, source, protocol).await;
            return;
        }
    };
    debug!(%source, %method, "dispatching SIP request");

    let handler = handlers.read().await.get(&method).cloned();
    match handler {
        Some(handler) => match handler.handle_request(request.clone(), source, protocol).await {
            Ok(Some(response)) => {
                if let Err(e) = sender.send_response(&response, source, protocol).await {
                    error!(%source, "failed to send response: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(%source, %method, "handler error: {}", e);
                reply(
                    &request,
                    ResponseBuilder::server_internal_error(),
                    &sender,
                    source,
                    protocol,
                )
                .await;
            }
        },
        None if method == SipMethod::Options => {
            let builder = ResponseBuilder::ok()
                .header(Header::Allow(ALLOWED_METHODS.into()))
                .header(Header::Accept("application/sdp".into()));
            reply(&request, builder, &sender, source, protocol).await;
        }
        None if method == SipMethod::Ack => {
            // stray ACKs are absorbed
        }
        None => {
            warn!(%method, "no handler registered, replying 501");
            reply(&request, ResponseBuilder::not_implemented(), &sender, source, protocol).await;
        }
    }
}

async fn reply(
    request: &SipRequest,
    builder: ResponseBuilder,
    sender: &SipSender,
    source: SocketAddr,
    protocol: TransportProtocol,
) {
    match builder.build_for_request(request) {
        Ok(response) => {
            if let Err(e) = sender.send_response(&response, source, protocol).await {
                error!(%source, "failed to send response: {}", e);
            }
        }
        Err(e) => error!("failed to build response: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(udp_port: u16) -> SipConfig {
        SipConfig {
            udp_bind: format!("127.0.0.1:{}", udp_port).parse().unwrap(),
            tcp_bind: "127.0.0.1:0".parse().unwrap(),
            enable_tcp: false,
            enable_tls: false,
            ..SipConfig::default()
        }
    }

    async fn probe(server_port: u16, request: &[u8]) -> SipResponse {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(request, ("127.0.0.1", server_port))
            .await
            .unwrap();
        let mut buf = [0u8; 4096];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .expect("no reply")
            .unwrap();
        SipResponse::parse(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_options_answered_with_allow() {
        // fixed ephemeral-ish port chosen by binding a throwaway socket
        let throwaway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = throwaway.local_addr().unwrap().port();
        drop(throwaway);

        let mut server = SipServer::new(test_config(port));
        server.start().await.unwrap();

        let response = probe(
            port,
            b"OPTIONS sip:pbx SIP/2.0\r\n\
              Via: SIP/2.0/UDP 127.0.0.1:9;branch=z9hG4bKopt\r\n\
              From: <sip:probe@x>;tag=1\r\nTo: <sip:pbx@x>\r\n\
              Call-ID: opt1\r\nCSeq: 1 OPTIONS\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert_eq!(response.status_code(), 200);
        server.stop();
    }

    #[tokio::test]
    async fn test_unknown_method_gets_501() {
        let throwaway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = throwaway.local_addr().unwrap().port();
        drop(throwaway);

        let mut server = SipServer::new(test_config(port));
        server.start().await.unwrap();

        let response = probe(
            port,
            b"SUBSCRIBE sip:pbx SIP/2.0\r\n\
              Via: SIP/2.0/UDP 127.0.0.1:9;branch=z9hG4bKsub\r\n\
              From: <sip:probe@x>;tag=1\r\nTo: <sip:pbx@x>\r\n\
              Call-ID: sub1\r\nCSeq: 1 SUBSCRIBE\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert_eq!(response.status_code(), 501);
        server.stop();
    }

    #[tokio::test]
    async fn test_response_routed_to_transaction() {
        let registry = TransactionRegistry::new();
        let mut rx = registry.register("z9hG4bKtxn1").await;

        let response = SipResponse::parse(
            b"SIP/2.0 200 OK\r\n\
              Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKtxn1\r\n\
              From: <sip:a@x>;tag=1\r\nTo: <sip:b@x>;tag=2\r\n\
              Call-ID: c1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        registry.route(response).await;

        let routed = rx.try_recv().unwrap();
        assert_eq!(routed.status_code(), 200);

        registry.deregister("z9hG4bKtxn1").await;
    }

    #[tokio::test]
    async fn test_handler_response_forwarded() {
        struct Teapot;
        #[async_trait::async_trait]
        impl SipHandler for Teapot {
            async fn handle_request(
                &self,
                request: SipRequest,
                _source: SocketAddr,
                _protocol: TransportProtocol,
            ) -> Result<Option<SipResponse>, SipError> {
                Ok(Some(
                    ResponseBuilder::new(486).build_for_request(&request)?,
                ))
            }
        }

        let throwaway = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = throwaway.local_addr().unwrap().port();
        drop(throwaway);

        let mut server = SipServer::new(test_config(port));
        server
            .register_handler(SipMethod::Invite, Arc::new(Teapot))
            .await;
        server.start().await.unwrap();

        let response = probe(
            port,
            b"INVITE sip:100@pbx SIP/2.0\r\n\
              Via: SIP/2.0/UDP 127.0.0.1:9;branch=z9hG4bKinv\r\n\
              From: <sip:probe@x>;tag=1\r\nTo: <sip:100@pbx>\r\n\
              Call-ID: inv1\r\nCSeq: 1 INVITE\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        assert_eq!(response.status_code(), 486);
        server.stop();
    }
}
