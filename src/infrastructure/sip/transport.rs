//! SIP transport listeners - UDP, TCP, TLS
//!
//! Every listener parses inbound traffic and feeds a shared channel of
//! `IncomingMessage`. Malformed datagrams are counted and dropped; a parse
//! rate above the configured threshold logs at warn level.

use bytes::Bytes;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use super::message::{SipError, SipMessage};

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            TransportProtocol::Udp | TransportProtocol::Tcp => 5060,
            TransportProtocol::Tls => 5061,
        }
    }
}

/// Parsed message plus its origin
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub message: SipMessage,
    pub source: SocketAddr,
    pub protocol: TransportProtocol,
}

/// Shared failure counter; the dispatcher samples it once a minute and
/// warns when the rate crosses the operator threshold.
#[derive(Debug, Default)]
pub struct ParseFailures {
    count: AtomicU64,
}

impl ParseFailures {
    pub fn bump(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("pbx_sip_parse_failures_total").increment(1);
    }

    /// Current count, resetting to zero.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

fn parse_and_forward(
    data: &[u8],
    source: SocketAddr,
    protocol: TransportProtocol,
    tx: &mpsc::Sender<IncomingMessage>,
    failures: &ParseFailures,
) {
    match SipMessage::parse(data) {
        Ok(message) => {
            let incoming = IncomingMessage {
                message,
                source,
                protocol,
            };
            if tx.try_send(incoming).is_err() {
                warn!(%source, "inbound SIP queue full, message dropped");
            }
        }
        Err(e) => {
            failures.bump();
            debug!(%source, "dropping unparseable {} message: {}", protocol.as_str(), e);
        }
    }
}

/// UDP transport
pub struct UdpTransport {
    bind_addr: SocketAddr,
    socket: Option<Arc<UdpSocket>>,
    tx: mpsc::Sender<IncomingMessage>,
    failures: Arc<ParseFailures>,
}

impl UdpTransport {
    pub fn new(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
        failures: Arc<ParseFailures>,
    ) -> Self {
        Self {
            bind_addr,
            socket: None,
            tx,
            failures,
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        let socket = UdpSocket::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("bind UDP {}: {}", self.bind_addr, e)))?;
        let local = socket
            .local_addr()
            .map_err(|e| SipError::Transport(e.to_string()))?;
        info!("UDP transport listening on {}", local);

        let socket = Arc::new(socket);
        self.socket = Some(socket.clone());

        let tx = self.tx.clone();
        let failures = self.failures.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 65535];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((size, source)) => {
                        parse_and_forward(
                            &buf[..size],
                            source,
                            TransportProtocol::Udp,
                            &tx,
                            &failures,
                        );
                    }
                    Err(e) => {
                        error!("UDP receive failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// The bound socket, for sending replies and client requests.
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.clone()
    }

    pub async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SipError::Transport("UDP transport not started".into()))?;
        socket
            .send_to(&data, destination)
            .await
            .map_err(|e| SipError::Transport(format!("UDP send to {}: {}", destination, e)))?;
        Ok(())
    }
}

/// TCP transport
pub struct TcpTransport {
    bind_addr: SocketAddr,
    tx: mpsc::Sender<IncomingMessage>,
    failures: Arc<ParseFailures>,
}

impl TcpTransport {
    pub fn new(
        bind_addr: SocketAddr,
        tx: mpsc::Sender<IncomingMessage>,
        failures: Arc<ParseFailures>,
    ) -> Self {
        Self {
            bind_addr,
            tx,
            failures,
        }
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("bind TCP {}: {}", self.bind_addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| SipError::Transport(e.to_string()))?;
        info!("TCP transport listening on {}", local);

        let tx = self.tx.clone();
        let failures = self.failures.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, source)) => {
                        debug!("accepted TCP connection from {}", source);
                        let tx = tx.clone();
                        let failures = failures.clone();
                        tokio::spawn(async move {
                            read_stream(stream, source, TransportProtocol::Tcp, tx, failures)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("TCP accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn send(&self, data: Bytes, destination: SocketAddr) -> Result<(), SipError> {
        use tokio::io::AsyncWriteExt;
        let mut stream = TcpStream::connect(destination)
            .await
            .map_err(|e| SipError::Transport(format!("TCP connect {}: {}", destination, e)))?;
        stream
            .write_all(&data)
            .await
            .map_err(|e| SipError::Transport(format!("TCP send: {}", e)))?;
        Ok(())
    }
}

async fn read_stream<S>(
    mut stream: S,
    source: SocketAddr,
    protocol: TransportProtocol,
    tx: mpsc::Sender<IncomingMessage>,
    failures: Arc<ParseFailures>,
) where
    S: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut buf = vec![0u8; 65535];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                debug!("{} connection closed by {}", protocol.as_str(), source);
                break;
            }
            Ok(size) => {
                parse_and_forward(&buf[..size], source, protocol, &tx, &failures);
            }
            Err(e) => {
                debug!("{} read from {} failed: {}", protocol.as_str(), source, e);
                break;
            }
        }
    }
}

/// How the TLS transport obtains its server configuration: a prepared
/// config from an external collaborator (ACME), or a static cert/key pair.
pub enum TlsIdentity {
    Prepared(Arc<ServerConfig>),
    CertFiles { cert_path: String, key_path: String },
}

/// TLS transport (server side)
pub struct TlsTransport {
    bind_addr: SocketAddr,
    identity: TlsIdentity,
    tx: mpsc::Sender<IncomingMessage>,
    failures: Arc<ParseFailures>,
}

impl TlsTransport {
    pub fn new(
        bind_addr: SocketAddr,
        identity: TlsIdentity,
        tx: mpsc::Sender<IncomingMessage>,
        failures: Arc<ParseFailures>,
    ) -> Self {
        Self {
            bind_addr,
            identity,
            tx,
            failures,
        }
    }

    fn load_config(cert_path: &str, key_path: &str) -> Result<ServerConfig, SipError> {
        let cert_file = File::open(cert_path)
            .map_err(|e| SipError::Transport(format!("open {}: {}", cert_path, e)))?;
        let cert_chain: Vec<_> = certs(&mut BufReader::new(cert_file))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SipError::Transport(format!("parse certificates: {}", e)))?;
        if cert_chain.is_empty() {
            return Err(SipError::Transport("no certificates found".into()));
        }

        let key_file = File::open(key_path)
            .map_err(|e| SipError::Transport(format!("open {}: {}", key_path, e)))?;
        let key = private_key(&mut BufReader::new(key_file))
            .map_err(|e| SipError::Transport(format!("parse private key: {}", e)))?
            .ok_or_else(|| SipError::Transport("no private key found".into()))?;

        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)
            .map_err(|e| SipError::Transport(format!("TLS config: {}", e)))
    }

    pub async fn start(&mut self) -> Result<(), SipError> {
        let config = match &self.identity {
            TlsIdentity::Prepared(config) => config.clone(),
            TlsIdentity::CertFiles {
                cert_path,
                key_path,
            } => Arc::new(Self::load_config(cert_path, key_path)?),
        };
        let acceptor = TlsAcceptor::from(config);

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("bind TLS {}: {}", self.bind_addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| SipError::Transport(e.to_string()))?;
        info!("TLS transport listening on {}", local);

        let tx = self.tx.clone();
        let failures = self.failures.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, source)) => {
                        let acceptor = acceptor.clone();
                        let tx = tx.clone();
                        let failures = failures.clone();
                        tokio::spawn(async move {
                            match acceptor.accept(stream).await {
                                Ok(tls_stream) => {
                                    debug!("TLS handshake complete for {}", source);
                                    read_stream(
                                        tls_stream,
                                        source,
                                        TransportProtocol::Tls,
                                        tx,
                                        failures,
                                    )
                                    .await;
                                }
                                Err(e) => {
                                    warn!("TLS handshake with {} failed: {}", source, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("TLS accept failed: {}", e);
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_transport_receives_and_counts_failures() {
        let (tx, mut rx) = mpsc::channel(16);
        let failures = Arc::new(ParseFailures::default());
        let mut transport =
            UdpTransport::new("127.0.0.1:0".parse().unwrap(), tx, failures.clone());
        transport.start().await.unwrap();
        let local = transport.socket().unwrap().local_addr().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"garbage \x01\x02", local).await.unwrap();
        client
            .send_to(
                b"OPTIONS sip:pbx SIP/2.0\r\n\
                  Via: SIP/2.0/UDP 127.0.0.1:9;branch=z9hG4bKx\r\n\
                  From: <sip:probe@x>;tag=1\r\n\
                  To: <sip:pbx@x>\r\n\
                  Call-ID: t1\r\n\
                  CSeq: 1 OPTIONS\r\n\
                  Content-Length: 0\r\n\r\n",
                local,
            )
            .await
            .unwrap();

        let incoming = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("no message")
            .unwrap();
        assert_eq!(incoming.protocol, TransportProtocol::Udp);
        assert_eq!(failures.take(), 1);
    }

    #[tokio::test]
    async fn test_tcp_transport_accepts_stream() {
        let (tx, mut rx) = mpsc::channel(16);
        let failures = Arc::new(ParseFailures::default());
        // bind on an ephemeral port by asking the OS first
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);
        let mut transport = TcpTransport::new(addr, tx, failures);
        transport.start().await.unwrap();

        use tokio::io::AsyncWriteExt;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"OPTIONS sip:pbx SIP/2.0\r\n\
                  Via: SIP/2.0/TCP 127.0.0.1:9;branch=z9hG4bKy\r\n\
                  From: <sip:probe@x>;tag=1\r\n\
                  To: <sip:pbx@x>\r\n\
                  Call-ID: t2\r\n\
                  CSeq: 1 OPTIONS\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();

        let incoming = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("no message")
            .unwrap();
        assert_eq!(incoming.protocol, TransportProtocol::Tcp);
    }

    #[tokio::test]
    async fn test_tls_transport_missing_cert_fails() {
        let (tx, _rx) = mpsc::channel(16);
        let failures = Arc::new(ParseFailures::default());
        let mut transport = TlsTransport::new(
            "127.0.0.1:0".parse().unwrap(),
            TlsIdentity::CertFiles {
                cert_path: "/nonexistent/cert.pem".into(),
                key_path: "/nonexistent/key.pem".into(),
            },
            tx,
            failures,
        );
        assert!(transport.start().await.is_err());
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(TransportProtocol::Udp.default_port(), 5060);
        assert_eq!(TransportProtocol::Tls.default_port(), 5061);
    }
}
