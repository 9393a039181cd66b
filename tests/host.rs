//! End-to-end tests of the connection host over real TLS: the protocol
//! scenarios a conforming client exercises, the anonymity of every reply to
//! a stranger, and the host lifecycle invariants.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{
    self, Certificate, ClientConfig, PrivateKey, RootCertStore, ServerCertVerified,
    ServerCertVerifier, TLSError,
};
use tokio_rustls::webpki::DNSNameRef;
use tokio_rustls::TlsConnector;

use tunneld::host::{ConnectionHost, HostOptions};
use tunneld::protocol::{
    ClientInfo, HelloRequest, HelloResponse, RequestBase, SessionErrorCode, SessionResponseBase,
    UdpChannelRequest, UdpChannelSessionResponse, UdpPacketHeader, UDP_HEADER_LENGTH,
};
use tunneld::session::{
    Session, SessionError, SessionManager, SessionState, UdpChannelState,
};
use tunneld::transport::{ClientStream, EndpointPair, SingleCertificateProvider};

// ---------------------------------------------------------------------------
// A session manager that records how it is called.

struct RecordingSession {
    session_id: u64,
    udp_port: Option<u16>,
    use_udp_channel: AtomicBool,
    datagrams: Mutex<Vec<Vec<u8>>>,
    attached_channels: AtomicUsize,
}

impl RecordingSession {
    fn key(session_id: u64) -> String {
        format!("key-{}", session_id)
    }
}

#[async_trait]
impl Session for RecordingSession {
    fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id,
            session_key: Self::key(self.session_id),
            server_secret: "secret".to_string(),
            udp_channel_key: format!("legacy-{}", self.session_id),
            udp_port: if self.use_udp_channel.load(Ordering::Relaxed) {
                self.udp_port
            } else {
                None
            },
            access_usage: Default::default(),
            suppressed_to: None,
        }
    }

    fn set_use_udp_channel(&self, enabled: bool) {
        self.use_udp_channel.store(enabled, Ordering::Relaxed);
    }

    async fn attach_datagram_channel(&self, stream: Box<dyn ClientStream>) {
        self.attached_channels.fetch_add(1, Ordering::Relaxed);
        drop(stream);
    }

    async fn attach_proxy_channel(
        &self,
        stream: Box<dyn ClientStream>,
        _request: tunneld::protocol::TcpProxyChannelRequest,
    ) -> Result<(), SessionError> {
        self.attached_channels.fetch_add(1, Ordering::Relaxed);
        drop(stream);
        Ok(())
    }

    async fn activate_udp_channel(&self) -> Result<UdpChannelState, SessionError> {
        let udp_port = self
            .udp_port
            .ok_or_else(|| SessionError::general("no UDP endpoint"))?;
        self.use_udp_channel.store(true, Ordering::Relaxed);
        Ok(UdpChannelState {
            udp_key: Self::key(self.session_id),
            udp_port,
        })
    }

    async fn receive_udp_datagram(&self, datagram: &[u8], _from: SocketAddr) {
        self.datagrams.lock().unwrap().push(datagram.to_vec());
    }
}

struct RecordingManager {
    create_calls: AtomicUsize,
    next_session_id: AtomicU64,
    sessions: Mutex<HashMap<u64, Arc<RecordingSession>>>,
    udp_port: Mutex<Option<u16>>,
}

impl RecordingManager {
    fn new() -> RecordingManager {
        RecordingManager {
            create_calls: AtomicUsize::new(0),
            next_session_id: AtomicU64::new(100),
            sessions: Mutex::new(HashMap::new()),
            udp_port: Mutex::new(None),
        }
    }

    fn set_udp_port(&self, port: Option<u16>) {
        *self.udp_port.lock().unwrap() = port;
    }

    fn session(&self, session_id: u64) -> Option<Arc<RecordingSession>> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    fn authenticate(&self, request: &RequestBase) -> Result<Arc<RecordingSession>, SessionError> {
        self.sessions
            .lock()
            .unwrap()
            .get(&request.session_id)
            .filter(|_| request.session_key == RecordingSession::key(request.session_id))
            .cloned()
            .ok_or_else(|| SessionError::general("invalid session id or session key"))
    }
}

#[async_trait]
impl SessionManager for RecordingManager {
    async fn create_session(
        &self,
        _request: &HelloRequest,
        _endpoints: &EndpointPair,
    ) -> Result<Arc<dyn Session>, SessionError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(RecordingSession {
            session_id,
            udp_port: *self.udp_port.lock().unwrap(),
            use_udp_channel: AtomicBool::new(false),
            datagrams: Mutex::new(Vec::new()),
            attached_channels: AtomicUsize::new(0),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, session.clone());
        Ok(session)
    }

    async fn get_session(&self, request: &RequestBase) -> Result<Arc<dyn Session>, SessionError> {
        Ok(self.authenticate(request)?)
    }

    async fn find_session(&self, session_id: u64) -> Option<Arc<dyn Session>> {
        let session = self.session(session_id)?;
        Some(session)
    }

    async fn close_session(&self, request: &RequestBase) -> Result<(), SessionError> {
        self.authenticate(request)?;
        self.sessions.lock().unwrap().remove(&request.session_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness

struct Harness {
    host: Arc<ConnectionHost>,
    manager: Arc<RecordingManager>,
    tcp: SocketAddr,
}

async fn start_host(udp_endpoints: &[&str], options: HostOptions) -> Harness {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let provider = SingleCertificateProvider::new(
        vec![Certificate(cert.serialize_der().unwrap())],
        PrivateKey(cert.serialize_private_key_der()),
    )
    .unwrap();

    let manager = Arc::new(RecordingManager::new());
    let host = ConnectionHost::new(options, manager.clone(), Arc::new(provider));
    let udp: Vec<SocketAddr> = udp_endpoints
        .iter()
        .map(|endpoint| endpoint.parse().unwrap())
        .collect();
    host.start(&["127.0.0.1:0".parse().unwrap()], &udp)
        .await
        .unwrap();
    manager.set_udp_port(host.udp_end_points().first().map(|endpoint| endpoint.port()));

    let tcp = host.tcp_end_points()[0];
    Harness { host, manager, tcp }
}

struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _roots: &RootCertStore,
        _presented_certs: &[rustls::Certificate],
        _dns_name: DNSNameRef<'_>,
        _ocsp_response: &[u8],
    ) -> Result<ServerCertVerified, TLSError> {
        Ok(ServerCertVerified::assertion())
    }
}

async fn connect_tls(address: SocketAddr) -> TlsStream<TcpStream> {
    let mut config = ClientConfig::new();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerify));
    let connector = TlsConnector::from(Arc::new(config));
    let tcp = TcpStream::connect(address).await.unwrap();
    tcp.set_nodelay(true).unwrap();
    connector
        .connect(DNSNameRef::try_from_ascii_str("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

fn hello_request(protocol_version: u32, use_udp_channel: bool) -> HelloRequest {
    HelloRequest {
        request_id: "req-1".to_string(),
        token_id: "t".to_string(),
        client_info: ClientInfo {
            client_id: "c".to_string(),
            protocol_version,
            client_version: "5.0".to_string(),
            user_agent: "ua".to_string(),
        },
        use_udp_channel,
        use_udp_channel2: false,
    }
}

async fn write_frame<W, T>(stream: &mut W, message: &T)
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message).unwrap();
    stream
        .write_all(&(body.len() as u32).to_le_bytes())
        .await
        .unwrap();
    stream.write_all(&body).await.unwrap();
    stream.flush().await.unwrap();
}

async fn read_frame<R, T>(stream: &mut R) -> T
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix).await.unwrap();
    let mut body = vec![0u8; u32::from_le_bytes(prefix) as usize];
    stream.read_exact(&mut body).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

/// Read until the reply's HTTP head is complete.
async fn read_http_head<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
        assert!(head.len() < 4096, "http head never terminated");
    }
    String::from_utf8(head).unwrap()
}

async fn read_line<R: AsyncRead + Unpin>(stream: &mut R) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            line.truncate(line.len() - 2);
            return String::from_utf8(line).unwrap();
        }
    }
}

/// Decode one complete chunked response body (through the zero chunk).
async fn read_chunked_body<R: AsyncRead + Unpin>(stream: &mut R) -> Vec<u8> {
    let mut body = Vec::new();
    loop {
        let size_line = read_line(stream).await;
        let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
        if size == 0 {
            assert_eq!(read_line(stream).await, "");
            return body;
        }
        let mut chunk = vec![0u8; size];
        stream.read_exact(&mut chunk).await.unwrap();
        body.extend_from_slice(&chunk);
        assert_eq!(read_line(stream).await, "");
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) {
    stream
        .write_all(format!("{:x}\r\n", data.len()).as_bytes())
        .await
        .unwrap();
    stream.write_all(data).await.unwrap();
    stream.write_all(b"\r\n").await.unwrap();
    stream.flush().await.unwrap();
}

fn framed(code: u8, body: &impl Serialize) -> Vec<u8> {
    let json = serde_json::to_vec(body).unwrap();
    let mut payload = vec![code];
    payload.extend_from_slice(&(json.len() as u32).to_le_bytes());
    payload.extend_from_slice(&json);
    payload
}

/// The connection should end without the peer sending anything further.
async fn expect_close<R: AsyncRead + Unpin>(stream: &mut R) {
    let mut buf = [0u8; 32];
    match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {}
        Ok(Ok(n)) => panic!("expected close, got {} more bytes", n),
        Err(_) => panic!("expected close, connection stayed open"),
    }
}

// ---------------------------------------------------------------------------
// Scenarios

#[tokio::test]
async fn raw_hello_happy_path() {
    let harness = start_host(&[], HostOptions::default()).await;
    let mut tls = connect_tls(harness.tcp).await;

    tls.write_all(&[0x01, 0x01]).await.unwrap();
    write_frame(&mut tls, &hello_request(2, false)).await;

    let response: HelloResponse = read_frame(&mut tls).await;
    assert_eq!(response.server_protocol_version, 3);
    assert_eq!(response.error_code, SessionErrorCode::Ok);
    assert_eq!(response.session_key, RecordingSession::key(response.session_id));
    assert_eq!(response.udp_port, 0, "no UDP channel was requested");
    assert_eq!(
        response.client_public_address,
        "127.0.0.1".parse::<std::net::IpAddr>().unwrap()
    );
    expect_close(&mut tls).await;

    harness.host.dispose().await;
}

#[tokio::test]
async fn unsupported_client_is_rejected_after_session_creation() {
    let harness = start_host(&[], HostOptions::default()).await;
    let mut tls = connect_tls(harness.tcp).await;

    tls.write_all(&[0x01, 0x01]).await.unwrap();
    write_frame(&mut tls, &hello_request(1, false)).await;

    let response: SessionResponseBase = read_frame(&mut tls).await;
    assert_eq!(response.error_code, SessionErrorCode::UnsupportedClient);
    // The session is created before the version check, so an outdated client
    // is indistinguishable from a current one until the reply.
    assert_eq!(harness.manager.create_calls.load(Ordering::SeqCst), 1);
    expect_close(&mut tls).await;

    harness.host.dispose().await;
}

#[tokio::test]
async fn unknown_request_code_gets_the_anonymous_reply() {
    let harness = start_host(&[], HostOptions::default()).await;
    let mut tls = connect_tls(harness.tcp).await;

    tls.write_all(&[0x01, 0xFF]).await.unwrap();
    tls.flush().await.unwrap();

    let head = read_http_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
    assert!(head.contains("Server: Kestrel\r\n"));
    assert!(head.contains("WWW-Authenticate: Bearer\r\n"));
    expect_close(&mut tls).await;

    harness.host.dispose().await;
}

#[tokio::test]
async fn malformed_requests_all_get_the_anonymous_reply() {
    let harness = start_host(&[], HostOptions::default()).await;

    // An unknown code, a valid Hello code with garbage JSON, and a frame
    // whose declared length blows the ceiling.
    let mut garbage_frame = vec![0x01, 0x01];
    garbage_frame.extend_from_slice(&4u32.to_le_bytes());
    garbage_frame.extend_from_slice(b"!!!!");
    let mut huge_frame = vec![0x01, 0x01];
    huge_frame.extend_from_slice(&(64 * 1024 * 1024u32).to_le_bytes());

    for payload in [vec![0x01, 0x00], garbage_frame, huge_frame] {
        let mut tls = connect_tls(harness.tcp).await;
        tls.write_all(&payload).await.unwrap();
        tls.flush().await.unwrap();

        let head = read_http_head(&mut tls).await;
        assert!(head.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(
            !head.to_ascii_lowercase().contains("session"),
            "anonymous reply must not leak session details"
        );
        expect_close(&mut tls).await;
    }

    harness.host.dispose().await;
}

#[tokio::test]
async fn bye_with_a_bad_session_key_gets_a_session_error() {
    let harness = start_host(&[], HostOptions::default()).await;

    // Establish a session first so the id exists.
    let mut tls = connect_tls(harness.tcp).await;
    tls.write_all(&[0x01, 0x01]).await.unwrap();
    write_frame(&mut tls, &hello_request(2, false)).await;
    let hello: HelloResponse = read_frame(&mut tls).await;
    expect_close(&mut tls).await;

    let mut tls = connect_tls(harness.tcp).await;
    tls.write_all(&[0x01, 0x05]).await.unwrap();
    write_frame(
        &mut tls,
        &RequestBase {
            session_id: hello.session_id,
            session_key: "wrong".to_string(),
            request_id: "req-2".to_string(),
        },
    )
    .await;

    let response: SessionResponseBase = read_frame(&mut tls).await;
    assert_ne!(response.error_code, SessionErrorCode::Ok);
    expect_close(&mut tls).await;
    // The session survived the failed Bye.
    assert!(harness.manager.session(hello.session_id).is_some());

    harness.host.dispose().await;
}

#[tokio::test]
async fn chunked_transport_reuses_the_connection_across_requests() {
    let harness = start_host(&["127.0.0.1:0"], HostOptions::default()).await;
    let mut tls = connect_tls(harness.tcp).await;

    // First exchange: Hello inside a chunked HTTP request.
    tls.write_all(b"POST /tunnel HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n")
        .await
        .unwrap();
    write_chunk(&mut tls, &framed(0x01, &hello_request(2, true))).await;

    let head = read_http_head(&mut tls).await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    let body = read_chunked_body(&mut tls).await;
    let hello: HelloResponse = {
        let mut cursor = std::io::Cursor::new(body);
        let mut prefix = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut prefix).unwrap();
        serde_json::from_reader(cursor).unwrap()
    };
    assert_eq!(hello.server_protocol_version, 3);
    assert_eq!(hello.error_code, SessionErrorCode::Ok);

    // Terminate the first request body, then reuse the TLS stream for two
    // more exchanges, each with its own head and chunked body.
    let base = RequestBase {
        session_id: hello.session_id,
        session_key: hello.session_key.clone(),
        request_id: "req-2".to_string(),
    };
    for _ in 0..2 {
        tls.write_all(b"0\r\n\r\n").await.unwrap();
        tls.write_all(
            b"POST /tunnel HTTP/1.1\r\nHost: localhost\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .await
        .unwrap();
        write_chunk(
            &mut tls,
            &framed(0x04, &UdpChannelRequest { base: base.clone() }),
        )
        .await;

        let head = read_http_head(&mut tls).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let body = read_chunked_body(&mut tls).await;
        let response: UdpChannelSessionResponse = {
            let mut cursor = std::io::Cursor::new(body);
            let mut prefix = [0u8; 4];
            std::io::Read::read_exact(&mut cursor, &mut prefix).unwrap();
            serde_json::from_reader(cursor).unwrap()
        };
        assert_eq!(response.error_code, SessionErrorCode::Ok);
        assert_eq!(response.udp_port, harness.host.udp_end_points()[0].port());
    }

    harness.host.dispose().await;
}

#[tokio::test]
async fn udp_datagrams_demux_in_order_and_unknown_ids_are_dropped() {
    let harness = start_host(&["127.0.0.1:0"], HostOptions::default()).await;
    let udp = harness.host.udp_end_points()[0];

    // Create a session over TCP first.
    let mut tls = connect_tls(harness.tcp).await;
    tls.write_all(&[0x01, 0x01]).await.unwrap();
    write_frame(&mut tls, &hello_request(2, true)).await;
    let hello: HelloResponse = read_frame(&mut tls).await;
    expect_close(&mut tls).await;

    let client = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let packet = |session_id: u64, marker: u8| {
        let mut datagram = vec![0u8; UDP_HEADER_LENGTH + 16];
        UdpPacketHeader {
            session_id,
            integrity_tag: [marker; 8],
        }
        .write(&mut datagram);
        datagram[UDP_HEADER_LENGTH..].copy_from_slice(&[marker; 16]);
        datagram
    };

    for marker in 1..=3u8 {
        client
            .send_to(&packet(hello.session_id, marker), udp)
            .await
            .unwrap();
    }
    // A datagram for an unknown session draws no reply and no delivery.
    client.send_to(&packet(0xBAD, 9), udp).await.unwrap();
    let mut buf = [0u8; 64];
    assert!(
        tokio::time::timeout(Duration::from_millis(300), client.recv(&mut buf))
            .await
            .is_err(),
        "the transmitter must never reply"
    );

    let session = harness.manager.session(hello.session_id).unwrap();
    let datagrams = session.datagrams.lock().unwrap().clone();
    assert_eq!(datagrams.len(), 3, "only the live session's datagrams arrive");
    for (index, datagram) in datagrams.iter().enumerate() {
        let marker = (index + 1) as u8;
        assert!(
            datagram.iter().all(|byte| *byte == marker),
            "datagrams must arrive in receipt order"
        );
    }

    harness.host.dispose().await;
}

// ---------------------------------------------------------------------------
// Lifecycle invariants

#[tokio::test]
async fn start_requires_a_tcp_endpoint() {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let provider = SingleCertificateProvider::new(
        vec![Certificate(cert.serialize_der().unwrap())],
        PrivateKey(cert.serialize_private_key_der()),
    )
    .unwrap();
    let host = ConnectionHost::new(
        HostOptions::default(),
        Arc::new(RecordingManager::new()),
        Arc::new(provider),
    );

    let error = host.start(&[], &[]).await.unwrap_err();
    assert!(error.to_string().contains("No TcpEndPoint"));
    assert!(!host.is_started());
}

#[tokio::test]
async fn start_stop_start_works_but_double_start_does_not() {
    let harness = start_host(&[], HostOptions::default()).await;
    let tcp_endpoints = ["127.0.0.1:0".parse().unwrap()];

    assert!(harness.host.start(&tcp_endpoints, &[]).await.is_err());

    harness.host.stop().await;
    assert!(!harness.host.is_started());
    harness.host.start(&tcp_endpoints, &[]).await.unwrap();
    assert!(harness.host.is_started());

    harness.host.dispose().await;
    assert!(harness.host.is_disposed());
    assert!(matches!(
        harness.host.start(&tcp_endpoints, &[]).await,
        Err(tunneld::host::StartError::Disposed)
    ));
}

#[tokio::test]
async fn zero_udp_ports_resolve_to_distinct_real_ports() {
    let harness = start_host(&["127.0.0.1:0", "127.0.0.1:0"], HostOptions::default()).await;
    let udp = harness.host.udp_end_points();
    assert_eq!(udp.len(), 2);
    assert!(udp.iter().all(|endpoint| endpoint.port() != 0));
    assert_ne!(udp[0].port(), udp[1].port());

    harness.host.dispose().await;
}

#[tokio::test]
async fn stop_interrupts_a_connection_mid_exchange() {
    let harness = start_host(&[], HostOptions::default()).await;

    // TLS is up but the request never arrives; the exchange is mid-flight.
    let mut tls = connect_tls(harness.tcp).await;
    tls.write_all(&[0x01]).await.unwrap();
    tls.flush().await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), harness.host.stop())
        .await
        .expect("stop must not wait out the request timeout");
    assert!(!harness.host.is_started());
    expect_close(&mut tls).await;
}

#[tokio::test]
async fn idle_requests_time_out() {
    let options = HostOptions {
        request_timeout: Duration::from_millis(300),
        ..HostOptions::default()
    };
    let harness = start_host(&[], options).await;

    let mut tls = connect_tls(harness.tcp).await;
    // Say nothing after the handshake; the server must hang up on its own.
    expect_close(&mut tls).await;

    harness.host.dispose().await;
}
