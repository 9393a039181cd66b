//! An in-process session registry.
//!
//! Accepts every token (admission policy belongs to the real session layer),
//! issues random key material, counts traffic, splices proxy channels, and
//! drains datagram channels. Enough to run the server standalone and to
//! exercise the host in tests.

use async_trait::async_trait;
use rand::RngCore;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::{Session, SessionError, SessionManager, SessionState, UdpChannelState};
use crate::protocol::{
    AccessUsage, HelloRequest, RequestBase, SessionErrorCode, TcpProxyChannelRequest,
};
use crate::transport::{ClientStream, EndpointPair};

fn random_key() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[derive(Default)]
struct Traffic {
    sent: AtomicU64,
    received: AtomicU64,
}

pub struct MemorySession {
    session_id: u64,
    session_key: String,
    server_secret: String,
    udp_channel_key: String,
    udp_port: Mutex<Option<u16>>,
    use_udp_channel: AtomicBool,
    traffic: Arc<Traffic>,
    channels: Mutex<Vec<JoinHandle<()>>>,
}

impl MemorySession {
    fn new(session_id: u64, udp_port: Option<u16>) -> MemorySession {
        MemorySession {
            session_id,
            session_key: random_key(),
            server_secret: random_key(),
            udp_channel_key: random_key(),
            udp_port: Mutex::new(udp_port),
            use_udp_channel: AtomicBool::new(false),
            traffic: Arc::new(Traffic::default()),
            channels: Mutex::new(Vec::new()),
        }
    }

    fn close(&self) {
        for channel in self.channels.lock().unwrap().drain(..) {
            channel.abort();
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id,
            session_key: self.session_key.clone(),
            server_secret: self.server_secret.clone(),
            udp_channel_key: self.udp_channel_key.clone(),
            udp_port: if self.use_udp_channel.load(Ordering::Relaxed) {
                *self.udp_port.lock().unwrap()
            } else {
                None
            },
            access_usage: AccessUsage {
                sent_traffic: self.traffic.sent.load(Ordering::Relaxed),
                received_traffic: self.traffic.received.load(Ordering::Relaxed),
                ..AccessUsage::default()
            },
            suppressed_to: None,
        }
    }

    fn set_use_udp_channel(&self, enabled: bool) {
        self.use_udp_channel.store(enabled, Ordering::Relaxed);
    }

    async fn attach_datagram_channel(&self, mut stream: Box<dyn ClientStream>) {
        let traffic = self.traffic.clone();
        let session_id = self.session_id;
        let pump = tokio::spawn(async move {
            let mut buffer = [0u8; 8192];
            loop {
                match stream.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        traffic.received.fetch_add(n as u64, Ordering::Relaxed);
                    }
                }
            }
            debug!(session_id, "datagram channel closed");
        });
        self.channels.lock().unwrap().push(pump);
    }

    async fn attach_proxy_channel(
        &self,
        mut stream: Box<dyn ClientStream>,
        request: TcpProxyChannelRequest,
    ) -> Result<(), SessionError> {
        let mut outbound = TcpStream::connect(request.destination_end_point)
            .await
            .map_err(|error| {
                SessionError::general(format!(
                    "could not reach {}: {}",
                    request.destination_end_point, error
                ))
            })?;
        let traffic = self.traffic.clone();
        let session_id = self.session_id;
        let pump = tokio::spawn(async move {
            match tokio::io::copy_bidirectional(&mut stream, &mut outbound).await {
                Ok((to_destination, to_client)) => {
                    traffic.received.fetch_add(to_destination, Ordering::Relaxed);
                    traffic.sent.fetch_add(to_client, Ordering::Relaxed);
                }
                Err(error) => debug!(session_id, %error, "proxy channel ended"),
            }
        });
        self.channels.lock().unwrap().push(pump);
        Ok(())
    }

    async fn activate_udp_channel(&self) -> Result<UdpChannelState, SessionError> {
        let udp_port = self.udp_port.lock().unwrap().ok_or_else(|| {
            SessionError::general("no UDP endpoint is available on this server")
        })?;
        self.use_udp_channel.store(true, Ordering::Relaxed);
        Ok(UdpChannelState {
            udp_key: self.session_key.clone(),
            udp_port,
        })
    }

    async fn receive_udp_datagram(&self, datagram: &[u8], _from: SocketAddr) {
        self.traffic
            .received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);
    }
}

pub struct MemorySessionManager {
    sessions: Mutex<HashMap<u64, Arc<MemorySession>>>,
    next_session_id: AtomicU64,
    udp_port: Mutex<Option<u16>>,
}

impl MemorySessionManager {
    pub fn new() -> MemorySessionManager {
        MemorySessionManager {
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            udp_port: Mutex::new(None),
        }
    }

    /// Tell new sessions which UDP port the host resolved, once it is known.
    pub fn set_udp_port(&self, port: Option<u16>) {
        *self.udp_port.lock().unwrap() = port;
    }

    fn authenticate(&self, request: &RequestBase) -> Result<Arc<MemorySession>, SessionError> {
        let sessions = self.sessions.lock().unwrap();
        // One error for both unknown id and bad key, so probes cannot tell
        // live session ids apart from dead ones.
        sessions
            .get(&request.session_id)
            .filter(|session| session.session_key == request.session_key)
            .cloned()
            .ok_or_else(|| {
                SessionError::new(
                    SessionErrorCode::GeneralError,
                    "invalid session id or session key",
                )
            })
    }
}

impl Default for MemorySessionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionManager for MemorySessionManager {
    async fn create_session(
        &self,
        request: &HelloRequest,
        endpoints: &EndpointPair,
    ) -> Result<Arc<dyn Session>, SessionError> {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(MemorySession::new(
            session_id,
            *self.udp_port.lock().unwrap(),
        ));
        self.sessions
            .lock()
            .unwrap()
            .insert(session_id, session.clone());
        info!(
            session_id,
            token_id = %request.token_id,
            client = %endpoints.remote,
            "session created"
        );
        Ok(session)
    }

    async fn get_session(&self, request: &RequestBase) -> Result<Arc<dyn Session>, SessionError> {
        Ok(self.authenticate(request)?)
    }

    async fn find_session(&self, session_id: u64) -> Option<Arc<dyn Session>> {
        let session = self.sessions.lock().unwrap().get(&session_id).cloned()?;
        Some(session)
    }

    async fn close_session(&self, request: &RequestBase) -> Result<(), SessionError> {
        let session = self.authenticate(request)?;
        session.close();
        self.sessions.lock().unwrap().remove(&request.session_id);
        info!(session_id = request.session_id, "session closed");
        Ok(())
    }
}
