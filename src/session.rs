//! The session layer's surface, as seen from the connection host.
//!
//! Session creation, lookup, accounting, and per-session packet tunnelling
//! live outside this crate; the host only ever calls the operations below.
//! [`memory::MemorySessionManager`] is a small in-process implementation used
//! by the standalone binary and by tests.

pub mod memory;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::{
    AccessUsage, HelloRequest, RequestBase, SessionErrorCode, SessionResponseBase,
    SessionSuppressType, TcpProxyChannelRequest,
};
use crate::transport::{ClientStream, EndpointPair};

/// A failure the client is entitled to learn about in a structured reply.
#[derive(Debug, Clone, Error)]
#[error("session error ({code:?}): {message}")]
pub struct SessionError {
    pub code: SessionErrorCode,
    pub message: String,
}

impl SessionError {
    pub fn new(code: SessionErrorCode, message: impl Into<String>) -> SessionError {
        SessionError {
            code,
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> SessionError {
        SessionError::new(SessionErrorCode::GeneralError, message)
    }

    pub fn to_response(&self) -> SessionResponseBase {
        let mut response = SessionResponseBase::new(self.code);
        if !self.message.is_empty() {
            response.error_message = Some(self.message.clone());
        }
        response
    }
}

/// Snapshot of the session fields the host needs to answer a Hello.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: u64,
    pub session_key: String,
    pub server_secret: String,
    /// Key for the legacy UDP channel derivation; clients setting
    /// `UseUdpChannel2` use the session key instead.
    pub udp_channel_key: String,
    /// Port of the session's UDP channel, if one exists.
    pub udp_port: Option<u16>,
    pub access_usage: AccessUsage,
    pub suppressed_to: Option<SessionSuppressType>,
}

/// What a client needs to start sending datagrams over UDP.
#[derive(Debug, Clone)]
pub struct UdpChannelState {
    pub udp_key: String,
    pub udp_port: u16,
}

/// One authenticated session, owner of its tunnel channels.
#[async_trait]
pub trait Session: Send + Sync {
    fn state(&self) -> SessionState;

    fn set_use_udp_channel(&self, enabled: bool);

    /// Retain `stream` as a long-lived bidirectional datagram channel. The
    /// host relinquishes ownership; the session keeps the stream until it
    /// closes.
    async fn attach_datagram_channel(&self, stream: Box<dyn ClientStream>);

    /// Splice `stream` with an outbound connection to the requested
    /// destination. On error the stream is closed by the session.
    async fn attach_proxy_channel(
        &self,
        stream: Box<dyn ClientStream>,
        request: TcpProxyChannelRequest,
    ) -> Result<(), SessionError>;

    /// Enable UDP on the session, yielding its key and port.
    async fn activate_udp_channel(&self) -> Result<UdpChannelState, SessionError>;

    /// Deliver one inbound datagram: the envelope past the session id
    /// prefix (integrity tag plus encrypted payload) and its source address.
    async fn receive_udp_datagram(&self, datagram: &[u8], from: SocketAddr);
}

/// The session registry the host dispatches into.
#[async_trait]
pub trait SessionManager: Send + Sync {
    /// Create a session for a Hello. The manager assigns the session id and
    /// key and determines access usage; policy failures surface as
    /// [`SessionError`]s.
    async fn create_session(
        &self,
        request: &HelloRequest,
        endpoints: &EndpointPair,
    ) -> Result<Arc<dyn Session>, SessionError>;

    /// Look up a session, authenticating the caller by session key.
    async fn get_session(&self, request: &RequestBase) -> Result<Arc<dyn Session>, SessionError>;

    /// Unauthenticated lookup for UDP demultiplexing. `None` means the
    /// datagram is silently dropped.
    async fn find_session(&self, session_id: u64) -> Option<Arc<dyn Session>>;

    /// Close a session, authenticated like [`SessionManager::get_session`].
    async fn close_session(&self, request: &RequestBase) -> Result<(), SessionError>;
}
