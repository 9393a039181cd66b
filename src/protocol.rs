//! The request/response wire vocabulary of the tunnel protocol.
//!
//! Every control exchange is a single request-code byte followed by a
//! 4-byte little-endian length prefix and a UTF-8 JSON body; responses reuse
//! the length-prefix framing without a code byte. Field names on the wire are
//! PascalCase. The numeric value of each [`RequestCode`] is part of the wire
//! contract and must never change once assigned.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

/// Protocol version the server speaks, sent in every [`HelloResponse`].
pub const SERVER_PROTOCOL_VERSION: u32 = 3;

/// Oldest client protocol version the server still serves.
pub const MIN_CLIENT_PROTOCOL_VERSION: u32 = 2;

/// First byte after the TLS handshake selecting the raw framing. Doubles as
/// the raw transport's version byte.
pub const RAW_TRANSPORT_VERSION: u8 = 0x01;

/// First byte after the TLS handshake selecting the HTTP-chunked-reusable
/// framing: ASCII `'P'`, the start of an HTTP request line.
pub const HTTP_TRANSPORT_SENTINEL: u8 = b'P';

/// Length of the session id prefix of every UDP datagram.
pub const UDP_SESSION_ID_LENGTH: usize = 8;

/// Length of the fixed UDP envelope header: the session id prefix followed by
/// the integrity tag.
pub const UDP_HEADER_LENGTH: usize = 16;

/// A one-byte tag selecting the request schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestCode {
    Hello = 0x01,
    TcpDatagramChannel = 0x02,
    TcpProxyChannel = 0x03,
    UdpChannel = 0x04,
    Bye = 0x05,
}

impl RequestCode {
    pub fn from_byte(byte: u8) -> Option<RequestCode> {
        match byte {
            0x01 => Some(RequestCode::Hello),
            0x02 => Some(RequestCode::TcpDatagramChannel),
            0x03 => Some(RequestCode::TcpProxyChannel),
            0x04 => Some(RequestCode::UdpChannel),
            0x05 => Some(RequestCode::Bye),
            _ => None,
        }
    }
}

/// Result of a session operation as reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionErrorCode {
    Ok,
    GeneralError,
    UnsupportedClient,
    SessionClosed,
    SessionSuppressedBy,
    AccessExpired,
    AccessTrafficOverflow,
    Maintenance,
}

/// How an existing session was displaced when a new one took its place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionSuppressType {
    None,
    YourSelf,
    Other,
}

/// Fields common to every request made against an existing session. The
/// session key authenticates the caller; the request id lets the session
/// layer deduplicate retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestBase {
    pub session_id: u64,
    pub session_key: String,
    #[serde(default)]
    pub request_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientInfo {
    pub client_id: String,
    pub protocol_version: u32,
    pub client_version: String,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelloRequest {
    #[serde(default)]
    pub request_id: String,
    pub token_id: String,
    pub client_info: ClientInfo,
    #[serde(default)]
    pub use_udp_channel: bool,
    #[serde(default)]
    pub use_udp_channel2: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpDatagramChannelRequest {
    #[serde(flatten)]
    pub base: RequestBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TcpProxyChannelRequest {
    #[serde(flatten)]
    pub base: RequestBase,
    pub destination_end_point: SocketAddr,
    #[serde(default)]
    pub host_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UdpChannelRequest {
    #[serde(flatten)]
    pub base: RequestBase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ByeRequest {
    #[serde(flatten)]
    pub base: RequestBase,
}

/// A single contiguous range of addresses, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IpRange {
    pub first_ip: IpAddr,
    pub last_ip: IpAddr,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessUsage {
    #[serde(default)]
    pub max_client_count: u32,
    #[serde(default)]
    pub max_traffic: u64,
    #[serde(default)]
    pub sent_traffic: u64,
    #[serde(default)]
    pub received_traffic: u64,
    #[serde(default)]
    pub expiration_time: Option<String>,
}

/// The reply sent when a request against a session fails in a way the client
/// is entitled to learn about.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionResponseBase {
    pub error_code: SessionErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_usage: Option<AccessUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_by: Option<SessionSuppressType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_host_end_point: Option<SocketAddr>,
}

impl SessionResponseBase {
    pub fn new(error_code: SessionErrorCode) -> SessionResponseBase {
        SessionResponseBase {
            error_code,
            error_message: None,
            access_usage: None,
            suppressed_by: None,
            redirect_host_end_point: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelloResponse {
    pub session_id: u64,
    pub session_key: String,
    pub server_secret: String,
    pub tcp_end_points: Vec<SocketAddr>,
    pub udp_end_points: Vec<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_key: Option<String>,
    pub udp_port: u16,
    pub server_version: String,
    pub server_protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed_to: Option<SessionSuppressType>,
    pub access_usage: AccessUsage,
    pub max_datagram_channel_count: u32,
    pub client_public_address: IpAddr,
    pub include_ip_ranges: Vec<IpRange>,
    pub exclude_ip_ranges: Vec<IpRange>,
    pub packet_capture_include_ip_ranges: Vec<IpRange>,
    pub packet_capture_exclude_ip_ranges: Vec<IpRange>,
    pub is_ipv6_supported: bool,
    pub error_code: SessionErrorCode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UdpChannelSessionResponse {
    pub error_code: SessionErrorCode,
    pub udp_key: String,
    pub udp_port: u16,
}

/// The fixed-size header opening every UDP datagram. The session id is
/// readable without decryption so the transmitter can demultiplex; verifying
/// the integrity tag requires the session key and is the session layer's
/// job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpPacketHeader {
    pub session_id: u64,
    pub integrity_tag: [u8; 8],
}

impl UdpPacketHeader {
    /// Parse the envelope header off the front of a datagram. `None` when the
    /// datagram is too short to carry one.
    pub fn parse(datagram: &[u8]) -> Option<UdpPacketHeader> {
        if datagram.len() < UDP_HEADER_LENGTH {
            return None;
        }
        let mut session_id = [0u8; UDP_SESSION_ID_LENGTH];
        session_id.copy_from_slice(&datagram[..UDP_SESSION_ID_LENGTH]);
        let mut integrity_tag = [0u8; UDP_HEADER_LENGTH - UDP_SESSION_ID_LENGTH];
        integrity_tag.copy_from_slice(&datagram[UDP_SESSION_ID_LENGTH..UDP_HEADER_LENGTH]);
        Some(UdpPacketHeader {
            session_id: u64::from_le_bytes(session_id),
            integrity_tag,
        })
    }

    pub fn write(&self, buffer: &mut [u8]) {
        buffer[..UDP_SESSION_ID_LENGTH].copy_from_slice(&self.session_id.to_le_bytes());
        buffer[UDP_SESSION_ID_LENGTH..UDP_HEADER_LENGTH].copy_from_slice(&self.integrity_tag);
    }
}

/// The fixed reply for every failure that must not disclose what this server
/// is. It matches what a stock Kestrel deployment answers to an
/// unauthenticated request, down to the header order.
pub fn anonymous_reply(now: SystemTime) -> Vec<u8> {
    format!(
        "HTTP/1.1 401 Unauthorized\r\n\
         Content-Length: 0\r\n\
         Date: {}\r\n\
         Server: Kestrel\r\n\
         WWW-Authenticate: Bearer\r\n\r\n",
        httpdate::fmt_http_date(now)
    )
    .into_bytes()
}
