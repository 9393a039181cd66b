//! Request dispatch and the five request handlers.
//!
//! Handlers never swallow session errors: they bubble a [`RequestError`] up
//! to the pipeline, which owns the reply policy. A handler that hands its
//! stream to a session takes it out of the [`StreamSlot`], after which the
//! host has no reference left to dispose.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use super::{ConnectionHost, Disposition, RequestError};
use crate::protocol::{
    ByeRequest, HelloRequest, HelloResponse, RequestCode, SessionErrorCode,
    TcpDatagramChannelRequest, TcpProxyChannelRequest, UdpChannelRequest,
    UdpChannelSessionResponse, MIN_CLIENT_PROTOCOL_VERSION, SERVER_PROTOCOL_VERSION,
};
use crate::session::{Session as _, SessionError, SessionManager as _};
use crate::transport::framer;
use crate::transport::ClientStream;

/// Holds the exchange's stream while handlers borrow or take it.
pub(crate) struct StreamSlot {
    stream: Option<Box<dyn ClientStream>>,
}

impl StreamSlot {
    pub(crate) fn new(stream: Box<dyn ClientStream>) -> StreamSlot {
        StreamSlot {
            stream: Some(stream),
        }
    }

    pub(crate) fn take(&mut self) -> Option<Box<dyn ClientStream>> {
        self.stream.take()
    }

    fn stream(&mut self) -> Result<&mut Box<dyn ClientStream>, RequestError> {
        self.stream.as_mut().ok_or(RequestError::Closed)
    }
}

/// Read the request code byte and route to its handler.
pub(crate) async fn dispatch(
    host: &ConnectionHost,
    slot: &mut StreamSlot,
) -> Result<Disposition, RequestError> {
    let mut code = [0u8; 1];
    let n = slot
        .stream()?
        .read(&mut code)
        .await
        .map_err(RequestError::Io)?;
    if n == 0 {
        return Err(RequestError::Closed);
    }

    match RequestCode::from_byte(code[0]) {
        None => Err(RequestError::UnknownRequestCode(code[0])),
        Some(RequestCode::Hello) => hello(host, slot).await,
        Some(RequestCode::TcpDatagramChannel) => tcp_datagram_channel(host, slot).await,
        Some(RequestCode::TcpProxyChannel) => tcp_proxy_channel(host, slot).await,
        Some(RequestCode::UdpChannel) => udp_channel(host, slot).await,
        Some(RequestCode::Bye) => bye(host, slot).await,
    }
}

async fn read_request<T: DeserializeOwned>(
    host: &ConnectionHost,
    slot: &mut StreamSlot,
) -> Result<T, RequestError> {
    framer::read_frame(slot.stream()?, host.options().max_message_length)
        .await
        .map_err(RequestError::from_read_frame)
}

async fn write_response<T: Serialize>(
    slot: &mut StreamSlot,
    message: &T,
) -> Result<(), RequestError> {
    framer::write_frame(slot.stream()?, message)
        .await
        .map_err(RequestError::from_write_frame)
}

async fn hello(host: &ConnectionHost, slot: &mut StreamSlot) -> Result<Disposition, RequestError> {
    let request: HelloRequest = read_request(host, slot).await?;
    let endpoints = slot.stream()?.endpoint_pair();
    debug!(
        token_id = %request.token_id,
        client_id = %request.client_info.client_id,
        client = %endpoints.remote,
        "hello"
    );

    let session = host
        .session_manager()
        .create_session(&request, &endpoints)
        .await?;
    session.set_use_udp_channel(request.use_udp_channel);

    // Checked only after create_session: an outdated client and an unknown
    // one must be indistinguishable on the wire up to this point.
    if request.client_info.protocol_version < MIN_CLIENT_PROTOCOL_VERSION {
        return Err(SessionError::new(
            SessionErrorCode::UnsupportedClient,
            format!(
                "client protocol version {} is not supported",
                request.client_info.protocol_version
            ),
        )
        .into());
    }

    let state = session.state();
    // With the current key scheme the UDP key is the session key itself; the
    // legacy scheme carried a separate per-channel key.
    let udp_key = state.udp_port.map(|_| {
        if request.use_udp_channel2 {
            state.session_key.clone()
        } else {
            state.udp_channel_key.clone()
        }
    });

    let options = host.options();
    let response = HelloResponse {
        session_id: state.session_id,
        session_key: state.session_key.clone(),
        server_secret: state.server_secret,
        tcp_end_points: host.tcp_end_points(),
        udp_end_points: host.udp_end_points(),
        udp_key,
        udp_port: state.udp_port.unwrap_or(0),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        server_protocol_version: SERVER_PROTOCOL_VERSION,
        suppressed_to: state.suppressed_to,
        access_usage: state.access_usage,
        max_datagram_channel_count: options.max_datagram_channel_count,
        client_public_address: endpoints.remote.ip(),
        include_ip_ranges: options.network_filter.include_ip_ranges.clone(),
        exclude_ip_ranges: options.network_filter.exclude_ip_ranges.clone(),
        packet_capture_include_ip_ranges: options
            .network_filter
            .packet_capture_include_ip_ranges
            .clone(),
        packet_capture_exclude_ip_ranges: options
            .network_filter
            .packet_capture_exclude_ip_ranges
            .clone(),
        is_ipv6_supported: options.is_ipv6_supported,
        error_code: SessionErrorCode::Ok,
    };
    write_response(slot, &response).await?;
    info!(session_id = state.session_id, client = %endpoints.remote, "session established");
    Ok(Disposition::Graceful)
}

async fn tcp_datagram_channel(
    host: &ConnectionHost,
    slot: &mut StreamSlot,
) -> Result<Disposition, RequestError> {
    let request: TcpDatagramChannelRequest = read_request(host, slot).await?;
    let session = host.session_manager().get_session(&request.base).await?;

    let stream = slot.take().ok_or(RequestError::Closed)?;
    info!(
        session_id = request.base.session_id,
        "datagram channel attached"
    );
    session.attach_datagram_channel(stream).await;
    Ok(Disposition::HandedOff)
}

async fn tcp_proxy_channel(
    host: &ConnectionHost,
    slot: &mut StreamSlot,
) -> Result<Disposition, RequestError> {
    let request: TcpProxyChannelRequest = read_request(host, slot).await?;
    let session = host.session_manager().get_session(&request.base).await?;

    let stream = slot.take().ok_or(RequestError::Closed)?;
    info!(
        session_id = request.base.session_id,
        destination = %request.destination_end_point,
        "proxy channel attached"
    );
    session.attach_proxy_channel(stream, request).await?;
    Ok(Disposition::HandedOff)
}

async fn udp_channel(
    host: &ConnectionHost,
    slot: &mut StreamSlot,
) -> Result<Disposition, RequestError> {
    let request: UdpChannelRequest = read_request(host, slot).await?;
    let session = host.session_manager().get_session(&request.base).await?;

    let udp = session.activate_udp_channel().await?;
    let response = UdpChannelSessionResponse {
        error_code: SessionErrorCode::Ok,
        udp_key: udp.udp_key,
        udp_port: udp.udp_port,
    };
    write_response(slot, &response).await?;
    info!(session_id = request.base.session_id, "udp channel enabled");
    Ok(Disposition::Graceful)
}

async fn bye(host: &ConnectionHost, slot: &mut StreamSlot) -> Result<Disposition, RequestError> {
    let request: ByeRequest = read_request(host, slot).await?;
    host.session_manager().get_session(&request.base).await?;
    host.session_manager().close_session(&request.base).await?;
    info!(session_id = request.base.session_id, "bye");
    // No response body; the stream just goes away.
    Ok(Disposition::Ungraceful)
}
