//! The connection host: owns the TCP listeners and UDP transmitters, accepts
//! and authenticates connections, and drives the request pipeline.
//!
//! One accept loop runs per TCP listener, each spawning a detached task per
//! connection. Connection tasks report back through an unbounded channel to a
//! supervisor that awaits them and logs failures as they surface, so a
//! stopping host can prove that no connection task outlives it.

pub(crate) mod handlers;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::config::NetworkFilter;
use crate::defaults;
use crate::protocol::{self, HTTP_TRANSPORT_SENTINEL, RAW_TRANSPORT_VERSION};
use crate::session::{SessionError, SessionManager};
use crate::transport::chunked::{self, HttpChunkedStream};
use crate::transport::framer::{self, FrameError};
use crate::transport::{CertificateProvider, ClientStream, EndpointPair, RawClientStream};
use crate::udp::UdpChannelTransmitter;

/// Tunables of the host, usually derived from [`crate::config::Config`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    pub request_timeout: Duration,
    pub max_message_length: usize,
    pub max_request_head_length: usize,
    pub accept_error_budget: u32,
    pub max_datagram_channel_count: u32,
    pub network_filter: NetworkFilter,
    pub is_ipv6_supported: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        HostOptions {
            request_timeout: defaults::request_timeout(),
            max_message_length: defaults::max_message_length(),
            max_request_head_length: defaults::max_request_head_length(),
            accept_error_budget: defaults::accept_error_budget(),
            max_datagram_channel_count: defaults::max_datagram_channel_count(),
            network_filter: NetworkFilter::default(),
            is_ipv6_supported: true,
        }
    }
}

impl From<&crate::config::Config> for HostOptions {
    fn from(config: &crate::config::Config) -> Self {
        HostOptions {
            request_timeout: config.request_timeout,
            max_message_length: config.max_message_length,
            max_request_head_length: config.max_request_head_length,
            accept_error_budget: config.accept_error_budget,
            max_datagram_channel_count: config.max_datagram_channel_count,
            network_filter: config.network_filter.clone(),
            is_ipv6_supported: config.is_ipv6_supported,
        }
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("No TcpEndPoint was specified")]
    NoTcpEndpoints,
    #[error("the host is already started")]
    AlreadyStarted,
    #[error("the host has been disposed")]
    Disposed,
    #[error("could not bind {endpoint}: {source}")]
    Bind {
        endpoint: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Everything that can go wrong while serving one request, shaped so the
/// reply policy in [`ConnectionHost::reply_error`] is a single match.
#[derive(Debug, Error)]
pub(crate) enum RequestError {
    /// The peer went away at a message boundary. Benign.
    #[error("connection closed by peer")]
    Closed,
    #[error("TLS authentication failed (cancelled: {by_cancellation}): {source}")]
    TlsAuthenticate {
        source: io::Error,
        by_cancellation: bool,
    },
    #[error("unsupported transport version byte {0:#04x}")]
    UnsupportedTransport(u8),
    #[error("unknown request code {0:#04x}")]
    UnknownRequestCode(u8),
    #[error("malformed request: {0}")]
    Parse(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("transport error: {0}")]
    Io(io::Error),
}

impl RequestError {
    fn from_read_frame(error: FrameError) -> RequestError {
        match error {
            FrameError::Closed => RequestError::Closed,
            error @ (FrameError::Truncated | FrameError::TooLarge { .. }) => {
                RequestError::Parse(error.to_string())
            }
            FrameError::Json(error) => RequestError::Parse(error.to_string()),
            FrameError::Io(error) => RequestError::Io(error),
        }
    }

    fn from_write_frame(error: FrameError) -> RequestError {
        match error {
            FrameError::Io(error) => RequestError::Io(error),
            other => RequestError::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

/// How a handler left its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    /// Response written in full; the stream may be reused if its framing
    /// allows it.
    Graceful,
    /// Drop the stream without completing any framing.
    Ungraceful,
    /// Ownership moved to a session; the host holds no reference anymore.
    HandedOff,
}

#[derive(Default)]
struct HostState {
    is_started: bool,
    is_disposed: bool,
    cancellation: Option<CancellationToken>,
    accept_tasks: Vec<JoinHandle<()>>,
    connection_tx: Option<mpsc::UnboundedSender<JoinHandle<()>>>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct ConnectionHost {
    options: HostOptions,
    session_manager: Arc<dyn SessionManager>,
    certificates: Arc<dyn CertificateProvider>,
    state: Mutex<HostState>,
    /// Serializes concurrent `stop` callers; never held across the state lock.
    stop_lock: tokio::sync::Mutex<()>,
    tcp_endpoints: Mutex<Vec<SocketAddr>>,
    transmitters: Mutex<Vec<Arc<UdpChannelTransmitter>>>,
}

impl ConnectionHost {
    pub fn new(
        options: HostOptions,
        session_manager: Arc<dyn SessionManager>,
        certificates: Arc<dyn CertificateProvider>,
    ) -> Arc<ConnectionHost> {
        Arc::new(ConnectionHost {
            options,
            session_manager,
            certificates,
            state: Mutex::new(HostState::default()),
            stop_lock: tokio::sync::Mutex::new(()),
            tcp_endpoints: Mutex::new(Vec::new()),
            transmitters: Mutex::new(Vec::new()),
        })
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().is_started
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().is_disposed
    }

    /// The TCP endpoints actually listening, with OS-assigned ports resolved.
    pub fn tcp_end_points(&self) -> Vec<SocketAddr> {
        self.tcp_endpoints.lock().unwrap().clone()
    }

    /// The UDP endpoints actually bound, with OS-assigned ports resolved.
    pub fn udp_end_points(&self) -> Vec<SocketAddr> {
        self.transmitters
            .lock()
            .unwrap()
            .iter()
            .map(|transmitter| transmitter.local_endpoint())
            .collect()
    }

    pub(crate) fn options(&self) -> &HostOptions {
        &self.options
    }

    pub(crate) fn session_manager(&self) -> &Arc<dyn SessionManager> {
        &self.session_manager
    }

    /// Bind every endpoint and begin accepting. At least one TCP endpoint is
    /// required; UDP endpoints are optional. Any bind failure unwinds the
    /// sockets bound so far and leaves the host stopped.
    pub async fn start(
        self: &Arc<Self>,
        tcp_endpoints: &[SocketAddr],
        udp_endpoints: &[SocketAddr],
    ) -> Result<(), StartError> {
        let cancellation = {
            let mut state = self.state.lock().unwrap();
            if state.is_disposed {
                return Err(StartError::Disposed);
            }
            if state.is_started {
                return Err(StartError::AlreadyStarted);
            }
            if tcp_endpoints.is_empty() {
                return Err(StartError::NoTcpEndpoints);
            }
            let token = CancellationToken::new();
            state.is_started = true;
            state.cancellation = Some(token.clone());
            token
        };

        match self.bind(tcp_endpoints, udp_endpoints, &cancellation).await {
            Ok(()) => {
                info!(
                    tcp = ?self.tcp_end_points(),
                    udp = ?self.udp_end_points(),
                    "connection host started"
                );
                Ok(())
            }
            Err(error) => {
                self.stop().await;
                Err(error)
            }
        }
    }

    async fn bind(
        self: &Arc<Self>,
        tcp_endpoints: &[SocketAddr],
        udp_endpoints: &[SocketAddr],
        cancellation: &CancellationToken,
    ) -> Result<(), StartError> {
        // UDP first: the resolved ports end up in HelloResponses.
        for endpoint in udp_endpoints {
            let transmitter = UdpChannelTransmitter::bind(
                *endpoint,
                self.session_manager.clone(),
                cancellation.child_token(),
            )
            .await
            .map_err(|source| StartError::Bind {
                endpoint: *endpoint,
                source,
            })?;
            self.transmitters.lock().unwrap().push(transmitter);
        }

        let mut listeners = Vec::new();
        for endpoint in tcp_endpoints {
            let listener = TcpListener::bind(endpoint)
                .await
                .and_then(|listener| listener.local_addr().map(|local| (listener, local)))
                .map_err(|source| StartError::Bind {
                    endpoint: *endpoint,
                    source,
                })?;
            listeners.push(listener);
        }

        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let supervisor = tokio::spawn(supervise_connections(connection_rx));

        let mut accept_tasks = Vec::new();
        let mut endpoints = Vec::new();
        for (listener, local) in listeners {
            endpoints.push(local);
            accept_tasks.push(tokio::spawn(self.clone().accept_loop(
                listener,
                local,
                cancellation.clone(),
                connection_tx.clone(),
            )));
        }
        *self.tcp_endpoints.lock().unwrap() = endpoints;

        let mut state = self.state.lock().unwrap();
        state.connection_tx = Some(connection_tx);
        state.supervisor = Some(supervisor);
        state.accept_tasks = accept_tasks;
        Ok(())
    }

    /// Cancel every loop, close every socket, and wait until no task spawned
    /// by this host is left running. Safe to call repeatedly and from
    /// concurrent callers.
    pub async fn stop(self: &Arc<Self>) {
        let _guard = self.stop_lock.lock().await;
        let (cancellation, accept_tasks, supervisor, connection_tx) = {
            let mut state = self.state.lock().unwrap();
            if !state.is_started {
                return;
            }
            (
                state.cancellation.take(),
                std::mem::take(&mut state.accept_tasks),
                state.supervisor.take(),
                state.connection_tx.take(),
            )
        };

        if let Some(token) = cancellation {
            token.cancel();
        }

        let transmitters: Vec<_> = self.transmitters.lock().unwrap().drain(..).collect();
        for transmitter in transmitters {
            transmitter.dispose().await;
        }

        for task in accept_tasks {
            let _ = task.await;
        }

        // With the senders gone the supervisor finishes once the last
        // connection task has.
        drop(connection_tx);
        if let Some(supervisor) = supervisor {
            let _ = supervisor.await;
        }

        self.tcp_endpoints.lock().unwrap().clear();
        self.certificates.clear_cache();
        self.state.lock().unwrap().is_started = false;
        info!("connection host stopped");
    }

    /// Stop the host and bar it from ever starting again.
    pub async fn dispose(self: &Arc<Self>) {
        self.stop().await;
        self.state.lock().unwrap().is_disposed = true;
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        bind_endpoint: SocketAddr,
        cancellation: CancellationToken,
        connection_tx: mpsc::UnboundedSender<JoinHandle<()>>,
    ) {
        info!(%bind_endpoint, "listening");
        let mut budget = ErrorBudget::new(self.options.accept_error_budget);
        loop {
            let accepted = tokio::select! {
                _ = cancellation.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    budget.success();
                    let _ = stream.set_nodelay(true);
                    let host = self.clone();
                    let token = cancellation.clone();
                    let task = tokio::spawn(async move {
                        host.serve_connection(stream, bind_endpoint, peer, token).await
                    });
                    let _ = connection_tx.send(task);
                }
                Err(error) => {
                    match error.kind() {
                        io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::NotConnected => {
                            trace!(%bind_endpoint, %error, "accept aborted")
                        }
                        _ => error!(%bind_endpoint, %error, "accept failed"),
                    }
                    if budget.failure() {
                        error!(
                            %bind_endpoint,
                            budget = self.options.accept_error_budget,
                            "accept error budget exhausted, stopping the host"
                        );
                        let host = self.clone();
                        tokio::spawn(async move { host.stop().await });
                        break;
                    }
                }
            }
        }
        trace!(%bind_endpoint, "accept loop exited");
        // The listener drops here; stop() never touches it.
    }

    /// Drive one connection: TLS, transport sniffing, then request cycles
    /// until the stream is disposed, handed off, or the peer goes away. Each
    /// cycle gets its own timeout window, so a reused stream is never
    /// penalized for earlier exchanges.
    async fn serve_connection(
        self: Arc<Self>,
        tcp: TcpStream,
        bind_endpoint: SocketAddr,
        peer: SocketAddr,
        cancellation: CancellationToken,
    ) {
        enum CycleEnd {
            Finished(Result<Option<Box<dyn ClientStream>>, RequestError>),
            TimedOut,
            Cancelled,
        }

        trace!(%peer, "connection accepted");
        let request_timeout = self.options.request_timeout;
        let mut pending = Some(tcp);
        let mut carried: Option<Box<dyn ClientStream>> = None;
        loop {
            let cycle = async {
                let stream = match carried.take() {
                    Some(previous) => match previous.into_reusable().await {
                        Ok(Some(stream)) => stream,
                        Ok(None) => return Ok(None),
                        Err(error) => return Err(RequestError::Io(error)),
                    },
                    None => {
                        let tcp = pending.take().expect("first cycle owns the socket");
                        self.establish(tcp, bind_endpoint, peer, &cancellation).await?
                    }
                };
                Ok(self.serve_exchange(stream).await)
            };

            let outcome = tokio::select! {
                _ = cancellation.cancelled() => CycleEnd::Cancelled,
                finished = tokio::time::timeout(request_timeout, cycle) => match finished {
                    Ok(result) => CycleEnd::Finished(result),
                    Err(_) => CycleEnd::TimedOut,
                },
            };

            match outcome {
                CycleEnd::Finished(Ok(Some(stream))) => carried = Some(stream),
                CycleEnd::Finished(Ok(None)) => break,
                CycleEnd::Finished(Err(error)) => {
                    self.log_rejected(&error, peer);
                    break;
                }
                CycleEnd::TimedOut => {
                    debug!(%peer, "request cycle timed out");
                    break;
                }
                CycleEnd::Cancelled => {
                    trace!(%peer, "request cycle cancelled");
                    break;
                }
            }
        }
    }

    /// TLS-authenticate the socket and sniff the transport version byte.
    /// Failures that deserve the anonymous reply emit it here, while the raw
    /// TLS stream is still at hand.
    async fn establish(
        &self,
        tcp: TcpStream,
        bind_endpoint: SocketAddr,
        peer: SocketAddr,
        cancellation: &CancellationToken,
    ) -> Result<Box<dyn ClientStream>, RequestError> {
        let config =
            self.certificates
                .server_config(bind_endpoint)
                .map_err(|error| RequestError::TlsAuthenticate {
                    source: io::Error::new(io::ErrorKind::InvalidInput, error.to_string()),
                    by_cancellation: false,
                })?;
        let mut tls = TlsAcceptor::from(config).accept(tcp).await.map_err(|source| {
            RequestError::TlsAuthenticate {
                source,
                by_cancellation: cancellation.is_cancelled(),
            }
        })?;

        let mut first = [0u8; 1];
        let n = tls.read(&mut first).await.map_err(RequestError::Io)?;
        if n == 0 {
            // Closed before the first byte: a scanner or a health check.
            return Err(RequestError::Closed);
        }

        let endpoints = EndpointPair {
            remote: peer,
            local: bind_endpoint,
        };
        match first[0] {
            RAW_TRANSPORT_VERSION => Ok(Box::new(RawClientStream::new(tls, endpoints))),
            HTTP_TRANSPORT_SENTINEL => {
                let head = chunked::read_request_head(
                    &mut tls,
                    &first,
                    self.options.max_request_head_length,
                )
                .await;
                match head {
                    Ok(Some((head, leftover))) if head.is_chunked => {
                        trace!(%peer, request_line = %head.request_line, "chunked transport negotiated");
                        Ok(Box::new(HttpChunkedStream::new(
                            tls,
                            endpoints,
                            leftover,
                            self.options.max_request_head_length,
                        )))
                    }
                    Ok(Some((head, _))) => {
                        Self::send_anonymous_reply(&mut tls).await;
                        Err(RequestError::Parse(format!(
                            "http request without chunked transfer-encoding: {}",
                            head.request_line
                        )))
                    }
                    Ok(None) => Err(RequestError::Closed),
                    Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => {
                        Err(RequestError::Closed)
                    }
                    Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                        Self::send_anonymous_reply(&mut tls).await;
                        Err(RequestError::Parse(error.to_string()))
                    }
                    Err(error) => Err(RequestError::Io(error)),
                }
            }
            other => Err(RequestError::UnsupportedTransport(other)),
        }
    }

    /// Serve one request/response exchange and apply the reply policy.
    /// Returns the stream when it is eligible for another exchange.
    async fn serve_exchange(
        &self,
        stream: Box<dyn ClientStream>,
    ) -> Option<Box<dyn ClientStream>> {
        let endpoints = stream.endpoint_pair();
        let mut slot = handlers::StreamSlot::new(stream);
        match handlers::dispatch(self, &mut slot).await {
            Ok(Disposition::Graceful) => {
                if let Some(mut stream) = slot.take() {
                    if let Err(error) = stream.finish_response().await {
                        trace!(%endpoints, %error, "could not finish the response");
                        stream.dispose(false).await;
                    } else if stream.can_reuse() {
                        trace!(%endpoints, "stream returned to the host for reuse");
                        return Some(stream);
                    } else {
                        stream.dispose(true).await;
                    }
                }
            }
            Ok(Disposition::Ungraceful) => {
                if let Some(stream) = slot.take() {
                    stream.dispose(false).await;
                }
            }
            Ok(Disposition::HandedOff) => debug!(%endpoints, "stream handed off to its session"),
            Err(error) => self.reply_error(error, slot.take(), endpoints).await,
        }
        None
    }

    /// The single place deciding what a failing exchange looks like on the
    /// wire: a structured session reply for authenticated failures, the
    /// anonymous 401 for everything a stranger could have caused, silence for
    /// transport losses.
    async fn reply_error(
        &self,
        error: RequestError,
        stream: Option<Box<dyn ClientStream>>,
        endpoints: EndpointPair,
    ) {
        match error {
            RequestError::Closed => {
                trace!(%endpoints, "connection closed by peer");
                if let Some(stream) = stream {
                    stream.dispose(false).await;
                }
            }
            RequestError::Io(error) => {
                trace!(%endpoints, %error, "transport error");
                if let Some(stream) = stream {
                    stream.dispose(false).await;
                }
            }
            RequestError::Session(session_error) => {
                info!(
                    %endpoints,
                    code = ?session_error.code,
                    message = %session_error.message,
                    "session error reply"
                );
                if let Some(mut stream) = stream {
                    let response = session_error.to_response();
                    if let Err(error) = framer::write_frame(&mut stream, &response).await {
                        trace!(%endpoints, %error, "could not write the session error reply");
                    }
                    stream.dispose(false).await;
                }
            }
            error @ (RequestError::Parse(_) | RequestError::UnknownRequestCode(_)) => {
                info!(%endpoints, %error, "anonymous reply");
                if let Some(mut stream) = stream {
                    let reply = protocol::anonymous_reply(SystemTime::now());
                    if let Err(error) = stream.write_anonymous_reply(&reply).await {
                        trace!(%endpoints, %error, "could not write the anonymous reply");
                    }
                    stream.dispose(false).await;
                }
            }
            error @ (RequestError::TlsAuthenticate { .. }
            | RequestError::UnsupportedTransport(_)) => {
                // Produced before a client stream exists; nothing to answer.
                debug!(%endpoints, %error, "connection rejected");
                if let Some(stream) = stream {
                    stream.dispose(false).await;
                }
            }
        }
    }

    async fn send_anonymous_reply<W>(stream: &mut W)
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;
        let reply = protocol::anonymous_reply(SystemTime::now());
        let _ = stream.write_all(&reply).await;
        let _ = stream.flush().await;
    }

    fn log_rejected(&self, error: &RequestError, peer: SocketAddr) {
        match error {
            RequestError::Closed => trace!(%peer, "connection closed before a request"),
            RequestError::TlsAuthenticate { source, by_cancellation } => {
                debug!(%peer, %source, by_cancellation, "TLS authentication failed")
            }
            error => debug!(%peer, %error, "connection rejected"),
        }
    }
}

/// Consecutive-failure counter for an accept loop. Any success resets it;
/// `failure` reports whether the budget has been exceeded.
struct ErrorBudget {
    limit: u32,
    consecutive: u32,
}

impl ErrorBudget {
    fn new(limit: u32) -> ErrorBudget {
        ErrorBudget {
            limit,
            consecutive: 0,
        }
    }

    fn success(&mut self) {
        self.consecutive = 0;
    }

    fn failure(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive > self.limit
    }
}

/// Await every spawned connection task, logging failures as they surface.
/// Ends once all accept loops have dropped their senders and the last task
/// has finished.
async fn supervise_connections(mut connection_rx: mpsc::UnboundedReceiver<JoinHandle<()>>) {
    let mut running = FuturesUnordered::new();
    loop {
        tokio::select! {
            incoming = connection_rx.recv() => match incoming {
                Some(task) => running.push(task),
                None => break,
            },
            Some(finished) = running.next() => log_connection_task(finished),
        }
    }
    while let Some(finished) = running.next().await {
        log_connection_task(finished);
    }
}

fn log_connection_task(result: Result<(), tokio::task::JoinError>) {
    if let Err(error) = result {
        if !error.is_cancelled() {
            error!(%error, "connection task failed");
        }
    }
}
