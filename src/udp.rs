//! The UDP channel transmitter: one socket per bound endpoint, demultiplexing
//! inbound datagrams to sessions by the id prefix of the envelope header.
//!
//! The transmitter never decrypts anything. It checks that a datagram is long
//! enough to carry the envelope, reads the session id, and hands the rest to
//! the session's UDP channel together with the source address. Datagrams for
//! unknown sessions are dropped without a reply. Outbound packets are
//! serialized through a single send lock so interleaved writers cannot
//! corrupt each other's datagrams.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use crate::protocol::{UdpPacketHeader, UDP_SESSION_ID_LENGTH};
use crate::session::{Session as _, SessionManager};

pub struct UdpChannelTransmitter {
    socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
    session_manager: Arc<dyn SessionManager>,
    cancellation: CancellationToken,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    send_lock: tokio::sync::Mutex<()>,
}

impl UdpChannelTransmitter {
    /// Bind `endpoint` and start the receive loop. A requested port of zero
    /// is resolved by the OS and readable via
    /// [`UdpChannelTransmitter::local_endpoint`].
    pub async fn bind(
        endpoint: SocketAddr,
        session_manager: Arc<dyn SessionManager>,
        cancellation: CancellationToken,
    ) -> io::Result<Arc<UdpChannelTransmitter>> {
        let socket = UdpSocket::bind(endpoint).await?;
        let local_endpoint = socket.local_addr()?;
        info!(%local_endpoint, "udp transmitter bound");

        let transmitter = Arc::new(UdpChannelTransmitter {
            socket: Arc::new(socket),
            local_endpoint,
            session_manager,
            cancellation,
            receive_task: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
        });
        let task = tokio::spawn(transmitter.clone().receive_loop());
        *transmitter.receive_task.lock().unwrap() = Some(task);
        Ok(transmitter)
    }

    /// The endpoint actually bound, with an OS-assigned port resolved.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    async fn receive_loop(self: Arc<Self>) {
        let mut buffer = vec![0u8; 0xFFFF];
        loop {
            let received = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                received = self.socket.recv_from(&mut buffer) => received,
            };
            match received {
                Ok((length, from)) => self.demux(&buffer[..length], from).await,
                Err(error) => {
                    trace!(local = %self.local_endpoint, %error, "udp receive failed");
                }
            }
        }
        trace!(local = %self.local_endpoint, "udp receive loop exited");
    }

    async fn demux(&self, datagram: &[u8], from: SocketAddr) {
        let header = match UdpPacketHeader::parse(datagram) {
            Some(header) => header,
            None => {
                trace!(%from, length = datagram.len(), "dropping malformed datagram");
                return;
            }
        };
        match self.session_manager.find_session(header.session_id).await {
            Some(session) => {
                session
                    .receive_udp_datagram(&datagram[UDP_SESSION_ID_LENGTH..], from)
                    .await
            }
            None => {
                trace!(
                    session_id = header.session_id,
                    %from,
                    "dropping datagram for unknown session"
                );
            }
        }
    }

    /// Send one datagram to `target`. Sends from session channels are
    /// serialized here; callers never share the socket directly.
    pub async fn send_to(&self, datagram: &[u8], target: SocketAddr) -> io::Result<usize> {
        let _guard = self.send_lock.lock().await;
        self.socket.send_to(datagram, target).await
    }

    /// End the receive loop and close the socket. Idempotent.
    pub async fn dispose(&self) {
        self.cancellation.cancel();
        let task = self.receive_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
