//! Server-side connection host and session protocol core of a VPN tunnelling
//! system.
//!
//! A client establishes an authenticated, encrypted control channel to the
//! server and then multiplexes IP datagrams and proxied TCP streams over one
//! or more transport channels. This crate owns the connection host (TCP
//! accept, TLS, transport negotiation, the request protocol), the client
//! stream abstraction shared by control requests and long-lived channels, and
//! the UDP channel transmitter. The session layer itself is an external
//! collaborator reached through the traits in [`session`].

pub mod cli;
pub mod config;
pub mod defaults;
pub mod host;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod udp;
