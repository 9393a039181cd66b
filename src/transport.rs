//! The transport layer of the connection host: length-delimited JSON framing,
//! the [`ClientStream`] abstraction shared by control requests and long-lived
//! channels, the HTTP-chunked reusable variant, and server-side TLS.

pub mod chunked;
pub mod client_stream;
pub mod framer;
pub mod pem;
pub mod tls;

pub use chunked::HttpChunkedStream;
pub use client_stream::{ClientStream, EndpointPair, RawClientStream};
pub use framer::FrameError;
pub use tls::{CertificateProvider, PemCertificateProvider, SingleCertificateProvider, TlsError};
