//! tls-socket-adapter - callback-driven TLS over non-blocking byte streams.
//!
//! A `TlsSocket` pairs a handshake engine (`HandshakeEngine`, implemented
//! over rustls by `RustlsEngine`) with a raw transport (`Transport`). Raw
//! bytes are pushed in, decrypted bytes come out through callbacks, and the
//! handshake is driven entirely by the engine's reported state.
//!
//! # Layout
//!
//! - `tls_socket`: the record adapter (wrap/unwrap passes, buffer growth,
//!   reentrancy, handshake completion)
//! - `trust`: post-handshake chain and hostname verification with an
//!   application override for trust failures
//! - `http_connect`: HTTP CONNECT tunnel negotiation through a proxy
//! - `tcp_transport`: tokio TCP transport and event loop
//! - `connector`: builds configured client sockets, optionally via a proxy
//!
//! # Example
//!
//! ```no_run
//! use tls_socket_adapter::address::NetLocation;
//! use tls_socket_adapter::connector::TlsConnector;
//! use tls_socket_adapter::tcp_transport::drive;
//!
//! # async fn run() -> std::io::Result<()> {
//! let connector = TlsConnector::new()?;
//! let target = NetLocation::from_str("example.com:443", None)?;
//! let mut socket = connector.connect(&target).await?;
//! socket.set_data_callback(|_, data| {
//!     println!("{} bytes", data.remaining());
//!     data.clear();
//! });
//! drive(&mut socket, connector.read_buffer_size()).await
//! # }
//! ```

pub mod address;
pub mod buffer_queue;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod growable_buffer;
pub mod http_connect;
pub mod line_reader;
pub mod rustls_engine;
pub mod rustls_util;
pub mod tcp_transport;
pub mod tls_socket;
pub mod transport;
pub mod trust;

#[cfg(test)]
mod test_util;
