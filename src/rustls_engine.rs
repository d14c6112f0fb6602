//! `HandshakeEngine` over a rustls connection.
//!
//! rustls buffers partial records internally, so `unwrap` never reports
//! underflow; it reports overflow whenever decrypted plaintext is left over
//! after filling the output slice. Handshake phases map as follows:
//!
//! - handshaking with pending TLS output: `NeedWrap`
//! - handshaking without pending output: `NeedUnwrap`
//! - handshake done but its final flight not yet written: `NeedWrap`
//! - otherwise `NotHandshaking`, with `Finished` in the result of the step
//!   that got there.

use std::io::{self, Cursor, Read, Write};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, ServerName};

use crate::engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus};

pub struct RustlsEngine {
    connection: rustls::Connection,
    /// Decrypted bytes still buffered inside rustls.
    plaintext_pending: usize,
    peer_closed: bool,
    /// Set once `Finished` has been reported.
    handshake_done: bool,
}

impl RustlsEngine {
    pub fn new(connection: rustls::Connection) -> Self {
        Self {
            connection,
            plaintext_pending: 0,
            peer_closed: false,
            handshake_done: false,
        }
    }

    pub fn new_client(config: Arc<rustls::ClientConfig>, host: &str) -> io::Result<Self> {
        let server_name = ServerName::try_from(host.to_string()).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid server name {host}: {e}"),
            )
        })?;
        let connection = rustls::ClientConnection::new(config, server_name).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Failed to create rustls client connection: {e}"),
            )
        })?;
        Ok(Self::new(rustls::Connection::Client(connection)))
    }

    pub fn new_server(config: Arc<rustls::ServerConfig>) -> io::Result<Self> {
        let connection = rustls::ServerConnection::new(config).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Failed to create rustls server connection: {e}"),
            )
        })?;
        Ok(Self::new(rustls::Connection::Server(connection)))
    }

    pub fn connection(&self) -> &rustls::Connection {
        &self.connection
    }

    pub fn connection_mut(&mut self) -> &mut rustls::Connection {
        &mut self.connection
    }

    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.connection.alpn_protocol()
    }

    fn current_status(&self) -> HandshakeStatus {
        if self.connection.is_handshaking() {
            if self.connection.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.handshake_done && self.connection.wants_write() {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// Status to put in a result, reporting `Finished` exactly once.
    fn result_status(&mut self) -> HandshakeStatus {
        let status = self.current_status();
        if status == HandshakeStatus::NotHandshaking && !self.handshake_done {
            self.handshake_done = true;
            return HandshakeStatus::Finished;
        }
        status
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let mut produced = 0;
        while self.plaintext_pending > 0 && produced < dst.len() {
            match self.connection.reader().read(&mut dst[produced..]) {
                Ok(0) => {
                    self.plaintext_pending = 0;
                    break;
                }
                Ok(n) => {
                    produced += n;
                    self.plaintext_pending = self.plaintext_pending.saturating_sub(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.plaintext_pending = 0;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(produced)
    }

    fn process_new_packets(&mut self) -> io::Result<()> {
        let io_state = self.connection.process_new_packets().map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("rustls error processing new packets: {e}"),
            )
        })?;
        self.plaintext_pending = io_state.plaintext_bytes_to_read();
        self.peer_closed = io_state.peer_has_closed();
        Ok(())
    }
}

impl HandshakeEngine for RustlsEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        let mut consumed = 0;
        if !src.is_empty() && !self.connection.is_handshaking() {
            consumed = self.connection.writer().write(src)?;
        }

        let mut cursor = Cursor::new(dst);
        while self.connection.wants_write() {
            let position = cursor.position() as usize;
            if position == cursor.get_ref().len() {
                break;
            }
            let n = self.connection.write_tls(&mut cursor)?;
            if n == 0 {
                break;
            }
        }
        let produced = cursor.position() as usize;

        let status = if self.connection.wants_write() {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.result_status(),
            consumed,
            produced,
        ))
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        let mut produced = self.read_plaintext(dst)?;
        let mut consumed = 0;

        // Only feed more ciphertext once everything already decrypted has
        // been handed out; rustls refuses input while its plaintext buffer
        // is full.
        if self.plaintext_pending == 0 && !src.is_empty() && !self.peer_closed {
            let mut cursor = Cursor::new(src);
            consumed = self.connection.read_tls(&mut cursor).map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("failed to feed rustls connection: {e}"),
                )
            })?;
            self.process_new_packets()?;
            produced += self.read_plaintext(&mut dst[produced..])?;
        }

        let status = if self.plaintext_pending > 0 {
            EngineStatus::BufferOverflow
        } else if self.peer_closed {
            EngineStatus::Closed
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult::new(
            status,
            self.result_status(),
            consumed,
            produced,
        ))
    }

    fn handshake_status(&self) -> HandshakeStatus {
        self.current_status()
    }

    fn wants_wrap(&self) -> bool {
        self.connection.wants_write()
    }

    fn close_outbound(&mut self) {
        self.connection.send_close_notify();
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        // rustls performs all handshake computation inline.
        None
    }

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.connection
            .peer_certificates()
            .map(|certs| certs.to_vec())
    }

    fn is_client(&self) -> bool {
        matches!(self.connection, rustls::Connection::Client(_))
    }
}
