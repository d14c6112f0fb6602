//! HTTP CONNECT tunnel negotiation.
//!
//! `ConnectTunnel` is a sans-IO state machine: the caller writes
//! `request_bytes()` to the raw transport, then feeds every inbound chunk to
//! `on_data` until it yields the bytes that followed the proxy's response.
//! Those bytes belong to the tunneled stream and must be handed to the TLS
//! layer as its first ciphertext.

use std::io;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{Bytes, BytesMut};
use log::debug;

use crate::address::NetLocation;
use crate::error::TunnelError;
use crate::line_reader::LineReader;

/// Status lines longer than this are rejected.
pub const MAX_STATUS_LINE_LENGTH: usize = 128;

const LINE_BUFFER_SIZE: usize = 8192;

fn create_http_auth_token(username: &str, password: &str) -> String {
    BASE64.encode(format!("{username}:{password}"))
}

fn create_http_auth_header_line(username: &str, password: &str) -> String {
    format!(
        "Proxy-Authorization: Basic {}\r\n",
        create_http_auth_token(username, password)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TunnelState {
    AwaitingStatusLine,
    AwaitingBlankLine,
    Established,
    Failed,
}

pub struct ConnectTunnel {
    target: NetLocation,
    auth_header: Option<String>,
    line_reader: LineReader,
    status_line: Option<String>,
    state: TunnelState,
}

impl ConnectTunnel {
    pub fn new(target: NetLocation, auth_credentials: Option<(String, String)>) -> Self {
        let auth_header = auth_credentials
            .map(|(username, password)| create_http_auth_header_line(&username, &password));
        Self {
            target,
            auth_header,
            line_reader: LineReader::new_with_buffer_size(LINE_BUFFER_SIZE),
            status_line: None,
            state: TunnelState::AwaitingStatusLine,
        }
    }

    pub fn target(&self) -> &NetLocation {
        &self.target
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }

    pub fn is_established(&self) -> bool {
        self.state == TunnelState::Established
    }

    /// The CONNECT request to send to the proxy.
    pub fn request_bytes(&self) -> Bytes {
        let authority = self.target.authority();
        let mut connect_str = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
        if let Some(ref header) = self.auth_header {
            connect_str.push_str(header);
        }
        connect_str.push_str("\r\n");
        Bytes::from(connect_str.into_bytes())
    }

    /// Feeds bytes received from the proxy.
    ///
    /// Returns `Ok(Some(leftover))` once the response has been fully read,
    /// where `leftover` is everything the proxy sent after the blank line.
    pub fn on_data(&mut self, mut data: &[u8]) -> Result<Option<Bytes>, TunnelError> {
        match self.state {
            TunnelState::AwaitingStatusLine | TunnelState::AwaitingBlankLine => {}
            TunnelState::Established | TunnelState::Failed => {
                return Err(TunnelError::Io(io::Error::other(
                    "proxy connect response already handled",
                )));
            }
        }

        loop {
            if let Some(leftover) = self.process_lines(data)? {
                return Ok(Some(leftover));
            }

            if data.is_empty() {
                return Ok(None);
            }

            let fed = self.line_reader.feed(data);
            data = &data[fed..];

            if self.state == TunnelState::AwaitingStatusLine
                && self.line_reader.pending_len() > MAX_STATUS_LINE_LENGTH
                && self.line_reader.is_cache_full()
            {
                return Err(self.fail(TunnelError::StatusLineTooLong(
                    self.line_reader.pending_len(),
                )));
            }

            if fed == 0 {
                let line = String::from_utf8_lossy(self.line_reader.unparsed_data()).into_owned();
                let error = match self.state {
                    TunnelState::AwaitingStatusLine => TunnelError::StatusLineTooLong(line.len()),
                    _ => TunnelError::UnknownSecondStatusLine(line),
                };
                return Err(self.fail(error));
            }
        }
    }

    /// Evaluates every complete line buffered so far.
    fn process_lines(&mut self, unfed: &[u8]) -> Result<Option<Bytes>, TunnelError> {
        loop {
            let line = match self.line_reader.read_line_bytes() {
                Some(line) => String::from_utf8_lossy(line).into_owned(),
                None => return Ok(None),
            };

            match self.state {
                TunnelState::AwaitingStatusLine => {
                    debug!("proxy connect to {}: {}", self.target, line);
                    if line.len() > MAX_STATUS_LINE_LENGTH {
                        return Err(self.fail(TunnelError::StatusLineTooLong(line.len())));
                    }
                    if !line.contains("200") {
                        return Err(self.fail(TunnelError::NonOkStatus(line)));
                    }
                    self.status_line = Some(line);
                    self.state = TunnelState::AwaitingBlankLine;
                }
                TunnelState::AwaitingBlankLine => {
                    if !line.trim().is_empty() {
                        return Err(self.fail(TunnelError::UnknownSecondStatusLine(line)));
                    }
                    self.state = TunnelState::Established;

                    let unparsed = self.line_reader.unparsed_data();
                    let mut leftover = BytesMut::with_capacity(unparsed.len() + unfed.len());
                    leftover.extend_from_slice(unparsed);
                    leftover.extend_from_slice(unfed);
                    return Ok(Some(leftover.freeze()));
                }
                TunnelState::Established | TunnelState::Failed => return Ok(None),
            }
        }
    }

    /// The proxy stream ended (with or without an error) before the tunnel
    /// was established.
    pub fn on_end(&mut self, error: Option<io::Error>) -> TunnelError {
        let error = match error {
            Some(e) => TunnelError::Io(e),
            None => TunnelError::ClosedBeforeResponse,
        };
        self.fail(error)
    }

    fn fail(&mut self, error: TunnelError) -> TunnelError {
        self.state = TunnelState::Failed;
        error
    }
}
