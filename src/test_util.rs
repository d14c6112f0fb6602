//! Test doubles: a record-framed mock handshake engine and an in-memory
//! transport.
//!
//! `MockEngine` behaves like a strict SSLEngine: it processes one record per
//! `unwrap` call, reports underflow for partial records and overflow when
//! the output slice cannot hold a record, asks for a delegated task on the
//! server side, and rejects zero-length application records. A closed
//! outbound side is announced with a `CLOSE` record.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use rustls::pki_types::CertificateDer;

use crate::buffer_queue::BufferQueue;
use crate::engine::{DelegatedTask, EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus};
use crate::transport::Transport;
use crate::trust::{HostnameVerifier, TrustManager};

pub const CLIENT_HELLO: u8 = 1;
pub const SERVER_HELLO: u8 = 2;
pub const APP_DATA: u8 = 3;
pub const CLOSE: u8 = 4;

const HEADER_LEN: usize = 3;
const CLIENT_HELLO_PAYLOAD: &[u8] = b"client hello";

/// Encodes one mock record.
pub fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MockState {
    ClientStart,
    ClientAwaitServerHello,
    ServerAwaitHello,
    ServerNeedTask,
    Done,
    Closed,
}

pub struct MockEngine {
    client: bool,
    state: MockState,
    certificate: Vec<u8>,
    peer_certificate: Option<Vec<u8>>,
    task_handed_out: bool,
    task_done: Arc<AtomicBool>,
    max_record_payload: usize,
    close_pending: bool,
    outbound_closed: bool,
    pub tasks_run: Arc<AtomicBool>,
}

impl MockEngine {
    pub fn client() -> Self {
        Self::new(true, vec![])
    }

    pub fn server(certificate: &[u8]) -> Self {
        Self::new(false, certificate.to_vec())
    }

    fn new(client: bool, certificate: Vec<u8>) -> Self {
        let task_done = Arc::new(AtomicBool::new(false));
        Self {
            client,
            state: if client {
                MockState::ClientStart
            } else {
                MockState::ServerAwaitHello
            },
            certificate,
            peer_certificate: None,
            task_handed_out: false,
            tasks_run: task_done.clone(),
            task_done,
            max_record_payload: 1024,
            close_pending: false,
            outbound_closed: false,
        }
    }

    pub fn with_max_record_payload(mut self, max_record_payload: usize) -> Self {
        self.max_record_payload = max_record_payload;
        self
    }

    /// The bytes a server engine sends to complete the handshake.
    pub fn server_hello(certificate: &[u8]) -> Vec<u8> {
        record(SERVER_HELLO, certificate)
    }

    fn result(&self, status: EngineStatus, consumed: usize, produced: usize) -> EngineResult {
        EngineResult::new(status, self.handshake_status(), consumed, produced)
    }
}

impl HandshakeEngine for MockEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        match self.state {
            MockState::ClientStart => {
                let out = record(CLIENT_HELLO, CLIENT_HELLO_PAYLOAD);
                if out.len() > dst.len() {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                dst[..out.len()].copy_from_slice(&out);
                self.state = MockState::ClientAwaitServerHello;
                Ok(self.result(EngineStatus::Ok, 0, out.len()))
            }
            MockState::ServerNeedTask if self.task_done.load(Ordering::SeqCst) => {
                let out = record(SERVER_HELLO, &self.certificate);
                if out.len() > dst.len() {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                dst[..out.len()].copy_from_slice(&out);
                self.state = MockState::Done;
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::Finished,
                    0,
                    out.len(),
                ))
            }
            MockState::Done if self.close_pending => {
                let out = record(CLOSE, &[]);
                if out.len() > dst.len() {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                dst[..out.len()].copy_from_slice(&out);
                self.close_pending = false;
                self.outbound_closed = true;
                Ok(self.result(EngineStatus::Ok, 0, out.len()))
            }
            MockState::Done if self.outbound_closed => Ok(self.result(EngineStatus::Closed, 0, 0)),
            MockState::Done => {
                if src.is_empty() {
                    // What a real engine does with an empty write; the peer
                    // treats it as a protocol violation.
                    if dst.len() < HEADER_LEN {
                        return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                    }
                    dst[..HEADER_LEN].copy_from_slice(&record(APP_DATA, &[]));
                    return Ok(self.result(EngineStatus::Ok, 0, HEADER_LEN));
                }
                let mut consumed = 0;
                let mut produced = 0;
                while consumed < src.len() {
                    let len = (src.len() - consumed).min(self.max_record_payload);
                    if produced + HEADER_LEN + len > dst.len() {
                        break;
                    }
                    let out = record(APP_DATA, &src[consumed..consumed + len]);
                    dst[produced..produced + out.len()].copy_from_slice(&out);
                    produced += out.len();
                    consumed += len;
                }
                if consumed == 0 {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                Ok(self.result(EngineStatus::Ok, consumed, produced))
            }
            MockState::Closed => Ok(self.result(EngineStatus::Closed, 0, 0)),
            _ => Ok(self.result(EngineStatus::Ok, 0, 0)),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult> {
        match self.handshake_status() {
            HandshakeStatus::NeedWrap | HandshakeStatus::NeedTask => {
                return Ok(self.result(EngineStatus::Ok, 0, 0));
            }
            _ => {}
        }
        if self.state == MockState::Closed {
            return Ok(self.result(EngineStatus::Closed, 0, 0));
        }

        if src.len() < HEADER_LEN {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let kind = src[0];
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER_LEN + len {
            return Ok(self.result(EngineStatus::BufferUnderflow, 0, 0));
        }
        let payload = &src[HEADER_LEN..HEADER_LEN + len];
        let consumed = HEADER_LEN + len;

        match (kind, self.state) {
            (CLIENT_HELLO, MockState::ServerAwaitHello) => {
                self.state = MockState::ServerNeedTask;
                Ok(self.result(EngineStatus::Ok, consumed, 0))
            }
            (SERVER_HELLO, MockState::ClientAwaitServerHello) => {
                self.peer_certificate = Some(payload.to_vec());
                self.state = MockState::Done;
                Ok(EngineResult::new(
                    EngineStatus::Ok,
                    HandshakeStatus::Finished,
                    consumed,
                    0,
                ))
            }
            (APP_DATA, MockState::Done) => {
                if len == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "zero-length application record",
                    ));
                }
                if len > dst.len() {
                    return Ok(self.result(EngineStatus::BufferOverflow, 0, 0));
                }
                dst[..len].copy_from_slice(payload);
                Ok(self.result(EngineStatus::Ok, consumed, len))
            }
            (CLOSE, _) => {
                self.state = MockState::Closed;
                Ok(self.result(EngineStatus::Closed, consumed, 0))
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected record type {kind} in state {:?}", self.state),
            )),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.state {
            MockState::ClientStart => HandshakeStatus::NeedWrap,
            MockState::ClientAwaitServerHello | MockState::ServerAwaitHello => {
                HandshakeStatus::NeedUnwrap
            }
            MockState::ServerNeedTask => {
                if self.task_done.load(Ordering::SeqCst) {
                    HandshakeStatus::NeedWrap
                } else {
                    HandshakeStatus::NeedTask
                }
            }
            MockState::Done | MockState::Closed => HandshakeStatus::NotHandshaking,
        }
    }

    fn wants_wrap(&self) -> bool {
        self.close_pending || self.handshake_status() == HandshakeStatus::NeedWrap
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.close_pending = true;
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if self.state != MockState::ServerNeedTask || self.task_handed_out {
            return None;
        }
        self.task_handed_out = true;
        let task_done = self.task_done.clone();
        Some(Box::new(move || task_done.store(true, Ordering::SeqCst)))
    }

    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>> {
        self.peer_certificate
            .as_ref()
            .map(|cert| vec![CertificateDer::from(cert.clone())])
    }

    fn is_client(&self) -> bool {
        self.client
    }
}

/// In-memory transport. Writes land in `writes` unless blocked, in which
/// case they queue up as backlog until `flush_backlog`.
pub struct MemoryTransport {
    pub writes: Vec<Bytes>,
    backlog: BufferQueue,
    blocked: bool,
    open: bool,
    paused: bool,
    ended: bool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            writes: vec![],
            backlog: BufferQueue::new(),
            blocked: false,
            open: true,
            paused: false,
            ended: false,
        }
    }

    /// Everything written so far, concatenated; clears the write log.
    pub fn take_written(&mut self) -> Bytes {
        let mut out = BytesMut::new();
        for chunk in self.writes.drain(..) {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }

    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    pub fn flush_backlog(&mut self) {
        while let Some(chunk) = self.backlog.pop_front() {
            self.writes.push(chunk);
        }
        if self.ended {
            self.open = false;
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

impl Transport for MemoryTransport {
    fn write(&mut self, data: Bytes) -> io::Result<()> {
        if !self.open {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if self.blocked || !self.backlog.is_empty() {
            self.backlog.push_back(data);
        } else {
            self.writes.push(data);
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.backlog.remaining()
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn resume(&mut self) {
        self.paused = false;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn end(&mut self) {
        self.ended = true;
        if self.backlog.is_empty() {
            self.open = false;
        }
    }

    fn close(&mut self) {
        self.open = false;
        self.backlog.clear();
    }
}

/// Trust manager with a fixed verdict.
#[derive(Debug)]
pub struct StaticTrustManager(pub bool);

impl TrustManager for StaticTrustManager {
    fn check_server_trusted(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
    ) -> Result<(), rustls::Error> {
        if self.0 {
            Ok(())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ))
        }
    }
}

/// Hostname verifier accepting a single fixed name.
#[derive(Debug)]
pub struct FixedHostnameVerifier(pub &'static str);

impl HostnameVerifier for FixedHostnameVerifier {
    fn verify(&self, host: &str, _end_entity: &CertificateDer<'_>) -> Result<(), rustls::Error> {
        if host == self.0 {
            Ok(())
        } else {
            Err(rustls::Error::General(format!("unexpected host {host}")))
        }
    }
}

/// Self-signed certificate for the given names: (cert PEM, key PEM, cert DER).
pub fn generate_test_certificate(names: &[&str]) -> (String, String, CertificateDer<'static>) {
    let key_pair = rcgen::KeyPair::generate().expect("Failed to generate key pair");
    let params =
        rcgen::CertificateParams::new(names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .expect("Failed to create certificate params");
    let cert = params
        .self_signed(&key_pair)
        .expect("Failed to create self-signed certificate");
    (cert.pem(), key_pair.serialize_pem(), cert.der().clone())
}

/// Hex SHA-256 fingerprint of a certificate, as accepted in configs.
pub fn fingerprint_hex(cert: &CertificateDer<'_>) -> String {
    crate::trust::FingerprintTrustManager::fingerprint(cert)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
