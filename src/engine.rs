//! The handshake engine contract driven by the record adapter.
//!
//! An engine performs one incremental cryptographic step per call over a pair
//! of bounded buffers and reports how far it got. Overflow and underflow are
//! sizing signals for the caller, not errors.

use std::io;

use rustls::pki_types::CertificateDer;

/// Outcome of a single `wrap` or `unwrap` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStatus {
    Ok,
    /// The output buffer was too small for what the engine had to produce.
    BufferOverflow,
    /// The input did not hold a complete record.
    BufferUnderflow,
    /// The engine was closed by the peer.
    Closed,
}

/// The engine's handshake phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// Only ever reported in the result of the step that completed the handshake.
    Finished,
    /// A delegated task must run before the handshake can continue.
    NeedTask,
    /// The engine has handshake data to send.
    NeedWrap,
    /// The engine needs more data from the peer.
    NeedUnwrap,
}

impl HandshakeStatus {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: EngineStatus,
    pub handshake_status: HandshakeStatus,
    pub bytes_consumed: usize,
    pub bytes_produced: usize,
}

impl EngineResult {
    pub fn new(
        status: EngineStatus,
        handshake_status: HandshakeStatus,
        bytes_consumed: usize,
        bytes_produced: usize,
    ) -> Self {
        Self {
            status,
            handshake_status,
            bytes_consumed,
            bytes_produced,
        }
    }
}

/// Cryptographic setup work the engine wants run outside of `wrap`/`unwrap`.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

pub trait HandshakeEngine {
    /// Consumes plaintext from `src` (possibly none while handshaking) and
    /// writes ciphertext into `dst`.
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult>;

    /// Consumes ciphertext from `src` and writes any plaintext into `dst`.
    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> io::Result<EngineResult>;

    /// The current handshake phase. Never `Finished`.
    fn handshake_status(&self) -> HandshakeStatus;

    /// Whether a wrap with no plaintext would produce output: handshake
    /// messages, alerts, key updates.
    fn wants_wrap(&self) -> bool;

    /// Queues a close_notify alert for the next wrap.
    fn close_outbound(&mut self);

    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    /// The peer's certificate chain, end-entity first, once it is known.
    fn peer_certificates(&self) -> Option<Vec<CertificateDer<'static>>>;

    fn is_client(&self) -> bool;
}
