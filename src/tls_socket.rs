//! The record adapter: turns a handshake engine plus a raw byte transport
//! into a callback-driven TLS connection.
//!
//! Everything is push driven. Ciphertext arrives through `on_data`, the
//! transport reports drained writes through `on_writable` and termination
//! through `on_end`/`on_closed`. The adapter answers by running unwrap passes
//! (ciphertext to plaintext, delivered to the data callback) and wrap passes
//! (plaintext or handshake output to ciphertext, written to the transport).
//!
//! Engine results fan out into further passes (a handshake step read from
//! the peer usually needs a reply), so passes nest. Two flags keep that
//! bounded: a second unwrap pass requested while one is running is folded
//! into the running one, and a wrap request arriving during a wrap pass is
//! dropped (a plaintext write is retried through the writable callback once
//! the running pass is done).
//!
//! Callbacks receive `&mut TlsSocket` and may call back into it freely.

use std::io;

use bytes::{Buf, Bytes};
use log::{debug, error, trace, warn};
use rustls::pki_types::CertificateDer;

use crate::buffer_queue::{BufferPool, BufferQueue};
use crate::engine::{EngineResult, EngineStatus, HandshakeEngine, HandshakeStatus};
use crate::error::{SslError, TrustFailure};
use crate::growable_buffer::GrowableBuffer;
use crate::transport::Transport;
use crate::trust::TrustEvaluator;

pub const DEFAULT_DECODE_CAPACITY: usize = 8192;
pub const DEFAULT_MIN_ENCODE_CAPACITY: usize = 8182;
pub const DEFAULT_GROWTH_FACTOR: usize = 2;

/// Sizing of the adapter's scratch buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    pub initial_decode_capacity: usize,
    pub min_encode_capacity: usize,
    /// Applied on overflow. Values below 2 are treated as 2.
    pub growth_factor: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            initial_decode_capacity: DEFAULT_DECODE_CAPACITY,
            min_encode_capacity: DEFAULT_MIN_ENCODE_CAPACITY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
        }
    }
}

impl BufferPolicy {
    /// Encode buffer size for a wrap of `remaining` plaintext bytes.
    pub fn encode_capacity(&self, remaining: usize) -> usize {
        (remaining.saturating_mul(3) / 2).max(self.min_encode_capacity)
    }

    fn grow(&self, capacity: usize) -> usize {
        capacity.saturating_mul(self.growth_factor.max(2))
    }
}

pub type DataCallback<E, T> = Box<dyn FnMut(&mut TlsSocket<E, T>, &mut BufferQueue)>;
pub type WritableCallback<E, T> = Box<dyn FnMut(&mut TlsSocket<E, T>)>;
pub type EndCallback<E, T> = Box<dyn FnMut(&mut TlsSocket<E, T>, Option<&mut SslError>)>;
pub type ClosedCallback<E, T> = Box<dyn FnMut(&mut TlsSocket<E, T>)>;

/// A single-slot callback registration.
///
/// The callback is taken out of the slot while it runs so it can be handed
/// `&mut TlsSocket`. It is only put back if nothing was registered in the
/// meantime.
struct CallbackSlot<F> {
    callback: Option<F>,
    generation: u64,
}

impl<F> Default for CallbackSlot<F> {
    fn default() -> Self {
        Self {
            callback: None,
            generation: 0,
        }
    }
}

impl<F> CallbackSlot<F> {
    fn set(&mut self, callback: Option<F>) {
        self.callback = callback;
        self.generation = self.generation.wrapping_add(1);
    }

    fn is_set(&self) -> bool {
        self.callback.is_some()
    }

    fn take(&mut self) -> Option<(F, u64)> {
        self.callback.take().map(|cb| (cb, self.generation))
    }

    fn restore(&mut self, callback: F, generation: u64) {
        if self.generation == generation && self.callback.is_none() {
            self.callback = Some(callback);
        }
    }
}

pub struct TlsSocket<E, T> {
    engine: E,
    transport: T,
    host: Option<String>,
    port: u16,
    trust_evaluator: TrustEvaluator,
    policy: BufferPolicy,
    pool: BufferPool,

    decode_buffer: GrowableBuffer,
    /// Ciphertext received but not yet consumed by the engine.
    pending_ciphertext: BufferQueue,
    /// Decrypted bytes not yet consumed by the data callback.
    plaintext: BufferQueue,

    handshake_complete: bool,
    trust_evaluated: bool,
    peer_certificates: Option<Vec<CertificateDer<'static>>>,

    unwrapping: bool,
    wrapping: bool,
    /// Ciphertext arrived while an unwrap pass was running.
    data_arrived: bool,
    /// A plaintext write was dropped because a wrap pass was running.
    write_deferred: bool,
    end_reported: bool,
    closed_reported: bool,
    /// `end` was called; no more plaintext is accepted.
    end_requested: bool,

    data_callback: CallbackSlot<DataCallback<E, T>>,
    writable_callback: CallbackSlot<WritableCallback<E, T>>,
    end_callback: CallbackSlot<EndCallback<E, T>>,
    closed_callback: CallbackSlot<ClosedCallback<E, T>>,
}

impl<E: HandshakeEngine, T: Transport> TlsSocket<E, T> {
    /// `host` is the name the peer is expected to prove; it is ignored for
    /// server-side engines.
    pub fn new(transport: T, engine: E, host: Option<String>, port: u16) -> Self {
        let policy = BufferPolicy::default();
        Self {
            engine,
            transport,
            host,
            port,
            trust_evaluator: TrustEvaluator::default(),
            policy,
            pool: BufferPool::default(),
            decode_buffer: GrowableBuffer::new(policy.initial_decode_capacity),
            pending_ciphertext: BufferQueue::new(),
            plaintext: BufferQueue::new(),
            handshake_complete: false,
            trust_evaluated: false,
            peer_certificates: None,
            unwrapping: false,
            wrapping: false,
            data_arrived: false,
            write_deferred: false,
            end_reported: false,
            closed_reported: false,
            end_requested: false,
            data_callback: CallbackSlot::default(),
            writable_callback: CallbackSlot::default(),
            end_callback: CallbackSlot::default(),
            closed_callback: CallbackSlot::default(),
        }
    }

    pub fn with_trust_evaluator(mut self, trust_evaluator: TrustEvaluator) -> Self {
        self.trust_evaluator = trust_evaluator;
        self
    }

    pub fn with_buffer_policy(mut self, policy: BufferPolicy) -> Self {
        self.policy = policy;
        self.decode_buffer = GrowableBuffer::new(policy.initial_decode_capacity);
        self
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    /// The verified peer chain, end entity first. Only populated for client
    /// engines, once the handshake completed.
    pub fn peer_certificate_chain(&self) -> Option<&[CertificateDer<'static>]> {
        self.peer_certificates.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn decode_capacity(&self) -> usize {
        self.decode_buffer.capacity()
    }

    /// Decrypted bytes the data callback has not consumed yet.
    pub fn pending_plaintext(&self) -> usize {
        self.plaintext.remaining()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn close(&mut self) {
        self.transport.close();
    }

    /// Sends close_notify once the handshake is complete, then closes the
    /// transport after its backlog drains. Called from inside a wrap pass,
    /// this happens when the pass finishes.
    pub fn end(&mut self) {
        if self.end_requested || !self.transport.is_open() {
            return;
        }
        self.end_requested = true;
        if self.handshake_complete {
            self.engine.close_outbound();
        }
        if !self.wrapping {
            self.finish_end();
        }
    }

    pub fn pause(&mut self) {
        self.transport.pause();
    }

    pub fn is_paused(&self) -> bool {
        self.transport.is_paused()
    }

    /// Resumes the transport and delivers anything that piled up while paused.
    pub fn resume(&mut self) {
        self.transport.resume();
        self.on_data_available();
    }

    pub fn set_data_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut TlsSocket<E, T>, &mut BufferQueue) + 'static,
    {
        self.data_callback.set(Some(Box::new(callback)));
    }

    pub fn clear_data_callback(&mut self) {
        self.data_callback.set(None);
    }

    pub fn set_writable_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut TlsSocket<E, T>) + 'static,
    {
        self.writable_callback.set(Some(Box::new(callback)));
    }

    pub fn clear_writable_callback(&mut self) {
        self.writable_callback.set(None);
    }

    /// The end callback receives at most one error per connection. A trust
    /// failure may be marked ignored from inside the callback with
    /// `SslError::set_ignore`, which lets the handshake complete.
    pub fn set_end_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut TlsSocket<E, T>, Option<&mut SslError>) + 'static,
    {
        self.end_callback.set(Some(Box::new(callback)));
    }

    pub fn clear_end_callback(&mut self) {
        self.end_callback.set(None);
    }

    pub fn set_closed_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut TlsSocket<E, T>) + 'static,
    {
        self.closed_callback.set(Some(Box::new(callback)));
    }

    pub fn clear_closed_callback(&mut self) {
        self.closed_callback.set(None);
    }

    /// Kicks off the handshake. Client engines send their first flight here.
    pub fn start_handshake(&mut self) {
        if !self.handshake_complete {
            self.write(&mut BufferQueue::new());
        }
    }

    /// Ciphertext from the transport.
    pub fn on_data(&mut self, data: Bytes) {
        self.pending_ciphertext.push_back(data);
        if self.unwrapping {
            self.data_arrived = true;
            return;
        }
        self.on_data_available();
    }

    /// Runs an unwrap pass over pending ciphertext. A no-op while another
    /// pass is running, or while the transport is paused or closed.
    pub fn on_data_available(&mut self) {
        if self.unwrapping || !self.transport.is_open() || self.transport.is_paused() {
            return;
        }

        self.unwrapping = true;
        let mut result = Ok(());
        loop {
            self.data_arrived = false;
            if let Err(e) = self.unwrap_pending() {
                result = Err(e);
                break;
            }
            self.emit_plaintext();
            if !self.data_arrived || !self.transport.is_open() || self.transport.is_paused() {
                break;
            }
        }
        self.unwrapping = false;

        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// The transport drained its backlog.
    pub fn on_writable(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        if self.engine.wants_wrap() {
            self.write(&mut BufferQueue::new());
        }
        self.fire_writable();
    }

    /// The transport reached end of stream, or failed.
    pub fn on_end(&mut self, error: Option<io::Error>) {
        match error {
            Some(e) => self.fail(SslError::Transport(e)),
            None => {
                if !self.end_reported {
                    self.end_reported = true;
                    debug!("{} ended", self.peer_name());
                    self.report(None);
                }
            }
        }
    }

    pub fn on_closed(&mut self) {
        if self.closed_reported {
            return;
        }
        self.closed_reported = true;
        if let Some((mut callback, generation)) = self.closed_callback.take() {
            callback(self);
            self.closed_callback.restore(callback, generation);
        }
    }

    /// Encrypts as much of `plaintext` as the transport accepts, advancing it
    /// past what was consumed. Whatever is left should be retried from the
    /// writable callback.
    ///
    /// An empty queue drives the handshake. Once the handshake is complete,
    /// an empty write only flushes output the engine has queued itself, and
    /// never produces an empty record. Nothing is accepted after `end`.
    pub fn write(&mut self, plaintext: &mut BufferQueue) {
        if self.wrapping {
            if !plaintext.is_empty() {
                self.write_deferred = true;
            }
            return;
        }
        if self.end_requested || self.transport.backlog() > 0 || !self.transport.is_open() {
            return;
        }

        self.wrapping = true;
        let result = self.wrap_plaintext(plaintext);
        self.wrapping = false;

        if let Err(e) = result {
            self.fail(e);
            return;
        }

        if self.end_requested {
            self.finish_end();
            return;
        }

        if self.write_deferred
            && self.handshake_complete
            && self.transport.backlog() == 0
            && self.transport.is_open()
        {
            self.write_deferred = false;
            self.fire_writable();
        }
    }

    /// Wraps out whatever the engine still holds (close_notify) regardless
    /// of backlog, then ends the transport.
    fn finish_end(&mut self) {
        if !self.transport.is_open() {
            return;
        }
        if self.handshake_complete {
            self.wrapping = true;
            let result = self.wrap_plaintext(&mut BufferQueue::new());
            self.wrapping = false;
            if let Err(e) = result {
                self.fail(e);
                return;
            }
        }
        debug!("{} half-closed", self.peer_name());
        self.transport.end();
    }

    fn unwrap_pending(&mut self) -> Result<(), SslError> {
        self.decode_buffer.clear();
        let mut chunk = Bytes::new();
        loop {
            if !self.transport.is_open() {
                self.pending_ciphertext.push_front(chunk);
                break;
            }

            if chunk.is_empty()
                && let Some(next) = self.pending_ciphertext.pop_front()
            {
                chunk = next;
            }

            let mut remaining = Some(chunk.len());
            let result = self
                .engine
                .unwrap(&chunk, self.decode_buffer.write_slice())
                .map_err(SslError::Engine)?;
            chunk.advance(result.bytes_consumed);
            self.decode_buffer.advance_write(result.bytes_produced);

            match result.status {
                EngineStatus::BufferOverflow => {
                    self.flush_decode_buffer();
                    self.decode_buffer.grow(self.policy.growth_factor);
                    debug!(
                        "decode buffer for {} grown to {}",
                        self.peer_name(),
                        self.decode_buffer.capacity()
                    );
                    remaining = None;
                }
                EngineStatus::BufferUnderflow => {
                    self.pending_ciphertext.push_front(std::mem::take(&mut chunk));
                    if self.pending_ciphertext.len() <= 1 {
                        break;
                    }
                    // The record spans several received chunks.
                    self.pending_ciphertext.merge_all();
                    remaining = None;
                }
                EngineStatus::Ok | EngineStatus::Closed => {}
            }

            self.handle_result(&result)?;

            if remaining == Some(chunk.len()) {
                self.pending_ciphertext.push_front(chunk);
                break;
            }
        }

        self.flush_decode_buffer();
        Ok(())
    }

    fn flush_decode_buffer(&mut self) {
        if let Some(data) = self.decode_buffer.take_filled(&mut self.pool) {
            trace!("{}: {} bytes decrypted", self.peer_name(), data.len());
            self.plaintext.push_back(data);
        }
    }

    fn emit_plaintext(&mut self) {
        while !self.plaintext.is_empty()
            && self.transport.is_open()
            && !self.transport.is_paused()
        {
            let Some((mut callback, generation)) = self.data_callback.take() else {
                return;
            };

            let mut data = std::mem::take(&mut self.plaintext);
            let before = data.remaining();
            callback(self, &mut data);
            self.data_callback.restore(callback, generation);

            let after = data.remaining();
            // Anything queued while the callback ran goes behind what it left.
            data.append(&mut self.plaintext);
            self.plaintext = data;

            if after >= before {
                // Reading on would only grow the retained plaintext.
                if self.transport.is_open()
                    && !self.transport.is_paused()
                    && self.data_callback.is_set()
                {
                    warn!(
                        "data callback for {} left {} bytes unconsumed, pausing",
                        self.peer_name(),
                        after
                    );
                    self.transport.pause();
                }
                return;
            }
        }
    }

    fn wrap_plaintext(&mut self, plaintext: &mut BufferQueue) -> Result<(), SslError> {
        let mut encode_buffer = self
            .pool
            .obtain(self.policy.encode_capacity(plaintext.remaining()));

        loop {
            // An empty write after the handshake would emit a zero-length
            // record, which some peers treat as fatal.
            if self.handshake_complete && plaintext.is_empty() && !self.engine.wants_wrap() {
                break;
            }
            if !self.transport.is_open() {
                break;
            }

            let remaining = plaintext.remaining();
            let source = plaintext.merge_all();
            let result = match self.engine.wrap(&source, &mut encode_buffer) {
                Ok(result) => result,
                Err(e) => {
                    self.pool.reclaim(encode_buffer);
                    return Err(SslError::Engine(e));
                }
            };
            plaintext.advance(result.bytes_consumed);
            let mut progressed = plaintext.remaining() != remaining;

            let capacity = encode_buffer.len();
            let mut produced = std::mem::take(&mut encode_buffer);
            if result.status == EngineStatus::BufferOverflow {
                encode_buffer = self.pool.obtain(self.policy.grow(capacity));
                debug!(
                    "encode buffer for {} grown to {}",
                    self.peer_name(),
                    encode_buffer.len()
                );
                progressed = true;
            } else {
                encode_buffer = self
                    .pool
                    .obtain(self.policy.encode_capacity(plaintext.remaining()));
            }

            if result.bytes_produced > 0 {
                produced.truncate(result.bytes_produced);
                trace!(
                    "{}: writing {} bytes of ciphertext",
                    self.peer_name(),
                    produced.len()
                );
                if let Err(e) = self.transport.write(Bytes::from(produced)) {
                    self.pool.reclaim(encode_buffer);
                    return Err(SslError::Transport(e));
                }
            } else {
                self.pool.reclaim(produced);
            }

            if let Err(e) = self.handle_result(&result) {
                self.pool.reclaim(encode_buffer);
                return Err(e);
            }

            let needs_wrap = result.handshake_status == HandshakeStatus::NeedWrap;
            if !(progressed || needs_wrap) || self.transport.backlog() > 0 {
                break;
            }
        }

        self.pool.reclaim(encode_buffer);
        Ok(())
    }

    /// Reacts to the handshake phase an engine step left behind, then checks
    /// whether the handshake just completed.
    fn handle_result(&mut self, result: &EngineResult) -> Result<(), SslError> {
        match result.handshake_status {
            HandshakeStatus::NeedTask => {
                self.run_delegated_tasks();
                match self.engine.handshake_status() {
                    HandshakeStatus::NeedWrap => self.write(&mut BufferQueue::new()),
                    HandshakeStatus::NeedUnwrap => self.on_data_available(),
                    _ => {}
                }
            }
            HandshakeStatus::NeedWrap => self.write(&mut BufferQueue::new()),
            HandshakeStatus::NeedUnwrap => self.on_data_available(),
            HandshakeStatus::NotHandshaking | HandshakeStatus::Finished => {
                // Post-handshake messages such as a key update reply.
                if self.handshake_complete && self.engine.wants_wrap() {
                    self.write(&mut BufferQueue::new());
                }
            }
        }

        if !self.trust_evaluated
            && self.transport.is_open()
            && self.engine.handshake_status().is_done()
        {
            self.finish_handshake()?;
        }
        Ok(())
    }

    fn run_delegated_tasks(&mut self) {
        while let Some(task) = self.engine.delegated_task() {
            task();
        }
    }

    fn finish_handshake(&mut self) -> Result<(), SslError> {
        self.trust_evaluated = true;

        if self.engine.is_client() {
            let chain = self.engine.peer_certificates().unwrap_or_default();
            if let Err(cause) = self.trust_evaluator.evaluate(self.host.as_deref(), &chain) {
                warn!("{} is not trusted: {}", self.peer_name(), cause);
                let mut error = SslError::Trust(TrustFailure::new(cause));
                self.report(Some(&mut error));
                if !error.is_ignored() {
                    self.end_reported = true;
                    return Err(error);
                }
                warn!("continuing with untrusted peer {}", self.peer_name());
            }
            self.peer_certificates = Some(chain);
        }

        self.handshake_complete = true;
        debug!("tls handshake with {} complete", self.peer_name());

        self.fire_writable();
        self.on_data_available();
        Ok(())
    }

    fn fire_writable(&mut self) {
        if let Some((mut callback, generation)) = self.writable_callback.take() {
            callback(self);
            self.writable_callback.restore(callback, generation);
        }
    }

    fn report(&mut self, error: Option<&mut SslError>) {
        if let Some((mut callback, generation)) = self.end_callback.take() {
            callback(self, error);
            self.end_callback.restore(callback, generation);
        }
    }

    fn fail(&mut self, mut error: SslError) {
        if !self.end_reported {
            self.end_reported = true;
            error!("tls connection to {} failed: {}", self.peer_name(), error);
            self.report(Some(&mut error));
        }
        self.transport.close();
    }

    fn peer_name(&self) -> String {
        match self.host {
            Some(ref host) => format!("{}:{}", host, self.port),
            None => format!("peer:{}", self.port),
        }
    }
}
