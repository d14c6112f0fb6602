use std::io;

use bytes::Bytes;

/// A non-blocking byte-stream the record adapter writes ciphertext to.
///
/// Reads are pushed into the adapter by whoever drives the transport
/// (see `TlsSocket::on_data`), so only the outbound half and lifecycle
/// controls live here.
pub trait Transport {
    /// Queues `data` for sending. Whatever cannot be sent immediately is kept
    /// in the transport's backlog.
    fn write(&mut self, data: Bytes) -> io::Result<()>;

    /// Bytes accepted by `write` but not yet handed to the network.
    fn backlog(&self) -> usize;

    fn is_open(&self) -> bool;

    fn pause(&mut self);

    fn resume(&mut self);

    fn is_paused(&self) -> bool;

    /// Closes the stream once the backlog has been flushed.
    fn end(&mut self);

    /// Closes the stream immediately, dropping any backlog.
    fn close(&mut self);
}
