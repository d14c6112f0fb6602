//! tokio TCP wiring: a non-blocking `Transport` over `TcpStream`, the event
//! loop that feeds a `TlsSocket`, and HTTP CONNECT negotiation over a raw
//! stream.
//!
//! Everything here runs on the task that owns the socket. Sockets are not
//! `Send`, so use a current-thread runtime or a `LocalSet`.

use std::io;

use bytes::{Buf, Bytes};
use log::{debug, trace};
use tokio::io::Interest;
use tokio::net::TcpStream;

use crate::address::{Address, NetLocation};
use crate::buffer_queue::BufferQueue;
use crate::engine::HandshakeEngine;
use crate::error::TunnelError;
use crate::http_connect::ConnectTunnel;
use crate::tls_socket::TlsSocket;
use crate::transport::Transport;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 16384;

pub struct TcpTransport {
    stream: Option<TcpStream>,
    backlog: BufferQueue,
    paused: bool,
    ending: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: Some(stream),
            backlog: BufferQueue::new(),
            paused: false,
            ending: false,
        }
    }

    pub async fn connect(location: &NetLocation) -> io::Result<Self> {
        let stream = match location.address() {
            Address::Hostname(host) => TcpStream::connect((host.as_str(), location.port())).await?,
            _ => {
                let addr = location.to_socket_addr_nonblocking().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("cannot connect to {location}"),
                    )
                })?;
                TcpStream::connect(addr).await?
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY on connection to {location}: {e}");
        }
        Ok(Self::new(stream))
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }

    fn stream_or_err(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport is closed"))
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream_or_err()?.try_read(buf)
    }

    /// Writes as much of the backlog as the socket accepts right now. Closes
    /// the stream once the backlog is empty if `end` was requested.
    pub fn flush_backlog(&mut self) -> io::Result<()> {
        while let Some(front) = self.backlog.front() {
            let written = match self.stream_or_err()?.try_write(front) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                ));
            }
            self.backlog.advance(written);
        }
        if self.ending {
            self.close();
        }
        Ok(())
    }

    async fn ready(&self, interest: Interest) -> io::Result<tokio::io::Ready> {
        self.stream_or_err()?.ready(interest).await
    }
}

impl Transport for TcpTransport {
    fn write(&mut self, mut data: Bytes) -> io::Result<()> {
        let stream = self.stream_or_err()?;
        if self.backlog.is_empty() {
            match stream.try_write(&data) {
                Ok(n) => data.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        if !data.is_empty() {
            trace!("{} bytes queued behind a full socket", data.len());
            self.backlog.push_back(data);
        }
        Ok(())
    }

    fn backlog(&self) -> usize {
        self.backlog.remaining()
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
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
        self.ending = true;
        if self.backlog.is_empty() {
            self.close();
        }
    }

    fn close(&mut self) {
        self.stream = None;
        self.backlog.clear();
    }
}

/// Feeds socket events into `socket` until the connection closes, or until
/// it is paused with nothing left to flush. Call again after `resume`.
pub async fn drive<E: HandshakeEngine>(
    socket: &mut TlsSocket<E, TcpTransport>,
    read_buffer_size: usize,
) -> io::Result<()> {
    let mut buf = vec![0u8; read_buffer_size.max(1)];
    loop {
        if !socket.transport().is_open() {
            socket.on_closed();
            return Ok(());
        }

        let paused = socket.transport().is_paused();
        let has_backlog = socket.transport().backlog() > 0;
        let interest = match (paused, has_backlog) {
            (true, false) => return Ok(()),
            (true, true) => Interest::WRITABLE,
            (false, true) => Interest::READABLE.add(Interest::WRITABLE),
            (false, false) => Interest::READABLE,
        };

        let ready = match socket.transport().ready(interest).await {
            Ok(ready) => ready,
            Err(e) => {
                socket.on_end(Some(e));
                socket.close();
                continue;
            }
        };

        if ready.is_readable() && !socket.transport().is_paused() {
            match socket.transport().try_read(&mut buf) {
                Ok(0) => {
                    debug!("{:?}:{} reached end of stream", socket.host(), socket.port());
                    socket.on_end(None);
                    socket.close();
                    continue;
                }
                Ok(n) => socket.on_data(Bytes::copy_from_slice(&buf[..n])),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    socket.on_end(Some(e));
                    socket.close();
                    continue;
                }
            }
        }

        if ready.is_writable() && socket.transport().backlog() > 0 {
            match socket.transport_mut().flush_backlog() {
                Ok(()) => {
                    if socket.transport().backlog() == 0 {
                        socket.on_writable();
                    }
                }
                Err(e) => {
                    socket.on_end(Some(e));
                    socket.close();
                }
            }
        }
    }
}

/// Negotiates an HTTP CONNECT tunnel over a fresh proxy connection.
///
/// Returns the bytes the proxy sent after its response; they are the first
/// bytes of the tunneled stream.
pub async fn establish_tunnel(
    transport: &mut TcpTransport,
    tunnel: &mut ConnectTunnel,
) -> Result<Bytes, TunnelError> {
    debug!("requesting proxy tunnel to {}", tunnel.target());
    transport.write(tunnel.request_bytes())?;

    let mut buf = vec![0u8; 4096];
    loop {
        if !transport.is_open() {
            return Err(tunnel.on_end(None));
        }
        let interest = if transport.backlog() > 0 {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        let ready = match transport.ready(interest).await {
            Ok(ready) => ready,
            Err(e) => return Err(tunnel.on_end(Some(e))),
        };

        if ready.is_writable() && transport.backlog() > 0 {
            transport.flush_backlog()?;
        }

        if ready.is_readable() {
            match transport.try_read(&mut buf) {
                Ok(0) => return Err(tunnel.on_end(None)),
                Ok(n) => {
                    if let Some(leftover) = tunnel.on_data(&buf[..n])? {
                        debug!(
                            "proxy tunnel to {} established: {}",
                            tunnel.target(),
                            tunnel.status_line().unwrap_or_default()
                        );
                        return Ok(leftover);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(tunnel.on_end(Some(e))),
            }
        }
    }
}
