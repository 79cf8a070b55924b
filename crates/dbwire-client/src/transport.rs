//! Packet transport.
//!
//! [`PacketTransport`] turns a byte stream into a sequence of logical
//! messages: `send` frames a payload into chunks of at most the chunk size
//! (with an empty terminator when the payload is an exact multiple) and
//! `receive` reassembles them, checking sequence numbers on the way.
//!
//! The stream underneath is a [`Wire`]: a plain or TLS [`Socket`], optionally
//! wrapped in the compressed envelope.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::config::HostAddress;
use crate::protocol::compress::CompressedStream;
use crate::protocol::writer::{frame_packets, packet_count};
use crate::protocol::{MAX_PACKET_SIZE, PacketHeader};
use dbwire_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};
use dbwire_core::{Error, Result};

/// The physical socket: plain TCP or TLS over TCP.
#[derive(Debug)]
pub enum Socket {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<crate::tls::TlsStream<TcpStream>>),
}

impl Socket {
    /// Open a TCP connection to `addr` within `timeout`.
    pub fn connect(addr: &HostAddress, timeout: Duration) -> Result<Self> {
        let resolved = addr
            .socket_addr()
            .to_socket_addrs()
            .map_err(|e| {
                connection_error(
                    ConnectionErrorKind::Connect,
                    format!("Failed to resolve {addr}: {e}"),
                    Some(e),
                )
            })?
            .collect::<Vec<_>>();

        let mut last_error = None;
        for socket_addr in resolved {
            match TcpStream::connect_timeout(&socket_addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    stream.set_read_timeout(Some(timeout)).ok();
                    stream.set_write_timeout(Some(timeout)).ok();
                    return Ok(Socket::Plain(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(match last_error {
            Some(e) => {
                let kind = if e.kind() == io::ErrorKind::ConnectionRefused {
                    ConnectionErrorKind::Refused
                } else {
                    ConnectionErrorKind::Connect
                };
                connection_error(kind, format!("Failed to connect to {addr}: {e}"), Some(e))
            }
            None => connection_error(
                ConnectionErrorKind::Connect,
                format!("{addr} did not resolve to any address"),
                None,
            ),
        })
    }

    /// The TCP stream underneath.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Socket::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            Socket::Tls(tls) => tls.get_ref(),
        }
    }

    /// Apply the socket read/write timeout.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let tcp = self.tcp();
        tcp.set_read_timeout(timeout)?;
        tcp.set_write_timeout(timeout)?;
        Ok(())
    }

    /// Upgrade a plain socket to TLS.
    #[cfg(feature = "tls")]
    pub fn upgrade_tls(
        self,
        tls_config: &crate::config::TlsConfig,
        server_name: &str,
        ssl_mode: crate::config::SslMode,
    ) -> Result<Self> {
        match self {
            Socket::Plain(stream) => Ok(Socket::Tls(Box::new(crate::tls::TlsStream::new(
                stream, tls_config, server_name, ssl_mode,
            )?))),
            tls @ Socket::Tls(_) => Ok(tls),
        }
    }

    #[cfg(not(feature = "tls"))]
    pub fn upgrade_tls(
        self,
        _tls_config: &crate::config::TlsConfig,
        _server_name: &str,
        _ssl_mode: crate::config::SslMode,
    ) -> Result<Self> {
        Err(crate::tls::tls_error(
            "TLS support requires the 'tls' feature",
        ))
    }

    pub fn is_tls(&self) -> bool {
        !matches!(self, Socket::Plain(_))
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Socket::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Socket::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            Socket::Tls(s) => s.flush(),
        }
    }
}

/// A socket with or without the compressed envelope.
#[derive(Debug)]
pub enum Wire {
    Raw(Socket),
    Compressed(CompressedStream<Socket>),
}

impl Wire {
    pub fn socket(&self) -> &Socket {
        match self {
            Wire::Raw(s) => s,
            Wire::Compressed(c) => c.get_ref(),
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self, Wire::Compressed(_))
    }

    /// Restart the compressed sequence; a no-op on raw sockets.
    pub fn reset_compression_sequence(&mut self) {
        if let Wire::Compressed(c) = self {
            c.reset_sequence();
        }
    }

    /// Shut the TCP socket down in both directions.
    pub fn shutdown(&self) {
        let _ = self.socket().tcp().shutdown(Shutdown::Both);
    }
}

impl Read for Wire {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Wire::Raw(s) => s.read(buf),
            Wire::Compressed(c) => c.read(buf),
        }
    }
}

impl Write for Wire {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Wire::Raw(s) => s.write(buf),
            Wire::Compressed(c) => c.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Wire::Raw(s) => s.flush(),
            Wire::Compressed(c) => c.flush(),
        }
    }
}

/// Framed, sequenced message exchange over a byte stream.
#[derive(Debug)]
pub struct PacketTransport<S> {
    stream: S,
    sequence_id: u8,
    max_chunk: usize,
    max_message: usize,
}

impl<S: Read + Write> PacketTransport<S> {
    pub fn new(stream: S) -> Self {
        Self::with_max_chunk(stream, MAX_PACKET_SIZE)
    }

    /// Use a smaller chunk size (framing tests).
    pub fn with_max_chunk(stream: S, max_chunk: usize) -> Self {
        Self {
            stream,
            sequence_id: 0,
            max_chunk: max_chunk.clamp(1, MAX_PACKET_SIZE),
            max_message: usize::MAX,
        }
    }

    /// Reject inbound messages larger than `limit` bytes.
    #[must_use]
    pub fn with_max_message(mut self, limit: usize) -> Self {
        self.max_message = limit;
        self
    }

    /// Start a new command: sequence numbers restart at 0.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Next sequence number expected or written.
    pub fn sequence_id(&self) -> u8 {
        self.sequence_id
    }

    /// Set the sequence number the next packet must carry.
    pub fn set_sequence(&mut self, sequence_id: u8) {
        self.sequence_id = sequence_id;
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Frame and write one message without flushing.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_message(&mut self, payload: &[u8]) -> Result<()> {
        let framed = frame_packets(payload, self.sequence_id, self.max_chunk);
        let packets = packet_count(payload.len(), self.max_chunk);
        self.sequence_id = self.sequence_id.wrapping_add(packets as u8);
        self.stream
            .write_all(&framed)
            .map_err(|e| io_error(e, "Failed to write packet"))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.stream
            .flush()
            .map_err(|e| io_error(e, "Failed to flush stream"))
    }

    /// Frame, write and flush one message.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.write_message(payload)?;
        self.flush()
    }

    /// Read one message, reassembling chunks.
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let mut header_buf = [0u8; PacketHeader::SIZE];
            self.stream
                .read_exact(&mut header_buf)
                .map_err(|e| io_error(e, "Failed to read packet header"))?;
            let header = PacketHeader::from_bytes(&header_buf);

            if header.sequence_id != self.sequence_id {
                return Err(Error::Protocol(ProtocolError {
                    message: format!(
                        "Packet sequence mismatch: expected {}, got {}",
                        self.sequence_id, header.sequence_id
                    ),
                    raw_data: Some(header_buf.to_vec()),
                    source: None,
                }));
            }
            self.sequence_id = self.sequence_id.wrapping_add(1);

            let len = header.payload_length as usize;
            let start = payload.len();
            if start + len > self.max_message {
                return Err(Error::Protocol(ProtocolError {
                    message: format!(
                        "Incoming message exceeds max_packet_size of {} bytes",
                        self.max_message
                    ),
                    raw_data: Some(header_buf.to_vec()),
                    source: None,
                }));
            }
            payload.resize(start + len, 0);
            self.stream
                .read_exact(&mut payload[start..])
                .map_err(|e| io_error(e, "Failed to read packet payload"))?;

            if len < self.max_chunk {
                return Ok(payload);
            }
        }
    }
}

/// Map a socket error onto the error taxonomy.
///
/// Timeouts and resets are connection errors (failover-eligible); corrupt
/// data (TLS or compression) is a protocol error.
pub fn io_error(e: io::Error, context: &str) -> Error {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => connection_error(
            ConnectionErrorKind::Timeout,
            format!("{context}: socket timed out"),
            Some(e),
        ),
        io::ErrorKind::InvalidData => Error::Protocol(ProtocolError {
            message: format!("{context}: {e}"),
            raw_data: None,
            source: Some(Box::new(e)),
        }),
        _ => connection_error(
            ConnectionErrorKind::Disconnected,
            format!("{context}: {e}"),
            Some(e),
        ),
    }
}

pub(crate) fn connection_error(
    kind: ConnectionErrorKind,
    message: String,
    source: Option<io::Error>,
) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message,
        source: source.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}
