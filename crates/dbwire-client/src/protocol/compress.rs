//! Compressed protocol envelope.
//!
//! Once compression is negotiated every write is wrapped in compressed
//! frames with a 7-byte header:
//! - 3 bytes: length of the frame body on the wire
//! - 1 byte: compressed sequence number (separate from packet sequence)
//! - 3 bytes: length after decompression, or 0 when the body is stored raw
//!
//! Frame bodies carry ordinary framed packets. Bodies shorter than
//! [`MIN_COMPRESS_LENGTH`] are stored raw, as are bodies zstd cannot shrink.

use std::io::{self, Read, Write};

use super::MAX_PACKET_SIZE;

/// Size of the compressed frame header.
pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Bodies shorter than this are not worth compressing.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Default zstd level sent in the handshake response.
pub const DEFAULT_ZSTD_LEVEL: u8 = 3;

/// A `Read + Write` adapter speaking the compressed envelope.
///
/// Writes are buffered until `flush`, which emits one or more frames.
/// Corrupt frames surface as `io::ErrorKind::InvalidData`.
#[derive(Debug)]
pub struct CompressedStream<S> {
    inner: S,
    level: i32,
    sequence_id: u8,
    read_buf: Vec<u8>,
    read_pos: usize,
    write_buf: Vec<u8>,
}

impl<S> CompressedStream<S> {
    /// Wrap a stream using the given zstd level.
    pub fn new(inner: S, level: u8) -> Self {
        Self {
            inner,
            level: i32::from(level),
            sequence_id: 0,
            read_buf: Vec::new(),
            read_pos: 0,
            write_buf: Vec::new(),
        }
    }

    /// Restart the compressed sequence at the beginning of a command.
    pub fn reset_sequence(&mut self) {
        self.sequence_id = 0;
    }

    /// Borrow the wrapped stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the wrapped stream.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

fn corrupt(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

fn read_u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}

#[allow(clippy::cast_possible_truncation)]
fn write_u24(out: &mut Vec<u8>, value: usize) {
    out.push((value & 0xFF) as u8);
    out.push(((value >> 8) & 0xFF) as u8);
    out.push(((value >> 16) & 0xFF) as u8);
}

impl<S: Read> CompressedStream<S> {
    fn fill_frame(&mut self) -> io::Result<()> {
        let mut header = [0u8; COMPRESSED_HEADER_SIZE];
        self.inner.read_exact(&mut header)?;
        let body_len = read_u24(&header[0..3]);
        let sequence_id = header[3];
        let uncompressed_len = read_u24(&header[4..7]);

        if sequence_id != self.sequence_id {
            return Err(corrupt(format!(
                "compressed sequence mismatch: expected {}, got {}",
                self.sequence_id, sequence_id
            )));
        }
        self.sequence_id = self.sequence_id.wrapping_add(1);

        let mut body = vec![0u8; body_len];
        self.inner.read_exact(&mut body)?;

        self.read_buf = if uncompressed_len == 0 {
            body
        } else {
            let inflated = zstd::bulk::decompress(&body, uncompressed_len)
                .map_err(|e| corrupt(format!("zstd decompression failed: {e}")))?;
            if inflated.len() != uncompressed_len {
                return Err(corrupt(format!(
                    "compressed frame declared {} bytes, inflated to {}",
                    uncompressed_len,
                    inflated.len()
                )));
            }
            inflated
        };
        self.read_pos = 0;
        Ok(())
    }
}

impl<S: Read> Read for CompressedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.read_pos >= self.read_buf.len() {
            self.fill_frame()?;
        }
        let available = &self.read_buf[self.read_pos..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl<S: Write> Write for CompressedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.write_buf.is_empty() {
            let pending = std::mem::take(&mut self.write_buf);
            let mut out = Vec::with_capacity(pending.len() + COMPRESSED_HEADER_SIZE);
            for chunk in pending.chunks(MAX_PACKET_SIZE) {
                let compressed = if chunk.len() < MIN_COMPRESS_LENGTH {
                    None
                } else {
                    zstd::bulk::compress(chunk, self.level)
                        .ok()
                        .filter(|c| c.len() < chunk.len())
                };
                match compressed {
                    Some(body) => {
                        write_u24(&mut out, body.len());
                        out.push(self.sequence_id);
                        write_u24(&mut out, chunk.len());
                        out.extend_from_slice(&body);
                    }
                    None => {
                        write_u24(&mut out, chunk.len());
                        out.push(self.sequence_id);
                        write_u24(&mut out, 0);
                        out.extend_from_slice(chunk);
                    }
                }
                self.sequence_id = self.sequence_id.wrapping_add(1);
            }
            self.inner.write_all(&out)?;
        }
        self.inner.flush()
    }
}
