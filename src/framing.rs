//! Length-prefix framing at the transport boundary.
//!
//! Each wire message is a length header followed by exactly that many
//! payload bytes. Header encodings vary between ISO 8583 deployments, so
//! the header codec is pluggable: a [`LengthFramer`] reads one header from
//! the inbound stream and writes one into an outbound buffer. Built-in
//! framers cover fixed-width binary, ASCII-decimal and BCD headers.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::errors::ConnectionError;

/// Reads and writes the length header that frames each message.
///
/// The length written for an outbound frame must equal the number of
/// payload bytes that immediately follow it; the engine interprets no
/// other bytes on the wire.
#[async_trait]
pub trait LengthFramer: Send + Sync + 'static {
    /// Read and decode exactly one length header from the stream.
    ///
    /// # Errors
    /// Returns an error on EOF or when the header is malformed.
    async fn read_length(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<usize>;

    /// Encode and append the header for a payload of `length` bytes.
    ///
    /// # Errors
    /// Returns an error when `length` is not representable in the header.
    fn write_length(&self, buf: &mut Vec<u8>, length: usize) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum BinaryWidth {
    Two,
    Four,
}

/// Fixed-width big-endian binary length header.
#[derive(Debug, Clone, Copy)]
pub struct BinaryFramer {
    width: BinaryWidth,
}

impl BinaryFramer {
    /// Two-byte header; payloads up to 65 535 bytes.
    #[must_use]
    pub const fn u16() -> Self { Self { width: BinaryWidth::Two } }

    /// Four-byte header.
    #[must_use]
    pub const fn u32() -> Self { Self { width: BinaryWidth::Four } }
}

#[async_trait]
impl LengthFramer for BinaryFramer {
    async fn read_length(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<usize> {
        match self.width {
            BinaryWidth::Two => {
                let mut header = [0u8; 2];
                reader.read_exact(&mut header).await?;
                Ok(usize::from(u16::from_be_bytes(header)))
            }
            BinaryWidth::Four => {
                let mut header = [0u8; 4];
                reader.read_exact(&mut header).await?;
                usize::try_from(u32::from_be_bytes(header)).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "length exceeds usize")
                })
            }
        }
    }

    fn write_length(&self, buf: &mut Vec<u8>, length: usize) -> io::Result<()> {
        match self.width {
            BinaryWidth::Two => {
                let header = u16::try_from(length).map_err(|_| header_overflow(length))?;
                buf.extend_from_slice(&header.to_be_bytes());
            }
            BinaryWidth::Four => {
                let header = u32::try_from(length).map_err(|_| header_overflow(length))?;
                buf.extend_from_slice(&header.to_be_bytes());
            }
        }
        Ok(())
    }
}

/// ASCII-decimal length header of a fixed digit count.
#[derive(Debug, Clone, Copy)]
pub struct AsciiFramer {
    digits: u32,
}

impl AsciiFramer {
    /// Header of exactly `digits` ASCII decimal digits, zero padded.
    #[must_use]
    pub const fn new(digits: u32) -> Self { Self { digits } }
}

#[async_trait]
impl LengthFramer for AsciiFramer {
    async fn read_length(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<usize> {
        let mut header = vec![0u8; self.digits as usize];
        reader.read_exact(&mut header).await?;
        let text = std::str::from_utf8(&header)
            .map_err(|_| malformed_header(&header))?;
        if !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed_header(&header));
        }
        text.parse().map_err(|_| malformed_header(&header))
    }

    fn write_length(&self, buf: &mut Vec<u8>, length: usize) -> io::Result<()> {
        let digits = self.digits as usize;
        let rendered = format!("{length:0digits$}");
        if rendered.len() > digits {
            return Err(header_overflow(length));
        }
        buf.extend_from_slice(rendered.as_bytes());
        Ok(())
    }
}

/// BCD-packed decimal length header of a fixed digit count.
#[derive(Debug, Clone, Copy)]
pub struct BcdFramer {
    digits: u32,
}

impl BcdFramer {
    /// Header of `digits` decimal digits packed two per byte, zero padded.
    /// An odd digit count is rounded up to the containing byte.
    #[must_use]
    pub const fn new(digits: u32) -> Self { Self { digits } }

    const fn byte_len(self) -> usize { self.digits.div_ceil(2) as usize }
}

#[async_trait]
impl LengthFramer for BcdFramer {
    async fn read_length(
        &self,
        reader: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<usize> {
        let mut header = vec![0u8; self.byte_len()];
        reader.read_exact(&mut header).await?;
        let mut rendered = String::with_capacity(header.len() * 2);
        for byte in &header {
            let high = byte >> 4;
            let low = byte & 0x0f;
            if high > 9 || low > 9 {
                return Err(malformed_header(&header));
            }
            rendered.push(char::from(b'0' + high));
            rendered.push(char::from(b'0' + low));
        }
        rendered.parse().map_err(|_| malformed_header(&header))
    }

    fn write_length(&self, buf: &mut Vec<u8>, length: usize) -> io::Result<()> {
        let digits = self.byte_len() * 2;
        let rendered = format!("{length:0digits$}");
        if rendered.len() > digits {
            return Err(header_overflow(length));
        }
        for pair in rendered.as_bytes().chunks(2) {
            let high = pair[0] - b'0';
            let low = pair[1] - b'0';
            buf.push((high << 4) | low);
        }
        Ok(())
    }
}

fn header_overflow(length: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("payload of {length} bytes does not fit the length header"),
    )
}

fn malformed_header(header: &[u8]) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("malformed length header ({} bytes)", header.len()),
    )
}

/// Read one complete frame: a length header, then exactly that many bytes.
pub(crate) async fn read_frame(
    framer: &dyn LengthFramer,
    reader: &mut (dyn AsyncRead + Send + Unpin),
    max_frame_size: usize,
) -> Result<Vec<u8>, ConnectionError> {
    let length = framer
        .read_length(reader)
        .await
        .map_err(ConnectionError::ReadLength)?;
    if length > max_frame_size {
        return Err(ConnectionError::FrameTooLarge { length, limit: max_frame_size });
    }
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(ConnectionError::Read)?;
    Ok(payload)
}
