//! Fixed-header frame codec for the beacon wire protocol.
//!
//! Every unit on the beacon wire is one frame:
//!
//! ```text
//! +-------------------+-----------+----------------+---------------+--------+
//! | size (4, BE, UDP) | enc (1)   | session_id (8) | reserved (4)  | data   |
//! +-------------------+-----------+----------------+---------------+--------+
//! ```
//!
//! The `size` prefix counts `data` bytes only and is present **on UDP
//! only**: each datagram is one frame and carries its own length. On TCP
//! the transport delivers one whole frame per read (the beacon writes one
//! message per send), so the frame body is simply the remainder of the
//! buffer and no prefix is written.
//!
//! Endianness is mixed and must be preserved exactly for wire
//! compatibility: the UDP size prefix is big-endian, every other header
//! scalar is little-endian.
//!
//! Declared lengths are validated against [`MAX_FRAME_SIZE`] before any
//! allocation occurs.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Maximum number of `data` bytes a single frame may carry.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Header bytes common to both transports: flag + session id + reserved.
pub const FIXED_HEADER_LEN: usize = 1 + 8 + 4;

/// Full UDP header length: the big-endian size prefix plus the fixed header.
pub const UDP_HEADER_LEN: usize = 4 + FIXED_HEADER_LEN;

/// Transport a frame travels over. Framing differs between the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    /// Stream transport; one frame per read, no length prefix.
    Tcp,
    /// Datagram transport; one frame per datagram, length-prefixed.
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// One decoded unit of the beacon wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Whether `data` is an XChaCha20 ciphertext.
    pub encrypted: bool,
    /// Session identifier; 0 until the server mints one at key exchange.
    pub session_id: u64,
    /// Ignored on receive; beacons fill it with random bytes. The server
    /// writes 0.
    pub reserved: i32,
    /// Frame body.
    pub data: Bytes,
}

impl Frame {
    /// Builds a frame with a zeroed reserved field.
    #[must_use]
    pub const fn new(encrypted: bool, session_id: u64, data: Bytes) -> Self {
        Self {
            encrypted,
            session_id,
            reserved: 0,
            data,
        }
    }
}

/// Errors produced while packing or unpacking a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer ended before the full header or body was read.
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated {
        /// Bytes the decoder needed.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },

    /// The frame body exceeds [`MAX_FRAME_SIZE`].
    #[error("frame data length {size} exceeds limit {max}")]
    FrameTooLarge {
        /// Declared or actual body length.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// A UDP datagram's declared size disagrees with its actual body.
    #[error("datagram declares {declared} data bytes but carries {actual}")]
    LengthMismatch {
        /// Length from the size prefix.
        declared: usize,
        /// Bytes present after the header.
        actual: usize,
    },
}

/// Packs a frame for the given transport.
///
/// # Errors
///
/// Returns [`CodecError::FrameTooLarge`] when the body exceeds
/// [`MAX_FRAME_SIZE`].
#[allow(clippy::cast_possible_truncation)] // length validated against MAX_FRAME_SIZE
pub fn pack(frame: &Frame, transport: Transport) -> Result<Bytes, CodecError> {
    if frame.data.len() > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge {
            size: frame.data.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = BytesMut::with_capacity(UDP_HEADER_LEN + frame.data.len());

    if transport == Transport::Udp {
        // Big-endian, unlike every other header scalar.
        buf.put_u32(frame.data.len() as u32);
    }

    buf.put_u8(u8::from(frame.encrypted));
    buf.put_u64_le(frame.session_id);
    buf.put_i32_le(frame.reserved);
    buf.extend_from_slice(&frame.data);

    Ok(buf.freeze())
}

/// Unpacks one frame from `src`.
///
/// For [`Transport::Udp`], `src` must be exactly one datagram: the declared
/// size must match the bytes present. For [`Transport::Tcp`], everything
/// after the fixed header is the body.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] on a short buffer,
/// [`CodecError::FrameTooLarge`] when the declared or implied body length
/// exceeds [`MAX_FRAME_SIZE`], and [`CodecError::LengthMismatch`] when a
/// datagram's size prefix disagrees with its contents.
pub fn unpack(src: &[u8], transport: Transport) -> Result<Frame, CodecError> {
    let header_len = match transport {
        Transport::Tcp => FIXED_HEADER_LEN,
        Transport::Udp => UDP_HEADER_LEN,
    };
    if src.len() < header_len {
        return Err(CodecError::Truncated {
            needed: header_len,
            have: src.len(),
        });
    }

    let mut buf = src;

    let declared = if transport == Transport::Udp {
        let size = buf.get_u32() as usize;
        // Validate before allocating anything.
        if size > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        Some(size)
    } else {
        None
    };

    let encrypted = buf.get_u8() != 0;
    let session_id = buf.get_u64_le();
    let reserved = buf.get_i32_le();

    let data = match declared {
        Some(size) => {
            if buf.remaining() != size {
                return Err(CodecError::LengthMismatch {
                    declared: size,
                    actual: buf.remaining(),
                });
            }
            Bytes::copy_from_slice(buf)
        }
        None => {
            if buf.remaining() > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge {
                    size: buf.remaining(),
                    max: MAX_FRAME_SIZE,
                });
            }
            Bytes::copy_from_slice(buf)
        }
    };

    Ok(Frame {
        encrypted,
        session_id,
        reserved,
        data,
    })
}
