//! Journal frame encoding.

use crate::error::{CoreError, CoreResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"FJNL";

/// Current frame format version.
pub const FRAME_VERSION: u16 = 1;

/// magic (4) + version (2) + kind (1) + length (4)
pub const HEADER_SIZE: usize = 11;

/// Trailing CRC32.
pub const CRC_SIZE: usize = 4;

/// Kind byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Opens a batch. Payload: batch id (u64 LE).
    Begin = 1,
    /// One CBOR-encoded operation.
    Op = 2,
    /// Closes a batch. Payload: batch id (u64 LE) + op count (u32 LE).
    Commit = 3,
}

impl FrameKind {
    /// Converts a byte to a frame kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Op),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Appends one encoded frame to `out`.
///
/// # Errors
///
/// Fails if the payload does not fit the 4-byte length field.
pub fn encode_frame(out: &mut Vec<u8>, kind: FrameKind, payload: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        CoreError::invalid_argument(format!("journal frame of {} bytes is too large", payload.len()))
    })?;

    let start = out.len();
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&FRAME_VERSION.to_le_bytes());
    out.push(kind as u8);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    let crc = compute_crc32(&out[start..]);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Offset of the first header byte.
    pub offset: u64,
    /// Offset just past the CRC.
    pub end: u64,
    /// Frame kind.
    pub kind: FrameKind,
    /// Payload bytes.
    pub payload: &'a [u8],
}

/// Walks the frames of a journal image.
///
/// A frame cut short by the end of the image is reported as the end of the
/// log: that is what a crash in the middle of an append leaves behind.
/// Anything else that does not parse is an error.
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    /// Starts reading at the beginning of `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Offset of the next unread byte.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    /// Reads the next frame, or `None` at the (possibly torn) end.
    ///
    /// # Errors
    ///
    /// - [`CoreError::JournalCorruption`] for bad magic, an unknown kind or a
    ///   future version
    /// - [`CoreError::ChecksumMismatch`] when the CRC does not match
    pub fn next_frame(&mut self) -> CoreResult<Option<Frame<'a>>> {
        let bytes: &'a [u8] = self.bytes;
        let rest = &bytes[self.pos..];
        let offset = self.pos as u64;
        if rest.len() < HEADER_SIZE {
            return Ok(None);
        }

        if rest[0..4] != FRAME_MAGIC {
            return Err(CoreError::journal_corruption(offset, "bad frame magic"));
        }
        let version = u16::from_le_bytes([rest[4], rest[5]]);
        if version > FRAME_VERSION {
            return Err(CoreError::journal_corruption(
                offset,
                format!("unsupported frame version {version}"),
            ));
        }
        let kind = FrameKind::from_byte(rest[6]).ok_or_else(|| {
            CoreError::journal_corruption(offset, format!("unknown frame kind {}", rest[6]))
        })?;
        let len = u32::from_le_bytes([rest[7], rest[8], rest[9], rest[10]]) as usize;

        let total = HEADER_SIZE + len + CRC_SIZE;
        if rest.len() < total {
            return Ok(None);
        }

        let body = &rest[..HEADER_SIZE + len];
        let crc_bytes = &rest[HEADER_SIZE + len..total];
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }

        self.pos += total;
        Ok(Some(Frame {
            offset,
            end: self.pos as u64,
            kind,
            payload: &body[HEADER_SIZE..],
        }))
    }
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
