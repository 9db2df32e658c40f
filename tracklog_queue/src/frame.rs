//! Record framing for segment files.
//!
//! Each record is laid out as:
//!
//! ```text
//! | payload length (u32 BE) | crc32 (u32 BE) | payload | '\n' |
//! ```
//!
//! The checksum covers the payload only.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

const RECORD_TERMINATOR: u8 = b'\n';

/// Bytes a frame adds around its payload.
pub(crate) const FRAME_OVERHEAD: u64 = 4 + 4 + 1;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("record is truncated")]
    Truncated,

    #[error("checksum mismatch: expected {expected:#010x}, actual {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("record is not terminated by a newline")]
    MissingTerminator,

    #[error("record of {0} bytes is too large to frame")]
    TooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub(crate) fn frame_len(payload_len: usize) -> u64 {
    payload_len as u64 + FRAME_OVERHEAD
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Write one framed record, returning the number of bytes written.
pub(crate) fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<u64, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;
    w.write_u32::<BigEndian>(len)?;
    w.write_u32::<BigEndian>(checksum(payload))?;
    w.write_all(payload)?;
    w.write_u8(RECORD_TERMINATOR)?;
    Ok(frame_len(payload.len()))
}

/// Read one framed record. `Ok(None)` means the reader was at a clean end of data.
pub(crate) fn read_frame<R: Read>(r: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let len = match r.read_u32::<BigEndian>() {
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        other => other? as usize,
    };
    let expected_checksum = r.read_u32::<BigEndian>().map_err(eof_is_truncation)?;

    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).map_err(eof_is_truncation)?;

    let terminator = r.read_u8().map_err(eof_is_truncation)?;
    if terminator != RECORD_TERMINATOR {
        return Err(FrameError::MissingTerminator);
    }

    let actual_checksum = checksum(&payload);
    if expected_checksum != actual_checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: expected_checksum,
            actual: actual_checksum,
        });
    }

    Ok(Some(payload))
}

fn eof_is_truncation(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Truncated
    } else {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut buf = Vec::new();
        let n1 = write_frame(&mut buf, b"first").unwrap();
        let n2 = write_frame(&mut buf, b"").unwrap();
        assert_eq!(n1, 5 + FRAME_OVERHEAD);
        assert_eq!(n2, FRAME_OVERHEAD);
        assert_eq!(buf.len() as u64, n1 + n2);

        let mut r = Cursor::new(buf);
        assert_eq!(read_frame(&mut r).unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut r).unwrap().unwrap(), b"");
        assert!(read_frame(&mut r).unwrap().is_none());
    }

    #[test]
    fn length_precedes_checksum() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload").unwrap();
        assert_eq!(buf[..4], 7u32.to_be_bytes());
        assert_eq!(buf[4..8], checksum(b"payload").to_be_bytes());
        assert_eq!(buf[8..15], *b"payload");
    }

    #[test]
    fn truncated_payload_is_detected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"some payload").unwrap();
        buf.truncate(buf.len() - 4);

        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[test]
    fn flipped_bit_fails_checksum() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload").unwrap();
        buf[9] ^= 0x01;

        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::ChecksumMismatch { .. }));
    }

    #[test]
    fn missing_terminator_is_detected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] = b'x';

        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::MissingTerminator));
    }
}
