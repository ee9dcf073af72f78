//! Binary frame format of the built-in protocol.
//!
//! Frame format (big-endian integers):
//!
//! ```text
//! [protocol:2][kind:1][command:2][serializer:1][compressor:1][status:1]
//! [id:4][deadline:8][body_len:4][checksum:4][body:N]
//! ```
//!
//! - **protocol**: protocol code, always first so a multiplexing decoder can
//!   peek it
//! - **compressor**: `0x80` (`i8::MIN`) means the body is not compressed
//! - **checksum**: CRC32C over the 24 preceding header bytes and the body
//!
//! Decoding follows mark/reset discipline: nothing is consumed from the
//! source buffer until a whole frame is present.

pub mod accumulator;

pub use accumulator::{Decoded, FrameAccumulator, FrameDecoder};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use switchyard_core::{CommandCode, ProtocolCode};

use crate::command::{CommandKind, RemotingCommand, ResponseStatus};

/// Header size: 24 bytes of fields + 4 bytes of checksum.
pub const HEADER_SIZE: usize = 28;

/// Offset of the checksum within the header.
const CHECKSUM_OFFSET: usize = 24;

/// Offset of the body length within the header.
const BODY_LEN_OFFSET: usize = 20;

/// Compressor byte meaning "no compression".
pub const NO_COMPRESSOR: u8 = 0x80;

/// Default upper bound on a frame body.
pub const DEFAULT_MAX_BODY_SIZE: usize = 16 * 1024 * 1024;

/// Errors raised while turning bytes into frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Checksum verification failed - data was corrupted.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried by the header.
        expected: u32,
        /// Checksum computed over the received bytes.
        actual: u32,
    },

    /// Body exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Declared body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A header field holds a value outside its domain.
    #[error("invalid {field} value: {value}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// The offending byte.
        value: u8,
    },

    /// The decoder produced a frame without consuming input.
    #[error("decoder produced a frame without consuming input")]
    NoProgress,

    /// No protocol is registered for the leading code.
    #[error("unknown protocol code {code}")]
    UnknownProtocol {
        /// The code found on the wire.
        code: ProtocolCode,
    },

    /// A frame carried a different protocol than the one bound to the connection.
    #[error("protocol mismatch: connection bound to {bound}, frame carries {received}")]
    ProtocolMismatch {
        /// Protocol bound by the first frame.
        bound: ProtocolCode,
        /// Protocol of the offending frame.
        received: ProtocolCode,
    },
}

impl DecodeError {
    /// Whether the error is a protocol violation rather than a malformed frame.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            DecodeError::UnknownProtocol { .. } | DecodeError::ProtocolMismatch { .. }
        )
    }
}

/// Errors raised while turning a command into bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// Body exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge {
        /// Body size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No protocol is registered for the command's code.
    #[error("unknown protocol code {code}")]
    UnknownProtocol {
        /// The command's protocol code.
        code: ProtocolCode,
    },

    /// `i8::MIN` is reserved as the "uncompressed" marker.
    #[error("compressor code -128 is reserved")]
    ReservedCompressor,
}

fn compute_checksum(header: &[u8], body: &[u8]) -> u32 {
    let crc = crc32c::crc32c(header);
    crc32c::crc32c_append(crc, body)
}

/// Append the frame for `command` to `dst`.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the body exceeds `max_body`.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use switchyard_core::{CommandCode, ProtocolCode};
/// use switchyard_transport::RemotingCommand;
/// use switchyard_transport::wire::{HEADER_SIZE, encode_command, try_decode_command};
///
/// let cmd = RemotingCommand::request(ProtocolCode::new(1), CommandCode::new(2), "hi").with_id(9);
/// let mut buf = BytesMut::new();
/// encode_command(&cmd, &mut buf, 1024).expect("encode");
/// assert_eq!(buf.len(), HEADER_SIZE + 2);
///
/// let decoded = try_decode_command(&mut buf, 1024).expect("decode").expect("complete");
/// assert_eq!(decoded, cmd);
/// assert!(buf.is_empty());
/// ```
pub fn encode_command(
    command: &RemotingCommand,
    dst: &mut BytesMut,
    max_body: usize,
) -> Result<(), EncodeError> {
    if command.body.len() > max_body {
        return Err(EncodeError::FrameTooLarge {
            size: command.body.len(),
            max: max_body,
        });
    }
    let compressor = match command.compressor {
        Some(i8::MIN) => return Err(EncodeError::ReservedCompressor),
        Some(code) => code as u8,
        None => NO_COMPRESSOR,
    };

    dst.reserve(HEADER_SIZE + command.body.len());
    let start = dst.len();
    dst.put_slice(&command.protocol.to_bytes());
    dst.put_u8(command.kind.as_u8());
    dst.put_u16(command.command.value());
    dst.put_u8(command.serializer as u8);
    dst.put_u8(compressor);
    dst.put_u8(command.status.as_u8());
    dst.put_u32(command.id);
    dst.put_u64(command.deadline_millis);
    dst.put_u32(command.body.len() as u32);

    let checksum = compute_checksum(&dst[start..start + CHECKSUM_OFFSET], &command.body);
    dst.put_u32(checksum);
    dst.put_slice(&command.body);
    Ok(())
}

/// Decode one frame from the front of `src` if it is complete.
///
/// # Returns
///
/// - `Ok(Some(command))` if a complete frame was consumed from `src`
/// - `Ok(None)` if more data is needed; `src` is left untouched
/// - `Err` if the frame is malformed
pub fn try_decode_command(
    src: &mut BytesMut,
    max_body: usize,
) -> Result<Option<RemotingCommand>, DecodeError> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let body_len = u32::from_be_bytes([
        src[BODY_LEN_OFFSET],
        src[BODY_LEN_OFFSET + 1],
        src[BODY_LEN_OFFSET + 2],
        src[BODY_LEN_OFFSET + 3],
    ]) as usize;
    if body_len > max_body {
        return Err(DecodeError::FrameTooLarge {
            size: body_len,
            max: max_body,
        });
    }
    if src.len() < HEADER_SIZE + body_len {
        return Ok(None);
    }

    let expected = u32::from_be_bytes([
        src[CHECKSUM_OFFSET],
        src[CHECKSUM_OFFSET + 1],
        src[CHECKSUM_OFFSET + 2],
        src[CHECKSUM_OFFSET + 3],
    ]);
    let actual = compute_checksum(
        &src[..CHECKSUM_OFFSET],
        &src[HEADER_SIZE..HEADER_SIZE + body_len],
    );
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    let kind_byte = src[2];
    let kind = CommandKind::from_u8(kind_byte).ok_or(DecodeError::InvalidField {
        field: "kind",
        value: kind_byte,
    })?;
    let status_byte = src[7];
    let status = ResponseStatus::from_u8(status_byte).ok_or(DecodeError::InvalidField {
        field: "status",
        value: status_byte,
    })?;

    let mut frame = src.split_to(HEADER_SIZE + body_len);
    let protocol = ProtocolCode::from_bytes([frame[0], frame[1]]);
    frame.advance(3);
    let command = CommandCode::new(frame.get_u16());
    let serializer = frame.get_i8();
    let compressor = match frame.get_u8() {
        NO_COMPRESSOR => None,
        code => Some(code as i8),
    };
    frame.advance(1); // status, parsed above
    let id = frame.get_u32();
    let deadline_millis = frame.get_u64();
    frame.advance(8); // body_len + checksum
    let body: Bytes = frame.freeze();

    Ok(Some(RemotingCommand {
        id,
        protocol,
        kind,
        command,
        serializer,
        compressor,
        status,
        deadline_millis,
        body,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO: ProtocolCode = ProtocolCode::new(0x0102);

    fn sample() -> RemotingCommand {
        RemotingCommand::request(PROTO, CommandCode::new(300), "hello world")
            .with_id(0xDEADBEEF)
            .with_deadline(1_700_000_000_000)
            .with_serializer(-5)
            .with_compressor(Some(3))
    }

    fn encoded(cmd: &RemotingCommand) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_command(cmd, &mut buf, DEFAULT_MAX_BODY_SIZE).expect("encode");
        buf
    }

    #[test]
    fn test_encode_decode_preserves_every_field() {
        let cmd = sample();
        let mut buf = encoded(&cmd);
        let decoded = try_decode_command(&mut buf, DEFAULT_MAX_BODY_SIZE)
            .expect("decode")
            .expect("complete");
        assert_eq!(decoded, cmd);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_protocol_code_leads_the_frame() {
        let buf = encoded(&sample());
        assert_eq!(&buf[..2], &[0x01, 0x02]);
    }

    #[test]
    fn test_partial_header_consumes_nothing() {
        let full = encoded(&sample());
        let mut partial = BytesMut::from(&full[..10]);
        assert!(matches!(
            try_decode_command(&mut partial, DEFAULT_MAX_BODY_SIZE),
            Ok(None)
        ));
        assert_eq!(partial.len(), 10);
    }

    #[test]
    fn test_partial_body_consumes_nothing() {
        let full = encoded(&sample());
        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert!(matches!(
            try_decode_command(&mut partial, DEFAULT_MAX_BODY_SIZE),
            Ok(None)
        ));
        assert_eq!(partial.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn test_extra_bytes_stay_buffered() {
        let mut buf = encoded(&sample());
        buf.extend_from_slice(b"next");
        let decoded = try_decode_command(&mut buf, DEFAULT_MAX_BODY_SIZE).expect("decode");
        assert!(decoded.is_some());
        assert_eq!(&buf[..], b"next");
    }

    #[test]
    fn test_body_corruption_detected() {
        let mut buf = encoded(&sample());
        buf[HEADER_SIZE] ^= 0xFF;
        assert!(matches!(
            try_decode_command(&mut buf, DEFAULT_MAX_BODY_SIZE),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut buf = encoded(&sample());
        buf[9] ^= 0xFF; // inside the request id
        assert!(matches!(
            try_decode_command(&mut buf, DEFAULT_MAX_BODY_SIZE),
            Err(DecodeError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_oversized_body_rejected_both_ways() {
        let cmd = RemotingCommand::request(PROTO, CommandCode::new(1), vec![0u8; 64]);
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_command(&cmd, &mut buf, 16),
            Err(EncodeError::FrameTooLarge { size: 64, max: 16 })
        ));

        let mut buf = encoded(&cmd);
        assert!(matches!(
            try_decode_command(&mut buf, 16),
            Err(DecodeError::FrameTooLarge { size: 64, max: 16 })
        ));
    }

    #[test]
    fn test_reserved_compressor_rejected() {
        let cmd = sample().with_compressor(Some(i8::MIN));
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_command(&cmd, &mut buf, DEFAULT_MAX_BODY_SIZE),
            Err(EncodeError::ReservedCompressor)
        );
    }

    #[test]
    fn test_uncompressed_marker() {
        let cmd = sample().with_compressor(None);
        let mut buf = encoded(&cmd);
        assert_eq!(buf[6], NO_COMPRESSOR);
        let decoded = try_decode_command(&mut buf, DEFAULT_MAX_BODY_SIZE)
            .expect("decode")
            .expect("complete");
        assert_eq!(decoded.compressor, None);
    }
}
