//! Protocol-multiplexing decoder.

use std::sync::{Arc, OnceLock};

use bytes::BytesMut;
use switchyard_core::{PROTOCOL_CODE_LENGTH, ProtocolCode};

use super::{Protocol, ProtocolRegistry};
use crate::command::RemotingCommand;
use crate::wire::{DecodeError, FrameDecoder};

/// Protocol bound to a connection.
///
/// Set once, by the first frame; later frames must carry the same code.
#[derive(Debug, Default)]
pub struct ProtocolBinding {
    protocol: OnceLock<Arc<Protocol>>,
}

impl ProtocolBinding {
    /// An unbound binding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound protocol code, if any.
    pub fn code(&self) -> Option<ProtocolCode> {
        self.protocol.get().map(|p| p.code())
    }

    /// Bound protocol bundle, if any.
    pub fn protocol(&self) -> Option<&Arc<Protocol>> {
        self.protocol.get()
    }

    /// Bind to `code`, resolving its bundle from `registry` on first use.
    ///
    /// # Errors
    ///
    /// - `ProtocolMismatch` if already bound to another code
    /// - `UnknownProtocol` if `code` is not registered
    pub fn bind(
        &self,
        code: ProtocolCode,
        registry: &ProtocolRegistry,
    ) -> Result<&Arc<Protocol>, DecodeError> {
        if let Some(bound) = self.protocol.get() {
            return if bound.code() == code {
                Ok(bound)
            } else {
                Err(DecodeError::ProtocolMismatch {
                    bound: bound.code(),
                    received: code,
                })
            };
        }

        let resolved = registry
            .resolve(code)
            .ok_or(DecodeError::UnknownProtocol { code })?;
        // a concurrent bind may have won; the winner is what counts
        let bound = self.protocol.get_or_init(|| resolved);
        if bound.code() == code {
            Ok(bound)
        } else {
            Err(DecodeError::ProtocolMismatch {
                bound: bound.code(),
                received: code,
            })
        }
    }
}

/// Peeks each frame's protocol code and delegates to the bound bundle.
pub struct ProtocolCodeDecoder<'a> {
    registry: &'a ProtocolRegistry,
    binding: &'a ProtocolBinding,
}

impl<'a> ProtocolCodeDecoder<'a> {
    /// Decoder for one connection's binding.
    pub fn new(registry: &'a ProtocolRegistry, binding: &'a ProtocolBinding) -> Self {
        Self { registry, binding }
    }
}

impl FrameDecoder for ProtocolCodeDecoder<'_> {
    type Frame = RemotingCommand;

    fn decode_one(&mut self, src: &mut BytesMut) -> Result<Option<RemotingCommand>, DecodeError> {
        if src.len() < PROTOCOL_CODE_LENGTH {
            return Ok(None);
        }
        let code = ProtocolCode::from_bytes([src[0], src[1]]);
        let protocol = self.binding.bind(code, self.registry)?;
        protocol.decoder().decode(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use crate::protocol::{BinaryDecoder, BinaryEncoder, CommandEncoder, CommandHandler};
    use crate::wire::{DEFAULT_MAX_BODY_SIZE, FrameAccumulator};
    use async_trait::async_trait;
    use switchyard_core::CommandCode;

    struct Ignore;

    #[async_trait]
    impl CommandHandler for Ignore {
        async fn handle_commands(&self, _c: &Arc<Connection>, _cmds: Vec<RemotingCommand>) {}
    }

    fn registry(codes: &[u16]) -> ProtocolRegistry {
        let registry = ProtocolRegistry::new();
        for &code in codes {
            registry.register(Protocol::new(
                ProtocolCode::new(code),
                Arc::new(BinaryEncoder::new(DEFAULT_MAX_BODY_SIZE)),
                Arc::new(BinaryDecoder::new(DEFAULT_MAX_BODY_SIZE)),
                Arc::new(Ignore),
            ));
        }
        registry
    }

    fn frame(code: u16, id: u32) -> BytesMut {
        let cmd = RemotingCommand::oneway(ProtocolCode::new(code), CommandCode::new(1), "x").with_id(id);
        let mut buf = BytesMut::new();
        BinaryEncoder::new(DEFAULT_MAX_BODY_SIZE)
            .encode(&cmd, &mut buf)
            .expect("encode");
        buf
    }

    #[test]
    fn test_first_frame_binds() {
        let registry = registry(&[1, 2]);
        let binding = ProtocolBinding::new();
        let mut acc = FrameAccumulator::new();

        let mut decoder = ProtocolCodeDecoder::new(&registry, &binding);
        let frames = acc.decode(&frame(2, 1), &mut decoder).into_result().expect("decode");
        assert_eq!(frames.len(), 1);
        assert_eq!(binding.code(), Some(ProtocolCode::new(2)));
    }

    #[test]
    fn test_mismatched_frame_fails() {
        let registry = registry(&[1, 2]);
        let binding = ProtocolBinding::new();
        let mut acc = FrameAccumulator::new();
        let mut decoder = ProtocolCodeDecoder::new(&registry, &binding);

        let mut bytes = frame(1, 1);
        bytes.extend_from_slice(&frame(2, 2));
        let decoded = acc.decode(&bytes, &mut decoder);
        assert_eq!(decoded.frames.len(), 1, "frame before the mismatch survives");
        assert_eq!(decoded.frames[0].id, 1);
        assert_eq!(
            decoded.error,
            Some(DecodeError::ProtocolMismatch {
                bound: ProtocolCode::new(1),
                received: ProtocolCode::new(2),
            })
        );
    }

    #[test]
    fn test_unknown_protocol_fails_and_stays_unbound() {
        let registry = registry(&[1]);
        let binding = ProtocolBinding::new();
        let mut decoder = ProtocolCodeDecoder::new(&registry, &binding);

        let mut bytes = frame(9, 1);
        assert_eq!(
            decoder.decode_one(&mut bytes),
            Err(DecodeError::UnknownProtocol {
                code: ProtocolCode::new(9)
            })
        );
        assert_eq!(binding.code(), None);
    }

    #[test]
    fn test_single_byte_waits_without_binding() {
        let registry = registry(&[1]);
        let binding = ProtocolBinding::new();
        let mut decoder = ProtocolCodeDecoder::new(&registry, &binding);

        let mut one = BytesMut::from(&[0u8][..]);
        assert_eq!(decoder.decode_one(&mut one), Ok(None));
        assert_eq!(binding.code(), None);
    }
}
