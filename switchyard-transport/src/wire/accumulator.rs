//! Streaming reassembly of byte arrivals into frames.
//!
//! A [`FrameAccumulator`] owns the partial-frame state of one connection. Each
//! arrival is appended to an accumulation buffer, then a [`FrameDecoder`] is
//! driven until it stops making progress. One arrival can yield zero, one or
//! many frames.

use bytes::BytesMut;

use super::DecodeError;

/// Capacity of a freshly allocated accumulation buffer.
const INITIAL_CAPACITY: usize = 4096;

/// Decodes at most one frame from the front of a buffer.
///
/// Implementations must leave `src` untouched when it does not hold a whole
/// frame. They may consume bytes without producing a frame (skipping padding,
/// say), but producing a frame without consuming anything is a bug the
/// accumulator reports as [`DecodeError::NoProgress`].
pub trait FrameDecoder {
    /// Decoded unit.
    type Frame;

    /// Decode the next frame, if complete.
    fn decode_one(&mut self, src: &mut BytesMut) -> Result<Option<Self::Frame>, DecodeError>;
}

/// Result of one decode pass.
///
/// A fatal error can stop a pass after some frames were already decoded from
/// the same arrival. Those frames are still returned, ahead of the error.
#[derive(Debug, PartialEq)]
pub struct Decoded<F> {
    /// Frames decoded before the pass stopped, in arrival order.
    pub frames: Vec<F>,
    /// Error that stopped the pass, if any.
    pub error: Option<DecodeError>,
}

impl<F> Decoded<F> {
    /// The frames, or the error if the pass stopped on one.
    pub fn into_result(self) -> Result<Vec<F>, DecodeError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.frames),
        }
    }
}

/// Partial-frame state of one connection.
#[derive(Debug, Default)]
pub struct FrameAccumulator {
    buffer: Option<BytesMut>,
    dropped_bytes: u64,
}

impl FrameAccumulator {
    /// Create an accumulator with no buffered bytes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.as_ref().map_or(0, BytesMut::len)
    }

    /// Whether an accumulation buffer is currently allocated.
    pub fn has_buffer(&self) -> bool {
        self.buffer.is_some()
    }

    /// Total undecodable bytes discarded at end-of-life.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    /// Append `chunk` and decode every complete frame now available.
    ///
    /// After an error the buffer state is undefined; callers are expected to
    /// [`discard`](FrameAccumulator::discard) it.
    pub fn decode<D: FrameDecoder>(&mut self, chunk: &[u8], decoder: &mut D) -> Decoded<D::Frame> {
        if !chunk.is_empty() {
            let buffer = self
                .buffer
                .get_or_insert_with(|| BytesMut::with_capacity(chunk.len().max(INITIAL_CAPACITY)));
            // grows only when the spare capacity cannot take the chunk
            buffer.reserve(chunk.len());
            buffer.extend_from_slice(chunk);
        }
        self.drain(decoder)
    }

    /// Final decode pass at connection end-of-life.
    ///
    /// Frames still decodable are returned. Whatever remains is discarded,
    /// logged and added to [`FrameAccumulator::dropped_bytes`].
    pub fn finish<D: FrameDecoder>(&mut self, decoder: &mut D) -> Vec<D::Frame> {
        let decoded = self.drain(decoder);
        if let Some(e) = &decoded.error {
            tracing::warn!(error = %e, "final decode pass failed");
        }
        self.discard();
        decoded.frames
    }

    /// Drop any buffered remainder without decoding it.
    pub fn discard(&mut self) {
        if let Some(rest) = self.buffer.take() {
            if !rest.is_empty() {
                tracing::warn!(
                    bytes = rest.len(),
                    "dropping undecodable remainder at end of connection"
                );
                self.dropped_bytes += rest.len() as u64;
            }
        }
    }

    fn drain<D: FrameDecoder>(&mut self, decoder: &mut D) -> Decoded<D::Frame> {
        let mut frames = Vec::new();
        let Some(buffer) = self.buffer.as_mut() else {
            return Decoded { frames, error: None };
        };

        while !buffer.is_empty() {
            let before = buffer.len();
            let frame = match decoder.decode_one(buffer) {
                Ok(frame) => frame,
                Err(e) => return Decoded { frames, error: Some(e) },
            };
            let consumed = before.saturating_sub(buffer.len());

            match frame {
                Some(_) if consumed == 0 => {
                    return Decoded {
                        frames,
                        error: Some(DecodeError::NoProgress),
                    };
                }
                Some(frame) => frames.push(frame),
                None if consumed == 0 => break,
                None => continue,
            }
        }

        if buffer.is_empty() {
            self.buffer = None;
        }
        Decoded { frames, error: None }
    }
}
