//! Length prefixed frames: `i32 id | i32 length | length bytes`, big-endian.

use std::io::{ErrorKind, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::Result;

/// Correlation id of frames that expect no reply.
pub const NO_REPLY: i32 = -1;
/// Size of the `id | length` header.
pub const FRAME_HEADER_SIZE: usize = 8;
/// Largest payload accepted on stream transports.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Largest datagram, header included.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

const READ_CHUNK: usize = 8 * 1024;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Negative frame length {0}")]
    NegativeLength(i32),

    #[error("Frame length {length} exceeds the maximum of {max}")]
    Oversized { length: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// The wire unit, a correlation id and an opaque payload.
pub struct Frame {
    pub id: i32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// A frame that expects no reply.
    pub fn one_way(payload: impl Into<Bytes>) -> Self {
        Self::new(NO_REPLY, payload)
    }

    pub fn expects_reply(&self) -> bool {
        self.id != NO_REPLY
    }

    /// Exactly `8 + payload.len()`.
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buffer);
        buffer.freeze()
    }

    /// Writes the frame to `dst`.
    ///
    /// The length field is an `i32`, senders keep payloads within [MAX_FRAME_SIZE] or
    /// [MAX_DATAGRAM_SIZE] before encoding.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_i32(self.id);
        dst.put_i32(self.payload.len() as i32);
        dst.put_slice(&self.payload);
    }

    /// Parses one frame from the start of `bytes`.
    ///
    /// Returns `Ok(None)` until `8 + length` bytes are available, otherwise the frame
    /// and the number of bytes it consumed.
    pub fn parse(
        bytes: &[u8],
        max_frame_size: usize,
    ) -> std::result::Result<Option<(Frame, usize)>, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &bytes[..FRAME_HEADER_SIZE];
        let id = header.get_i32();
        let length = header.get_i32();

        if length < 0 {
            return Err(FrameError::NegativeLength(length));
        }

        let length = length as usize;
        if length > max_frame_size {
            return Err(FrameError::Oversized {
                length,
                max: max_frame_size,
            });
        }

        let end = FRAME_HEADER_SIZE + length;
        if bytes.len() < end {
            return Ok(None);
        }

        let payload = Bytes::copy_from_slice(&bytes[FRAME_HEADER_SIZE..end]);

        Ok(Some((Frame { id, payload }, end)))
    }

    /// Decodes a datagram that must carry exactly one complete frame.
    pub fn from_datagram(datagram: &[u8]) -> Option<Frame> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            trace!(
                context = "frame_validation",
                size = datagram.len(),
                "Oversized datagram"
            );
            return None;
        }

        match Frame::parse(datagram, MAX_DATAGRAM_SIZE - FRAME_HEADER_SIZE) {
            Ok(Some((frame, consumed))) => {
                if consumed < datagram.len() {
                    trace!(
                        context = "frame_validation",
                        trailing = datagram.len() - consumed,
                        "Ignoring trailing datagram bytes"
                    );
                }
                Some(frame)
            }
            Ok(None) => {
                trace!(
                    context = "frame_validation",
                    size = datagram.len(),
                    "Truncated datagram"
                );
                None
            }
            Err(error) => {
                trace!(context = "frame_validation", ?error, "Invalid datagram");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// Stream codec over an accumulating buffer.
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Takes one frame off the front of `src`, leaving it untouched if the frame is incomplete.
    pub fn decode(&self, src: &mut BytesMut) -> std::result::Result<Option<Frame>, FrameError> {
        match Frame::parse(src, self.max_frame_size)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    pub fn encode(&self, frame: &Frame, dst: &mut BytesMut) {
        frame.encode_into(dst)
    }
}

/// Lazy sequence of frames read off a byte stream.
///
/// Ends at EOF. An invalid frame is yielded once as an error, after which the
/// iterator is exhausted: a byte stream can't be resynchronized.
#[derive(Debug)]
pub struct Frames<R> {
    reader: R,
    buffer: BytesMut,
    codec: FrameCodec,
    done: bool,
}

impl<R: Read> Frames<R> {
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, FrameCodec::default())
    }

    pub fn with_codec(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(READ_CHUNK),
            codec,
            done: false,
        }
    }
}

impl<R: Read> Iterator for Frames<R> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = [0u8; READ_CHUNK];

        while !self.done {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(frame)) => return Some(Ok(frame)),
                Ok(None) => {}
                Err(error) => {
                    self.done = true;
                    return Some(Err(error.into()));
                }
            }

            match self.reader.read(&mut chunk) {
                Ok(0) => {
                    if !self.buffer.is_empty() {
                        trace!(
                            context = "frame_validation",
                            pending = self.buffer.len(),
                            "Stream ended inside a frame"
                        );
                    }
                    self.done = true;
                }
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => {}
                Err(error) => {
                    self.done = true;
                    return Some(Err(error.into()));
                }
            }
        }

        None
    }
}
