//! Application message framing and dispatch
//!
//! Payloads carried by the transport are opaque. Applications that want typed
//! messages can pack them as frames:
//!
//! ```text
//! +----------------+---------+-------------------+
//! | total_len (BE) |  kind   |       body        |
//! |    2 bytes     | 1 byte  | total_len - 3     |
//! +----------------+---------+-------------------+
//! ```
//!
//! and route them through a [`MessageRegistry`] owned by the application.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Frame header size (length + kind)
pub const FRAME_HEADER_SIZE: usize = 3;

/// Message kind identifier
pub type MessageKind = u8;

type Handler = Box<dyn Fn(&[u8], usize) + Send + Sync>;

/// Framing and dispatch errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Frame too short: {0} bytes")]
    Truncated(usize),

    #[error("Frame length field {declared} does not match {actual} available bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Frame body too large: {0} bytes")]
    Oversized(usize),

    #[error("No handler bound for message kind {0}")]
    UnknownKind(MessageKind),
}

/// Build a frame for `kind` around `body`
pub fn encode_frame(kind: MessageKind, body: &[u8]) -> Result<Bytes, DispatchError> {
    let total = FRAME_HEADER_SIZE + body.len();
    if total > u16::MAX as usize {
        return Err(DispatchError::Oversized(body.len()));
    }

    let mut buf = BytesMut::with_capacity(total);
    buf.put_u16(total as u16);
    buf.put_u8(kind);
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Split the first frame off `bytes`, returning `(kind, body, rest)`
pub fn decode_frame(bytes: &[u8]) -> Result<(MessageKind, &[u8], &[u8]), DispatchError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(DispatchError::Truncated(bytes.len()));
    }

    let mut header = &bytes[..FRAME_HEADER_SIZE];
    let total = header.get_u16() as usize;
    let kind = header.get_u8();

    if total < FRAME_HEADER_SIZE || total > bytes.len() {
        return Err(DispatchError::LengthMismatch {
            declared: total,
            actual: bytes.len(),
        });
    }

    Ok((kind, &bytes[FRAME_HEADER_SIZE..total], &bytes[total..]))
}

/// Table of message handlers keyed by kind
///
/// Handlers receive the frame body and the shard (or client) id the payload
/// arrived on.
#[derive(Default)]
pub struct MessageRegistry {
    handlers: HashMap<MessageKind, Handler>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, replacing any previous binding
    pub fn bind<F>(&mut self, kind: MessageKind, handler: F)
    where
        F: Fn(&[u8], usize) + Send + Sync + 'static,
    {
        if self.handlers.insert(kind, Box::new(handler)).is_some() {
            tracing::debug!(kind, "replaced message handler");
        }
    }

    /// Remove the handler for `kind`
    pub fn unbind(&mut self, kind: MessageKind) -> bool {
        self.handlers.remove(&kind).is_some()
    }

    pub fn is_bound(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Decode one frame and call its handler
    ///
    /// Returns the bytes following the frame.
    pub fn dispatch<'a>(&self, frame: &'a [u8], origin: usize) -> Result<&'a [u8], DispatchError> {
        let (kind, body, rest) = decode_frame(frame)?;
        let handler = self
            .handlers
            .get(&kind)
            .ok_or(DispatchError::UnknownKind(kind))?;
        handler(body, origin);
        Ok(rest)
    }

    /// Dispatch every frame packed back to back in `payload`
    ///
    /// Stops at the first bad frame; frames before it have already been
    /// handled. Returns the number of frames dispatched.
    pub fn dispatch_all(&self, mut payload: &[u8], origin: usize) -> Result<usize, DispatchError> {
        let mut count = 0;
        while !payload.is_empty() {
            payload = self.dispatch(payload, origin)?;
            count += 1;
        }
        Ok(count)
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort_unstable();
        f.debug_struct("MessageRegistry").field("kinds", &kinds).finish()
    }
}
