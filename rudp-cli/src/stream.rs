//! Byte-stream framing used by the sender and receiver tools
//!
//! Input is cut into chunks, each carried as a [`KIND_DATA`] frame in its own
//! datagram. A final [`KIND_END`] frame marks the end of the stream.

use bytes::Bytes;
use crossbeam::channel::Sender;
use rudp_protocol::dispatch::{MessageKind, MessageRegistry, FRAME_HEADER_SIZE};
use rudp_protocol::MAX_PAYLOAD;

/// Chunk of stream data
pub const KIND_DATA: MessageKind = 1;

/// End of stream
pub const KIND_END: MessageKind = 2;

/// Largest chunk that fits one datagram once framed
pub const MAX_CHUNK: usize = MAX_PAYLOAD - FRAME_HEADER_SIZE;

/// Decoded stream frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Bytes),
    End,
}

/// Registry that forwards stream frames into `events`
pub fn stream_registry(events: Sender<StreamEvent>) -> MessageRegistry {
    let mut registry = MessageRegistry::new();

    let tx = events.clone();
    registry.bind(KIND_DATA, move |body, _| {
        let _ = tx.send(StreamEvent::Data(Bytes::copy_from_slice(body)));
    });
    registry.bind(KIND_END, move |_, _| {
        let _ = events.send(StreamEvent::End);
    });

    registry
}
