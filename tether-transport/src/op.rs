//! Framed stream operations and transport batches.

use bytes::Bytes;

use crate::metadata::MetadataBatch;
use crate::status::StatusCode;

/// One element of a framed stream, in either direction.
#[derive(Debug, Clone)]
pub enum StreamOp {
    /// A metadata batch (initial or trailing, by position in the stream).
    Metadata(MetadataBatch),
    /// Start of a message with a declared payload length.
    BeginMessage { length: u32, flags: u32 },
    /// A slice of message payload. Slices accumulate until the declared
    /// length is reached.
    Slice(Bytes),
}

/// How far the transport has closed the stream, as reported with each
/// receive completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both directions open.
    Open,
    /// We can no longer send.
    SendClosed,
    /// The peer can no longer send to us.
    RecvClosed,
    /// Fully closed in both directions.
    Closed,
}

/// An outgoing batch of stream ops. At most one is in flight at a time.
#[derive(Debug, Clone, Default)]
pub struct SendBatch {
    pub ops: Vec<StreamOp>,
    /// This batch closes the write side of the stream.
    pub is_last_send: bool,
}

impl SendBatch {
    pub fn push(&mut self, op: StreamOp) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One unit of work handed to the transport.
///
/// Any combination of fields may be set; `recv` arms a single receive that
/// the transport answers with one completion.
#[derive(Debug, Clone, Default)]
pub struct TransportOp {
    pub send: Option<SendBatch>,
    pub recv: bool,
    pub cancel_with_status: Option<StatusCode>,
}

impl TransportOp {
    pub fn is_empty(&self) -> bool {
        self.send.is_none() && !self.recv && self.cancel_with_status.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_op() {
        assert!(TransportOp::default().is_empty());

        let op = TransportOp {
            recv: true,
            ..Default::default()
        };
        assert!(!op.is_empty());
    }

    #[test]
    fn batch_push() {
        let mut batch = SendBatch::default();
        assert!(batch.is_empty());
        batch.push(StreamOp::BeginMessage {
            length: 4,
            flags: 0,
        });
        batch.push(StreamOp::Slice(Bytes::from_static(b"ping")));
        assert_eq!(batch.ops.len(), 2);
        assert!(!batch.is_last_send);
    }
}
