//! The seam between the call layer and a transport implementation.
//!
//! The call never holds its lock while talking to the transport, and the
//! transport may complete ops from any thread. Each [`TransportOp`] carries
//! at most one send batch and arms at most one receive; the transport
//! answers each with exactly one completion on the [`TransportCall`] handle
//! it was given.

use tether_transport::{StreamOp, StreamState, TransportOp};

use crate::call::Shared;
use crate::error::OpStatus;
use std::sync::Arc;

/// A transport able to carry a call's stream ops.
pub trait Transport: Send + Sync {
    /// Start a transport op. Called with no call lock held.
    ///
    /// Contract: if `op.send` is some, call [`TransportCall::complete_send`]
    /// exactly once when the batch is on the wire (or failed). If `op.recv`
    /// is set, call [`TransportCall::complete_recv`] exactly once with the
    /// ops received and the stream state observed. `cancel_with_status` is
    /// best-effort and needs no completion.
    fn start(&self, call: TransportCall, op: TransportOp);
}

/// Completion handle the transport uses to report back into a call.
///
/// Cloning is cheap; each clone keeps the call alive until dropped.
#[derive(Clone)]
pub struct TransportCall {
    pub(crate) shared: Arc<Shared>,
}

impl TransportCall {
    /// Report the in-flight send batch done. `success` fails or finishes
    /// every sub-operation the batch carried.
    pub fn complete_send(&self, success: bool) {
        self.shared.on_send_done(OpStatus::from_success(success));
    }

    /// Report the armed receive done, delivering the stream ops observed
    /// and the transport's current view of stream closure.
    pub fn complete_recv(&self, ops: Vec<StreamOp>, stream_state: StreamState, success: bool) {
        self.shared.on_recv_done(ops, stream_state, success);
    }
}
