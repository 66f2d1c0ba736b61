//! The per-RPC call state machine.
//!
//! A call multiplexes concurrent application sub-operations (ioreqs) onto a
//! single bidirectional stream. Submissions group into masters that complete
//! together; the send pipeline coalesces live send ops into at most one
//! in-flight transport batch; the receive pipeline consumes stream ops,
//! reassembles messages, and routes metadata; final status merges three
//! priority-ordered sources once the stream closes.
//!
//! All state lives behind one mutex. The scheduling discipline is strict:
//! mutate under the lock, then at unlock start at most one send, arm at most
//! one receive, and snapshot completed groups; transport dispatch and
//! completion callbacks always run with the lock released.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use slab::Slab;
use tracing::{debug, error, trace};

use tether_transport::{
    Metadata, MetadataBatch, SendBatch, StatusCode, StreamOp, StreamState, TransportOp,
};

use crate::alarm::AlarmHandle;
use crate::batch::{BatchOp, Ioreq, StatusSink};
use crate::channel::Channel;
use crate::cq::CompletionQueue;
use crate::error::{CallError, OpStatus};
use crate::metrics;
use crate::opset::{IoreqOp, OpSet, OP_COUNT};
use crate::transport::TransportCall;

/// Upper bound on metadata elements pre-seeded at call creation.
pub const MAX_ADD_INITIAL_METADATA: usize = 3;

/// Which side of the RPC this call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// How far through the stream we have read. Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum ReadState {
    /// Still waiting for initial metadata.
    Initial,
    /// Initial metadata seen; reading messages or trailing metadata.
    GotInitialMetadata,
    /// The stream is closed for reading.
    ReadClosed,
    /// The stream is closed for reading and writing.
    StreamClosed,
}

/// How far through the stream we have written. Never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum WriteState {
    Initial,
    Started,
    WriteClosed,
}

/// Priority-ordered status sources. Earlier entries override later ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusSource {
    /// The application overrode whatever the wire says (cancellation).
    ApiOverride = 0,
    /// Produced by the surrounding runtime between the API and the wire.
    Core = 1,
    /// Arrived from the wire.
    Wire = 2,
}

const STATUS_SOURCE_COUNT: usize = 3;

/// Status received from one source. The code marks the source as set;
/// details may arrive independently and only count alongside a code.
#[derive(Default)]
struct ReceivedStatus {
    code: Option<StatusCode>,
    details: Option<Bytes>,
}

/// State of one ioreq slot. `Done` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// No request pending; a new one may start.
    Empty,
    /// Pending; the payload is the key of the master grouping it.
    Pending(usize),
    /// Permanently terminated.
    Done,
}

type CompletionFn = Box<dyn FnOnce(OpStatus) + Send>;

/// Completion record for a group of ioreqs submitted together.
struct Master {
    /// Overall status: starts OK, may degrade.
    status: OpStatus,
    need: OpSet,
    complete: OpSet,
    on_complete: Option<CompletionFn>,
}

/// A finished group, queued under the lock and dispatched after release.
struct CompletedRequest {
    status: OpStatus,
    on_complete: CompletionFn,
}

struct State {
    read_state: ReadState,
    write_state: WriteState,
    /// A transport send batch is in flight.
    sending: bool,
    /// A transport receive is armed.
    receiving: bool,
    /// Completion callbacks are being dispatched.
    completing: bool,
    /// Mid-assembly of an incoming message.
    reading_message: bool,
    /// Ops carried by the in-flight send batch.
    last_send_contains: OpSet,
    /// Cancel op to hand the transport at the next unlock.
    pending_cancel: Option<StatusCode>,

    slots: [SlotState; OP_COUNT],
    data: [Option<Ioreq>; OP_COUNT],
    masters: Slab<Master>,
    completed: Vec<CompletedRequest>,

    incoming_queue: VecDeque<Bytes>,
    incoming_message: BytesMut,
    incoming_message_length: u32,

    /// Element 0 is initial metadata, element 1 is trailing metadata.
    buffered_metadata: [Vec<Metadata>; 2],
    status: [ReceivedStatus; STATUS_SOURCE_COUNT],

    alarm: Option<AlarmHandle>,
    /// Pre-seeded initial metadata, consumed by the first send.
    add_initial_metadata: Vec<Metadata>,
    send_deadline: Option<Instant>,
}

impl State {
    fn is_op_live(&self, op: IoreqOp) -> bool {
        match self.slots[op.index()] {
            SlotState::Pending(key) => !self.masters[key].complete.contains(op),
            _ => false,
        }
    }

    fn need_more_data(&self, role: Role) -> bool {
        self.is_op_live(IoreqOp::RecvInitialMetadata)
            || self.is_op_live(IoreqOp::RecvMessage)
            || self.is_op_live(IoreqOp::RecvTrailingMetadata)
            || self.is_op_live(IoreqOp::RecvStatus)
            || self.is_op_live(IoreqOp::RecvStatusDetails)
            || (self.is_op_live(IoreqOp::RecvClose) && self.incoming_queue.is_empty())
            // Servers read eagerly before answering: the method arrives in
            // initial metadata.
            || (self.write_state == WriteState::Initial
                && role == Role::Server
                && self.read_state != ReadState::StreamClosed)
    }
}

pub(crate) struct Shared {
    channel: Arc<Channel>,
    cq: Arc<CompletionQueue>,
    role: Role,
    state: Mutex<State>,
}

/// Application handle for one RPC.
///
/// Dropping the handle cancels the deadline alarm and, if the stream has not
/// already closed for reading, cancels the call. The shared state stays
/// alive until every in-flight transport op, alarm, and completion dispatch
/// has released its reference.
pub struct Call {
    shared: Arc<Shared>,
}

impl Call {
    /// Create a call on `channel`, reporting batch completions to `cq`.
    ///
    /// `add_initial_metadata` is prepended to the first initial-metadata
    /// send (at most [`MAX_ADD_INITIAL_METADATA`] elements). A finite
    /// `deadline` arms the deadline alarm immediately. Server calls arm an
    /// eager receive so initial metadata is read before the first batch.
    pub fn create(
        channel: Arc<Channel>,
        cq: Arc<CompletionQueue>,
        role: Role,
        add_initial_metadata: Vec<Metadata>,
        deadline: Option<Instant>,
    ) -> Call {
        assert!(
            add_initial_metadata.len() <= MAX_ADD_INITIAL_METADATA,
            "too many pre-seeded initial metadata elements"
        );

        let mut slots = [SlotState::Empty; OP_COUNT];
        if role == Role::Client {
            // Only servers send trailing metadata and status.
            slots[IoreqOp::SendTrailingMetadata.index()] = SlotState::Done;
            slots[IoreqOp::SendStatus.index()] = SlotState::Done;
        }

        let shared = Arc::new(Shared {
            channel,
            cq,
            role,
            state: Mutex::new(State {
                read_state: ReadState::Initial,
                write_state: WriteState::Initial,
                sending: false,
                receiving: false,
                completing: false,
                reading_message: false,
                last_send_contains: OpSet::empty(),
                pending_cancel: None,
                slots,
                data: std::array::from_fn(|_| None),
                masters: Slab::with_capacity(OP_COUNT),
                completed: Vec::with_capacity(OP_COUNT),
                incoming_queue: VecDeque::new(),
                incoming_message: BytesMut::new(),
                incoming_message_length: 0,
                buffered_metadata: [Vec::new(), Vec::new()],
                status: Default::default(),
                alarm: None,
                add_initial_metadata,
                send_deadline: deadline,
            }),
        });

        metrics::CALLS_CREATED.increment();

        // The unlock pass arms the server's eager receive.
        shared.with_lock(|state| {
            if let Some(deadline) = deadline {
                shared.set_deadline_alarm(state, deadline);
            }
        });

        Call { shared }
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    /// Submit an application batch. On success the batch will produce
    /// exactly one completion for `tag` on the completion queue; on error
    /// nothing is enqueued and no call state changes.
    ///
    /// An empty batch completes immediately.
    pub fn start_batch(&self, ops: Vec<BatchOp>, tag: u64) -> Result<(), CallError> {
        debug!(tag, ops = ops.len(), "start_batch");

        if ops.is_empty() {
            self.shared.cq.begin_op();
            self.shared.cq.end_op(tag);
            return Ok(());
        }

        let mut reqs = Vec::with_capacity(ops.len() + 3);
        for op in ops {
            if let Err(e) = op.expand(self.shared.role, &mut reqs) {
                metrics::BATCHES_REJECTED.increment();
                return Err(e);
            }
        }

        let cq = Arc::clone(&self.shared.cq);
        let on_complete: CompletionFn = Box::new(move |_status| cq.end_op(tag));

        let shared = &self.shared;
        let result = shared.with_lock(|state| {
            shared.start_ioreqs_locked(state, reqs, on_complete)?;
            // Count the batch only once it is accepted, but before the lock
            // drops so the completion cannot outrun the begin.
            shared.cq.begin_op();
            Ok(())
        });

        match result {
            Ok(()) => metrics::BATCHES_ACCEPTED.increment(),
            Err(_) => metrics::BATCHES_REJECTED.increment(),
        };
        result
    }

    /// Submit a group of ioreqs directly. The group completes as one unit:
    /// `on_complete` runs once, after every op in the group has finished.
    ///
    /// An empty group is a no-op and `on_complete` is dropped unread.
    /// `SendMessage` becomes startable again as soon as it succeeds, even
    /// though its group may still be outstanding; streaming senders should
    /// submit each `SendMessage` as its own group.
    pub fn start_ioreqs(
        &self,
        reqs: Vec<Ioreq>,
        on_complete: impl FnOnce(OpStatus) + Send + 'static,
    ) -> Result<(), CallError> {
        if reqs.is_empty() {
            return Ok(());
        }
        let shared = &self.shared;
        shared.with_lock(|state| shared.start_ioreqs_locked(state, reqs, Box::new(on_complete)))
    }

    /// Cancel the call with `Cancelled` / "Cancelled".
    pub fn cancel(&self) {
        self.cancel_with_status(StatusCode::Cancelled, "Cancelled");
    }

    /// Cancel the call: stamps the application-override status source and
    /// informs the transport best-effort.
    pub fn cancel_with_status(&self, code: StatusCode, description: &str) {
        let details = Bytes::copy_from_slice(description.as_bytes());
        let shared = &self.shared;
        shared.with_lock(|state| shared.cancel_locked(state, code, Some(details)));
    }

    /// Stamp a status produced by the surrounding runtime (between the
    /// application and the wire). Does not touch the transport.
    pub fn set_internal_status(&self, code: StatusCode, details: Option<Bytes>) {
        let shared = &self.shared;
        shared.with_lock(|state| {
            shared.set_status_code(state, StatusSource::Core, code);
            set_status_details(state, StatusSource::Core, details);
        });
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        let shared = &self.shared;
        let needs_cancel = shared.with_lock(|state| {
            if let Some(alarm) = state.alarm.take() {
                alarm.cancel();
            }
            state.read_state != ReadState::StreamClosed
        });
        if needs_cancel {
            shared.with_lock(|state| {
                shared.cancel_locked(
                    state,
                    StatusCode::Cancelled,
                    Some(Bytes::from_static(b"Cancelled")),
                );
            });
        }
        metrics::CALLS_DESTROYED.increment();
        trace!(reason = "application", "call unref");
    }
}

impl Shared {
    /// Run `f` under the call mutex, then perform the unlock pass.
    fn with_lock<R>(self: &Arc<Self>, f: impl FnOnce(&mut State) -> R) -> R {
        let mut guard = self.state.lock().unwrap();
        let result = f(&mut guard);
        self.unlock(guard);
        result
    }

    /// The edge-triggered scheduling pass. With the lock still held, build
    /// at most one send, arm at most one receive, and snapshot finished
    /// groups; then release the lock, dispatch to the transport, and run
    /// completion callbacks. Loops until a pass schedules nothing new.
    fn unlock<'a>(self: &'a Arc<Self>, mut guard: MutexGuard<'a, State>) {
        loop {
            let mut op = TransportOp::default();

            if !guard.receiving && guard.need_more_data(self.role) {
                guard.receiving = true;
                op.recv = true;
                trace!(reason = "receiving", "call ref");
            }

            if !guard.sending {
                if let Some(batch) = self.fill_send_ops(&mut guard) {
                    guard.sending = true;
                    op.send = Some(batch);
                    trace!(reason = "sending", "call ref");
                }
            }

            if let Some(code) = guard.pending_cancel.take() {
                op.cancel_with_status = Some(code);
            }

            let completions = if !guard.completing && !guard.completed.is_empty() {
                guard.completing = true;
                trace!(reason = "completing", "call ref");
                Some(std::mem::take(&mut guard.completed))
            } else {
                None
            };

            drop(guard);

            if !op.is_empty() {
                let handle = TransportCall {
                    shared: Arc::clone(self),
                };
                self.channel.transport().start(handle, op);
            }

            let Some(completions) = completions else {
                return;
            };
            for completed in completions {
                (completed.on_complete)(completed.status);
            }

            guard = self.state.lock().unwrap();
            guard.completing = false;
            trace!(reason = "completing", "call unref");
        }
    }

    // ── Request multiplexer ──────────────────────────────────────────

    /// Validate and commit a group of ioreqs. Nothing is mutated unless the
    /// whole group is acceptable.
    fn start_ioreqs_locked(
        &self,
        state: &mut State,
        reqs: Vec<Ioreq>,
        on_complete: CompletionFn,
    ) -> Result<(), CallError> {
        let mut need = OpSet::empty();
        for req in &reqs {
            let op = req.op();
            if need.contains(op) {
                return Err(CallError::TooManyOperations);
            }
            match state.slots[op.index()] {
                SlotState::Pending(_) => return Err(CallError::TooManyOperations),
                SlotState::Done => return Err(CallError::AlreadyInvoked),
                SlotState::Empty => {}
            }
            if let Ioreq::SendInitialMetadata(md) | Ioreq::SendTrailingMetadata(md) = req {
                for element in md {
                    if !element.key_is_valid()
                        || element.key == *self.channel.status_key()
                        || element.key == *self.channel.message_key()
                    {
                        return Err(CallError::InvalidMetadata);
                    }
                }
            }
            need.insert(op);
        }

        let key = state.masters.insert(Master {
            status: OpStatus::Ok,
            need,
            complete: OpSet::empty(),
            on_complete: Some(on_complete),
        });
        for req in reqs {
            let op = req.op();
            state.slots[op.index()] = SlotState::Pending(key);
            state.data[op.index()] = Some(req);
        }

        // Some of the group may already be satisfiable.
        self.finish_read_ops(state);
        self.early_out_write_ops(state);
        Ok(())
    }

    fn finish_ioreq_op(&self, state: &mut State, op: IoreqOp, status: OpStatus) {
        if state.is_op_live(op) {
            self.finish_live_ioreq_op(state, op, status);
        }
    }

    /// Mark a live op complete; when its group's masks match, terminate the
    /// group: transition slots, materialize receive results, and queue the
    /// completion for dispatch after the lock releases.
    fn finish_live_ioreq_op(&self, state: &mut State, op: IoreqOp, status: OpStatus) {
        let key = match state.slots[op.index()] {
            SlotState::Pending(key) => key,
            _ => unreachable!("finishing an op that is not pending"),
        };

        {
            let master = &mut state.masters[key];
            master.complete.insert(op);
            if !status.is_ok() {
                master.status = OpStatus::Error;
            }
            if master.complete != master.need {
                return;
            }
        }

        let master = state.masters.remove(key);
        for member in IoreqOp::ALL {
            if state.slots[member.index()] != SlotState::Pending(key) {
                continue;
            }
            state.slots[member.index()] = SlotState::Done;
            let data = state.data[member.index()].take();
            match member {
                IoreqOp::SendMessage | IoreqOp::RecvMessage => {
                    if master.status.is_ok() {
                        // Repeatable: the next message may start.
                        state.slots[member.index()] = SlotState::Empty;
                    } else {
                        state.write_state = WriteState::WriteClosed;
                    }
                }
                IoreqOp::RecvStatus => {
                    if let Some(Ioreq::RecvStatus(sink)) = data {
                        let code = self.final_status(state);
                        match sink {
                            StatusSink::Code(cell) => cell.set(code),
                            StatusSink::Cancelled(cell) => cell.set(!code.is_ok()),
                        }
                    }
                }
                IoreqOp::RecvStatusDetails => {
                    if let Some(Ioreq::RecvStatusDetails(sink)) = data {
                        let details = final_details(state);
                        sink.set(String::from_utf8_lossy(&details).into_owned());
                    }
                }
                IoreqOp::RecvInitialMetadata => {
                    if let Some(Ioreq::RecvInitialMetadata(sink)) = data {
                        sink.set(std::mem::take(&mut state.buffered_metadata[0]));
                    }
                }
                IoreqOp::RecvTrailingMetadata => {
                    if let Some(Ioreq::RecvTrailingMetadata(sink)) = data {
                        sink.set(std::mem::take(&mut state.buffered_metadata[1]));
                    }
                }
                _ => {}
            }
        }

        state.completed.push(CompletedRequest {
            status: master.status,
            on_complete: master
                .on_complete
                .expect("group completion dispatched twice"),
        });
    }

    // ── Send pipeline ────────────────────────────────────────────────

    /// Assemble the next send batch from currently-live send ops, or `None`
    /// if nothing can go out. Initial metadata must precede any message;
    /// messages precede close + trailers.
    fn fill_send_ops(&self, state: &mut State) -> Option<SendBatch> {
        let mut batch = SendBatch::default();

        match state.write_state {
            WriteState::WriteClosed => return None,
            WriteState::Initial => {
                if !state.is_op_live(IoreqOp::SendInitialMetadata) {
                    return None;
                }
                let request_md = match state.data[IoreqOp::SendInitialMetadata.index()].take() {
                    Some(Ioreq::SendInitialMetadata(md)) => md,
                    _ => Vec::new(),
                };
                let mut elements = std::mem::take(&mut state.add_initial_metadata);
                elements.extend(request_md);
                batch.push(StreamOp::Metadata(MetadataBatch::with_deadline(
                    elements,
                    state.send_deadline,
                )));
                state.last_send_contains.insert(IoreqOp::SendInitialMetadata);
                state.write_state = WriteState::Started;
                self.fill_started_sends(state, &mut batch);
            }
            WriteState::Started => self.fill_started_sends(state, &mut batch),
        }

        if state.last_send_contains.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    fn fill_started_sends(&self, state: &mut State, batch: &mut SendBatch) {
        if state.is_op_live(IoreqOp::SendMessage) {
            if let Some(Ioreq::SendMessage(payload)) = &state.data[IoreqOp::SendMessage.index()] {
                batch.push(StreamOp::BeginMessage {
                    length: payload.len() as u32,
                    flags: 0,
                });
                batch.push(StreamOp::Slice(payload.clone()));
            }
            state.last_send_contains.insert(IoreqOp::SendMessage);
        }

        if state.is_op_live(IoreqOp::SendClose) {
            batch.is_last_send = true;
            state.last_send_contains.insert(IoreqOp::SendClose);
            state.write_state = WriteState::WriteClosed;

            if self.role == Role::Server {
                let trailers = match state.data[IoreqOp::SendTrailingMetadata.index()].take() {
                    Some(Ioreq::SendTrailingMetadata(md)) => md,
                    _ => Vec::new(),
                };
                let mut mdb = MetadataBatch::new(trailers);
                if let Some(Ioreq::SendStatus { code, details }) =
                    state.data[IoreqOp::SendStatus.index()].take()
                {
                    mdb.elements.push(Metadata {
                        key: self.channel.status_key().clone(),
                        value: code.to_wire(),
                    });
                    if let Some(details) = details {
                        mdb.elements.push(Metadata {
                            key: self.channel.message_key().clone(),
                            value: details,
                        });
                    }
                }
                batch.push(StreamOp::Metadata(mdb));
            }
        }
    }

    /// Fail sends that can no longer reach the wire, evaluated at submit.
    fn early_out_write_ops(&self, state: &mut State) {
        if state.write_state >= WriteState::WriteClosed {
            self.finish_ioreq_op(state, IoreqOp::SendMessage, OpStatus::Error);
            self.finish_ioreq_op(state, IoreqOp::SendStatus, OpStatus::Error);
            self.finish_ioreq_op(state, IoreqOp::SendTrailingMetadata, OpStatus::Error);
            // Closing an already-closed stream is success.
            self.finish_ioreq_op(state, IoreqOp::SendClose, OpStatus::Ok);
        }
        if state.write_state >= WriteState::Started {
            self.finish_ioreq_op(state, IoreqOp::SendInitialMetadata, OpStatus::Error);
        }
    }

    /// Send-batch completion from the transport.
    pub(crate) fn on_send_done(self: &Arc<Self>, status: OpStatus) {
        self.with_lock(|state| {
            if state.last_send_contains.contains(IoreqOp::SendInitialMetadata) {
                self.finish_ioreq_op(state, IoreqOp::SendInitialMetadata, status);
            }
            if state.last_send_contains.contains(IoreqOp::SendMessage) {
                if status.is_ok() {
                    metrics::MESSAGES_SENT.increment();
                }
                self.finish_ioreq_op(state, IoreqOp::SendMessage, status);
            }
            if state.last_send_contains.contains(IoreqOp::SendClose) {
                // Trailers and status ride the close; they have no wire
                // completion of their own.
                self.finish_ioreq_op(state, IoreqOp::SendTrailingMetadata, status);
                self.finish_ioreq_op(state, IoreqOp::SendStatus, status);
                self.finish_ioreq_op(state, IoreqOp::SendClose, OpStatus::Ok);
            }
            state.last_send_contains.clear();
            state.sending = false;
            trace!(reason = "sending", "call unref");
        });
    }

    // ── Receive pipeline ─────────────────────────────────────────────

    /// Receive completion from the transport: walk the stream ops, advance
    /// the read state, and satisfy whatever receives became ready.
    pub(crate) fn on_recv_done(
        self: &Arc<Self>,
        ops: Vec<StreamOp>,
        stream_state: StreamState,
        success: bool,
    ) {
        self.with_lock(|state| {
            state.receiving = false;
            trace!(reason = "receiving", "call unref");

            if !success {
                for op in [
                    IoreqOp::RecvMessage,
                    IoreqOp::RecvStatus,
                    IoreqOp::RecvClose,
                    IoreqOp::RecvTrailingMetadata,
                    IoreqOp::RecvInitialMetadata,
                    IoreqOp::RecvStatusDetails,
                ] {
                    self.finish_ioreq_op(state, op, OpStatus::Error);
                }
                return;
            }

            let mut walk_ok = true;
            for op in ops {
                if !walk_ok {
                    break;
                }
                match op {
                    StreamOp::Metadata(batch) => self.recv_metadata(state, batch),
                    StreamOp::BeginMessage { length, .. } => {
                        walk_ok = self.begin_message(state, length);
                    }
                    StreamOp::Slice(slice) => {
                        walk_ok = self.add_slice_to_message(state, slice);
                    }
                }
            }

            let read_closing = matches!(
                stream_state,
                StreamState::RecvClosed | StreamState::Closed
            );
            if read_closing && state.reading_message {
                // The peer closed mid-message: declared length was never
                // reached.
                let message = format!(
                    "Message terminated early; read {} bytes, expected {}",
                    state.incoming_message.len(),
                    state.incoming_message_length
                );
                metrics::FRAMING_ERRORS.increment();
                abandon_message(state);
                self.cancel_locked(state, StatusCode::InvalidArgument, Some(Bytes::from(message)));
            }

            if stream_state == StreamState::RecvClosed {
                debug_assert!(state.read_state <= ReadState::ReadClosed);
                state.read_state = ReadState::ReadClosed;
            }
            if stream_state == StreamState::Closed {
                debug_assert!(state.read_state <= ReadState::StreamClosed);
                state.read_state = ReadState::StreamClosed;
                if let Some(alarm) = state.alarm.take() {
                    alarm.cancel();
                }
            }

            self.finish_read_ops(state);
        });
    }

    fn begin_message(self: &Arc<Self>, state: &mut State, length: u32) -> bool {
        if state.reading_message {
            let message = format!(
                "Message terminated early; read {} bytes, expected {}",
                state.incoming_message.len(),
                state.incoming_message_length
            );
            metrics::FRAMING_ERRORS.increment();
            abandon_message(state);
            self.cancel_locked(state, StatusCode::InvalidArgument, Some(Bytes::from(message)));
            return false;
        }
        let max = self.channel.max_message_length();
        if length > max {
            let message = format!(
                "Maximum message length of {max} exceeded by a message of length {length}"
            );
            metrics::FRAMING_ERRORS.increment();
            self.cancel_locked(state, StatusCode::InvalidArgument, Some(Bytes::from(message)));
            false
        } else if length > 0 {
            state.reading_message = true;
            state.incoming_message_length = length;
            true
        } else {
            finish_message(state);
            true
        }
    }

    fn add_slice_to_message(self: &Arc<Self>, state: &mut State, slice: Bytes) -> bool {
        if slice.is_empty() {
            return true;
        }
        if !state.reading_message {
            metrics::FRAMING_ERRORS.increment();
            self.cancel_locked(
                state,
                StatusCode::InvalidArgument,
                Some(Bytes::from_static(
                    b"Received payload data while not reading a message",
                )),
            );
            return false;
        }
        state.incoming_message.extend_from_slice(&slice);
        let received = state.incoming_message.len();
        let expected = state.incoming_message_length as usize;
        if received > expected {
            let message =
                format!("Receiving message overflow; read {received} bytes, expected {expected}");
            metrics::FRAMING_ERRORS.increment();
            abandon_message(state);
            self.cancel_locked(state, StatusCode::InvalidArgument, Some(Bytes::from(message)));
            false
        } else {
            if received == expected {
                finish_message(state);
            }
            true
        }
    }

    // ── Read-op matcher ──────────────────────────────────────────────

    /// Satisfy live receives against the current read state. Runs under the
    /// lock after anything that could make a receive ready. Order matters:
    /// message delivery first, then close-gated completions.
    fn finish_read_ops(&self, state: &mut State) {
        let is_empty;
        if state.is_op_live(IoreqOp::RecvMessage) {
            match state.incoming_queue.pop_front() {
                Some(payload) => {
                    if let Some(Ioreq::RecvMessage(sink)) =
                        &state.data[IoreqOp::RecvMessage.index()]
                    {
                        sink.set(Some(payload));
                    }
                    self.finish_live_ioreq_op(state, IoreqOp::RecvMessage, OpStatus::Ok);
                    is_empty = state.incoming_queue.is_empty();
                }
                None => {
                    // Nothing queued: pre-stage the no-more-messages marker
                    // so a close below delivers it.
                    if let Some(Ioreq::RecvMessage(sink)) =
                        &state.data[IoreqOp::RecvMessage.index()]
                    {
                        sink.set(None);
                    }
                    is_empty = true;
                }
            }
        } else {
            is_empty = state.incoming_queue.is_empty();
        }

        if state.read_state >= ReadState::StreamClosed && is_empty {
            self.finish_ioreq_op(state, IoreqOp::RecvClose, OpStatus::Ok);
        }
        if state.read_state >= ReadState::ReadClosed {
            if is_empty {
                self.finish_ioreq_op(state, IoreqOp::RecvMessage, OpStatus::Ok);
            }
            // Status and trailers complete only once the peer can add no
            // further sources.
            self.finish_ioreq_op(state, IoreqOp::RecvStatus, OpStatus::Ok);
            self.finish_ioreq_op(state, IoreqOp::RecvStatusDetails, OpStatus::Ok);
            self.finish_ioreq_op(state, IoreqOp::RecvTrailingMetadata, OpStatus::Ok);
        }
        if state.read_state >= ReadState::GotInitialMetadata {
            self.finish_ioreq_op(state, IoreqOp::RecvInitialMetadata, OpStatus::Ok);
        }
    }

    // ── Metadata routing ─────────────────────────────────────────────

    /// Route one incoming metadata batch: status and details keys feed the
    /// wire status source, everything else lands in the buffered initial or
    /// trailing array. A carried deadline arms the alarm.
    fn recv_metadata(self: &Arc<Self>, state: &mut State, batch: MetadataBatch) {
        let is_trailing = state.read_state >= ReadState::GotInitialMetadata;
        for element in batch.elements {
            if element.key == *self.channel.status_key() {
                let code = StatusCode::from_wire(&element.value);
                self.set_status_code(state, StatusSource::Wire, code);
            } else if element.key == *self.channel.message_key() {
                set_status_details(state, StatusSource::Wire, Some(element.value));
            } else {
                state.buffered_metadata[is_trailing as usize].push(element);
            }
        }
        if let Some(deadline) = batch.deadline {
            self.set_deadline_alarm(state, deadline);
        }
        if !is_trailing {
            state.read_state = ReadState::GotInitialMetadata;
        }
    }

    // ── Status & deadline ────────────────────────────────────────────

    fn set_status_code(&self, state: &mut State, source: StatusSource, code: StatusCode) {
        state.status[source as usize].code = Some(code);

        // Callers should see status rather than stale data: clients flush
        // undelivered messages on cancellation, servers on any failure.
        let flush = match self.role {
            Role::Client => code == StatusCode::Cancelled,
            Role::Server => code != StatusCode::Ok,
        };
        if flush && !state.incoming_queue.is_empty() {
            state.incoming_queue.clear();
        }
    }

    fn final_status(&self, state: &State) -> StatusCode {
        for slot in &state.status {
            if let Some(code) = slot.code {
                return code;
            }
        }
        match self.role {
            Role::Client => StatusCode::Unknown,
            Role::Server => StatusCode::Ok,
        }
    }

    /// Stamp the override source and queue a cancel op for the transport.
    fn cancel_locked(&self, state: &mut State, code: StatusCode, details: Option<Bytes>) {
        debug!(code = %code, "cancelling call");
        metrics::CALLS_CANCELLED.increment();
        self.set_status_code(state, StatusSource::ApiOverride, code);
        set_status_details(state, StatusSource::ApiOverride, details);
        state.pending_cancel = Some(code);
    }

    fn set_deadline_alarm(self: &Arc<Self>, state: &mut State, deadline: Instant) {
        if state.alarm.is_some() {
            error!("attempt to set deadline alarm twice");
            debug_assert!(false, "attempt to set deadline alarm twice");
            return;
        }
        trace!(reason = "alarm", "call ref");
        let shared = Arc::clone(self);
        let handle = self.channel.alarms().schedule(
            deadline,
            Box::new(move |fired| {
                if fired {
                    metrics::DEADLINES_FIRED.increment();
                    let (code, details) = match shared.role {
                        Role::Client => (StatusCode::DeadlineExceeded, "Deadline Exceeded"),
                        Role::Server => (StatusCode::Cancelled, "Cancelled"),
                    };
                    shared.with_lock(|state| {
                        shared.cancel_locked(
                            state,
                            code,
                            Some(Bytes::from_static(details.as_bytes())),
                        );
                    });
                }
                trace!(reason = "alarm", "call unref");
            }),
        );
        state.alarm = Some(handle);
    }
}

fn set_status_details(state: &mut State, source: StatusSource, details: Option<Bytes>) {
    state.status[source as usize].details = details;
}

fn final_details(state: &State) -> Bytes {
    // Details only count from the highest-priority source that set a code.
    for slot in &state.status {
        if slot.code.is_some() {
            return slot.details.clone().unwrap_or_else(Bytes::new);
        }
    }
    Bytes::new()
}

fn finish_message(state: &mut State) {
    let payload = state.incoming_message.split().freeze();
    state.incoming_queue.push_back(payload);
    state.reading_message = false;
    metrics::MESSAGES_RECEIVED.increment();
}

/// Discard a partially-assembled message after a framing fault so later
/// stream events do not re-report it.
fn abandon_message(state: &mut State) {
    state.incoming_message.clear();
    state.reading_message = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::transport::Transport;
    use crate::Sink;

    /// Transport that records ops and never completes them.
    struct NullTransport;

    impl Transport for NullTransport {
        fn start(&self, _call: TransportCall, _op: TransportOp) {}
    }

    fn test_channel() -> Arc<Channel> {
        Channel::new(Arc::new(NullTransport), ChannelConfig::default())
    }

    fn client_call(channel: &Arc<Channel>, cq: &Arc<CompletionQueue>) -> Call {
        Call::create(
            Arc::clone(channel),
            Arc::clone(cq),
            Role::Client,
            Vec::new(),
            None,
        )
    }

    #[test]
    fn send_status_is_born_done_on_clients() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let call = client_call(&channel, &cq);

        let err = call
            .start_ioreqs(
                vec![Ioreq::SendStatus {
                    code: StatusCode::Ok,
                    details: None,
                }],
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyInvoked);

        let err = call
            .start_ioreqs(vec![Ioreq::SendTrailingMetadata(vec![])], |_| {})
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyInvoked);
    }

    #[test]
    fn duplicate_kind_in_one_group_is_rejected() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let call = client_call(&channel, &cq);

        let err = call
            .start_ioreqs(
                vec![
                    Ioreq::RecvMessage(Sink::new()),
                    Ioreq::RecvMessage(Sink::new()),
                ],
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err, CallError::TooManyOperations);

        // Rejection rolled everything back: the same op starts cleanly.
        call.start_ioreqs(vec![Ioreq::RecvMessage(Sink::new())], |_| {})
            .unwrap();
    }

    #[test]
    fn reserved_metadata_keys_are_rejected() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let call = client_call(&channel, &cq);

        let err = call
            .start_ioreqs(
                vec![Ioreq::SendInitialMetadata(vec![Metadata::new(
                    "grpc-status",
                    "0",
                )])],
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err, CallError::InvalidMetadata);

        let err = call
            .start_ioreqs(
                vec![Ioreq::SendInitialMetadata(vec![Metadata::new("", "x")])],
                |_| {},
            )
            .unwrap_err();
        assert_eq!(err, CallError::InvalidMetadata);
    }

    #[test]
    fn empty_ioreq_group_is_a_no_op() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let call = client_call(&channel, &cq);
        call.start_ioreqs(Vec::new(), |_| panic!("must not run"))
            .unwrap();
    }

    #[test]
    fn empty_batch_completes_immediately() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let call = client_call(&channel, &cq);

        call.start_batch(Vec::new(), 9).unwrap();
        assert_eq!(cq.try_next().map(|e| e.tag), Some(9));
        assert_eq!(cq.pending_ops(), 0);
    }

    #[test]
    #[should_panic(expected = "too many pre-seeded initial metadata elements")]
    fn preseeded_metadata_is_bounded() {
        let channel = test_channel();
        let cq = Arc::new(CompletionQueue::new());
        let md = (0..4).map(|i| Metadata::new(format!("k{i}"), "v")).collect();
        let _call = Call::create(channel, cq, Role::Client, md, None);
    }
}
