//! tether-call — per-RPC call state machine over a framed-stream transport.
//!
//! A [`Call`] sits between an application's batch API and a transport that
//! carries framed stream ops (metadata batches, begin-message markers,
//! payload slices, close signals). It multiplexes concurrent sub-operations
//! onto one bidirectional stream, keeps at most one transport batch in
//! flight per direction, merges final status from three priority-ordered
//! sources, and posts one completion per accepted batch to a
//! [`CompletionQueue`].
//!
//! # Architecture
//!
//! ```text
//!   application
//!        |  start_batch(ops, tag)
//!   +----v-----------+
//!   | Call           |  ioreq multiplexer + send/recv pipelines
//!   |                |  status sources + deadline alarm
//!   +----+-----------+
//!        |  TransportOp (one send batch / one armed receive)
//!   +----v-----------+
//!   | Transport impl |  completes via TransportCall, any thread
//!   +----------------+
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_call::{BatchOp, Call, Channel, ChannelConfig, CompletionQueue, Role, Sink};
//!
//! let channel = Channel::new(transport, ChannelConfig::default());
//! let cq = std::sync::Arc::new(CompletionQueue::new());
//! let call = Call::create(channel, cq.clone(), Role::Client, vec![], None);
//!
//! let message = Sink::new();
//! let status = Sink::new();
//! call.start_batch(vec![
//!     BatchOp::SendInitialMetadata(vec![]),
//!     BatchOp::SendMessage(b"ping"[..].into()),
//!     BatchOp::SendCloseFromClient,
//!     BatchOp::RecvMessage(message.clone()),
//!     BatchOp::RecvStatusOnClient {
//!         status: status.clone(),
//!         details: Sink::new(),
//!         trailing_metadata: Sink::new(),
//!     },
//! ], 1)?;
//!
//! let event = cq.next(std::time::Duration::from_secs(5)).unwrap();
//! assert_eq!(event.tag, 1);
//! ```

pub mod alarm;
pub mod batch;
pub mod call;
pub mod channel;
pub mod config;
pub mod cq;
pub mod error;
pub mod metrics;
pub mod opset;
pub mod transport;

pub use batch::{BatchOp, Ioreq, Sink, StatusSink};
pub use call::{Call, Role, MAX_ADD_INITIAL_METADATA};
pub use channel::Channel;
pub use config::{ChannelConfig, DEFAULT_MAX_MESSAGE_LENGTH};
pub use cq::{CompletionQueue, Event};
pub use error::{CallError, OpStatus};
pub use opset::IoreqOp;
pub use transport::{Transport, TransportCall};

pub use tether_transport::{
    Metadata, MetadataBatch, SendBatch, StatusCode, StreamOp, StreamState, TransportOp,
};
