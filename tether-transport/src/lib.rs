//! Transport-level primitives shared by the tether call layer and transports.
//!
//! A transport carries framed stream operations in each direction: metadata
//! batches, begin-message markers that declare a payload length, and payload
//! slices. The call layer assembles these into [`SendBatch`]es (at most one
//! in flight per direction) and consumes them from receive completions.
//!
//! ```text
//!   application batches
//!        |
//!   +----v-----------+
//!   | tether-call    |  ioreq multiplexing + status + deadlines
//!   +----+-----------+
//!        |  StreamOp / SendBatch / StreamState
//!   +----v-----------+
//!   | transport impl |  framing, flow control (out of scope here)
//!   +----------------+
//! ```

pub mod metadata;
pub mod op;
pub mod status;

pub use metadata::{Metadata, MetadataBatch};
pub use op::{SendBatch, StreamOp, StreamState, TransportOp};
pub use status::StatusCode;
