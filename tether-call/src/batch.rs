//! Application-facing batch operations and their expansion into ioreqs.
//!
//! A batch is the application's unit of submission; it lowers to a group of
//! sub-operations ([`Ioreq`]s) that complete together. Receive results are
//! delivered through [`Sink`] cells the application retains.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tether_transport::{Metadata, StatusCode};

use crate::error::CallError;
use crate::opset::IoreqOp;
use crate::Role;

/// A shared out-cell a receive operation fills on completion.
///
/// The application keeps one clone and reads it (with [`Sink::take`]) after
/// the owning batch completes on the completion queue.
pub struct Sink<T>(Arc<Mutex<Option<T>>>);

impl<T> Sink<T> {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(None)))
    }

    /// Take the delivered value, leaving the cell empty.
    pub fn take(&self) -> Option<T> {
        self.0.lock().unwrap().take()
    }

    pub(crate) fn set(&self, value: T) {
        *self.0.lock().unwrap() = Some(value);
    }
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Sink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Sink<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Sink")
    }
}

/// How a `RecvStatus` ioreq delivers the final status.
#[derive(Debug, Clone)]
pub enum StatusSink {
    /// Deliver the status code itself.
    Code(Sink<StatusCode>),
    /// Deliver whether the call ended non-OK (the server-side "cancelled"
    /// view of client closure).
    Cancelled(Sink<bool>),
}

/// One sub-operation, the low-level unit the multiplexer tracks.
///
/// Most applications use [`BatchOp`] and `start_batch`; `start_ioreqs`
/// accepts these directly for callers that need their own grouping. Note
/// that `SendMessage` returns to startable on success while its group's
/// completion may already have fired, so a streaming sender should submit
/// each `SendMessage` as its own group.
#[derive(Debug)]
pub enum Ioreq {
    SendInitialMetadata(Vec<Metadata>),
    SendMessage(Bytes),
    SendTrailingMetadata(Vec<Metadata>),
    SendStatus {
        code: StatusCode,
        details: Option<Bytes>,
    },
    SendClose,
    RecvInitialMetadata(Sink<Vec<Metadata>>),
    /// Delivers `Some(payload)` per message; `None` once the read side has
    /// closed and no messages remain.
    RecvMessage(Sink<Option<Bytes>>),
    RecvStatus(StatusSink),
    RecvStatusDetails(Sink<String>),
    RecvTrailingMetadata(Sink<Vec<Metadata>>),
    RecvClose,
}

impl Ioreq {
    pub fn op(&self) -> IoreqOp {
        match self {
            Ioreq::SendInitialMetadata(_) => IoreqOp::SendInitialMetadata,
            Ioreq::SendMessage(_) => IoreqOp::SendMessage,
            Ioreq::SendTrailingMetadata(_) => IoreqOp::SendTrailingMetadata,
            Ioreq::SendStatus { .. } => IoreqOp::SendStatus,
            Ioreq::SendClose => IoreqOp::SendClose,
            Ioreq::RecvInitialMetadata(_) => IoreqOp::RecvInitialMetadata,
            Ioreq::RecvMessage(_) => IoreqOp::RecvMessage,
            Ioreq::RecvStatus(_) => IoreqOp::RecvStatus,
            Ioreq::RecvStatusDetails(_) => IoreqOp::RecvStatusDetails,
            Ioreq::RecvTrailingMetadata(_) => IoreqOp::RecvTrailingMetadata,
            Ioreq::RecvClose => IoreqOp::RecvClose,
        }
    }
}

/// One operation in an application batch.
#[derive(Debug)]
pub enum BatchOp {
    /// Send the call's initial metadata. Must precede any message on the
    /// wire; the pipeline enforces the ordering.
    SendInitialMetadata(Vec<Metadata>),
    /// Send one message payload.
    SendMessage(Bytes),
    /// Close the write side (client only).
    SendCloseFromClient,
    /// Send trailing metadata plus final status, then close the write side
    /// (server only).
    SendStatusFromServer {
        trailing_metadata: Vec<Metadata>,
        code: StatusCode,
        details: Option<Bytes>,
    },
    /// Receive the peer's initial metadata (client only).
    RecvInitialMetadata(Sink<Vec<Metadata>>),
    /// Receive one message; delivers `None` at end of stream.
    RecvMessage(Sink<Option<Bytes>>),
    /// Receive the final status, details, and trailing metadata (client
    /// only). Completes once the read side has fully closed.
    RecvStatusOnClient {
        status: Sink<StatusCode>,
        details: Sink<String>,
        trailing_metadata: Sink<Vec<Metadata>>,
    },
    /// Learn whether the client cancelled, once the stream closes.
    RecvCloseOnServer { cancelled: Sink<bool> },
}

impl BatchOp {
    /// Lower this batch op into its ioreqs, checking role preconditions.
    pub(crate) fn expand(self, role: Role, out: &mut Vec<Ioreq>) -> Result<(), CallError> {
        match self {
            BatchOp::SendInitialMetadata(md) => {
                out.push(Ioreq::SendInitialMetadata(md));
            }
            BatchOp::SendMessage(payload) => {
                out.push(Ioreq::SendMessage(payload));
            }
            BatchOp::SendCloseFromClient => {
                if role != Role::Client {
                    return Err(CallError::NotOnServer);
                }
                out.push(Ioreq::SendClose);
            }
            BatchOp::SendStatusFromServer {
                trailing_metadata,
                code,
                details,
            } => {
                if role != Role::Server {
                    return Err(CallError::NotOnClient);
                }
                out.push(Ioreq::SendTrailingMetadata(trailing_metadata));
                out.push(Ioreq::SendStatus { code, details });
                out.push(Ioreq::SendClose);
            }
            BatchOp::RecvInitialMetadata(sink) => {
                if role != Role::Client {
                    return Err(CallError::NotOnServer);
                }
                out.push(Ioreq::RecvInitialMetadata(sink));
            }
            BatchOp::RecvMessage(sink) => {
                out.push(Ioreq::RecvMessage(sink));
            }
            BatchOp::RecvStatusOnClient {
                status,
                details,
                trailing_metadata,
            } => {
                if role != Role::Client {
                    return Err(CallError::NotOnServer);
                }
                out.push(Ioreq::RecvStatus(StatusSink::Code(status)));
                out.push(Ioreq::RecvStatusDetails(details));
                out.push(Ioreq::RecvTrailingMetadata(trailing_metadata));
                out.push(Ioreq::RecvClose);
            }
            BatchOp::RecvCloseOnServer { cancelled } => {
                out.push(Ioreq::RecvStatus(StatusSink::Cancelled(cancelled)));
                out.push(Ioreq::RecvClose);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_take_leaves_empty() {
        let sink: Sink<u32> = Sink::new();
        assert!(sink.take().is_none());
        sink.set(5);
        assert_eq!(sink.take(), Some(5));
        assert!(sink.take().is_none());
    }

    #[test]
    fn clones_share_the_cell() {
        let a: Sink<&'static str> = Sink::new();
        let b = a.clone();
        a.set("hello");
        assert_eq!(b.take(), Some("hello"));
    }

    #[test]
    fn status_from_server_expands_to_three_ioreqs() {
        let mut out = Vec::new();
        BatchOp::SendStatusFromServer {
            trailing_metadata: vec![],
            code: StatusCode::Ok,
            details: None,
        }
        .expand(Role::Server, &mut out)
        .unwrap();
        let ops: Vec<IoreqOp> = out.iter().map(Ioreq::op).collect();
        assert_eq!(
            ops,
            vec![
                IoreqOp::SendTrailingMetadata,
                IoreqOp::SendStatus,
                IoreqOp::SendClose
            ]
        );
    }

    #[test]
    fn role_preconditions() {
        let mut out = Vec::new();
        assert_eq!(
            BatchOp::SendCloseFromClient
                .expand(Role::Server, &mut out)
                .unwrap_err(),
            CallError::NotOnServer
        );
        assert_eq!(
            BatchOp::SendStatusFromServer {
                trailing_metadata: vec![],
                code: StatusCode::Ok,
                details: None,
            }
            .expand(Role::Client, &mut out)
            .unwrap_err(),
            CallError::NotOnClient
        );
        assert_eq!(
            BatchOp::RecvInitialMetadata(Sink::new())
                .expand(Role::Server, &mut out)
                .unwrap_err(),
            CallError::NotOnServer
        );
        assert!(out.is_empty());
    }

    #[test]
    fn recv_close_on_server_has_no_role_check() {
        let mut out = Vec::new();
        BatchOp::RecvCloseOnServer {
            cancelled: Sink::new(),
        }
        .expand(Role::Client, &mut out)
        .unwrap();
        assert_eq!(out.len(), 2);
    }
}
