//! Metadata elements and batches.
//!
//! Metadata is a list of key/value byte pairs. A batch is what travels in a
//! single `StreamOp::Metadata`: the elements plus an optional deadline the
//! peer attached to the stream.

use std::time::Instant;

use bytes::Bytes;

/// A single metadata element: a key/value byte pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub key: Bytes,
    pub value: Bytes,
}

impl Metadata {
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Whether the key is acceptable from the application (non-empty).
    pub fn key_is_valid(&self) -> bool {
        !self.key.is_empty()
    }
}

/// A batch of metadata elements as carried by one stream op.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataBatch {
    pub elements: Vec<Metadata>,
    /// Deadline the sender attached to the stream, if finite.
    pub deadline: Option<Instant>,
}

impl MetadataBatch {
    pub fn new(elements: Vec<Metadata>) -> Self {
        Self {
            elements,
            deadline: None,
        }
    }

    pub fn with_deadline(elements: Vec<Metadata>, deadline: Option<Instant>) -> Self {
        Self { elements, deadline }
    }
}
