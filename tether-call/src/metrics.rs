//! Call-layer metrics, exposed through the metriken registry.

use metriken::{metric, Counter};

// ── Call lifecycle ───────────────────────────────────────────────

#[metric(name = "tether/calls/created", description = "Total calls created")]
pub static CALLS_CREATED: Counter = Counter::new();

#[metric(name = "tether/calls/destroyed", description = "Total calls destroyed")]
pub static CALLS_DESTROYED: Counter = Counter::new();

#[metric(
    name = "tether/calls/cancelled",
    description = "Cancellations requested through the API or internally"
)]
pub static CALLS_CANCELLED: Counter = Counter::new();

#[metric(
    name = "tether/calls/deadline_fired",
    description = "Deadline alarms that fired before the stream closed"
)]
pub static DEADLINES_FIRED: Counter = Counter::new();

// ── Batches and messages ─────────────────────────────────────────

#[metric(name = "tether/batches/accepted", description = "Application batches accepted")]
pub static BATCHES_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "tether/batches/rejected",
    description = "Application batches rejected at submission"
)]
pub static BATCHES_REJECTED: Counter = Counter::new();

#[metric(name = "tether/messages/sent", description = "Messages sent to the transport")]
pub static MESSAGES_SENT: Counter = Counter::new();

#[metric(
    name = "tether/messages/received",
    description = "Messages assembled from the transport"
)]
pub static MESSAGES_RECEIVED: Counter = Counter::new();

// ── Faults ───────────────────────────────────────────────────────

#[metric(
    name = "tether/framing/errors",
    description = "Incoming framing faults (bad begin, overflow, oversized)"
)]
pub static FRAMING_ERRORS: Counter = Counter::new();
