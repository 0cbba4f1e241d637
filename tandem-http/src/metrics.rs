//! Client metrics.
//!
//! Process-wide counters registered with `metriken`, exposed by whatever
//! exporter the embedding application installs.

use metriken::{Counter, metric};

// ── Frames ───────────────────────────────────────────────────────

#[metric(name = "tandem/h2/frames/sent", description = "HTTP/2 frames written")]
pub static FRAMES_SENT: Counter = Counter::new();

#[metric(
    name = "tandem/h2/frames/received",
    description = "HTTP/2 frames read"
)]
pub static FRAMES_RECEIVED: Counter = Counter::new();

// ── Streams ──────────────────────────────────────────────────────

#[metric(
    name = "tandem/h2/streams/opened",
    description = "HTTP/2 streams created"
)]
pub static STREAMS_OPENED: Counter = Counter::new();

#[metric(
    name = "tandem/h2/streams/reset",
    description = "HTTP/2 streams reset by the peer"
)]
pub static STREAMS_RESET: Counter = Counter::new();

// ── Requests ─────────────────────────────────────────────────────

#[metric(
    name = "tandem/requests/h1",
    description = "Request attempts sent over HTTP/1.1"
)]
pub static REQUESTS_H1: Counter = Counter::new();

#[metric(
    name = "tandem/requests/h2",
    description = "Request attempts sent over HTTP/2"
)]
pub static REQUESTS_H2: Counter = Counter::new();

#[metric(
    name = "tandem/requests/retries",
    description = "Requests re-issued because of a retryable status"
)]
pub static RETRIES: Counter = Counter::new();
