//! Dispatcher and connection metrics.
//!
//! Plain process-wide counters; exposed through the metriken registry so a
//! host application can export them however it likes.

use metriken::{Counter, metric};

// ── Dispatch queue ───────────────────────────────────────────────

#[metric(
    name = "membase/dispatch/enqueued",
    description = "Operations accepted into the dispatch queue"
)]
pub static DISPATCH_ENQUEUED: Counter = Counter::new();

#[metric(
    name = "membase/dispatch/rejected",
    description = "Operations rejected because the dispatch queue was full"
)]
pub static DISPATCH_REJECTED: Counter = Counter::new();

#[metric(
    name = "membase/dispatch/completed",
    description = "Operations completed successfully"
)]
pub static DISPATCH_COMPLETED: Counter = Counter::new();

#[metric(
    name = "membase/dispatch/failed",
    description = "Operations completed with an error"
)]
pub static DISPATCH_FAILED: Counter = Counter::new();

#[metric(
    name = "membase/dispatch/wait_timeouts",
    description = "Callers that stopped waiting before the result arrived"
)]
pub static DISPATCH_WAIT_TIMEOUTS: Counter = Counter::new();

// ── Topology ─────────────────────────────────────────────────────

#[metric(
    name = "membase/topology/nmv_retries",
    description = "Re-dispatches after a not-my-vbucket response"
)]
pub static NMV_RETRIES: Counter = Counter::new();

#[metric(
    name = "membase/topology/reconfigs",
    description = "Topology refreshes performed by the worker"
)]
pub static RECONFIGS: Counter = Counter::new();

// ── Connections ──────────────────────────────────────────────────

#[metric(
    name = "membase/connections/opened",
    description = "TCP connections opened to cluster nodes"
)]
pub static CONNECTIONS_OPENED: Counter = Counter::new();

#[metric(
    name = "membase/connections/closed",
    description = "TCP connections closed or dropped after errors"
)]
pub static CONNECTIONS_CLOSED: Counter = Counter::new();
