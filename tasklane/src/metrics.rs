//! Runtime counters, exposed through the metriken registry.

use metriken::{Counter, metric};

#[metric(
    name = "tasklane/callbacks/submitted",
    description = "Callbacks submitted across all queues and lanes"
)]
pub static CALLBACKS_SUBMITTED: Counter = Counter::new();

#[metric(
    name = "tasklane/callbacks/dispatched",
    description = "Callbacks that ran to completion"
)]
pub static CALLBACKS_DISPATCHED: Counter = Counter::new();

#[metric(
    name = "tasklane/callbacks/removed",
    description = "Queued callbacks revoked before dispatch"
)]
pub static CALLBACKS_REMOVED: Counter = Counter::new();

#[metric(
    name = "tasklane/pool/wakeups",
    description = "Worker wakeups requested from thread pools"
)]
pub static POOL_WAKEUPS: Counter = Counter::new();

#[metric(
    name = "tasklane/ops/completed",
    description = "Async operations that delivered a completion, canceled ones included"
)]
pub static OPS_COMPLETED: Counter = Counter::new();

#[metric(
    name = "tasklane/ops/canceled",
    description = "Async operations canceled before or during their work"
)]
pub static OPS_CANCELED: Counter = Counter::new();
