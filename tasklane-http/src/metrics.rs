//! HTTP-layer counters, exposed through the metriken registry.

use metriken::{Counter, metric};

#[metric(
    name = "tasklane_http/calls/created",
    description = "Call objects created"
)]
pub static CALLS_CREATED: Counter = Counter::new();

#[metric(
    name = "tasklane_http/calls/performed",
    description = "Calls handed to the perform dispatcher"
)]
pub static CALLS_PERFORMED: Counter = Counter::new();

#[metric(
    name = "tasklane_http/calls/mocked",
    description = "Calls served from the mock table without touching the network"
)]
pub static CALLS_MOCKED: Counter = Counter::new();

#[metric(
    name = "tasklane_http/calls/retried",
    description = "Attempts rescheduled by the retry policy"
)]
pub static CALLS_RETRIED: Counter = Counter::new();

#[metric(
    name = "tasklane_http/calls/failed",
    description = "Calls that surfaced a transport failure after retries"
)]
pub static CALLS_FAILED: Counter = Counter::new();
