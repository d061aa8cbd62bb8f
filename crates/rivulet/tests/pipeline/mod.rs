//! End-to-end tests for the pipeline engine:
//!
//! - **basic**: unordered mapping, counting, streaming, permit bounds
//! - **ordered**: source-order output, including capacity-1 queues
//! - **retry_behavior**: retry convergence and backoff timing
//! - **error_modes**: fail-fast, collect-and-continue, best-effort
//! - **cancellation**: external token behavior
//! - **fallback**: substitute values for exhausted items
//! - **hooks**: lifecycle hooks, hook isolation, drain, throttle

mod fallback;
mod hooks;
mod ordered;
