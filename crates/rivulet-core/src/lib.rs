//! Core primitives shared by the rivulet engine crates.
//!
//! This crate provides the two building blocks the pipeline engine is wired
//! out of:
//!
//! - [`BoundedQueue`]: a bounded MPMC FIFO with asynchronous write-wait and
//!   read-wait, and a close-then-drain protocol.
//! - [`EventListeners`]: a panic-isolated listener registry used for
//!   observability. A misbehaving listener never takes the pipeline down,
//!   and one that keeps panicking is muted after [`MAX_LISTENER_STRIKES`].
//!
//! Applications normally depend on the `rivulet` crate and only reach for
//! these types when plugging in custom observability.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod events;
pub mod queue;

pub use events::{EngineEvent, EventListener, EventListeners, FnListener, MAX_LISTENER_STRIKES};
pub use queue::{BoundedQueue, WriteError};
