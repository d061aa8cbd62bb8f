//! Error types surfaced by the pipeline.
//!
//! The engine keeps the user's error type `E` fully generic and never
//! requires it to implement [`std::error::Error`]; bounds are only added
//! where a `Display` impl actually interpolates it.

use std::time::Duration;

use crate::config::ConfigError;

/// How a single item ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum ItemFailure<E> {
    /// The transform returned an error on the final attempt.
    #[error("transform failed: {0}")]
    Transform(E),
    /// The per-item timeout elapsed before an attempt finished.
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
}

impl<E> ItemFailure<E> {
    /// Returns true if this failure came from the per-item timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ItemFailure::Timeout(_))
    }

    /// The transform error, if this was not a timeout.
    pub fn transform_error(&self) -> Option<&E> {
        match self {
            ItemFailure::Transform(e) => Some(e),
            ItemFailure::Timeout(_) => None,
        }
    }
}

/// Terminal failure record for one item.
///
/// Carries the item's source index, how many attempts were spent on it, and
/// the failure observed on the last attempt.
#[derive(Debug, thiserror::Error)]
#[error("item {index} failed after {attempts} attempt(s): {failure}")]
pub struct ItemError<E> {
    /// Source index of the failed item.
    pub index: u64,
    /// Attempts consumed, including the first one.
    pub attempts: u32,
    /// What the last attempt observed.
    pub failure: ItemFailure<E>,
}

/// Terminal error of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError<E> {
    /// The options failed validation; no work was started.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A single item failed and stopped the pipeline (fail-fast).
    #[error("{0}")]
    Item(ItemError<E>),

    /// Item failures collected over the run.
    #[error("{} item(s) failed", .0.len())]
    Aggregate(Vec<ItemError<E>>),

    /// The source stream itself produced an error; always fatal.
    #[error("source stream failed")]
    Source(E),

    /// The pipeline was cancelled through the external token.
    #[error("pipeline cancelled")]
    Cancelled,
}

impl<E> PipelineError<E> {
    /// Returns true for the external-cancellation terminal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Returns true for an options-validation failure.
    pub fn is_config(&self) -> bool {
        matches!(self, PipelineError::Config(_))
    }

    /// The per-item failures carried by this error, if any.
    pub fn item_errors(&self) -> &[ItemError<E>] {
        match self {
            PipelineError::Item(e) => std::slice::from_ref(e),
            PipelineError::Aggregate(errors) => errors,
            _ => &[],
        }
    }
}
