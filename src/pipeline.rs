//! Document processing stages.
//!
//! A claimed task flows through build (fetch + chunk + stamp), embedding,
//! optionally RAPTOR, and the index commit. Stages run strictly sequentially,
//! report progress through [`ProgressHandle`] after every step, and convert
//! their own external-call failures into progress updates instead of letting
//! errors escape to the consumer loop. Cancellation is observed at every
//! progress write and before the indexing commit.

mod build;
mod chunk;
mod commit;
mod embed;
mod progress;
mod raptor;

pub use build::build_chunks;
pub use chunk::Chunk;
pub use commit::commit_chunks;
pub use embed::embed_chunks;
pub use progress::{Cancelled, ProgressHandle};
pub use raptor::{RaptorOutcome, run_raptor};

use thiserror::Error;

/// Terminal outcome of a stage that did not complete.
///
/// By the time a stage returns one of these, the task's progress has already
/// been forced to `-1` (with a `[Canceled]` suffix for cancellations); the
/// consumer loop only has to acknowledge the queue message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StageError {
    /// Cancellation was requested from outside the worker.
    #[error("task cancelled")]
    Cancelled,
    /// The stage hit an unrecoverable error and recorded it.
    #[error("task failed")]
    Failed,
}

impl From<Cancelled> for StageError {
    fn from(_: Cancelled) -> Self {
        StageError::Cancelled
    }
}
