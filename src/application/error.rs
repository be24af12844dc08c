use thiserror::Error;

use crate::infrastructure::{CheckpointError, ParsingError};

/// Errors that stop a crawl run
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Persisting batch of {batch} listings failed: {message}")]
    Persist { batch: usize, message: String },

    #[error("Checkpoint write failed: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Parser setup failed: {0}")]
    Parser(#[from] ParsingError),
}
