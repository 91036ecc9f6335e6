//! Error taxonomy for the generation engine.
//!
//! Public operations return `anyhow::Result`; the variants below are the
//! typed failures callers can recover with `downcast_ref::<EngineError>()`.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("no sequences provided to batch preparation")]
    EmptyBatch,

    #[error("batch size {size} exceeds the decode ceiling of {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("execution plan buffers are not initialized")]
    PlanNotInitialized,

    #[error("out of cache blocks: requested {requested}, available {available}")]
    OutOfBlocks { requested: usize, available: usize },

    #[error("block table needs {blocks} columns but plan buffers hold {limit}")]
    ContextTooLong { blocks: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("contract violation: {0}")]
    Contract(String),
}

impl EngineError {
    /// Whether this error aborts a generation call as a configuration fault
    /// rather than an internal invariant break.
    pub fn is_fatal_config(&self) -> bool {
        !matches!(self, EngineError::Contract(_))
    }
}
