//! Shared error taxonomy for the control plane.
//!
//! Individual crates may keep their own local error enums for
//! crate-specific detail, but anything that crosses a pipeline-stage
//! boundary converts into this taxonomy so the orchestrator and the
//! gateway can classify failures uniformly.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("input error: {0}")]
    Input(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution failure: {0}")]
    Execution(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("needs confirmation: {0}")]
    ManualNeeded(String),

    #[error("repair failure: {0}")]
    Repair(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn input(msg: impl Into<String>) -> Self {
        Self::Input(msg.into())
    }
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
    pub fn manual_needed(msg: impl Into<String>) -> Self {
        Self::ManualNeeded(msg.into())
    }
    pub fn repair(msg: impl Into<String>) -> Self {
        Self::Repair(msg.into())
    }
}
