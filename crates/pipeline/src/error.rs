use thiserror::Error;

/// Failure reported by a GPU primitive.
///
/// Any of these means the context that produced it can no longer be trusted;
/// the renderer treats it as a context loss and never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{call} failed: {detail}")]
pub struct GpuError {
    pub call: &'static str,
    pub detail: String,
}

impl GpuError {
    pub fn new(call: &'static str, detail: impl Into<String>) -> Self {
        Self {
            call,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Filter id outside the known table; the caller and core disagree on versions.
    #[error("unknown filter id {0}")]
    InvalidFilterId(u32),
    #[error("video encoder failed to start: {0}")]
    EncoderInitFailed(String),
    #[error("no camera available")]
    NoCameraAvailable,
    #[error("GPU context lost: {0}")]
    ContextLossUnrecoverable(#[from] GpuError),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
    #[error("camera error: {0}")]
    Camera(String),
    #[error("{0} context is no longer running")]
    Disconnected(&'static str),
    #[error("failed to spawn {name} thread: {reason}")]
    ThreadSpawn { name: &'static str, reason: String },
}

impl PipelineError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        PipelineError::InvariantViolation(message.into())
    }

    /// True for conditions that signal a design bug rather than an environmental fault.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::InvariantViolation(_) | PipelineError::InvalidFilterId(_)
        )
    }
}
