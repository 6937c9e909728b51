use std::fmt;

/// Failure categories reported to the UI alongside `AnalysisError` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    CaptureFailure,
    InvalidImage,
    BackendError,
    NotReady,
    ModelLoadFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::CaptureFailure => "capture failure",
            ErrorKind::InvalidImage => "invalid image",
            ErrorKind::BackendError => "backend error",
            ErrorKind::NotReady => "model not ready",
            ErrorKind::ModelLoadFailure => "model load failure",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("screen capture failed: {0}")]
    CaptureFailure(String),

    #[error("image has degenerate dimensions {width}x{height}")]
    InvalidImage { width: u32, height: u32 },

    #[error("{0}")]
    Backend(String),

    #[error("local model is not ready ({state}); wait for it to load and try again")]
    NotReady { state: String },

    #[error("local model failed to load: {0}")]
    ModelLoadFailure(String),
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::CaptureFailure(_) => ErrorKind::CaptureFailure,
            PipelineError::InvalidImage { .. } => ErrorKind::InvalidImage,
            PipelineError::Backend(_) => ErrorKind::BackendError,
            PipelineError::NotReady { .. } => ErrorKind::NotReady,
            PipelineError::ModelLoadFailure(_) => ErrorKind::ModelLoadFailure,
        }
    }

    /// Wraps an `anyhow` chain, keeping every context layer in the message.
    pub fn capture(err: anyhow::Error) -> Self {
        PipelineError::CaptureFailure(format!("{err:#}"))
    }

    pub fn backend(err: anyhow::Error) -> Self {
        PipelineError::Backend(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::{ErrorKind, PipelineError};
    use anyhow::{Context, anyhow};

    #[test]
    fn backend_errors_keep_context_chain() {
        let err = Err::<(), _>(anyhow!("connection refused"))
            .context("failed to call inference server")
            .expect_err("error");
        let wrapped = PipelineError::backend(err);
        assert_eq!(wrapped.kind(), ErrorKind::BackendError);
        assert_eq!(
            wrapped.to_string(),
            "failed to call inference server: connection refused"
        );
    }

    #[test]
    fn invalid_image_reports_dimensions() {
        let err = PipelineError::InvalidImage {
            width: 0,
            height: 12,
        };
        assert_eq!(err.kind(), ErrorKind::InvalidImage);
        assert!(err.to_string().contains("0x12"));
    }
}
