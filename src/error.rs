use thiserror::Error;

/// Failures the pipeline reports by kind.
///
/// Per-camera failures (`ConnectFailed`, `StreamEnded`, `SourceReleased`) are
/// isolated to the camera that raised them. Shutdown-phase failures
/// (`WriteFailed`, `SendFailed`) are logged and never block process exit.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("camera {camera} could not be opened: {reason}")]
    ConnectFailed { camera: String, reason: String },

    #[error("camera {camera} stream ended: {reason}")]
    StreamEnded { camera: String, reason: String },

    #[error("camera {camera} has been released")]
    SourceReleased { camera: String },

    #[error("failed to write recognition results: {0}")]
    WriteFailed(String),

    #[error("failed to send report: {0}")]
    SendFailed(String),
}

impl PipelineError {
    /// Camera the failure belongs to, if any.
    pub fn camera(&self) -> Option<&str> {
        match self {
            PipelineError::ConnectFailed { camera, .. }
            | PipelineError::StreamEnded { camera, .. }
            | PipelineError::SourceReleased { camera } => Some(camera),
            PipelineError::WriteFailed(_) | PipelineError::SendFailed(_) => None,
        }
    }
}
