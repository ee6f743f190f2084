use serde::Serialize;
use thiserror::Error;

/// Failures surfaced by the halftone renderer and its host loop.
///
/// Initialization failures (`Unsupported`, `ShaderBuild`) are terminal for a
/// session. Media failures leave the session idle and ready for new media.
#[derive(Debug, Error)]
pub enum HalftoneError {
    #[error("GPU shader support unavailable: {0}")]
    Unsupported(String),

    #[error("shader {stage} failed: {diagnostic}")]
    ShaderBuild {
        stage: &'static str,
        diagnostic: String,
    },

    #[error("failed to load media: {0}")]
    MediaLoad(String),

    #[error("source {width}x{height} exceeds the GPU texture limit of {limit}px; downscale and retry")]
    ResourceExhausted { width: u32, height: u32, limit: u32 },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("cannot {action} while session is {state}")]
    InvalidState {
        action: &'static str,
        state: &'static str,
    },

    #[error("render failed: {0}")]
    Render(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HalftoneError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "E_UNSUPPORTED",
            Self::ShaderBuild { .. } => "E_SHADER_BUILD",
            Self::MediaLoad(_) => "E_MEDIA_LOAD",
            Self::ResourceExhausted { .. } => "E_RESOURCE_EXHAUSTED",
            Self::InvalidParameter { .. } => "E_INVALID_PARAMETER",
            Self::InvalidState { .. } => "E_INVALID_STATE",
            Self::Render(_) => "E_RENDER",
            Self::Io(_) => "E_IO",
        }
    }

    /// Whether the session can keep accepting media after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Unsupported(_) | Self::ShaderBuild { .. })
    }

    pub fn invalid_parameter(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            ok: false,
            error: ErrorEnvelopeBody {
                code: self.code().to_owned(),
                message: self.to_string(),
                recoverable: self.is_recoverable(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub ok: bool,
    pub error: ErrorEnvelopeBody,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelopeBody {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

/// Walk an `anyhow` chain looking for a typed halftone failure.
pub fn find_halftone_error(error: &anyhow::Error) -> Option<&HalftoneError> {
    error
        .chain()
        .find_map(|cause| cause.downcast_ref::<HalftoneError>())
}
