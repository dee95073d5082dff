#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisError {
    #[error("Gemini request failed after {attempts} attempt(s): {message}")]
    Network { attempts: u32, message: String },

    #[error("Gemini rate limit still exceeded after {attempts} attempt(s)")]
    RateLimitExceeded { attempts: u32 },

    #[error("Gemini request failed with status {status}: {message}")]
    Provider { status: u16, message: String },

    #[error("Gemini returned an empty response")]
    EmptyResponse,

    #[error("Gemini returned malformed analysis JSON: {snippet}")]
    MalformedResult { snippet: String },

    #[error("Image could not be decoded: {0}")]
    InvalidImage(String),
}

impl AnalysisError {
    /// Errors the facade turns into a displayable value instead of returning.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AnalysisError::EmptyResponse
                | AnalysisError::MalformedResult { .. }
                | AnalysisError::InvalidImage(_)
        )
    }
}
