//! Error taxonomy for the recommendation pipeline.
//!
//! Most failures inside the pipeline degrade instead of propagating: a failed
//! index build means lexical-only retrieval, a failed generation means the
//! templated explanation. [`PipelineError`] names the failures that do reach a
//! boundary (admin operations, the HTTP adapter, the CLI).
//!
//! A retrieval miss and an incomplete section extraction are *outcomes*, not
//! errors; see [`crate::retriever::Retrieval`] and
//! [`crate::models::ExplanationSource`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Embedding or persistence failed while building the vector index.
    #[error("Index build failed: {0}")]
    IndexBuild(String),

    /// A credential was malformed or rejected by the provider's probe.
    #[error("Provider '{provider}' rejected: {reason}")]
    ProviderValidation { provider: String, reason: String },

    /// The provider raised, timed out or returned an unusable payload.
    #[error("Generation failed: {0}")]
    ProviderGeneration(String),

    /// The backend choice could not be written to disk.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Blank request against an empty knowledge base; nothing can be returned.
    #[error("Unprocessable request: {0}")]
    Unprocessable(String),
}

impl PipelineError {
    /// Machine-readable code used by the HTTP error contract.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::IndexBuild(_) => "index_build_failed",
            PipelineError::ProviderValidation { .. } => "provider_rejected",
            PipelineError::ProviderGeneration(_) => "generation_failed",
            PipelineError::Persistence(_) => "persistence_failed",
            PipelineError::Unprocessable(_) => "unprocessable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_names_provider() {
        let err = PipelineError::ProviderValidation {
            provider: "openai".into(),
            reason: "key must start with 'sk-'".into(),
        };
        assert_eq!(
            err.to_string(),
            "Provider 'openai' rejected: key must start with 'sk-'"
        );
        assert_eq!(err.code(), "provider_rejected");
    }
}
