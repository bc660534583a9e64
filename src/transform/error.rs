//! Error taxonomy for the transform pipeline.
//!
//! Configuration problems are fatal before the run starts; preparation and
//! validation failures are localised to one email; embedding and persistence
//! failures are localised to one batch.

use thiserror::Error;

use crate::capabilities::CapabilityError;
use crate::transform::classify::ClassifyError;
use crate::transform::embedder::EmbedError;
use crate::transform::prompts::PromptError;
use crate::transform::redact::RedactError;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Capabilities(#[from] CapabilityError),
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
    #[error(transparent)]
    Redact(#[from] RedactError),
    #[error(transparent)]
    Embed(#[from] EmbedError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// One-line rendering used when a per-email failure is logged and dropped.
pub fn format_error(err: &TransformError) -> String {
    match err {
        TransformError::Classify(ClassifyError::Service { status, body }) => {
            format!(
                "ClassifyError: status={status} body={}",
                body.chars().take(200).collect::<String>()
            )
        }
        TransformError::Embed(EmbedError::Service { status, body }) => {
            format!(
                "EmbedError: status={status} body={}",
                body.chars().take(200).collect::<String>()
            )
        }
        other => other.to_string(),
    }
}
