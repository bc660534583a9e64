//! Environment-driven configuration for the pipeline and its remote services.

use std::env;
use std::path::PathBuf;

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

/// Base URLs of the four remote model services plus file locations.
///
/// A missing URL is not an immediate error: each client reports it when the
/// transform path actually needs the service, so read-only commands (such as
/// the capability probe against a partial deployment) still work.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Text-embeddings service (`/embed`, `/tokenize`, `/info`).
    pub embedding_url: Option<String>,
    /// OpenAI-compatible LLM endpoint, usually ending in `/v1`.
    pub vllm_url: Option<String>,
    /// Named-entity recognition service (`/ner`).
    pub spacy_api_url: Option<String>,
    /// Language detection service (`/detect`, `/health`).
    pub fasttext_langdetect_url: Option<String>,
    /// Directory holding the classification prompt templates.
    pub prompts_dir: PathBuf,
    /// Location of the discovered capabilities JSON.
    pub capabilities_path: PathBuf,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self {
            embedding_url: env_opt("EMBEDDING_URL").map(normalize_url),
            vllm_url: env_opt("VLLM_URL").map(normalize_url),
            spacy_api_url: env_opt("SPACY_API_URL").map(normalize_url),
            fasttext_langdetect_url: env_opt("FASTTEXT_LANGDETECT_URL").map(normalize_url),
            prompts_dir: PathBuf::from(env_string("PROMPTS_DIR", "prompts")),
            capabilities_path: PathBuf::from(env_string("CAPABILITIES_PATH", "capabilities.json")),
        }
    }
}

fn normalize_url(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    /// Read `DATABASE_URL` from the environment.
    ///
    /// Returns `None` when unset so callers can fail with their own message.
    pub fn from_env() -> Option<Self> {
        let url = env_opt("DATABASE_URL")?;
        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(5);
        Some(Self {
            url,
            max_connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(
            normalize_url("http://localhost:8080/".to_string()),
            "http://localhost:8080"
        );
        assert_eq!(
            normalize_url(" http://localhost:8080 ".to_string()),
            "http://localhost:8080"
        );
    }
}
