//! Typed access to the capabilities JSON written by the probe.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_EMBED_MAX_TOKENS: usize = 8192;
// ~4 chars/token * 8192
pub const DEFAULT_EMBED_MAX_CHARS: usize = 32_768;
pub const DEFAULT_CLASSIFY_MAX_CHARS: usize = 6_000;

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("capabilities file is missing at {0}; run `mailvault capabilities` first")]
    Missing(PathBuf),
    #[error("could not read capabilities file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse capabilities file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("capabilities are incomplete (missing: {0}); run `mailvault capabilities` again")]
    Incomplete(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingCapability {
    pub max_tokens: Option<usize>,
    pub max_chars: Option<usize>,
    pub source: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmCapability {
    pub max_model_len: Option<usize>,
    pub source: Option<String>,
    pub model_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceAvailability {
    pub url: Option<String>,
    #[serde(default)]
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "422_detail", skip_serializing_if = "Option::is_none")]
    pub unprocessable_detail: Option<String>,
}

/// The full capability snapshot, in the same shape the probe writes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub embedding: EmbeddingCapability,
    #[serde(default)]
    pub vllm: LlmCapability,
    #[serde(default)]
    pub spacy_api: ServiceAvailability,
    #[serde(default)]
    pub fasttext_langdetect: ServiceAvailability,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classify_body_max_chars: Option<usize>,
}

/// The concrete budget values the transform path runs with.
///
/// Produced only by [`Capabilities::require_for_transform`], so a value of
/// this type implies every required service was discovered.
#[derive(Debug, Clone)]
pub struct TransformCaps {
    pub embed_max_tokens: usize,
    pub embed_max_chars: usize,
    pub llm_max_model_len: usize,
    pub llm_model_id: String,
}

impl Capabilities {
    /// Load the snapshot from disk.
    pub fn load(path: &Path) -> Result<Self, CapabilityError> {
        if !path.exists() {
            return Err(CapabilityError::Missing(path.to_path_buf()));
        }
        let raw = std::fs::read_to_string(path).map_err(|source| CapabilityError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| CapabilityError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Write the snapshot as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<(), CapabilityError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| CapabilityError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json).map_err(|source| CapabilityError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate that every field the transform path depends on is present.
    ///
    /// The error lists each missing field by its JSON path so the operator
    /// knows which probe failed.
    pub fn require_for_transform(&self) -> Result<TransformCaps, CapabilityError> {
        let mut missing = Vec::new();
        if self.embedding.max_tokens.is_none() {
            missing.push("embedding.max_tokens");
        }
        match self.vllm.model_id.as_deref() {
            Some(id) if !id.trim().is_empty() => {}
            _ => missing.push("vllm.model_id"),
        }
        if self.vllm.max_model_len.is_none() {
            missing.push("vllm.max_model_len");
        }
        if !self.spacy_api.available {
            missing.push("spacy_api.available");
        }
        if !self.fasttext_langdetect.available {
            missing.push("fasttext_langdetect.available");
        }
        if !missing.is_empty() {
            return Err(CapabilityError::Incomplete(missing.join(", ")));
        }

        Ok(TransformCaps {
            embed_max_tokens: self.embedding.max_tokens.unwrap_or(DEFAULT_EMBED_MAX_TOKENS),
            embed_max_chars: self.embedding.max_chars.unwrap_or(DEFAULT_EMBED_MAX_CHARS),
            llm_max_model_len: self.vllm.max_model_len.unwrap_or(0),
            llm_model_id: self.vllm.model_id.clone().unwrap_or_default(),
        })
    }

    /// Embed token budget with the non-transform default.
    pub fn embed_max_tokens(&self) -> usize {
        self.embedding.max_tokens.unwrap_or(DEFAULT_EMBED_MAX_TOKENS)
    }

    /// Embed character budget with the non-transform default.
    pub fn embed_max_chars(&self) -> usize {
        self.embedding.max_chars.unwrap_or(DEFAULT_EMBED_MAX_CHARS)
    }

    /// Character budget for classification previews.
    ///
    /// Prefers the probed value, otherwise derives it from the LLM context
    /// window, otherwise falls back to the conservative default.
    pub fn classify_max_chars(&self) -> usize {
        if let Some(value) = self.classify_body_max_chars {
            return value;
        }
        match self.vllm.max_model_len {
            Some(len) => DEFAULT_CLASSIFY_MAX_CHARS.min(len * 4 / 2),
            None => DEFAULT_CLASSIFY_MAX_CHARS,
        }
    }
}

/// Derive the classification character budget from an LLM context window.
pub fn classify_body_max_chars(max_model_len: usize) -> usize {
    8_000.min(max_model_len * 4 / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Capabilities {
        Capabilities {
            embedding: EmbeddingCapability {
                max_tokens: Some(8192),
                max_chars: Some(32_768),
                source: Some("TEI /info".to_string()),
                model_id: Some("nomic-embed-text".to_string()),
            },
            vllm: LlmCapability {
                max_model_len: Some(16_384),
                source: Some("v1/models".to_string()),
                model_id: Some("qwen3-8b".to_string()),
            },
            spacy_api: ServiceAvailability {
                url: Some("http://localhost:9010".to_string()),
                available: true,
                ..Default::default()
            },
            fasttext_langdetect: ServiceAvailability {
                url: Some("http://localhost:9020".to_string()),
                available: true,
                ..Default::default()
            },
            classify_body_max_chars: Some(8_000),
        }
    }

    #[test]
    fn complete_snapshot_passes() {
        let caps = complete().require_for_transform().expect("complete");
        assert_eq!(caps.embed_max_tokens, 8192);
        assert_eq!(caps.llm_max_model_len, 16_384);
        assert_eq!(caps.llm_model_id, "qwen3-8b");
    }

    #[test]
    fn incomplete_snapshot_lists_every_missing_field() {
        let caps = Capabilities::default();
        let err = caps.require_for_transform().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("embedding.max_tokens"));
        assert!(message.contains("vllm.model_id"));
        assert!(message.contains("vllm.max_model_len"));
        assert!(message.contains("spacy_api.available"));
        assert!(message.contains("fasttext_langdetect.available"));
    }

    #[test]
    fn blank_model_id_counts_as_missing() {
        let mut caps = complete();
        caps.vllm.model_id = Some("  ".to_string());
        let err = caps.require_for_transform().unwrap_err();
        assert!(err.to_string().contains("vllm.model_id"));
    }

    #[test]
    fn classify_budget_derivation() {
        assert_eq!(classify_body_max_chars(16_384), 8_000);
        assert_eq!(classify_body_max_chars(2_048), 4_096);

        let mut caps = complete();
        caps.classify_body_max_chars = None;
        caps.vllm.max_model_len = Some(2_048);
        assert_eq!(caps.classify_max_chars(), 4_096);
        caps.vllm.max_model_len = None;
        assert_eq!(caps.classify_max_chars(), DEFAULT_CLASSIFY_MAX_CHARS);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let caps = complete();
        let json = serde_json::to_string(&caps).expect("serialize");
        let parsed: Capabilities = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.embedding.max_tokens, Some(8192));
        assert!(parsed.spacy_api.available);
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("capabilities.json");
        let err = Capabilities::load(&path).unwrap_err();
        assert!(matches!(err, CapabilityError::Missing(_)));
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("capabilities.json");
        complete().write(&path).expect("write");
        let loaded = Capabilities::load(&path).expect("load");
        assert!(loaded.require_for_transform().is_ok());
    }
}
