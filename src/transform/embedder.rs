//! Batched client for the text-embeddings service.
//!
//! The service is a constrained inference backend: requests are pre-clipped
//! to its discovered budgets, and an HTTP 413 triggers an adaptive retreat
//! (element-by-element, then one halving of a single oversized text).

use std::time::Duration;

use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::models::EMBEDDING_DIM;

const EMBED_TIMEOUT: Duration = Duration::from_secs(300);
const TOKENIZE_TIMEOUT: Duration = Duration::from_secs(30);
/// Texts shorter than `cap * CHARS_PER_TOKEN_GUARD` chars cannot exceed the
/// token cap, so their token count is never fetched.
const CHARS_PER_TOKEN_GUARD: usize = 3;
/// Below this length a 413 is not worth retrying with a shorter text.
const HALVING_MIN_CHARS: usize = 256;
const TRUNCATE_MAX_ITERATIONS: usize = 15;
const TRUNCATE_SHRINK_FACTOR: f64 = 0.9;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embedding endpoint URL is not set (EMBEDDING_URL); embedding and tokenize require a running server")]
    MissingUrl,
    #[error("embedding HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("embedding service returned status {status}: {body}")]
    Service { status: StatusCode, body: String },
    #[error("embedding tokenize returned unexpected response shape")]
    TokenizeShape,
    #[error("embedding response shape invalid: {0}")]
    ResponseShape(String),
    #[error("embedding count mismatch: expected {expected}, got {actual} ({context})")]
    CountMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },
    #[error("embedding vector dimension mismatch: expected {expected}, got {actual} ({context})")]
    DimensionMismatch {
        expected: usize,
        actual: usize,
        context: String,
    },
}

/// Anything that can count tokens the way the embedder does.
///
/// The chunker is generic over this so tests can substitute a local counter
/// for the remote tokenizer.
#[allow(async_fn_in_trait)]
pub trait TokenCount {
    async fn token_count(&self, text: &str) -> Result<usize, EmbedError>;
}

#[derive(Debug, Clone)]
pub struct EmbedderClient {
    http: Client,
    base_url: String,
}

impl EmbedderClient {
    pub fn new(base_url: &str) -> Result<Self, EmbedError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post_embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let response = self
            .http
            .post(format!("{}/embed", self.base_url))
            .timeout(EMBED_TIMEOUT)
            .json(&serde_json::json!({ "inputs": texts }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Service { status, body });
        }
        response
            .json::<Vec<Vec<f32>>>()
            .await
            .map_err(EmbedError::Http)
    }

    /// Tokenize one text through the service's own tokenizer.
    pub async fn tokenize(&self, text: &str) -> Result<Vec<i64>, EmbedError> {
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(format!("{}/tokenize", self.base_url))
            .timeout(TOKENIZE_TIMEOUT)
            .json(&serde_json::json!({ "inputs": [text] }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Service { status, body });
        }
        let data: Value = response.json().await?;
        parse_tokenize_response(&data).ok_or(EmbedError::TokenizeShape)
    }

    /// Embed a single text, enforcing the vector contract.
    async fn embed_one(&self, text: &str, context: &str) -> Result<Vec<f32>, EmbedError> {
        let inputs = [text.to_string()];
        let vectors = self.post_embed(&inputs).await?;
        if vectors.len() != 1 {
            return Err(EmbedError::CountMismatch {
                expected: 1,
                actual: vectors.len(),
                context: context.to_string(),
            });
        }
        let vector = vectors.into_iter().next().unwrap_or_default();
        check_dimension(&vector, context)?;
        Ok(vector)
    }

    /// Ratio-estimate truncation of `text` to at most `max_tokens` tokens.
    async fn truncate_to_max_tokens(
        &self,
        text: &str,
        max_tokens: usize,
    ) -> Result<String, EmbedError> {
        if text.is_empty() || max_tokens == 0 {
            return Ok(text.to_string());
        }
        let total = self.token_count(text).await?;
        if total <= max_tokens {
            return Ok(text.to_string());
        }
        let chars: Vec<char> = text.chars().collect();
        let mut max_len = chars.len() * max_tokens / total;
        for _ in 0..TRUNCATE_MAX_ITERATIONS {
            if max_len == 0 {
                return Ok(String::new());
            }
            let truncated: String = chars[..max_len.min(chars.len())].iter().collect();
            if self.token_count(&truncated).await? <= max_tokens {
                return Ok(truncated);
            }
            max_len = (max_len as f64 * TRUNCATE_SHRINK_FACTOR) as usize;
        }
        Ok(chars[..max_len.min(chars.len())].iter().collect())
    }

    /// Embed an ordered list of texts in fixed sub-batches.
    ///
    /// Inputs are clipped to `max_chars_per_input` characters; texts long
    /// enough to plausibly exceed `max_tokens_per_input` are token-counted
    /// and truncated. A 413 shrinks adaptively instead of failing.
    pub async fn encode_batch(
        &self,
        texts: &[String],
        batch_size: usize,
        max_chars_per_input: Option<usize>,
        max_tokens_per_input: Option<usize>,
        log_context: &str,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut texts: Vec<String> = match max_chars_per_input {
            Some(max_chars) if max_chars > 0 => texts
                .iter()
                .map(|text| truncate_chars(text, max_chars))
                .collect(),
            _ => texts.to_vec(),
        };

        if let Some(max_tokens) = max_tokens_per_input.filter(|cap| *cap > 0) {
            let cap = max_tokens.min(8192);
            let min_chars_to_check = cap * CHARS_PER_TOKEN_GUARD;
            let mut truncated_count = 0usize;
            let mut checked = Vec::with_capacity(texts.len());
            for text in texts {
                if text.chars().count() <= min_chars_to_check {
                    checked.push(text);
                } else if self.token_count(&text).await? > cap {
                    checked.push(self.truncate_to_max_tokens(&text, cap).await?);
                    truncated_count += 1;
                } else {
                    checked.push(text);
                }
            }
            texts = checked;
            if truncated_count > 0 {
                debug!("truncated {truncated_count} texts to <={cap} tokens for embed");
            }
        }

        let batch_size = batch_size.max(1);
        let total = texts.len();
        let num_batches = total.div_ceil(batch_size);
        let mut out: Vec<Vec<f32>> = Vec::with_capacity(total);

        for (batch_index, sub) in texts.chunks(batch_size).enumerate() {
            let context = format!(
                "{}{}sub-batch {}/{} ({} texts)",
                log_context,
                if log_context.is_empty() { "" } else { ", " },
                batch_index + 1,
                num_batches,
                sub.len()
            );
            debug!("embed {context}");

            match self.post_embed(sub).await {
                Ok(vectors) => {
                    if vectors.len() != sub.len() {
                        return Err(EmbedError::CountMismatch {
                            expected: sub.len(),
                            actual: vectors.len(),
                            context,
                        });
                    }
                    for vector in vectors {
                        check_dimension(&vector, &context)?;
                        out.push(vector);
                    }
                }
                Err(EmbedError::Service { status, .. })
                    if status == StatusCode::PAYLOAD_TOO_LARGE =>
                {
                    self.recover_from_payload_too_large(sub, &context, &mut out)
                        .await?;
                }
                Err(err) => return Err(err),
            }
        }

        if out.len() != total {
            return Err(EmbedError::CountMismatch {
                expected: total,
                actual: out.len(),
                context: log_context.to_string(),
            });
        }
        Ok(out)
    }

    /// 413 retreat: retry one text at a time; a single text that still 413s
    /// and is long enough is retried once at half length.
    async fn recover_from_payload_too_large(
        &self,
        sub: &[String],
        context: &str,
        out: &mut Vec<Vec<f32>>,
    ) -> Result<(), EmbedError> {
        if sub.len() > 1 {
            warn!(
                "413 Payload Too Large for {} texts in {}; retrying one at a time",
                sub.len(),
                context
            );
        }
        for text in sub {
            match self.embed_one(text, context).await {
                Ok(vector) => out.push(vector),
                Err(EmbedError::Service { status, .. })
                    if status == StatusCode::PAYLOAD_TOO_LARGE
                        && text.chars().count() > HALVING_MIN_CHARS =>
                {
                    let halved = truncate_chars(text, text.chars().count() / 2);
                    warn!(
                        "413 for single text (len={}); retrying truncated to {} chars ({})",
                        text.chars().count(),
                        halved.chars().count(),
                        context
                    );
                    out.push(self.embed_one(&halved, context).await?);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl TokenCount for EmbedderClient {
    async fn token_count(&self, text: &str) -> Result<usize, EmbedError> {
        Ok(self.tokenize(text).await?.len())
    }
}

fn check_dimension(vector: &[f32], context: &str) -> Result<(), EmbedError> {
    if vector.len() != EMBEDDING_DIM {
        return Err(EmbedError::DimensionMismatch {
            expected: EMBEDDING_DIM,
            actual: vector.len(),
            context: context.to_string(),
        });
    }
    Ok(())
}

/// Clip to at most `max_chars` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Tokenize responses come back either as `[[ids]]` or a bare `[ids]`.
fn parse_tokenize_response(data: &Value) -> Option<Vec<i64>> {
    let items = data.as_array()?;
    match items.first() {
        Some(Value::Array(first)) => first
            .iter()
            .map(Value::as_i64)
            .collect::<Option<Vec<i64>>>(),
        Some(_) => items.iter().map(Value::as_i64).collect::<Option<Vec<i64>>>(),
        None => Some(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }

    #[test]
    fn tokenize_shapes_parse() {
        let nested = serde_json::json!([[1, 2, 3]]);
        assert_eq!(parse_tokenize_response(&nested).unwrap(), vec![1, 2, 3]);

        let flat = serde_json::json!([4, 5]);
        assert_eq!(parse_tokenize_response(&flat).unwrap(), vec![4, 5]);

        let empty = serde_json::json!([]);
        assert_eq!(parse_tokenize_response(&empty).unwrap(), Vec::<i64>::new());

        let junk = serde_json::json!({ "nope": 1 });
        assert!(parse_tokenize_response(&junk).is_none());
    }

    #[test]
    fn dimension_check_enforces_contract() {
        assert!(check_dimension(&vec![0.0; EMBEDDING_DIM], "test").is_ok());
        let err = check_dimension(&vec![0.0; 3], "test").unwrap_err();
        assert!(matches!(
            err,
            EmbedError::DimensionMismatch {
                expected: EMBEDDING_DIM,
                actual: 3,
                ..
            }
        ));
    }
}
