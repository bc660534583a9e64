//! Token-aware splitting of long bodies into weighted chunks.
//!
//! Token counts come from the embedding service's own tokenizer so chunk
//! lengths never exceed what the embedder accepts.

use std::sync::OnceLock;

use regex::Regex;

use crate::transform::embedder::{EmbedError, TokenCount};

pub const CHUNK_TARGET_TOKENS: usize = 7_500;

/// The first chunk carries the lead paragraph and extra signal.
const LEAD_CHUNK_WEIGHT: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub position: usize,
    pub weight: f64,
}

static PARAGRAPH_BREAK_REGEX: OnceLock<Regex> = OnceLock::new();
static SENTENCE_END_REGEX: OnceLock<Regex> = OnceLock::new();

fn paragraph_break_regex() -> &'static Regex {
    PARAGRAPH_BREAK_REGEX
        .get_or_init(|| Regex::new(r"\n\s*\n").expect("invalid paragraph break regex"))
}

fn sentence_end_regex() -> &'static Regex {
    SENTENCE_END_REGEX.get_or_init(|| Regex::new(r"[.!?]\s+").expect("invalid sentence regex"))
}

fn split_into_paragraphs(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    paragraph_break_regex()
        .split(&normalized)
        .map(str::trim)
        .filter(|block| !block.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split on sentence-ending punctuation followed by whitespace, keeping the
/// punctuation with the preceding sentence.
fn split_into_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for found in sentence_end_regex().find_iter(text) {
        // +1 keeps the terminator; the terminators are single-byte ASCII.
        let cut = found.start() + 1;
        let sentence = text[start..cut].trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = found.end();
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

fn chunk_weight(position: usize) -> f64 {
    if position == 0 {
        LEAD_CHUNK_WEIGHT
    } else {
        1.0
    }
}

/// Greedy-pack a long body into chunks of at most `target_chunk_tokens`.
///
/// Returns no chunks when the whole body already fits `max_tokens`.
/// Paragraphs that alone exceed the target are sentence-split and packed the
/// same way.
pub async fn chunk_body<T: TokenCount>(
    body: &str,
    counter: &T,
    max_tokens: usize,
    target_chunk_tokens: usize,
) -> Result<Vec<Chunk>, EmbedError> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    if counter.token_count(body).await? <= max_tokens {
        return Ok(Vec::new());
    }

    let mut paragraphs = split_into_paragraphs(body);
    if paragraphs.is_empty() {
        paragraphs = split_into_sentences(body);
        if paragraphs.is_empty() {
            paragraphs = vec![body.to_string()];
        }
    }

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;
    let mut position = 0usize;

    let flush = |current: &mut Vec<String>,
                 current_tokens: &mut usize,
                 position: &mut usize,
                 chunks: &mut Vec<Chunk>| {
        if current.is_empty() {
            return;
        }
        chunks.push(Chunk {
            text: current.join("\n\n"),
            position: *position,
            weight: chunk_weight(*position),
        });
        *position += 1;
        current.clear();
        *current_tokens = 0;
    };

    for paragraph in paragraphs {
        let paragraph_tokens = counter.token_count(&paragraph).await?;
        if paragraph_tokens > target_chunk_tokens {
            for sentence in split_into_sentences(&paragraph) {
                let sentence_tokens = counter.token_count(&sentence).await?;
                if current_tokens + sentence_tokens > target_chunk_tokens && !current.is_empty() {
                    flush(&mut current, &mut current_tokens, &mut position, &mut chunks);
                }
                current.push(sentence);
                current_tokens += sentence_tokens;
            }
            continue;
        }

        if current_tokens + paragraph_tokens > target_chunk_tokens && !current.is_empty() {
            flush(&mut current, &mut current_tokens, &mut position, &mut chunks);
        }
        current.push(paragraph);
        current_tokens += paragraph_tokens;
    }
    flush(&mut current, &mut current_tokens, &mut position, &mut chunks);

    Ok(chunks)
}

/// Weighted mean of chunk embeddings, normalised by the summed weight.
///
/// Mismatched or empty input yields an empty vector; an all-zero weight set
/// yields a zero vector.
pub fn weighted_mean_embedding(embeddings: &[Vec<f32>], weights: &[f64]) -> Vec<f32> {
    if embeddings.is_empty() || weights.is_empty() || embeddings.len() != weights.len() {
        return Vec::new();
    }
    let dim = embeddings[0].len();
    let total_weight: f64 = weights.iter().sum();
    if total_weight == 0.0 {
        return vec![0.0; dim];
    }
    let mut out = vec![0.0f64; dim];
    for (embedding, weight) in embeddings.iter().zip(weights.iter()) {
        for (slot, value) in out.iter_mut().zip(embedding.iter()) {
            *slot += f64::from(*value) * weight;
        }
    }
    out.into_iter()
        .map(|value| (value / total_weight) as f32)
        .collect()
}
