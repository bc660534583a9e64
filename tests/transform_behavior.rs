//! End-to-end behavior of the pure transform stages: preprocessing, tier
//! parsing, redaction and chunking, exercised through the public API.

use mailvault::models::PrivacyTier;
use mailvault::transform::chunking::{chunk_body, weighted_mean_embedding, CHUNK_TARGET_TOKENS};
use mailvault::transform::classify::parse_tier;
use mailvault::transform::embedder::{EmbedError, TokenCount};
use mailvault::transform::preprocess::preprocess_body;
use mailvault::transform::redact::{
    redact_pii, redact_secret_patterns, SNIPPET_REDACTED_PLACEHOLDER,
};

struct WordCounter;

impl TokenCount for WordCounter {
    async fn token_count(&self, text: &str) -> Result<usize, EmbedError> {
        Ok(text.split_whitespace().count())
    }
}

fn paragraph(tag: &str, words: usize) -> String {
    (0..words)
        .map(|i| format!("{tag}{i}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[test]
fn quoted_reply_is_absent_from_cleaned_body() {
    let body = "Sounds good, see you then.\n\nOn Mon, Jan 1, 2024 at 9:00, Alice wrote:\n> previous discussion\n> more quoted text";
    let cleaned = preprocess_body(body);
    assert_eq!(cleaned, "Sounds good, see you then.");
    assert!(!cleaned.contains("previous discussion"));
}

#[test]
fn think_wrapped_responses_parse() {
    assert_eq!(
        parse_tier("<think>hmm</think> PUBLIC").unwrap(),
        PrivacyTier::Public
    );
    assert_eq!(
        parse_tier("PERSONAL <think>… not enough info").unwrap(),
        PrivacyTier::Personal
    );
}

#[test]
fn password_reset_body_is_redacted() {
    let body = "Your account: user@example.com\nreset_token=AbC123def456GHI789jkl012MNO345";
    let out = redact_secret_patterns(&redact_pii(body));
    assert!(out.contains("[EMAIL]"));
    assert!(out.contains("[REDACTED]"));
    assert!(!out.contains("AbC123"));
}

#[test]
fn snippet_placeholder_is_the_fixed_string() {
    assert_eq!(SNIPPET_REDACTED_PLACEHOLDER, "Content redacted");
}

#[tokio::test]
async fn long_body_chunks_have_contiguous_positions_and_lead_weight() {
    // 22 paragraphs x 1000 words ≈ a 22k-token body against an 8192 cap.
    let body = (0..22)
        .map(|i| paragraph(&format!("p{i}w"), 1000))
        .collect::<Vec<_>>()
        .join("\n\n");

    let chunks = chunk_body(&body, &WordCounter, 8192, CHUNK_TARGET_TOKENS)
        .await
        .unwrap();

    assert!(chunks.len() >= 3, "expected >=3 chunks, got {}", chunks.len());
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.position, index);
    }
    assert_eq!(chunks[0].weight, 2.0);
    assert!(chunks[1..].iter().all(|chunk| chunk.weight == 1.0));
    for chunk in &chunks {
        let tokens = WordCounter.token_count(&chunk.text).await.unwrap();
        assert!(tokens <= CHUNK_TARGET_TOKENS, "chunk of {tokens} tokens");
    }
}

#[tokio::test]
async fn body_within_budget_is_not_chunked() {
    let body = paragraph("w", 500);
    let chunks = chunk_body(&body, &WordCounter, 8192, CHUNK_TARGET_TOKENS)
        .await
        .unwrap();
    assert!(chunks.is_empty());
}

#[test]
fn pooled_embedding_matches_weighted_mean_within_tolerance() {
    let dim = 768;
    let chunk_vectors: Vec<Vec<f32>> = (0..4)
        .map(|chunk| {
            (0..dim)
                .map(|component| ((chunk * dim + component) % 17) as f32 / 17.0)
                .collect()
        })
        .collect();
    let weights = vec![2.0, 1.0, 1.0, 1.0];

    let pooled = weighted_mean_embedding(&chunk_vectors, &weights);
    assert_eq!(pooled.len(), dim);

    let total: f64 = weights.iter().sum();
    let mut distance_sq = 0.0f64;
    for component in 0..dim {
        let expected: f64 = chunk_vectors
            .iter()
            .zip(weights.iter())
            .map(|(vector, weight)| f64::from(vector[component]) * weight)
            .sum::<f64>()
            / total;
        let diff = f64::from(pooled[component]) - expected;
        distance_sq += diff * diff;
    }
    assert!(distance_sq.sqrt() < 1e-5, "distance {}", distance_sq.sqrt());
}
