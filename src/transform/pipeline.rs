//! The transform pipeline: selection, concurrent preparation, one fused
//! embedding batch per transform batch, validation, and transactional
//! persistence.
//!
//! Failure containment follows three levels: a prepare or validation failure
//! drops one email, an embedding or persistence failure drops one batch, and
//! a configuration failure stops the run before any work starts.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};
use pgvector::Vector;
use sqlx::PgPool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::capabilities::TransformCaps;
use crate::config::ServiceConfig;
use crate::models::{ChunkRecord, DerivedRecord, EmailRow, PrivacyTier, EMBEDDING_DIM};
use crate::transform::chunking::{
    chunk_body, weighted_mean_embedding, Chunk, CHUNK_TARGET_TOKENS,
};
use crate::transform::classify::{Classifier, EmailFacts, LlmClient};
use crate::transform::embedder::{truncate_chars, EmbedderClient, TokenCount};
use crate::transform::error::{format_error, TransformError};
use crate::transform::langdetect::LangDetectClient;
use crate::transform::preprocess::preprocess_body;
use crate::transform::progress::{ProgressFn, TierCounts, TransformProgress};
use crate::transform::prompts::PromptSet;
use crate::transform::redact::{NerClient, Redactor};
use crate::transform::store;

/// Conservative sub-batch size for small inference backends.
pub const EMBED_BATCH_SIZE: usize = 1;
/// Each prepare performs three to four remote calls; the LLM dominates.
pub const PREPARE_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct TransformOptions {
    pub account_id: Option<i32>,
    pub email_id: Option<i64>,
    pub force: bool,
    pub batch_size: usize,
    pub limit: Option<i64>,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            account_id: None,
            email_id: None,
            force: false,
            batch_size: 50,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyType {
    None,
    Full,
    Chunked,
}

/// Everything computed for one email before embedding.
struct PreparePayload {
    email_id: i64,
    privacy_tier: PrivacyTier,
    body_redacted: Option<String>,
    snippet_redacted: Option<String>,
    subject: String,
    /// Text embedded under the `subject` role; empty when the subject is
    /// blank or the email is SENSITIVE.
    subject_text: String,
    body_type: BodyType,
    /// Text embedded under the `body` role when `body_type` is `Full`.
    body_text: Option<String>,
    /// The cleaned body, used to decide whether body content was expected.
    text_to_embed: Option<String>,
    chunks: Vec<Chunk>,
}

#[derive(Debug, Clone, Copy)]
enum EmbedRole {
    Subject,
    Body,
    Chunk { position: usize, weight: f64 },
}

struct EmbedItem {
    payload_index: usize,
    role: EmbedRole,
    text: String,
}

#[derive(Default)]
struct AssembledVectors {
    subject: Option<Vec<f32>>,
    body: Option<Vec<f32>>,
    chunks: Vec<(usize, f64, Vec<f32>)>,
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    ok: usize,
    failed: usize,
    by_tier: TierCounts,
    body_full: usize,
    body_chunked: usize,
}

pub struct TransformPipeline {
    pool: PgPool,
    caps: TransformCaps,
    classifier: Arc<Classifier>,
    redactor: Arc<Redactor>,
    langdetect: Arc<LangDetectClient>,
    embedder: Arc<EmbedderClient>,
}

impl TransformPipeline {
    /// Wire up every client the pipeline needs.
    ///
    /// Fails fast on any missing service URL or prompt file so a
    /// misconfigured run never reaches the database.
    pub fn new(
        pool: PgPool,
        caps: TransformCaps,
        config: &ServiceConfig,
    ) -> Result<Self, TransformError> {
        let embedding_url = config.embedding_url.as_deref().ok_or_else(|| {
            TransformError::Config(
                "EMBEDDING_URL is not set; the transform path requires the embedding service"
                    .to_string(),
            )
        })?;
        let vllm_url = config.vllm_url.as_deref().ok_or_else(|| {
            TransformError::Config(
                "VLLM_URL is not set; privacy classification requires a running LLM server"
                    .to_string(),
            )
        })?;
        let spacy_url = config.spacy_api_url.as_deref().ok_or_else(|| {
            TransformError::Config(
                "SPACY_API_URL is not set; PII redaction requires the NER service".to_string(),
            )
        })?;
        let fasttext_url = config.fasttext_langdetect_url.as_deref().ok_or_else(|| {
            TransformError::Config(
                "FASTTEXT_LANGDETECT_URL is not set; language detection requires the fastText service"
                    .to_string(),
            )
        })?;

        let prompts = PromptSet::load(&config.prompts_dir)?;
        let classifier = Classifier::new(
            LlmClient::new(vllm_url)?,
            prompts,
            caps.llm_model_id.clone(),
            caps.llm_max_model_len,
        );
        let redactor = Redactor::new(NerClient::new(spacy_url)?);
        let langdetect = LangDetectClient::new(fasttext_url)
            .map_err(|err| TransformError::Config(format!("language detector client: {err}")))?;
        let embedder = EmbedderClient::new(embedding_url)?;

        Ok(Self {
            pool,
            caps,
            classifier: Arc::new(classifier),
            redactor: Arc::new(redactor),
            langdetect: Arc::new(langdetect),
            embedder: Arc::new(embedder),
        })
    }

    /// Run the pipeline over the selected emails and return how many were
    /// transformed successfully.
    pub async fn run(
        &self,
        opts: &TransformOptions,
        progress: Option<&ProgressFn>,
    ) -> Result<usize, TransformError> {
        info!(
            "using capabilities: embed max_tokens={} max_chars={}, llm model_id={} max_model_len={}",
            self.caps.embed_max_tokens,
            self.caps.embed_max_chars,
            self.caps.llm_model_id,
            self.caps.llm_max_model_len,
        );

        let ids = store::select_email_ids(&self.pool, opts).await?;
        let total = ids.len();
        if total == 0 {
            info!(
                "no emails to transform (account_id={:?}, email_id={:?}, force={})",
                opts.account_id, opts.email_id, opts.force
            );
            return Ok(0);
        }

        info!(
            "transform pipeline: {} emails to process (account_id={:?}, email_id={:?}, force={}, batch_size={})",
            total, opts.account_id, opts.email_id, opts.force, opts.batch_size
        );

        let batch_size = opts.batch_size.max(1);
        let total_batches = total.div_ceil(batch_size);
        let mut summary = BatchOutcome::default();

        emit(
            progress,
            &snapshot(&summary, total, 0, total_batches),
        );

        for (index, batch_ids) in ids.chunks(batch_size).enumerate() {
            let batch_num = index + 1;
            info!(
                "batch {}/{}: {} emails ({}-{} of {})",
                batch_num,
                total_batches,
                batch_ids.len(),
                index * batch_size + 1,
                index * batch_size + batch_ids.len(),
                total
            );

            let outcome = self.transform_batch(batch_ids).await?;
            summary.ok += outcome.ok;
            summary.failed += outcome.failed;
            summary.by_tier.merge(outcome.by_tier);
            summary.body_full += outcome.body_full;
            summary.body_chunked += outcome.body_chunked;

            emit(
                progress,
                &snapshot(&summary, total, batch_num, total_batches),
            );
        }

        info!(
            "transform summary: {} updated, {} failed | by tier: SENSITIVE={} PERSONAL={} PUBLIC={} | body: full={} chunked={}",
            summary.ok,
            summary.failed,
            summary.by_tier.sensitive,
            summary.by_tier.personal,
            summary.by_tier.public,
            summary.body_full,
            summary.body_chunked,
        );

        Ok(summary.ok)
    }

    async fn transform_batch(&self, batch_ids: &[i64]) -> Result<BatchOutcome, TransformError> {
        let emails = store::load_batch(&self.pool, batch_ids).await?;
        let emails: Vec<EmailRow> = emails
            .into_iter()
            .filter(|email| email.body_text.as_deref().is_some_and(|body| !body.is_empty()))
            .collect();
        if emails.is_empty() {
            return Ok(BatchOutcome::default());
        }

        let mut account_ids: Vec<i32> = emails.iter().map(|email| email.account_id).collect();
        account_ids.sort_unstable();
        account_ids.dedup();
        let label_maps = store::load_label_maps(&self.pool, &account_ids).await?;

        let payloads = self.prepare_all(&emails, &label_maps).await;
        if payloads.is_empty() {
            warn!("batch had no successful prepares; email ids in batch: {batch_ids:?}");
            return Ok(BatchOutcome {
                failed: emails.len(),
                ..Default::default()
            });
        }

        let payload_ids: Vec<i64> = payloads.iter().map(|payload| payload.email_id).collect();
        let min_id = payload_ids.iter().min().copied().unwrap_or_default();
        let max_id = payload_ids.iter().max().copied().unwrap_or_default();
        info!(
            "embedding batch for email ids {min_id}-{max_id} ({} emails)",
            payloads.len()
        );

        let items = build_embed_items(&payloads, self.caps.embed_max_chars);
        let (n_subjects, n_bodies, n_chunks) = count_roles(&items);
        info!(
            "embedding batch: {} subjects, {} bodies, {} chunks (total {} texts)",
            n_subjects,
            n_bodies,
            n_chunks,
            items.len()
        );

        let texts: Vec<String> = items.iter().map(|item| item.text.clone()).collect();
        let context = format!("email ids {min_id}-{max_id}");
        let vectors = match self
            .embedder
            .encode_batch(
                &texts,
                EMBED_BATCH_SIZE,
                Some(self.caps.embed_max_chars),
                Some(self.caps.embed_max_tokens),
                &context,
            )
            .await
        {
            Ok(vectors) => vectors,
            Err(err) => {
                error!("embedding batch failed for email ids {payload_ids:?}: {err}");
                for email_id in &payload_ids {
                    warn!("transform failed for email id={email_id} (embed): {err}");
                }
                return Ok(BatchOutcome {
                    failed: emails.len(),
                    ..Default::default()
                });
            }
        };

        if vectors.len() != items.len() {
            error!(
                "embedding batch length mismatch: {} vectors for {} items (email ids {payload_ids:?})",
                vectors.len(),
                items.len()
            );
            return Err(TransformError::Validation(format!(
                "embed batch length mismatch: got {} vectors for {} items",
                vectors.len(),
                items.len()
            )));
        }

        let assembled = assemble_vectors(&items, vectors, payloads.len());

        let mut outcome = BatchOutcome::default();
        let mut records: Vec<(DerivedRecord, PrivacyTier, BodyType)> = Vec::new();
        for (payload, vectors) in payloads.iter().zip(assembled.into_iter()) {
            match build_record(payload, vectors) {
                Ok(record) => records.push((record, payload.privacy_tier, payload.body_type)),
                Err(reason) => {
                    warn!(
                        "transform failed for email id={} (validation): {reason}",
                        payload.email_id
                    );
                }
            }
        }

        // All surviving emails of the batch commit or roll back together.
        if let Err(err) = self.write_batch(&records).await {
            error!("batch write failed for email ids {payload_ids:?}: {err}");
            return Ok(BatchOutcome {
                failed: emails.len(),
                ..Default::default()
            });
        }

        for (_, tier, body_type) in &records {
            outcome.ok += 1;
            outcome.by_tier.add(*tier);
            match body_type {
                BodyType::Full => outcome.body_full += 1,
                BodyType::Chunked => outcome.body_chunked += 1,
                BodyType::None => {}
            }
        }
        outcome.failed = emails.len() - outcome.ok;
        if outcome.failed > 0 {
            info!(
                "batch complete: {} succeeded, {} failed (email ids in batch: {batch_ids:?})",
                outcome.ok, outcome.failed
            );
        }

        Ok(outcome)
    }

    /// Prepare every email of the batch concurrently, bounded by the
    /// prepare semaphore. Results come back in input order; failures are
    /// logged and dropped.
    async fn prepare_all(
        &self,
        emails: &[EmailRow],
        label_maps: &HashMap<i32, HashMap<String, String>>,
    ) -> Vec<PreparePayload> {
        let semaphore = Arc::new(Semaphore::new(PREPARE_CONCURRENCY));
        let mut join_set = JoinSet::new();

        for (index, email) in emails.iter().enumerate() {
            let label_names = resolve_label_names(email, label_maps);
            let email = email.clone();
            let semaphore = semaphore.clone();
            let classifier = self.classifier.clone();
            let redactor = self.redactor.clone();
            let langdetect = self.langdetect.clone();
            let embedder = self.embedder.clone();
            let embed_max_tokens = self.caps.embed_max_tokens;

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("prepare semaphore closed");
                let result = prepare_email(
                    email,
                    label_names,
                    classifier,
                    redactor,
                    langdetect,
                    embedder,
                    embed_max_tokens,
                )
                .await;
                (index, result)
            });
        }

        let mut prepared: Vec<Option<PreparePayload>> =
            (0..emails.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(payload))) => prepared[index] = Some(payload),
                Ok((index, Err(err))) => {
                    warn!(
                        "transform failed for email id={} (prepare): {}",
                        emails[index].id,
                        format_error(&err)
                    );
                }
                Err(join_err) => {
                    error!("prepare task panicked: {join_err}");
                }
            }
        }

        prepared.into_iter().flatten().collect()
    }

    async fn write_batch(
        &self,
        records: &[(DerivedRecord, PrivacyTier, BodyType)],
    ) -> Result<(), sqlx::Error> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (record, _, _) in records {
            store::write_derived(&mut tx, record).await?;
        }
        tx.commit().await
    }
}

/// Per-email preparation: preprocess, classify, detect language, redact,
/// build the snippet, and plan the body embedding.
async fn prepare_email(
    email: EmailRow,
    label_names: Vec<String>,
    classifier: Arc<Classifier>,
    redactor: Arc<Redactor>,
    langdetect: Arc<LangDetectClient>,
    embedder: Arc<EmbedderClient>,
    embed_max_tokens: usize,
) -> Result<PreparePayload, TransformError> {
    let raw_body = email.body_text.clone().unwrap_or_default();
    let subject = email.subject.clone().unwrap_or_default();
    let sender = match email.from_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("{name} <{}>", email.from_email),
        _ => email.from_email.clone(),
    };
    debug!(
        "prepare email id={} subject={:?}",
        email.id,
        truncate_chars(&subject, 60)
    );

    let body_cleaned = preprocess_body(&raw_body);

    let tier = classifier
        .classify(&EmailFacts {
            sender,
            subject: subject.clone(),
            body: raw_body,
            has_attachments: email.has_attachments,
            labels: label_names,
        })
        .await?;
    debug!("email id={} classified as {}", email.id, tier.name());

    let lang = langdetect.detect(&body_cleaned).await;
    let body_redacted = redactor.redact_for_display(&body_cleaned, &lang).await?;
    let snippet_redacted = redactor
        .snippet_for_display(tier, email.snippet.as_deref(), &lang)
        .await?;
    debug!("email id={} redacted ({}, lang={lang})", email.id, tier.name());

    let text_to_embed = {
        let trimmed = body_cleaned.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    };
    let subject_text = {
        let trimmed = subject.trim();
        if trimmed.is_empty() || tier == PrivacyTier::Sensitive {
            String::new()
        } else {
            trimmed.to_string()
        }
    };

    let mut body_type = BodyType::None;
    let mut body_text = None;
    let mut chunks = Vec::new();
    if let Some(text) = &text_to_embed {
        let token_count = embedder.token_count(text).await?;
        if token_count <= embed_max_tokens {
            body_type = BodyType::Full;
            body_text = Some(text.clone());
            debug!(
                "email id={} body fits ({token_count} tokens), will embed full body",
                email.id
            );
        } else {
            body_type = BodyType::Chunked;
            chunks = chunk_body(text, embedder.as_ref(), embed_max_tokens, CHUNK_TARGET_TOKENS)
                .await?;
            debug!(
                "email id={} body long ({token_count} tokens), {} chunks",
                email.id,
                chunks.len()
            );
        }
    }

    Ok(PreparePayload {
        email_id: email.id,
        privacy_tier: tier,
        body_redacted: Some(body_redacted),
        snippet_redacted: if snippet_redacted.is_empty() {
            None
        } else {
            Some(snippet_redacted)
        },
        subject,
        subject_text,
        body_type,
        body_text,
        text_to_embed,
        chunks,
    })
}

fn resolve_label_names(
    email: &EmailRow,
    label_maps: &HashMap<i32, HashMap<String, String>>,
) -> Vec<String> {
    let label_ids = email.labels.clone().unwrap_or_default();
    match label_maps.get(&email.account_id) {
        Some(names) => label_ids
            .into_iter()
            .map(|label_id| names.get(&label_id).cloned().unwrap_or(label_id))
            .collect(),
        None => label_ids,
    }
}

/// Flatten the prepared payloads into one ordered embed request, keeping a
/// side table from each entry back to its payload and role.
fn build_embed_items(payloads: &[PreparePayload], max_chars: usize) -> Vec<EmbedItem> {
    let mut items = Vec::new();
    for (payload_index, payload) in payloads.iter().enumerate() {
        if !payload.subject_text.is_empty() {
            items.push(EmbedItem {
                payload_index,
                role: EmbedRole::Subject,
                text: truncate_chars(&payload.subject_text, max_chars),
            });
        }
        if payload.body_type == BodyType::Full {
            if let Some(body_text) = &payload.body_text {
                items.push(EmbedItem {
                    payload_index,
                    role: EmbedRole::Body,
                    text: truncate_chars(body_text, max_chars),
                });
            }
        }
        if payload.body_type == BodyType::Chunked {
            for chunk in &payload.chunks {
                items.push(EmbedItem {
                    payload_index,
                    role: EmbedRole::Chunk {
                        position: chunk.position,
                        weight: chunk.weight,
                    },
                    text: truncate_chars(&chunk.text, max_chars),
                });
            }
        }
    }
    items
}

fn count_roles(items: &[EmbedItem]) -> (usize, usize, usize) {
    let mut subjects = 0;
    let mut bodies = 0;
    let mut chunks = 0;
    for item in items {
        match item.role {
            EmbedRole::Subject => subjects += 1,
            EmbedRole::Body => bodies += 1,
            EmbedRole::Chunk { .. } => chunks += 1,
        }
    }
    (subjects, bodies, chunks)
}

fn assemble_vectors(
    items: &[EmbedItem],
    vectors: Vec<Vec<f32>>,
    payload_count: usize,
) -> Vec<AssembledVectors> {
    let mut assembled: Vec<AssembledVectors> =
        (0..payload_count).map(|_| AssembledVectors::default()).collect();
    for (item, vector) in items.iter().zip(vectors.into_iter()) {
        let slot = &mut assembled[item.payload_index];
        match item.role {
            EmbedRole::Subject => slot.subject = Some(vector),
            EmbedRole::Body => slot.body = Some(vector),
            EmbedRole::Chunk { position, weight } => {
                slot.chunks.push((position, weight, vector));
            }
        }
    }
    for slot in &mut assembled {
        slot.chunks.sort_by_key(|(position, _, _)| *position);
    }
    assembled
}

fn validate_embedding(
    vector: Option<&Vec<f32>>,
    name: &str,
    expect_content: bool,
) -> Result<(), String> {
    let Some(vector) = vector.filter(|vector| !vector.is_empty()) else {
        if expect_content {
            return Err(format!("{name} is missing but content was expected"));
        }
        return Ok(());
    };
    if vector.len() != EMBEDDING_DIM {
        return Err(format!(
            "{name} has wrong dim {} (expected {EMBEDDING_DIM})",
            vector.len()
        ));
    }
    if expect_content && vector.iter().all(|value| *value == 0.0) {
        return Err(format!("{name} is all zeros; embedding likely failed"));
    }
    Ok(())
}

/// Validate one assembled payload and turn it into the derived row set.
fn build_record(
    payload: &PreparePayload,
    vectors: AssembledVectors,
) -> Result<DerivedRecord, String> {
    let expect_subject =
        !payload.subject.trim().is_empty() && payload.privacy_tier != PrivacyTier::Sensitive;
    if payload.privacy_tier == PrivacyTier::Sensitive && vectors.subject.is_some() {
        return Err("subject_embedding present for SENSITIVE email".to_string());
    }
    validate_embedding(vectors.subject.as_ref(), "subject_embedding", expect_subject)?;

    let expect_body = payload
        .text_to_embed
        .as_deref()
        .is_some_and(|text| !text.trim().is_empty());

    let chunk_count = vectors.chunks.len();
    if chunk_count != payload.chunks.len() {
        return Err(format!(
            "chunk embedding count {chunk_count} does not match chunk count {}",
            payload.chunks.len()
        ));
    }
    let pooled = if chunk_count > 0 {
        let chunk_vectors: Vec<Vec<f32>> = vectors
            .chunks
            .iter()
            .map(|(_, _, vector)| vector.clone())
            .collect();
        let weights: Vec<f64> = vectors.chunks.iter().map(|(_, weight, _)| *weight).collect();
        Some(weighted_mean_embedding(&chunk_vectors, &weights))
    } else {
        None
    };

    if vectors.body.is_some() {
        validate_embedding(vectors.body.as_ref(), "body_embedding", expect_body)?;
    }
    if pooled.is_some() {
        validate_embedding(pooled.as_ref(), "body_pooled_embedding", expect_body)?;
    }
    if expect_body && vectors.body.is_none() && pooled.is_none() {
        return Err("body content to embed but no body_embedding or body_pooled_embedding".to_string());
    }
    for (index, (_, _, vector)) in vectors.chunks.iter().enumerate() {
        validate_embedding(Some(vector), &format!("chunk[{index}].embedding"), true)?;
    }

    let chunks: Vec<ChunkRecord> = payload
        .chunks
        .iter()
        .zip(vectors.chunks.iter())
        .map(|(chunk, (position, weight, vector))| ChunkRecord {
            text: chunk.text.clone(),
            position: *position as i32,
            weight: *weight,
            embedding: Vector::from(vector.clone()),
        })
        .collect();

    Ok(DerivedRecord {
        email_id: payload.email_id,
        privacy_tier: payload.privacy_tier,
        body_redacted: payload.body_redacted.clone(),
        snippet_redacted: payload.snippet_redacted.clone(),
        subject_embedding: vectors.subject.map(Vector::from),
        body_embedding: vectors.body.map(Vector::from),
        body_pooled_embedding: pooled.map(Vector::from),
        transform_completed_at: Utc::now(),
        chunks,
    })
}

fn snapshot(
    summary: &BatchOutcome,
    total: usize,
    batch_num: usize,
    total_batches: usize,
) -> TransformProgress {
    TransformProgress {
        total,
        processed: summary.ok,
        failed: summary.failed,
        by_tier: summary.by_tier,
        body_full: summary.body_full,
        body_chunked: summary.body_chunked,
        batch_num,
        total_batches,
    }
}

fn emit(progress: Option<&ProgressFn>, event: &TransformProgress) {
    if let Some(callback) = progress {
        callback(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(tier: PrivacyTier) -> PreparePayload {
        PreparePayload {
            email_id: 1,
            privacy_tier: tier,
            body_redacted: Some("redacted".to_string()),
            snippet_redacted: None,
            subject: "Weekly Digest".to_string(),
            subject_text: if tier == PrivacyTier::Sensitive {
                String::new()
            } else {
                "Weekly Digest".to_string()
            },
            body_type: BodyType::Full,
            body_text: Some("body".to_string()),
            text_to_embed: Some("body".to_string()),
            chunks: Vec::new(),
        }
    }

    fn unit_vector() -> Vec<f32> {
        let mut vector = vec![0.0f32; EMBEDDING_DIM];
        vector[0] = 1.0;
        vector
    }

    #[test]
    fn full_body_payload_validates() {
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: Some(unit_vector()),
            chunks: Vec::new(),
        };
        let record = build_record(&payload(PrivacyTier::Public), vectors).expect("valid");
        assert!(record.subject_embedding.is_some());
        assert!(record.body_embedding.is_some());
        assert!(record.body_pooled_embedding.is_none());
        assert!(record.chunks.is_empty());
    }

    #[test]
    fn sensitive_subject_vector_is_rejected() {
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: Some(unit_vector()),
            chunks: Vec::new(),
        };
        let err = build_record(&payload(PrivacyTier::Sensitive), vectors).unwrap_err();
        assert!(err.contains("SENSITIVE"));
    }

    #[test]
    fn missing_subject_vector_fails_when_expected() {
        let vectors = AssembledVectors {
            subject: None,
            body: Some(unit_vector()),
            chunks: Vec::new(),
        };
        let err = build_record(&payload(PrivacyTier::Public), vectors).unwrap_err();
        assert!(err.contains("subject_embedding"));
    }

    #[test]
    fn wrong_dimension_is_rejected() {
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: Some(vec![1.0, 2.0]),
            chunks: Vec::new(),
        };
        let err = build_record(&payload(PrivacyTier::Public), vectors).unwrap_err();
        assert!(err.contains("wrong dim"));
    }

    #[test]
    fn all_zero_body_vector_is_rejected() {
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: Some(vec![0.0; EMBEDDING_DIM]),
            chunks: Vec::new(),
        };
        let err = build_record(&payload(PrivacyTier::Public), vectors).unwrap_err();
        assert!(err.contains("all zeros"));
    }

    #[test]
    fn missing_body_vectors_fail_when_body_expected() {
        let mut payload = payload(PrivacyTier::Public);
        payload.body_type = BodyType::None;
        payload.body_text = None;
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: None,
            chunks: Vec::new(),
        };
        let err = build_record(&payload, vectors).unwrap_err();
        assert!(err.contains("no body_embedding"));
    }

    #[test]
    fn chunked_payload_produces_pooled_vector_and_rows() {
        let mut prepared = payload(PrivacyTier::Personal);
        prepared.body_type = BodyType::Chunked;
        prepared.body_text = None;
        prepared.chunks = vec![
            Chunk {
                text: "first".to_string(),
                position: 0,
                weight: 2.0,
            },
            Chunk {
                text: "second".to_string(),
                position: 1,
                weight: 1.0,
            },
        ];

        let mut first = vec![0.0f32; EMBEDDING_DIM];
        first[0] = 3.0;
        let mut second = vec![0.0f32; EMBEDDING_DIM];
        second[0] = 6.0;

        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: None,
            // Delivered out of order; assembly sorts by position before this,
            // but build_record must still pair rows correctly when sorted.
            chunks: vec![(0, 2.0, first), (1, 1.0, second)],
        };

        let record = build_record(&prepared, vectors).expect("valid");
        assert!(record.body_embedding.is_none());
        let pooled = record.body_pooled_embedding.expect("pooled");
        // (3*2 + 6*1) / 3 = 4
        assert!((pooled.as_slice()[0] - 4.0).abs() < 1e-5);
        assert_eq!(record.chunks.len(), 2);
        assert_eq!(record.chunks[0].position, 0);
        assert_eq!(record.chunks[0].weight, 2.0);
        assert_eq!(record.chunks[1].position, 1);
    }

    #[test]
    fn chunk_count_mismatch_is_rejected() {
        let mut prepared = payload(PrivacyTier::Public);
        prepared.body_type = BodyType::Chunked;
        prepared.body_text = None;
        prepared.chunks = vec![Chunk {
            text: "only".to_string(),
            position: 0,
            weight: 2.0,
        }];
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: None,
            chunks: Vec::new(),
        };
        let err = build_record(&prepared, vectors).unwrap_err();
        assert!(err.contains("chunk embedding count"));
    }

    #[test]
    fn empty_body_payload_validates_without_vectors() {
        let mut prepared = payload(PrivacyTier::Public);
        prepared.body_type = BodyType::None;
        prepared.body_text = None;
        prepared.text_to_embed = None;
        let vectors = AssembledVectors {
            subject: Some(unit_vector()),
            body: None,
            chunks: Vec::new(),
        };
        let record = build_record(&prepared, vectors).expect("valid");
        assert!(record.body_embedding.is_none());
        assert!(record.body_pooled_embedding.is_none());
    }

    #[test]
    fn embed_items_respect_roles_and_order() {
        let mut chunked = payload(PrivacyTier::Personal);
        chunked.email_id = 2;
        chunked.body_type = BodyType::Chunked;
        chunked.body_text = None;
        chunked.chunks = vec![
            Chunk {
                text: "c0".to_string(),
                position: 0,
                weight: 2.0,
            },
            Chunk {
                text: "c1".to_string(),
                position: 1,
                weight: 1.0,
            },
        ];
        let mut sensitive = payload(PrivacyTier::Sensitive);
        sensitive.email_id = 3;

        let payloads = vec![payload(PrivacyTier::Public), chunked, sensitive];
        let items = build_embed_items(&payloads, 1_000);

        let (subjects, bodies, chunks) = count_roles(&items);
        // The SENSITIVE payload contributes no subject entry.
        assert_eq!(subjects, 2);
        assert_eq!(bodies, 2);
        assert_eq!(chunks, 2);
        assert_eq!(items.len(), 6);
        assert_eq!(items[0].payload_index, 0);
    }

    #[test]
    fn assembly_routes_vectors_back_to_payloads() {
        let items = vec![
            EmbedItem {
                payload_index: 0,
                role: EmbedRole::Subject,
                text: "s".to_string(),
            },
            EmbedItem {
                payload_index: 0,
                role: EmbedRole::Chunk {
                    position: 1,
                    weight: 1.0,
                },
                text: "c1".to_string(),
            },
            EmbedItem {
                payload_index: 0,
                role: EmbedRole::Chunk {
                    position: 0,
                    weight: 2.0,
                },
                text: "c0".to_string(),
            },
        ];
        let vectors = vec![vec![1.0f32], vec![2.0f32], vec![3.0f32]];
        let assembled = assemble_vectors(&items, vectors, 1);
        assert_eq!(assembled[0].subject.as_deref(), Some([1.0f32].as_slice()));
        // Chunks come back sorted by position.
        assert_eq!(assembled[0].chunks[0].0, 0);
        assert_eq!(assembled[0].chunks[0].2, vec![3.0f32]);
        assert_eq!(assembled[0].chunks[1].0, 1);
    }
}
