//! Privacy classification through an OpenAI-compatible chat endpoint.
//!
//! The prompt is fitted to the model's context window using the server's own
//! tokenizer, and the answer is parsed defensively: reasoning models may wrap
//! their output in `<think>` blocks, echo the label mid-sentence, or
//! abbreviate it.

use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use regex::{Regex, RegexBuilder};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::models::PrivacyTier;
use crate::transform::prompts::{PromptError, PromptSet, TemplateVars};

const CHAT_TIMEOUT: Duration = Duration::from_secs(120);
const TOKENIZE_TIMEOUT: Duration = Duration::from_secs(30);
/// Context reserved for the model's answer.
const ANSWER_RESERVE_TOKENS: usize = 150;
/// Head/tail previews never shrink below this many characters.
const PREVIEW_FLOOR_CHARS: usize = 100;
const ANSWER_MAX_TOKENS: u32 = 64;
const SAMPLING_SEED: u64 = 42;
const METRICS_LOG_EVERY: u64 = 100;

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Prompt(#[from] PromptError),
    #[error("LLM endpoint URL is not set (VLLM_URL); privacy classification requires a running server")]
    MissingUrl,
    #[error("LLM HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM returned status {status}: {body}")]
    Service { status: StatusCode, body: String },
    #[error("LLM /tokenize returned unexpected response shape")]
    TokenizeShape,
    #[error("LLM returned unexpected response shape for classification")]
    ResponseShape,
    #[error("classification prompt exceeds token limit after truncation")]
    OverBudget,
    #[error("classification response was empty after stripping think blocks")]
    EmptyResponse,
    #[error("could not parse tier from classification response (expected SENSITIVE, PERSONAL, or PUBLIC); preview: {preview:?}")]
    UnparsableTier { preview: String },
}

/// Per-process classification counters, guarded by a mutex in [`Classifier`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationMetrics {
    pub total_calls: u64,
    pub sensitive_count: u64,
    pub personal_count: u64,
    pub public_count: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

/// Everything the classifier needs to know about one email.
#[derive(Debug, Clone)]
pub struct EmailFacts {
    pub sender: String,
    pub subject: String,
    pub body: String,
    pub has_attachments: bool,
    pub labels: Vec<String>,
}

// ---------------------------------------------------------------------------
// LLM HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatTemplateKwargs {
    enable_thinking: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    seed: u64,
    chat_template_kwargs: ChatTemplateKwargs,
}

/// Thin client over the OpenAI-compatible endpoint plus the server-root
/// `/tokenize` route used for prompt measurement.
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: Client,
    /// Chat base, usually ending in `/v1`.
    base_url: String,
}

impl LlmClient {
    pub fn new(base_url: &str) -> Result<Self, ClassifyError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// The server root: the tokenize route lives outside the `/v1` prefix.
    fn root_url(&self) -> &str {
        self.base_url
            .strip_suffix("/v1")
            .unwrap_or(&self.base_url)
            .trim_end_matches('/')
    }

    pub async fn token_count(&self, text: &str) -> Result<usize, ClassifyError> {
        if text.is_empty() {
            return Ok(0);
        }
        let response = self
            .http
            .post(format!("{}/tokenize", self.root_url()))
            .timeout(TOKENIZE_TIMEOUT)
            .json(&serde_json::json!({ "prompt": text }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Service { status, body });
        }
        let data: Value = response.json().await?;
        parse_token_ids(&data)
            .map(|ids| ids.len())
            .ok_or(ClassifyError::TokenizeShape)
    }

    /// Send one deterministic chat completion and return the raw content.
    async fn chat(&self, request: &ChatRequest<'_>) -> Result<String, ClassifyError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(CHAT_TIMEOUT)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status == StatusCode::BAD_REQUEST {
                warn!(
                    "LLM 400 Bad Request (classification). Response body: {}",
                    body.chars().take(500).collect::<String>()
                );
            }
            return Err(ClassifyError::Service { status, body });
        }

        let data: Value = response.json().await?;
        let content = data
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(Value::as_str)
            .ok_or(ClassifyError::ResponseShape)?;
        Ok(content.trim().to_string())
    }
}

fn parse_token_ids(data: &Value) -> Option<Vec<i64>> {
    if let Some(items) = data.as_array() {
        return collect_ints(items);
    }
    if let Some(object) = data.as_object() {
        for key in ["token_ids", "tokens", "ids"] {
            let Some(ids) = object.get(key).and_then(Value::as_array) else {
                continue;
            };
            if let Some(flat) = collect_ints(ids) {
                return Some(flat);
            }
            if let Some(first) = ids.first().and_then(Value::as_array) {
                return collect_ints(first);
            }
        }
    }
    None
}

fn collect_ints(items: &[Value]) -> Option<Vec<i64>> {
    items
        .iter()
        .map(Value::as_i64)
        .collect::<Option<Vec<i64>>>()
}

// ---------------------------------------------------------------------------
// Tier parsing
// ---------------------------------------------------------------------------

const TIER_ORDER: [(&str, PrivacyTier); 3] = [
    ("SENSITIVE", PrivacyTier::Sensitive),
    ("PERSONAL", PrivacyTier::Personal),
    ("PUBLIC", PrivacyTier::Public),
];

/// Abbreviations some models produce in place of the full label.
const TIER_VARIATIONS: [(&str, PrivacyTier); 5] = [
    ("SENS", PrivacyTier::Sensitive),
    ("PRIV", PrivacyTier::Personal),
    ("PERS", PrivacyTier::Personal),
    ("PUBL", PrivacyTier::Public),
    ("PUB", PrivacyTier::Public),
];

static THINK_REGEX: OnceLock<Regex> = OnceLock::new();
static TIER_WORD_REGEXES: OnceLock<Vec<Regex>> = OnceLock::new();

fn think_regex() -> &'static Regex {
    THINK_REGEX.get_or_init(|| {
        RegexBuilder::new(
            r"<think>.*?</think>|<think>.*$|<(?:think|thinking)\b[^>]*>.*?</(?:think|thinking)\s*>|<(?:think|thinking)\b[^>]*>.*$",
        )
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .expect("invalid think-block regex")
    })
}

fn tier_word_regexes() -> &'static [Regex] {
    TIER_WORD_REGEXES.get_or_init(|| {
        TIER_ORDER
            .iter()
            .map(|(name, _)| Regex::new(&format!(r"\b{name}\b")).expect("invalid tier regex"))
            .collect()
    })
}

/// Remove `<think>` / `<thinking>` blocks, including a trailing unterminated
/// one, so only the final answer is parsed.
fn strip_think_blocks(text: &str) -> String {
    let mut out = text.to_string();
    loop {
        let next = think_regex().replace_all(&out, "").trim().to_string();
        if next == out {
            return out;
        }
        out = next;
    }
}

fn extract_tier_from_text(text: &str) -> Option<PrivacyTier> {
    if text.trim().is_empty() {
        return None;
    }
    let upper = text.trim().to_uppercase();
    for (regex, (_, tier)) in tier_word_regexes().iter().zip(TIER_ORDER.iter()) {
        if regex.is_match(&upper) {
            return Some(*tier);
        }
    }
    for (name, tier) in TIER_ORDER {
        if upper.contains(name) {
            return Some(tier);
        }
    }
    None
}

fn response_preview(raw: &str) -> String {
    if raw.chars().count() > 100 {
        let head: String = raw.chars().take(100).collect();
        format!("{head}…")
    } else {
        raw.to_string()
    }
}

/// Parse the three-way tier label out of an arbitrary model response.
///
/// Checks run from strictest to loosest: exact match, first whitespace
/// token, known abbreviations, word-boundary match in priority order
/// SENSITIVE > PERSONAL > PUBLIC, plain substring in the same order.
pub fn parse_tier(raw: &str) -> Result<PrivacyTier, ClassifyError> {
    let cleaned = strip_think_blocks(raw).trim().to_uppercase();
    if cleaned.is_empty() {
        if let Some(tier) = extract_tier_from_text(raw) {
            return Ok(tier);
        }
        return Err(ClassifyError::EmptyResponse);
    }

    for (name, tier) in TIER_ORDER {
        if cleaned == name {
            return Ok(tier);
        }
    }
    if let Some(token) = cleaned.split_whitespace().next() {
        for (name, tier) in TIER_ORDER {
            if token == name {
                return Ok(tier);
            }
        }
    }
    for (variant, tier) in TIER_VARIATIONS {
        if cleaned.contains(variant) {
            return Ok(tier);
        }
    }
    for (regex, (_, tier)) in tier_word_regexes().iter().zip(TIER_ORDER.iter()) {
        if regex.is_match(&cleaned) {
            return Ok(*tier);
        }
    }
    for (name, tier) in TIER_ORDER {
        if cleaned.contains(name) {
            return Ok(tier);
        }
    }

    Err(ClassifyError::UnparsableTier {
        preview: response_preview(raw),
    })
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

pub struct Classifier {
    llm: LlmClient,
    prompts: PromptSet,
    model_id: String,
    max_model_len: usize,
    metrics: Mutex<ClassificationMetrics>,
}

impl Classifier {
    pub fn new(
        llm: LlmClient,
        prompts: PromptSet,
        model_id: String,
        max_model_len: usize,
    ) -> Self {
        Self {
            llm,
            prompts,
            model_id,
            max_model_len,
            metrics: Mutex::new(ClassificationMetrics::default()),
        }
    }

    pub fn metrics(&self) -> ClassificationMetrics {
        *self.metrics.lock().expect("metrics mutex poisoned")
    }

    /// Classify one email, tracking latency and outcome counters.
    pub async fn classify(&self, facts: &EmailFacts) -> Result<PrivacyTier, ClassifyError> {
        let started = Instant::now();
        let result = self.classify_inner(facts).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut metrics = self.metrics.lock().expect("metrics mutex poisoned");
        metrics.total_calls += 1;
        let n = metrics.total_calls as f64;
        metrics.avg_latency_ms = (metrics.avg_latency_ms * (n - 1.0) + elapsed_ms) / n;
        match &result {
            Ok(PrivacyTier::Sensitive) => metrics.sensitive_count += 1,
            Ok(PrivacyTier::Personal) => metrics.personal_count += 1,
            Ok(PrivacyTier::Public) => metrics.public_count += 1,
            Err(err) => {
                metrics.errors += 1;
                error!("classification error: {err}");
            }
        }
        if metrics.total_calls % METRICS_LOG_EVERY == 0 {
            info!(
                "classification metrics: {} calls, {:.1} ms avg, {} errors",
                metrics.total_calls, metrics.avg_latency_ms, metrics.errors
            );
        }

        result
    }

    async fn classify_inner(&self, facts: &EmailFacts) -> Result<PrivacyTier, ClassifyError> {
        let max_prompt_tokens = self.max_model_len.saturating_sub(ANSWER_RESERVE_TOKENS);
        let sender = normalize_sender(&facts.sender);
        let sender = if sender.is_empty() {
            "(unknown)".to_string()
        } else {
            sender
        };
        let subject = facts.subject.trim();
        let body = facts.body.trim();

        let body_preview = if body.is_empty() {
            String::new()
        } else {
            self.fit_body_to_budget(body, &sender, subject, facts, max_prompt_tokens)
                .await?
        };

        self.classify_with_llm(&sender, subject, &body_preview, facts, max_prompt_tokens)
            .await
    }

    fn template_vars<'a>(
        &self,
        sender: &'a str,
        subject: &'a str,
        body_preview: &'a str,
        facts: &'a EmailFacts,
    ) -> TemplateVars<'a> {
        TemplateVars {
            sender,
            subject,
            body_preview,
            has_attachments: facts.has_attachments,
            labels: &facts.labels,
        }
    }

    /// Shrink the body into a head+tail preview until the rendered prompt
    /// fits the budget. Terminates at the 100/100 character floor.
    async fn fit_body_to_budget(
        &self,
        body: &str,
        sender: &str,
        subject: &str,
        facts: &EmailFacts,
        max_prompt_tokens: usize,
    ) -> Result<String, ClassifyError> {
        let full_prompt =
            self.prompts
                .render_combined(&self.template_vars(sender, subject, body, facts));
        if self.llm.token_count(&full_prompt).await? <= max_prompt_tokens {
            return Ok(body.to_string());
        }

        let chars: Vec<char> = body.chars().collect();
        let n = chars.len();
        let mut start_len = n / 2 + n / 4;
        let mut end_len = n / 4;
        if start_len + end_len > n {
            start_len = n / 2;
            end_len = n - start_len;
        }

        loop {
            let preview = if start_len + end_len >= n {
                body.to_string()
            } else {
                head_tail_preview(&chars, start_len, end_len)
            };
            let prompt =
                self.prompts
                    .render_combined(&self.template_vars(sender, subject, &preview, facts));
            if self.llm.token_count(&prompt).await? <= max_prompt_tokens {
                return Ok(preview);
            }
            start_len = start_len.saturating_sub(500).max(PREVIEW_FLOOR_CHARS);
            end_len = end_len.saturating_sub(200).max(PREVIEW_FLOOR_CHARS);
            if start_len <= PREVIEW_FLOOR_CHARS && end_len <= PREVIEW_FLOOR_CHARS {
                return Ok(head_tail_preview(
                    &chars,
                    PREVIEW_FLOOR_CHARS,
                    PREVIEW_FLOOR_CHARS,
                ));
            }
        }
    }

    async fn classify_with_llm(
        &self,
        sender: &str,
        subject: &str,
        body_preview: &str,
        facts: &EmailFacts,
        max_prompt_tokens: usize,
    ) -> Result<PrivacyTier, ClassifyError> {
        let vars = self.template_vars(sender, subject, body_preview, facts);
        let system_content = self.prompts.render_system(&vars);
        let user_content = self.prompts.render_user(&vars);

        let combined = self.prompts.render_combined(&vars);
        if self.llm.token_count(&combined).await? > max_prompt_tokens {
            return Err(ClassifyError::OverBudget);
        }

        debug!("classifying with model_id={}", self.model_id);
        let request = ChatRequest {
            model: &self.model_id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &system_content,
                },
                ChatMessage {
                    role: "user",
                    content: &user_content,
                },
            ],
            max_tokens: ANSWER_MAX_TOKENS,
            temperature: 0.0,
            top_p: 1.0,
            seed: SAMPLING_SEED,
            chat_template_kwargs: ChatTemplateKwargs {
                enable_thinking: false,
            },
        };

        let raw = self.llm.chat(&request).await?;
        debug!("classification response (len={}): {}", raw.len(), raw);
        parse_tier(&raw)
    }
}

/// Keep only senders that look like an address; lowercase them. Real-world
/// rows carry "unknown" or display names without an address.
fn normalize_sender(sender: &str) -> String {
    let trimmed = sender.trim();
    if trimmed.is_empty() || !trimmed.contains('@') {
        return String::new();
    }
    trimmed.to_lowercase()
}

fn head_tail_preview(chars: &[char], start_len: usize, end_len: usize) -> String {
    let start_len = start_len.min(chars.len());
    let end_len = end_len.min(chars.len());
    let head: String = chars[..start_len].iter().collect();
    let tail: String = chars[chars.len() - end_len..].iter().collect();
    format!("{head}\n...\n{tail}")
}
