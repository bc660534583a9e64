//! One-shot discovery of remote service limits.
//!
//! Each probe is best-effort: an unreachable service leaves its section
//! empty or unavailable, and the registry decides later whether that matters
//! for the requested operation.

use std::time::Duration;

use log::debug;
use reqwest::Client;
use serde_json::Value;

use crate::capabilities::registry::{
    classify_body_max_chars, Capabilities, EmbeddingCapability, LlmCapability, ServiceAvailability,
};
use crate::config::ServiceConfig;

const INFO_TIMEOUT: Duration = Duration::from_secs(10);
const EMBED_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const CHARS_PER_TOKEN: usize = 4;

/// Run every probe and assemble the capability snapshot.
pub async fn probe_all(config: &ServiceConfig) -> Capabilities {
    let http = Client::new();

    let embedding = probe_embedding(&http, config.embedding_url.as_deref()).await;
    let vllm = probe_vllm(&http, config.vllm_url.as_deref()).await;
    let spacy_api = probe_spacy(&http, config.spacy_api_url.as_deref()).await;
    let fasttext_langdetect = probe_fasttext(&http, config.fasttext_langdetect_url.as_deref()).await;

    let classify = vllm.max_model_len.map(classify_body_max_chars);

    Capabilities {
        embedding,
        vllm,
        spacy_api,
        fasttext_langdetect,
        classify_body_max_chars: classify,
    }
}

/// Ask the embedder for its limits via `/info`, falling back to an
/// incremental payload probe against `/embed`.
async fn probe_embedding(http: &Client, url: Option<&str>) -> EmbeddingCapability {
    let mut out = EmbeddingCapability::default();
    let Some(url) = url else {
        return out;
    };

    match fetch_json(http, &format!("{url}/info"), INFO_TIMEOUT).await {
        Ok(info) => {
            if let Some(max_tokens) = info.get("max_input_length").and_then(Value::as_u64) {
                out.max_tokens = Some(max_tokens as usize);
                out.max_chars = Some(max_tokens as usize * CHARS_PER_TOKEN);
                out.source = Some("TEI /info".to_string());
                out.model_id = info
                    .get("model_id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                return out;
            }
        }
        Err(err) => debug!("embedding /info failed: {err}"),
    }

    // No /info: grow a synthetic payload until the service rejects it.
    for n_chars in [500usize, 1_000, 2_000, 4_000, 8_000, 16_000] {
        let text = "x ".repeat(n_chars / 2);
        let result = http
            .post(format!("{url}/embed"))
            .timeout(EMBED_PROBE_TIMEOUT)
            .json(&serde_json::json!({ "inputs": [text] }))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                out.max_chars = Some(n_chars);
                out.source = Some("probe".to_string());
            }
            Ok(_) => break,
            Err(err) => {
                debug!("embedding probe failed: {err}");
                break;
            }
        }
    }
    if let Some(max_chars) = out.max_chars {
        out.max_tokens = Some(max_chars / CHARS_PER_TOKEN);
    }

    out
}

/// Read the LLM context window and model id from `/models`.
async fn probe_vllm(http: &Client, url: Option<&str>) -> LlmCapability {
    let mut out = LlmCapability::default();
    let Some(url) = url else {
        return out;
    };

    let data = match fetch_json(http, &format!("{url}/models"), INFO_TIMEOUT).await {
        Ok(data) => data,
        Err(err) => {
            debug!("vLLM /models failed: {err}");
            return out;
        }
    };

    let mut server_max: Option<usize> = None;
    if let Some(models) = data.get("data").and_then(Value::as_array) {
        for model in models.iter().filter_map(Value::as_object) {
            if out.model_id.is_none() {
                out.model_id = model
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string);
            }
            for key in ["max_model_len", "context_length"] {
                if let Some(value) = model.get(key).and_then(Value::as_u64) {
                    let value = value as usize;
                    server_max = Some(server_max.map_or(value, |cur| cur.max(value)));
                }
            }
        }
    }
    if let Some(value) = data.get("max_model_len").and_then(Value::as_u64) {
        let value = value as usize;
        server_max = Some(server_max.map_or(value, |cur| cur.max(value)));
    }

    if server_max.is_some() {
        out.max_model_len = server_max;
        out.source = Some("v1/models".to_string());
    }

    out
}

/// Check the NER service with a trivial request.
async fn probe_spacy(http: &Client, url: Option<&str>) -> ServiceAvailability {
    let mut out = ServiceAvailability {
        url: url.map(str::to_string),
        ..Default::default()
    };
    let Some(url) = url else {
        return out;
    };

    let result = http
        .post(format!("{url}/ner"))
        .timeout(INFO_TIMEOUT)
        .json(&serde_json::json!({ "text": "Hello world.", "lang": "en" }))
        .send()
        .await;

    match result {
        Ok(response) if response.status().is_success() => out.available = true,
        Ok(response) if response.status().as_u16() == 422 => {
            let detail = response
                .text()
                .await
                .unwrap_or_else(|_| "Unprocessable Entity".to_string());
            out.unprocessable_detail = Some(detail.chars().take(200).collect());
        }
        Ok(_) => {}
        Err(err) => out.error = Some(err.to_string()),
    }

    out
}

/// Check the language detector via `/health`.
async fn probe_fasttext(http: &Client, url: Option<&str>) -> ServiceAvailability {
    let mut out = ServiceAvailability {
        url: url.map(str::to_string),
        ..Default::default()
    };
    let Some(url) = url else {
        return out;
    };

    match fetch_json(http, &format!("{url}/health"), INFO_TIMEOUT).await {
        Ok(info) => {
            if info.get("model_loaded").and_then(Value::as_bool) == Some(true) {
                out.available = true;
            }
        }
        Err(err) => out.error = Some(err.to_string()),
    }

    out
}

async fn fetch_json(http: &Client, url: &str, timeout: Duration) -> Result<Value, reqwest::Error> {
    http.get(url)
        .timeout(timeout)
        .send()
        .await?
        .error_for_status()?
        .json::<Value>()
        .await
}
