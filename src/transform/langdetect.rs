//! Remote language detection for the redaction pass.
//!
//! Detection is advisory: any transport or shape problem degrades to `"en"`
//! with a warning instead of failing the email.

use std::time::Duration;

use log::warn;
use reqwest::Client;
use serde::Deserialize;

const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const DETECT_CONFIDENCE_THRESHOLD: f64 = 0.5;
const FALLBACK_LANG: &str = "en";

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    #[serde(default)]
    language: String,
    confidence: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct LangDetectClient {
    http: Client,
    base_url: String,
}

impl LangDetectClient {
    pub fn new(base_url: &str) -> Result<Self, reqwest::Error> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Detect the language of `text` as a two-letter lower-case code.
    ///
    /// Returns `"en"` for blank input, low-confidence predictions,
    /// non-alphabetic results, and any request failure.
    pub async fn detect(&self, text: &str) -> String {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return FALLBACK_LANG.to_string();
        }

        match self.request(trimmed).await {
            Ok(lang) => lang,
            Err(err) => {
                warn!("language detection failed, defaulting to en: {err}");
                FALLBACK_LANG.to_string()
            }
        }
    }

    async fn request(&self, text: &str) -> Result<String, reqwest::Error> {
        let response = self
            .http
            .post(format!("{}/detect", self.base_url))
            .timeout(DETECT_TIMEOUT)
            .json(&serde_json::json!({ "text": text, "k": 1 }))
            .send()
            .await?
            .error_for_status()?
            .json::<DetectResponse>()
            .await?;

        Ok(top_language(&response))
    }
}

fn top_language(response: &DetectResponse) -> String {
    let Some(first) = response.predictions.first() else {
        return FALLBACK_LANG.to_string();
    };
    if let Some(confidence) = first.confidence {
        if confidence < DETECT_CONFIDENCE_THRESHOLD {
            return FALLBACK_LANG.to_string();
        }
    }
    let lang = first.language.trim();
    if lang.len() >= 2 {
        let base: String = lang
            .split('_')
            .next()
            .unwrap_or_default()
            .chars()
            .take(2)
            .collect::<String>()
            .to_lowercase();
        if base.len() == 2 && base.chars().all(|c| c.is_alphabetic()) {
            return base;
        }
    }
    FALLBACK_LANG.to_string()
}
