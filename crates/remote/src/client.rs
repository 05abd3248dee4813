use async_trait::async_trait;
use chrono::NaiveDate;
use ledgerlabel_core::{
    clean_vendor, CategorySet, Label, Money, Reconciled, Transaction, FALLBACK_CATEGORY,
};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ClassificationError;

/// Confidence assumed when the service omits one.
pub const DEFAULT_CONFIDENCE: f32 = 0.8;
/// Penalty applied when the category only matched loosely.
const LOOSE_CATEGORY_FACTOR: f32 = 0.9;
/// Anything longer than this is narrative, not a label.
const MAX_RESPONSE_CHARS: usize = 200;

/// What the remote service is told about one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationRequest {
    pub description: String,
    pub amount: Money,
    pub date: NaiveDate,
}

impl ClassificationRequest {
    pub fn for_transaction(tx: &Transaction) -> Self {
        Self {
            description: tx.normalized.clone(),
            amount: tx.amount,
            date: tx.date,
        }
    }
}

/// One categorization call against an external model service.
#[async_trait]
pub trait RemoteClassifier: Send + Sync {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Label, ClassificationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of an OpenAI-compatible API; `/chat/completions` is appended.
    pub endpoint: String,
    pub model: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub max_tokens: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 30,
            max_tokens: 32,
        }
    }
}

pub struct OpenAiClassifier {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
    categories: CategorySet,
}

impl OpenAiClassifier {
    pub fn new(
        config: &ClientConfig,
        api_key: String,
        categories: CategorySet,
    ) -> Result<Self, ClassificationError> {
        if api_key.trim().is_empty() {
            return Err(ClassificationError::AuthFailure("API key is empty".to_string()));
        }
        if categories.is_empty() {
            return Err(ClassificationError::Misconfigured(
                "no categories configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ClassificationError::Misconfigured(e.to_string()))?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            max_tokens: config.max_tokens,
            categories,
        })
    }

    /// Reads the credential from the environment variable named in `config`.
    pub fn from_env(config: &ClientConfig, categories: CategorySet) -> Result<Self, ClassificationError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            ClassificationError::AuthFailure(format!("{} is not set", config.api_key_env))
        })?;
        Self::new(config, api_key, categories)
    }
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[async_trait]
impl RemoteClassifier for OpenAiClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Label, ClassificationError> {
        let body = serde_json::json!({
            "model": &self.model,
            "temperature": 0,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": "You are a personal finance assistant that labels bank transactions."},
                {"role": "user", "content": build_prompt(&self.categories, request)}
            ]
        });

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &text));
        }

        let api_response: ApiResponse = response.json().await.map_err(transport_error)?;
        let content = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ClassificationError::InvalidResponse("no choices returned".to_string()))?;

        tracing::debug!(description = %request.description, response = %content, "remote classification");
        parse_completion(&content, &self.categories)
    }
}

pub fn build_prompt(categories: &CategorySet, request: &ClassificationRequest) -> String {
    let mut prompt = format!(
        "Return ONE category from this list:\n{}\n\
         and a concise vendor name (at most 30 characters) and your confidence from 0 to 1, \
         separated by \" | \". Reply with nothing else.\n",
        categories.names().join(", ")
    );
    if categories.contains(FALLBACK_CATEGORY) {
        prompt.push_str(&format!("If unsure, pick \"{FALLBACK_CATEGORY}\".\n"));
    }
    prompt.push_str(&format!(
        "Description: \"{}\"\nAmount: {}\nDate: {}\n",
        request.description.replace('"', ""),
        request.amount,
        request.date
    ));
    prompt
}

/// Parses `Category | Vendor [| Confidence]` and validates the category
/// against the known set.
pub fn parse_completion(text: &str, categories: &CategorySet) -> Result<Label, ClassificationError> {
    let text = text.trim().trim_matches('"').trim();
    if text.is_empty() {
        return Err(ClassificationError::InvalidResponse("empty response".to_string()));
    }
    if text.chars().count() > MAX_RESPONSE_CHARS {
        return Err(ClassificationError::InvalidResponse(
            "response is not a bare label".to_string(),
        ));
    }

    let mut parts = text.splitn(3, '|').map(str::trim);
    let raw_category = parts.next().unwrap_or_default();
    let raw_vendor = parts.next().ok_or_else(|| {
        ClassificationError::InvalidResponse(format!("expected 'Category | Vendor', got {text:?}"))
    })?;

    let (category, how) = categories.reconcile(raw_category).ok_or_else(|| {
        ClassificationError::InvalidResponse(format!("unknown category {raw_category:?}"))
    })?;

    let vendor = Some(clean_vendor(raw_vendor)).filter(|v| !v.is_empty());

    let mut confidence = parts
        .next()
        .and_then(parse_confidence)
        .unwrap_or(DEFAULT_CONFIDENCE);
    if how == Reconciled::Loose {
        confidence *= LOOSE_CATEGORY_FACTOR;
    }

    Ok(Label {
        category: category.to_string(),
        vendor,
        confidence: Some(confidence),
    })
}

fn parse_confidence(s: &str) -> Option<f32> {
    let s = s.trim();
    let value = match s.strip_suffix('%') {
        Some(pct) => pct.trim().parse::<f32>().ok()? / 100.0,
        None => s.parse::<f32>().ok()?,
    };
    value.is_finite().then(|| value.clamp(0.0, 1.0))
}

pub fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> ClassificationError {
    let detail = format!("{status}: {}", body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClassificationError::AuthFailure(detail),
        StatusCode::TOO_MANY_REQUESTS => ClassificationError::RateLimited { retry_after },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClassificationError::Timeout,
        s if s.is_server_error() => ClassificationError::Unavailable(detail),
        _ => ClassificationError::Misconfigured(detail),
    }
}

fn transport_error(e: reqwest::Error) -> ClassificationError {
    if e.is_timeout() {
        ClassificationError::Timeout
    } else if e.is_decode() || e.is_body() {
        ClassificationError::InvalidResponse(e.to_string())
    } else {
        ClassificationError::Unavailable(e.to_string())
    }
}
