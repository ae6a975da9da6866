//! Classification client: batch prompt → remote call → parsed results.
//!
//! A batch call never fails from the caller's point of view. Call errors and
//! unparsable responses are retried with a fixed delay; once retries run out
//! every record in the batch comes back as an `error` result.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ClassifierConfig;
use crate::dataset::Record;
use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, ProviderError};
use crate::labels::{ClassificationResult, Confidence, Label};
use crate::prompts::{prompt_by_slug, PromptTemplate, DEFAULT_PROMPT};

/// Which model tier a call goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Fast,
    Pro,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Pro => "pro",
        }
    }

    fn caller(&self) -> &'static str {
        match self {
            Tier::Fast => "classify::fast",
            Tier::Pro => "classify::pro",
        }
    }
}

/// Error type for a single classification attempt.
#[derive(Debug, thiserror::Error)]
pub enum ClassificationError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Parse error: {0}")]
    Parse(String),
}

impl ClassificationError {
    /// Whether another attempt could plausibly succeed.
    fn is_retryable(&self) -> bool {
        match self {
            ClassificationError::Provider(ProviderError::Config(_))
            | ClassificationError::Provider(ProviderError::InvalidRequest { .. }) => false,
            _ => true,
        }
    }
}

// =============================================================================
// JSON parsing
// =============================================================================

/// Parse a model response into exactly `expected` results.
///
/// Accepts a JSON array, an object with a `results` array, or a single
/// object. When every element carries an integer `index` (or `row_index`)
/// the results are placed by that index, otherwise by position. Indices
/// numbered exactly `1..=expected` are read as 1-based. Elements
/// that are not valid become `error`. Missing positions are padded with
/// `error` and extra elements are dropped.
pub fn parse_batch_response(
    raw: &str,
    expected: usize,
) -> Result<Vec<ClassificationResult>, ClassificationError> {
    let json_str = extract_json(raw);
    let value: Value =
        serde_json::from_str(json_str).map_err(|e| ClassificationError::Parse(e.to_string()))?;

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("results") {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(ClassificationError::Parse(
                    "'results' is not an array".into(),
                ))
            }
            None => vec![Value::Object(obj)],
        },
        other => {
            return Err(ClassificationError::Parse(format!(
                "expected array or object, got {}",
                json_kind(&other)
            )))
        }
    };

    let mut results = vec![ClassificationResult::error(); expected];

    let indices: Option<Vec<i64>> = if items.is_empty() {
        None
    } else {
        items.iter().map(item_index).collect()
    };

    match indices {
        Some(mut indices) => {
            if indices.len() == expected && is_one_based(&indices) {
                warn!(returned = items.len(), "model numbered results from 1; shifting to 0-based");
                indices.iter_mut().for_each(|idx| *idx -= 1);
            }
            let mut placed = vec![false; expected];
            for (idx, item) in indices.into_iter().zip(&items) {
                match usize::try_from(idx) {
                    Ok(pos) if pos < expected && !placed[pos] => {
                        placed[pos] = true;
                        results[pos] = item_to_result(item);
                    }
                    _ => warn!(index = idx, expected, "result index out of range or repeated; ignored"),
                }
            }
        }
        None => {
            for (slot, item) in results.iter_mut().zip(&items) {
                *slot = item_to_result(item);
            }
        }
    }

    if items.len() != expected {
        debug!(
            expected,
            returned = items.len(),
            "model returned a different number of results; padded or truncated"
        );
    }

    Ok(results)
}

/// Indices that are a permutation of `1..=n` with no 0.
fn is_one_based(indices: &[i64]) -> bool {
    let n = indices.len() as i64;
    let mut seen = vec![false; indices.len()];
    indices.iter().all(|&idx| {
        if idx < 1 || idx > n {
            return false;
        }
        let slot = &mut seen[(idx - 1) as usize];
        !std::mem::replace(slot, true)
    })
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn item_index(item: &Value) -> Option<i64> {
    let obj = item.as_object()?;
    obj.get("index")
        .or_else(|| obj.get("row_index"))
        .and_then(Value::as_i64)
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Turn one response element into a result, `error` if it is unusable.
fn item_to_result(item: &Value) -> ClassificationResult {
    let Some(obj) = item.as_object() else {
        return ClassificationResult::error();
    };

    let label = obj
        .get("label")
        .or_else(|| obj.get("sentiment_label"))
        .and_then(Value::as_str)
        .map(Label::from_model)
        .unwrap_or(Label::Error);
    if label.is_error() {
        return ClassificationResult::error();
    }

    let confidence = match obj.get("confidence") {
        Some(Value::Object(conf)) => {
            let get = |l: Label| conf.get(l.as_str()).and_then(number).unwrap_or(0.0);
            // "irrelevant" mass belongs to neutral.
            let irrelevant = conf.get("irrelevant").and_then(number).unwrap_or(0.0);
            Confidence::normalized(
                get(Label::Positive),
                get(Label::Neutral) + irrelevant,
                get(Label::Negative),
            )
        }
        Some(v) => match number(v) {
            Some(c) => Confidence::concentrated(label, c),
            None => Confidence::uniform(),
        },
        None => match obj.get("sentiment_score").and_then(number) {
            Some(c) => Confidence::concentrated(label, c),
            None => Confidence::uniform(),
        },
    };

    ClassificationResult::new(label, confidence)
}

/// Extract the JSON payload from a response that may have fences or prose.
fn extract_json(raw: &str) -> &str {
    let mut trimmed = raw.trim();

    // Prefer the body of a fenced block if there is one.
    if let Some(fence) = trimmed.find("```") {
        let after = &trimmed[fence + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after[body_start..];
        let body = match body.find("```") {
            Some(end) => &body[..end],
            None => body,
        };
        trimmed = body.trim();
    }

    let Some(start) = trimmed.find(['[', '{']) else {
        return trimmed;
    };
    let remainder = &trimmed[start..];

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }

    remainder
}

// =============================================================================
// Client
// =============================================================================

/// Sends batches to the fast or pro tier through a [`ChatGateway`].
#[derive(Clone)]
pub struct Classifier {
    gateway: Arc<dyn ChatGateway>,
    config: ClassifierConfig,
    template: PromptTemplate,
    run_id: Option<Uuid>,
    shard_id: Option<u32>,
}

impl Classifier {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: ClassifierConfig) -> Self {
        let template = match config.prompt.as_deref() {
            Some(slug) => prompt_by_slug(slug).unwrap_or_else(|| {
                warn!(slug, "unknown prompt template; using default");
                DEFAULT_PROMPT
            }),
            None => DEFAULT_PROMPT,
        };
        Self {
            gateway,
            config,
            template,
            run_id: None,
            shard_id: None,
        }
    }

    /// Tag every request with the run and shard for usage accounting.
    pub fn with_attribution(mut self, run_id: Option<Uuid>, shard_id: Option<u32>) -> Self {
        self.run_id = run_id;
        self.shard_id = shard_id;
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn model(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.config.fast_model,
            Tier::Pro => &self.config.pro_model,
        }
    }

    /// Classify a batch, one result per record in input order.
    pub async fn classify_batch(&self, tier: Tier, records: &[Record]) -> Vec<ClassificationResult> {
        if records.is_empty() {
            return Vec::new();
        }

        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            match self.attempt(tier, records).await {
                Ok(results) => return results,
                Err(err) => {
                    let retryable = err.is_retryable();
                    warn!(
                        tier = tier.as_str(),
                        model = self.model(tier),
                        attempt,
                        attempts,
                        error = %err,
                        "classification attempt failed"
                    );
                    if !retryable || attempt == attempts {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }

        warn!(
            tier = tier.as_str(),
            records = records.len(),
            "retries exhausted; marking batch as error"
        );
        vec![ClassificationResult::error(); records.len()]
    }

    async fn attempt(
        &self,
        tier: Tier,
        records: &[Record],
    ) -> Result<Vec<ClassificationResult>, ClassificationError> {
        let model = self.model(tier);
        let prompt = self.template.render(records);

        let mut attribution = Attribution::new(tier.caller());
        if let Some(run_id) = self.run_id {
            attribution = attribution.with_run(run_id);
        }
        if let Some(shard_id) = self.shard_id {
            attribution = attribution.with_shard(shard_id);
        }

        let mut request = ChatRequest::new(
            ChatModel::openrouter(model),
            prompt.to_messages(),
            attribution,
        )
        .temperature(self.config.temperature)
        .max_tokens(self.config.max_output_tokens);
        // Only OpenAI models reliably support response_format=json_object via OpenRouter.
        if model.starts_with("openai/") {
            request = request.json();
        }

        let response = self.gateway.chat(request).await?;
        parse_batch_response(&response.content, records.len())
    }
}

// =============================================================================
// TESTS
// =============================================================================
