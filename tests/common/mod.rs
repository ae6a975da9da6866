//! Scripted classification service shared by the end-to-end tests.

#![allow(dead_code)]

use serde_json::{json, Value};
use wiremock::{Request, Respond, ResponseTemplate};

pub const FAST: &str = "google/gemini-2.5-flash";
pub const PRO: &str = "google/gemini-2.5-pro";

/// Opinion of each tier, keyed by the record id prefix.
pub fn opinion(model: &str, record_id: &str) -> (&'static str, [f64; 3]) {
    let kind = record_id.split('-').next().unwrap_or_default();
    match (model == FAST, kind) {
        (true, "love") => ("positive", [0.995, 0.004, 0.001]),
        (false, "love") => ("positive", [0.9, 0.08, 0.02]),
        (true, "awful") => ("negative", [0.1, 0.2, 0.7]),
        (false, "awful") => ("negative", [0.05, 0.05, 0.9]),
        (true, _) => ("neutral", [0.2, 0.6, 0.2]),
        (false, "hmm") => ("negative", [0.0, 0.1, 0.9]),
        (false, _) => ("positive", [0.5, 0.3, 0.2]),
    }
}

fn record_ids(user_prompt: &str) -> Vec<String> {
    user_prompt
        .split("id=\"")
        .skip(1)
        .filter_map(|s| s.split('"').next())
        .map(str::to_string)
        .collect()
}

pub fn request_ids(request: &Request) -> (String, Vec<String>) {
    let body: Value = serde_json::from_slice(&request.body).unwrap();
    let model = body["model"].as_str().unwrap().to_string();
    let user = body["messages"]
        .as_array()
        .unwrap()
        .iter()
        .find(|m| m["role"] == "user")
        .and_then(|m| m["content"].as_str())
        .unwrap()
        .to_string();
    (model, record_ids(&user))
}

/// Answers each batch from [`opinion`], wrapped in a code fence like real models do.
pub struct SentimentResponder;

impl Respond for SentimentResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let (model, ids) = request_ids(request);
        let results: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(index, id)| {
                let (label, [p, u, n]) = opinion(&model, id);
                json!({
                    "index": index,
                    "label": label,
                    "confidence": { "positive": p, "neutral": u, "negative": n }
                })
            })
            .collect();
        let content = format!("```json\n{}\n```", Value::Array(results));
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 200, "completion_tokens": 40 }
        }))
    }
}
