//! Prompt templates for batch sentiment classification.
//!
//! Provider-agnostic: a template renders a batch of records into a system
//! and user message, the gateway does the rest.

use crate::dataset::Record;
use crate::gateway::Message;

// =============================================================================
// Prompt templates
// =============================================================================

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// XML-safe tag name for a context column, e.g. `video title` -> `video_title`.
fn tag_name(column: &str) -> String {
    let tag: String = column
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if tag.is_empty() || tag.starts_with(|c: char| c.is_ascii_digit()) {
        format!("field_{tag}")
    } else {
        tag
    }
}

/// A prompt template with placeholders.
///
/// `{count}` is replaced with the batch size in both parts; `{records}` in
/// the user part is replaced with the rendered record blocks.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, records: &[Record]) -> PromptInstance {
        let count = records.len().to_string();

        let blocks: Vec<String> = records
            .iter()
            .enumerate()
            .map(|(index, record)| render_record(index, record))
            .collect();

        let system = self.system.replace("{count}", &count);
        let user = self
            .user
            .replace("{count}", &count)
            .replace("{records}", &blocks.join("\n"));

        PromptInstance {
            template_slug: self.slug.to_string(),
            system: system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

fn render_record(index: usize, record: &Record) -> String {
    let mut out = format!(
        "<record index=\"{index}\" id=\"{}\">\n",
        escape_xml_chars(&record.record_id)
    );
    for (column, value) in &record.context {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let tag = tag_name(column);
        out.push_str(&format!("<{tag}>{}</{tag}>\n", escape_xml_chars(value)));
    }
    out.push_str(&format!(
        "<text>\n{}\n</text>\n</record>",
        escape_xml_chars(record.text.trim())
    ));
    out
}

// =============================================================================
// Standard prompts
// =============================================================================

pub const SENTIMENT_V1: PromptTemplate = PromptTemplate {
    slug: "sentiment_batch_v1",
    system: r#"You are a sentiment classification system for short user-generated texts such as comments and reviews.
Classify each record into exactly one of three labels:
- positive: praising, enjoying, expressing satisfaction or support
- neutral: factual, unclear, off-topic or without a clear sentiment
- negative: complaining, criticising, expressing dissatisfaction

Take the context fields of a record into account. The same sentence can carry a different sentiment in a different context.

Output only valid JSON: an array with exactly {count} elements, one per record, in the order given:
[{"index": 0, "label": "positive|neutral|negative", "confidence": {"positive": p, "neutral": u, "negative": n}}]
Confidence values are numbers in [0,1] that sum to 1."#,
    user: r#"Classify these {count} records.

{records}

Return the JSON array.
json:"#,
};

pub const PROMPTS: &[PromptTemplate] = &[SENTIMENT_V1];
pub const DEFAULT_PROMPT: PromptTemplate = SENTIMENT_V1;

pub fn prompt_by_slug(slug: &str) -> Option<PromptTemplate> {
    PROMPTS.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// TESTS
// =============================================================================
