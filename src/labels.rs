//! Sentiment labels, per-tier classification results and consensus decisions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sentiment label produced by a model tier.
///
/// `Error` marks a record the tier could not classify (failed call,
/// unparsable or invalid item) and never becomes a final label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Positive,
    Neutral,
    Negative,
    Error,
}

impl Label {
    /// The three labels a record can actually end up with, in tie-break order.
    pub const VALID: [Label; 3] = [Label::Positive, Label::Neutral, Label::Negative];

    pub fn as_str(&self) -> &'static str {
        match self {
            Label::Positive => "positive",
            Label::Neutral => "neutral",
            Label::Negative => "negative",
            Label::Error => "error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Label::Error)
    }

    /// Lenient parse of a model-supplied label.
    ///
    /// Case and surrounding whitespace are ignored and `irrelevant` counts as
    /// `neutral`. Anything else unknown is `Error`.
    pub fn from_model(raw: &str) -> Label {
        match raw.trim().to_lowercase().as_str() {
            "positive" => Label::Positive,
            "neutral" | "irrelevant" => Label::Neutral,
            "negative" => Label::Negative,
            _ => Label::Error,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Label::Positive),
            "neutral" => Ok(Label::Neutral),
            "negative" => Ok(Label::Negative),
            "error" => Ok(Label::Error),
            other => Err(format!("unknown label '{other}'")),
        }
    }
}

/// Probability mass over the three valid labels. Always sums to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Confidence {
    pub positive: f64,
    pub neutral: f64,
    pub negative: f64,
}

impl Confidence {
    /// Equal 1/3 split, used when a tier gives no usable confidence.
    pub fn uniform() -> Self {
        let third = 1.0 / 3.0;
        Self {
            positive: third,
            neutral: third,
            negative: third,
        }
    }

    /// Build from raw per-label values, normalizing to a distribution.
    ///
    /// Negative and non-finite inputs count as zero. If nothing is left the
    /// result is [`Confidence::uniform`].
    pub fn normalized(positive: f64, neutral: f64, negative: f64) -> Self {
        let clean = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
        let (p, n, g) = (clean(positive), clean(neutral), clean(negative));
        let total = p + n + g;
        if total <= 0.0 {
            return Self::uniform();
        }
        Self {
            positive: p / total,
            neutral: n / total,
            negative: g / total,
        }
    }

    /// Put `value` on `label` and split the remainder evenly over the others.
    pub fn concentrated(label: Label, value: f64) -> Self {
        if label.is_error() || !value.is_finite() {
            return Self::uniform();
        }
        let v = value.clamp(0.0, 1.0);
        let rest = (1.0 - v) / 2.0;
        let mut c = Self {
            positive: rest,
            neutral: rest,
            negative: rest,
        };
        c.set(label, v);
        c
    }

    pub fn get(&self, label: Label) -> f64 {
        match label {
            Label::Positive => self.positive,
            Label::Neutral => self.neutral,
            Label::Negative => self.negative,
            Label::Error => 0.0,
        }
    }

    fn set(&mut self, label: Label, value: f64) {
        match label {
            Label::Positive => self.positive = value,
            Label::Neutral => self.neutral = value,
            Label::Negative => self.negative = value,
            Label::Error => {}
        }
    }

    pub fn sum(&self) -> f64 {
        self.positive + self.neutral + self.negative
    }
}

impl Default for Confidence {
    fn default() -> Self {
        Self::uniform()
    }
}

/// One tier's verdict on one record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: Label,
    pub confidence: Confidence,
}

impl ClassificationResult {
    pub fn new(label: Label, confidence: Confidence) -> Self {
        Self { label, confidence }
    }

    /// Placeholder for a record the tier failed to classify.
    pub fn error() -> Self {
        Self {
            label: Label::Error,
            confidence: Confidence::uniform(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.label.is_error()
    }

    /// Confidence the tier puts on the label it returned.
    pub fn label_confidence(&self) -> f64 {
        self.confidence.get(self.label)
    }
}

/// How a record's final label was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Fast tier was confident enough and the record was not audited.
    FastAccept,
    /// Both tiers returned the same label.
    Agreement,
    /// Weighted vote with a margin at or above the threshold.
    SoftVoting,
    /// Tiers disagreed too closely (or both failed); no label assigned.
    HumanReview,
    /// Empty text; never sent to a model.
    Skipped,
}

impl Strategy {
    pub const ALL: [Strategy; 5] = [
        Strategy::FastAccept,
        Strategy::Agreement,
        Strategy::SoftVoting,
        Strategy::HumanReview,
        Strategy::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::FastAccept => "fast_accept",
            Strategy::Agreement => "agreement",
            Strategy::SoftVoting => "soft_voting",
            Strategy::HumanReview => "human_review",
            Strategy::Skipped => "skipped",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Strategy::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown strategy '{s}'"))
    }
}

/// Final outcome for one record.
///
/// `final_label` is `None` exactly when `strategy` is
/// [`Strategy::HumanReview`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub record_id: String,
    pub final_label: Option<Label>,
    pub strategy: Strategy,
    /// Score gap between the top two labels; only set by voting.
    pub margin: Option<f64>,
    /// Confidence in the final (or, for human review, the leading) label.
    pub score: f64,
}

impl ConsensusDecision {
    /// Decision for a record with blank text.
    pub fn skipped(record_id: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            final_label: Some(Label::Neutral),
            strategy: Strategy::Skipped,
            margin: None,
            score: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_labels_are_parsed_leniently() {
        assert_eq!(Label::from_model(" Positive "), Label::Positive);
        assert_eq!(Label::from_model("IRRELEVANT"), Label::Neutral);
        assert_eq!(Label::from_model("mixed"), Label::Error);
        assert_eq!(Label::from_model(""), Label::Error);
    }

    #[test]
    fn normalized_confidence_sums_to_one() {
        let c = Confidence::normalized(2.0, 1.0, 1.0);
        assert!((c.sum() - 1.0).abs() < 1e-9);
        assert!((c.positive - 0.5).abs() < 1e-9);
    }

    #[test]
    fn zero_or_garbage_confidence_becomes_uniform() {
        let c = Confidence::normalized(0.0, -3.0, f64::NAN);
        assert_eq!(c, Confidence::uniform());
        assert!((c.sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn concentrated_spreads_remainder() {
        let c = Confidence::concentrated(Label::Negative, 0.8);
        assert!((c.negative - 0.8).abs() < 1e-9);
        assert!((c.positive - 0.1).abs() < 1e-9);
        assert!((c.neutral - 0.1).abs() < 1e-9);
    }

    #[test]
    fn strategy_round_trips_through_strings() {
        for s in Strategy::ALL {
            assert_eq!(s.as_str().parse::<Strategy>().unwrap(), s);
        }
        assert!("maybe".parse::<Strategy>().is_err());
    }

    #[test]
    fn skipped_decision_is_neutral_with_zero_score() {
        let d = ConsensusDecision::skipped("r1");
        assert_eq!(d.final_label, Some(Label::Neutral));
        assert_eq!(d.strategy, Strategy::Skipped);
        assert_eq!(d.score, 0.0);
        assert!(d.margin.is_none());
    }
}
