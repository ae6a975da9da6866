//! Consensus decision engine.
//!
//! Per record: fast-accept when the fast tier is confident and the record is
//! not drawn for audit; otherwise the pro tier is consulted and the two
//! verdicts are combined by agreement or weighted soft voting. Close votes go
//! to human review.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{ConfigError, ConsensusConfig};
use crate::labels::{ClassificationResult, Confidence, ConsensusDecision, Label, Strategy};

/// Outcome of looking at the fast result alone.
#[derive(Debug, Clone, PartialEq)]
pub enum Screening {
    Accepted(ConsensusDecision),
    /// The pro tier must be consulted. `audited` is true when the fast tier
    /// was confident enough but the record was drawn for audit.
    NeedsPro { audited: bool },
}

/// Result of weighted soft voting over the non-error tiers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vote {
    pub top: Label,
    pub scores: Confidence,
    pub margin: f64,
}

impl Vote {
    pub fn top_score(&self) -> f64 {
        self.scores.get(self.top)
    }
}

/// Weighted soft vote of the fast and pro results.
///
/// Error tiers are left out and the scores are normalized by the weights
/// that were used. Returns `None` when both tiers errored. Ties between
/// labels resolve in [`Label::VALID`] order.
pub fn weighted_soft_vote(
    fast: &ClassificationResult,
    pro: &ClassificationResult,
    config: &ConsensusConfig,
) -> Option<Vote> {
    let mut raw = [0.0f64; 3];
    let mut total_weight = 0.0;

    for (result, weight) in [(fast, config.weight_fast), (pro, config.weight_pro)] {
        if result.is_error() {
            continue;
        }
        for (slot, label) in raw.iter_mut().zip(Label::VALID) {
            *slot += result.confidence.get(label) * weight;
        }
        total_weight += weight;
    }

    if total_weight <= 0.0 {
        return None;
    }

    let scores = Confidence {
        positive: raw[0] / total_weight,
        neutral: raw[1] / total_weight,
        negative: raw[2] / total_weight,
    };

    let mut ranked: Vec<(Label, f64)> = Label::VALID.iter().map(|&l| (l, scores.get(l))).collect();
    // Stable sort keeps VALID order for ties.
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let margin = (ranked[0].1 - ranked[1].1).clamp(0.0, 1.0);
    Some(Vote {
        top: ranked[0].0,
        scores,
        margin,
    })
}

/// Applies the decision policy with a fixed configuration and an injected RNG.
#[derive(Debug)]
pub struct ConsensusEngine<R: Rng = StdRng> {
    config: ConsensusConfig,
    rng: R,
}

impl ConsensusEngine<StdRng> {
    /// Engine seeded from `config.seed`, or from entropy when unset.
    pub fn new(config: ConsensusConfig) -> Result<Self, ConfigError> {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self::with_rng(config, rng)
    }
}

impl<R: Rng> ConsensusEngine<R> {
    pub fn with_rng(config: ConsensusConfig, rng: R) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, rng })
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    /// Decide whether the fast result can stand on its own.
    ///
    /// The audit draw happens only for records that pass the confidence
    /// threshold, so the RNG advances once per such record.
    pub fn screen(&mut self, record_id: &str, fast: &ClassificationResult) -> Screening {
        if fast.is_error() {
            return Screening::NeedsPro { audited: false };
        }
        let confidence = fast.label_confidence();
        if confidence < self.config.conf_fast_accept {
            return Screening::NeedsPro { audited: false };
        }
        if self.rng.gen::<f64>() < self.config.audit_rate {
            return Screening::NeedsPro { audited: true };
        }
        Screening::Accepted(ConsensusDecision {
            record_id: record_id.to_string(),
            final_label: Some(fast.label),
            strategy: Strategy::FastAccept,
            margin: None,
            score: confidence,
        })
    }

    /// Combine fast and pro results for a record that was sent to pro.
    pub fn decide(
        &self,
        record_id: &str,
        fast: &ClassificationResult,
        pro: &ClassificationResult,
    ) -> ConsensusDecision {
        let vote = weighted_soft_vote(fast, pro, &self.config);

        if !fast.is_error() && !pro.is_error() && fast.label == pro.label {
            let score = vote.map(|v| v.scores.get(fast.label)).unwrap_or(0.0);
            return ConsensusDecision {
                record_id: record_id.to_string(),
                final_label: Some(fast.label),
                strategy: Strategy::Agreement,
                margin: None,
                score,
            };
        }

        match vote {
            Some(vote) if vote.margin >= self.config.margin_threshold => ConsensusDecision {
                record_id: record_id.to_string(),
                final_label: Some(vote.top),
                strategy: Strategy::SoftVoting,
                margin: Some(vote.margin),
                score: vote.top_score(),
            },
            Some(vote) => ConsensusDecision {
                record_id: record_id.to_string(),
                final_label: None,
                strategy: Strategy::HumanReview,
                margin: Some(vote.margin),
                score: vote.top_score(),
            },
            None => ConsensusDecision {
                record_id: record_id.to_string(),
                final_label: None,
                strategy: Strategy::HumanReview,
                margin: Some(0.0),
                score: 0.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;

    fn result(label: Label, p: f64, u: f64, n: f64) -> ClassificationResult {
        ClassificationResult::new(label, Confidence::normalized(p, u, n))
    }

    /// RNG whose f64 draws are always close to 1.0, so nothing is audited.
    fn never_audit() -> StepRng {
        StepRng::new(u64::MAX, 0)
    }

    /// RNG whose f64 draws are always 0.0, so every eligible record is audited.
    fn always_audit() -> StepRng {
        StepRng::new(0, 0)
    }

    #[test]
    fn confident_fast_result_is_accepted() {
        let mut engine =
            ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();
        let fast = result(Label::Positive, 0.99, 0.005, 0.005);
        match engine.screen("A", &fast) {
            Screening::Accepted(d) => {
                assert_eq!(d.final_label, Some(Label::Positive));
                assert_eq!(d.strategy, Strategy::FastAccept);
                assert!(d.margin.is_none());
                assert!((d.score - 0.99).abs() < 1e-9);
            }
            other => panic!("expected fast accept, got {other:?}"),
        }
    }

    #[test]
    fn audit_draw_forces_pro() {
        let mut engine =
            ConsensusEngine::with_rng(ConsensusConfig::default(), always_audit()).unwrap();
        let fast = result(Label::Positive, 0.99, 0.005, 0.005);
        assert_eq!(
            engine.screen("A", &fast),
            Screening::NeedsPro { audited: true }
        );
    }

    #[test]
    fn low_confidence_and_errors_go_to_pro_without_audit() {
        let mut engine =
            ConsensusEngine::with_rng(ConsensusConfig::default(), always_audit()).unwrap();
        let unsure = result(Label::Positive, 0.6, 0.3, 0.1);
        assert_eq!(
            engine.screen("A", &unsure),
            Screening::NeedsPro { audited: false }
        );
        assert_eq!(
            engine.screen("B", &ClassificationResult::error()),
            Screening::NeedsPro { audited: false }
        );
    }

    #[test]
    fn matching_labels_agree() {
        let engine = ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();
        let fast = result(Label::Negative, 0.1, 0.2, 0.7);
        let pro = result(Label::Negative, 0.0, 0.1, 0.9);
        let d = engine.decide("A", &fast, &pro);
        assert_eq!(d.strategy, Strategy::Agreement);
        assert_eq!(d.final_label, Some(Label::Negative));
        assert!(d.margin.is_none());
        // (0.7*1 + 0.9*2) / 3
        assert!((d.score - 2.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn three_record_walkthrough() {
        // A: fast-accepted. B: blank text, skipped upstream. C: disagreement resolved by vote.
        let mut engine =
            ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();

        let a = result(Label::Positive, 0.99, 0.01, 0.0);
        assert!(matches!(engine.screen("A", &a), Screening::Accepted(_)));

        let b = ConsensusDecision::skipped("B");
        assert_eq!(b.final_label, Some(Label::Neutral));
        assert_eq!(b.score, 0.0);

        let c_fast = result(Label::Neutral, 0.3, 0.6, 0.1);
        assert!(matches!(
            engine.screen("C", &c_fast),
            Screening::NeedsPro { audited: false }
        ));
        let c_pro = result(Label::Positive, 0.8, 0.15, 0.05);
        let c = engine.decide("C", &c_fast, &c_pro);
        // positive = (0.3 + 1.6)/3 = 0.6333, neutral = (0.6 + 0.3)/3 = 0.3
        assert_eq!(c.strategy, Strategy::SoftVoting);
        assert_eq!(c.final_label, Some(Label::Positive));
        let margin = c.margin.unwrap();
        assert!((margin - (1.9 - 0.9) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn close_vote_goes_to_human_review() {
        let engine = ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();
        let fast = result(Label::Positive, 0.5, 0.1, 0.4);
        let pro = result(Label::Negative, 0.4, 0.1, 0.5);
        let d = engine.decide("A", &fast, &pro);
        assert_eq!(d.strategy, Strategy::HumanReview);
        assert!(d.final_label.is_none());
        let margin = d.margin.unwrap();
        assert!((0.0..0.2).contains(&margin));
    }

    #[test]
    fn single_surviving_tier_votes_alone() {
        let engine = ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();
        let pro = result(Label::Negative, 0.05, 0.05, 0.9);
        let d = engine.decide("A", &ClassificationResult::error(), &pro);
        assert_eq!(d.strategy, Strategy::SoftVoting);
        assert_eq!(d.final_label, Some(Label::Negative));
        assert!((d.margin.unwrap() - 0.85).abs() < 1e-9);
    }

    #[test]
    fn both_tiers_failing_means_human_review() {
        let engine = ConsensusEngine::with_rng(ConsensusConfig::default(), never_audit()).unwrap();
        let err = ClassificationResult::error();
        let d = engine.decide("A", &err, &err);
        assert_eq!(d.strategy, Strategy::HumanReview);
        assert!(d.final_label.is_none());
        assert_eq!(d.margin, Some(0.0));
    }

    #[test]
    fn margins_stay_in_unit_interval() {
        let cfg = ConsensusConfig::default();
        let samples = [
            result(Label::Positive, 1.0, 0.0, 0.0),
            result(Label::Neutral, 0.0, 1.0, 0.0),
            result(Label::Negative, 0.2, 0.3, 0.5),
            result(Label::Positive, 0.34, 0.33, 0.33),
            ClassificationResult::error(),
        ];
        for fast in &samples {
            for pro in &samples {
                if let Some(vote) = weighted_soft_vote(fast, pro, &cfg) {
                    assert!((0.0..=1.0).contains(&vote.margin));
                    assert!((vote.scores.sum() - 1.0).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn seeded_engines_draw_the_same_audits() {
        let cfg = ConsensusConfig {
            conf_fast_accept: 0.5,
            audit_rate: 0.5,
            seed: Some(42),
            ..ConsensusConfig::default()
        };
        let fast = result(Label::Positive, 0.9, 0.05, 0.05);
        let mut a = ConsensusEngine::new(cfg.clone()).unwrap();
        let mut b = ConsensusEngine::new(cfg).unwrap();
        for i in 0..32 {
            let id = i.to_string();
            assert_eq!(a.screen(&id, &fast), b.screen(&id, &fast));
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = ConsensusConfig {
            margin_threshold: -0.1,
            ..ConsensusConfig::default()
        };
        assert!(ConsensusEngine::new(cfg).is_err());
    }
}
