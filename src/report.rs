//! Strategy and label statistics for shards, runs and labeled files.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::dataset::{Dataset, DatasetError, LabelCells, LabelColumns};
use crate::labels::Strategy;

/// How many records each strategy decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyCounts {
    pub fast_accept: u64,
    pub agreement: u64,
    pub soft_voting: u64,
    pub human_review: u64,
    pub skipped: u64,
}

impl StrategyCounts {
    pub fn record(&mut self, strategy: Strategy) {
        *self.slot(strategy) += 1;
    }

    /// Count the strategy cells of labeled rows.
    pub fn from_rows(cols: &LabelColumns, rows: &[Vec<String>]) -> Self {
        let mut counts = Self::default();
        for row in rows {
            if let Some(s) = cols.read(row).strategy_value() {
                counts.record(s);
            }
        }
        counts
    }

    pub fn get(&self, strategy: Strategy) -> u64 {
        match strategy {
            Strategy::FastAccept => self.fast_accept,
            Strategy::Agreement => self.agreement,
            Strategy::SoftVoting => self.soft_voting,
            Strategy::HumanReview => self.human_review,
            Strategy::Skipped => self.skipped,
        }
    }

    fn slot(&mut self, strategy: Strategy) -> &mut u64 {
        match strategy {
            Strategy::FastAccept => &mut self.fast_accept,
            Strategy::Agreement => &mut self.agreement,
            Strategy::SoftVoting => &mut self.soft_voting,
            Strategy::HumanReview => &mut self.human_review,
            Strategy::Skipped => &mut self.skipped,
        }
    }

    pub fn total(&self) -> u64 {
        Strategy::ALL.iter().map(|s| self.get(*s)).sum()
    }

    pub fn add(&mut self, other: &StrategyCounts) {
        for s in Strategy::ALL {
            *self.slot(s) += other.get(s);
        }
    }

    /// Records that needed the pro tier.
    pub fn pro_calls(&self) -> u64 {
        self.agreement + self.soft_voting + self.human_review
    }
}

impl fmt::Display for StrategyCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = Strategy::ALL
            .iter()
            .map(|s| format!("{}={}", s.as_str(), self.get(*s)))
            .collect();
        f.write_str(&parts.join(" "))
    }
}

/// min / mean / max of a set of margins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MarginStats {
    pub count: u64,
    pub min: f64,
    pub mean: f64,
    pub max: f64,
}

impl MarginStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(Self {
            count: values.len() as u64,
            min,
            mean,
            max,
        })
    }
}

/// Summary of a labeled CSV.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DatasetStats {
    pub rows: u64,
    /// Rows with no label cells at all (not yet labeled).
    pub unlabeled: u64,
    pub labels: BTreeMap<String, u64>,
    pub strategies: StrategyCounts,
    pub soft_voting_margin: Option<MarginStats>,
    pub human_review_margin: Option<MarginStats>,
}

impl DatasetStats {
    pub fn from_dataset(dataset: &Dataset, source: &Path) -> Result<Self, DatasetError> {
        let columns = LabelColumns::locate(dataset.headers())
            .ok_or_else(|| DatasetError::NotLabeled(source.to_path_buf()))?;
        Ok(Self::from_cells(
            dataset.rows().iter().map(|row| columns.read(row)),
        ))
    }

    pub fn from_cells(cells: impl IntoIterator<Item = LabelCells>) -> Self {
        let mut stats = DatasetStats::default();
        let mut soft = Vec::new();
        let mut review = Vec::new();

        for cell in cells {
            stats.rows += 1;
            if cell.is_empty() {
                stats.unlabeled += 1;
                continue;
            }
            let label = if cell.final_label.is_empty() {
                "(none)".to_string()
            } else {
                cell.final_label.clone()
            };
            *stats.labels.entry(label).or_default() += 1;

            if let Some(strategy) = cell.strategy_value() {
                stats.strategies.record(strategy);
                match (strategy, cell.margin_value()) {
                    (Strategy::SoftVoting, Some(m)) => soft.push(m),
                    (Strategy::HumanReview, Some(m)) => review.push(m),
                    _ => {}
                }
            }
        }

        stats.soft_voting_margin = MarginStats::from_values(&soft);
        stats.human_review_margin = MarginStats::from_values(&review);
        stats
    }
}

fn pct(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        100.0 * part as f64 / whole as f64
    }
}

impl fmt::Display for DatasetStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labeled = self.rows - self.unlabeled;
        writeln!(f, "rows: {} (labeled {}, unlabeled {})", self.rows, labeled, self.unlabeled)?;
        writeln!(f, "labels:")?;
        for (label, n) in &self.labels {
            writeln!(f, "  {label:<12} {n:>8} {:>6.1}%", pct(*n, labeled))?;
        }
        writeln!(f, "strategies:")?;
        for s in Strategy::ALL {
            let n = self.strategies.get(s);
            writeln!(f, "  {:<12} {n:>8} {:>6.1}%", s.as_str(), pct(n, labeled))?;
        }
        for (name, margin) in [
            ("soft_voting", &self.soft_voting_margin),
            ("human_review", &self.human_review_margin),
        ] {
            if let Some(m) = margin {
                writeln!(
                    f,
                    "{name} margin: min {:.4} mean {:.4} max {:.4} (n={})",
                    m.min, m.mean, m.max, m.count
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cells(label: &str, strategy: &str, margin: &str) -> LabelCells {
        LabelCells {
            final_label: label.into(),
            strategy: strategy.into(),
            margin: margin.into(),
            score: "0.9".into(),
        }
    }

    #[test]
    fn counts_add_up() {
        let mut a = StrategyCounts::default();
        a.record(Strategy::FastAccept);
        a.record(Strategy::FastAccept);
        a.record(Strategy::HumanReview);
        let mut b = StrategyCounts::default();
        b.record(Strategy::Agreement);
        b.add(&a);
        assert_eq!(b.total(), 4);
        assert_eq!(b.fast_accept, 2);
        assert_eq!(b.pro_calls(), 2);
        assert!(b.to_string().contains("fast_accept=2"));
    }

    #[test]
    fn stats_from_cells() {
        let stats = DatasetStats::from_cells(vec![
            cells("positive", "fast_accept", ""),
            cells("negative", "soft_voting", "0.4000"),
            cells("positive", "soft_voting", "0.2000"),
            cells("", "human_review", "0.1000"),
            LabelCells::default(),
        ]);
        assert_eq!(stats.rows, 5);
        assert_eq!(stats.unlabeled, 1);
        assert_eq!(stats.labels["positive"], 2);
        assert_eq!(stats.labels["(none)"], 1);
        let soft = stats.soft_voting_margin.unwrap();
        assert_eq!(soft.count, 2);
        assert!((soft.mean - 0.3).abs() < 1e-9);
        assert!((soft.min - 0.2).abs() < 1e-9);
        assert_eq!(stats.human_review_margin.unwrap().count, 1);
        assert!(stats.to_string().contains("soft_voting margin"));
    }

    #[test]
    fn unlabeled_file_is_rejected() {
        let ds = Dataset::new(vec!["record_id".into(), "text".into()], vec![]);
        assert!(matches!(
            DatasetStats::from_dataset(&ds, Path::new("x.csv")),
            Err(DatasetError::NotLabeled(_))
        ));
    }
}
