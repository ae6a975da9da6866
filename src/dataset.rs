//! Tabular datasets: CSV in, records out, labeled rows back to CSV.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::config::ColumnConfig;
use crate::labels::{ConsensusDecision, Strategy};

/// Columns added to every labeled output, in this order.
pub const LABEL_COLUMNS: [&str; 4] = ["final_label", "strategy", "margin", "score"];

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),
    #[error("column '{0}' not found")]
    MissingColumn(String),
    #[error("duplicate record id '{id}' at data row {row}")]
    DuplicateId { id: String, row: usize },
    #[error("'{0}' is not a labeled dataset (missing final_label/strategy/margin/score)")]
    NotLabeled(PathBuf),
}

/// One input row as the classifier sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_id: String,
    pub text: String,
    /// Context column name and value, in configured column order.
    pub context: Vec<(String, String)>,
}

impl Record {
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// A CSV file held in memory as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Dataset {
    /// Build a dataset, padding or cutting rows to the header width.
    pub fn new(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let width = headers.len();
        let rows = rows
            .into_iter()
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Self { headers, rows }
    }

    pub fn read_csv(path: &Path) -> Result<Self, DatasetError> {
        let read_err = |source| DatasetError::Read {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(|e| read_err(csv::Error::from(e)))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let headers: Vec<String> = reader
            .headers()
            .map_err(read_err)?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(read_err)?;
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self::new(headers, rows))
    }

    /// Write to `path` via a temp file in the same directory and a rename.
    pub fn write_csv(&self, path: &Path) -> Result<(), DatasetError> {
        let bytes = self.to_csv_bytes()?;
        write_atomically(path, &bytes).map_err(|source| DatasetError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, DatasetError> {
        encode_csv(&self.headers, &self.rows)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Vec<String>> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<usize, DatasetError> {
        self.column(name)
            .ok_or_else(|| DatasetError::MissingColumn(name.to_string()))
    }

    /// Rows in `range`, clamped to the dataset, with the same headers.
    pub fn slice(&self, range: Range<usize>) -> Dataset {
        let end = range.end.min(self.rows.len());
        let start = range.start.min(end);
        Dataset {
            headers: self.headers.clone(),
            rows: self.rows[start..end].to_vec(),
        }
    }

    /// Check that the configured columns exist and ids are unique.
    pub fn validate_columns(&self, columns: &ColumnConfig) -> Result<(), DatasetError> {
        self.records(columns).map(|_| ())
    }

    /// Extract one [`Record`] per row.
    pub fn records(&self, columns: &ColumnConfig) -> Result<Vec<Record>, DatasetError> {
        let id_idx = self.require_column(&columns.id_column)?;
        let text_idx = self.require_column(&columns.text_column)?;
        let context_idx = columns
            .context_columns
            .iter()
            .map(|name| self.require_column(name).map(|idx| (name.clone(), idx)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::with_capacity(self.rows.len());
        let mut records = Vec::with_capacity(self.rows.len());
        for (row_num, row) in self.rows.iter().enumerate() {
            let record_id = row[id_idx].clone();
            if !seen.insert(record_id.clone()) {
                return Err(DatasetError::DuplicateId {
                    id: record_id,
                    row: row_num + 1,
                });
            }
            records.push(Record {
                record_id,
                text: row[text_idx].clone(),
                context: context_idx
                    .iter()
                    .map(|(name, idx)| (name.clone(), row[*idx].clone()))
                    .collect(),
            });
        }
        Ok(records)
    }
}

// =============================================================================
// Label columns
// =============================================================================

/// The four label cells of one output row, as written to CSV.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelCells {
    pub final_label: String,
    pub strategy: String,
    pub margin: String,
    pub score: String,
}

impl LabelCells {
    pub fn from_decision(decision: &ConsensusDecision) -> Self {
        Self {
            final_label: decision
                .final_label
                .map(|l| l.as_str().to_string())
                .unwrap_or_default(),
            strategy: decision.strategy.as_str().to_string(),
            margin: decision
                .margin
                .map(|m| format!("{m:.4}"))
                .unwrap_or_default(),
            score: format!("{:.4}", decision.score),
        }
    }

    pub fn score_value(&self) -> Option<f64> {
        self.score.trim().parse().ok()
    }

    pub fn margin_value(&self) -> Option<f64> {
        self.margin.trim().parse().ok()
    }

    pub fn strategy_value(&self) -> Option<Strategy> {
        self.strategy.parse().ok()
    }

    /// Neutral with a score of exactly zero: a record that carried no signal.
    pub fn is_degenerate(&self) -> bool {
        self.final_label == "neutral" && self.score_value() == Some(0.0)
    }

    pub fn is_human_review(&self) -> bool {
        self.strategy_value() == Some(Strategy::HumanReview)
    }

    pub fn is_empty(&self) -> bool {
        self.final_label.is_empty() && self.strategy.is_empty()
    }
}

/// Positions of the label columns within a header row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelColumns {
    pub final_label: usize,
    pub strategy: usize,
    pub margin: usize,
    pub score: usize,
}

impl LabelColumns {
    /// Find the label columns, `None` unless all four are present.
    pub fn locate(headers: &[String]) -> Option<Self> {
        let find = |name: &str| headers.iter().position(|h| h == name);
        Some(Self {
            final_label: find(LABEL_COLUMNS[0])?,
            strategy: find(LABEL_COLUMNS[1])?,
            margin: find(LABEL_COLUMNS[2])?,
            score: find(LABEL_COLUMNS[3])?,
        })
    }

    /// Find the label columns, appending any that are missing.
    pub fn ensure(headers: &mut Vec<String>) -> Self {
        let mut find_or_push = |name: &str| match headers.iter().position(|h| h == name) {
            Some(idx) => idx,
            None => {
                headers.push(name.to_string());
                headers.len() - 1
            }
        };
        Self {
            final_label: find_or_push(LABEL_COLUMNS[0]),
            strategy: find_or_push(LABEL_COLUMNS[1]),
            margin: find_or_push(LABEL_COLUMNS[2]),
            score: find_or_push(LABEL_COLUMNS[3]),
        }
    }

    pub fn read(&self, row: &[String]) -> LabelCells {
        let cell = |idx: usize| row.get(idx).cloned().unwrap_or_default();
        LabelCells {
            final_label: cell(self.final_label),
            strategy: cell(self.strategy),
            margin: cell(self.margin),
            score: cell(self.score),
        }
    }

    /// Overwrite the label cells of `row`. The row must be full width.
    pub fn write(&self, row: &mut [String], cells: &LabelCells) {
        row[self.final_label] = cells.final_label.clone();
        row[self.strategy] = cells.strategy.clone();
        row[self.margin] = cells.margin.clone();
        row[self.score] = cells.score.clone();
    }
}

/// Header row for labeled output built from an input header row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    headers: Vec<String>,
    columns: LabelColumns,
}

impl OutputSchema {
    pub fn for_input(input_headers: &[String]) -> Self {
        let mut headers = input_headers.to_vec();
        let columns = LabelColumns::ensure(&mut headers);
        Self { headers, columns }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn columns(&self) -> LabelColumns {
        self.columns
    }

    /// Input row extended with the decision's label cells.
    pub fn labeled_row(&self, source: &[String], decision: &ConsensusDecision) -> Vec<String> {
        let mut row = source.to_vec();
        row.resize(self.headers.len(), String::new());
        self.columns
            .write(&mut row, &LabelCells::from_decision(decision));
        row
    }
}

// =============================================================================
// Atomic writes
// =============================================================================

/// Encode a header row and data rows as CSV.
pub(crate) fn encode_csv(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>, DatasetError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer
        .into_inner()
        .map_err(|e| DatasetError::Csv(csv::Error::from(e.into_error())))
}

/// Write `bytes` to a temp file next to `path`, sync it, then rename over `path`.
pub(crate) fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Label;

    fn sample() -> Dataset {
        Dataset::new(
            vec!["record_id".into(), "text".into(), "title".into()],
            vec![
                vec!["1".into(), "love it".into(), "Show".into()],
                vec!["2".into(), "".into(), "Show".into()],
                vec!["3".into(), "meh".into()],
            ],
        )
    }

    #[test]
    fn records_follow_column_config() {
        let columns = ColumnConfig {
            context_columns: vec!["title".into()],
            ..ColumnConfig::default()
        };
        let records = sample().records(&columns).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].context, vec![("title".into(), "Show".into())]);
        assert!(!records[1].has_text());
        // Short rows are padded.
        assert_eq!(records[2].context[0].1, "");
    }

    #[test]
    fn missing_column_and_duplicate_ids_are_errors() {
        let columns = ColumnConfig {
            text_column: "text_cleaned".into(),
            ..ColumnConfig::default()
        };
        assert!(matches!(
            sample().records(&columns),
            Err(DatasetError::MissingColumn(c)) if c == "text_cleaned"
        ));

        let dup = Dataset::new(
            vec!["record_id".into(), "text".into()],
            vec![vec!["a".into(), "x".into()], vec!["a".into(), "y".into()]],
        );
        assert!(matches!(
            dup.records(&ColumnConfig::default()),
            Err(DatasetError::DuplicateId { row: 2, .. })
        ));
    }

    #[test]
    fn csv_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.csv");
        let ds = Dataset::new(
            vec!["record_id".into(), "text".into()],
            vec![vec!["1".into(), "a, \"quoted\"\nline".into()]],
        );
        ds.write_csv(&path).unwrap();
        assert_eq!(Dataset::read_csv(&path).unwrap(), ds);
    }

    #[test]
    fn slice_is_clamped() {
        let ds = sample();
        assert_eq!(ds.slice(1..10).len(), 2);
        assert_eq!(ds.slice(5..9).len(), 0);
    }

    #[test]
    fn output_schema_appends_or_reuses_label_columns() {
        let schema = OutputSchema::for_input(sample().headers());
        assert_eq!(schema.headers().len(), 7);
        assert_eq!(&schema.headers()[3..], &LABEL_COLUMNS.map(String::from));

        // Relabeling an already labeled file keeps the header width.
        let again = OutputSchema::for_input(schema.headers());
        assert_eq!(again.headers(), schema.headers());
    }

    #[test]
    fn labeled_row_formats_decision() {
        let schema = OutputSchema::for_input(sample().headers());
        let decision = ConsensusDecision {
            record_id: "1".into(),
            final_label: None,
            strategy: Strategy::HumanReview,
            margin: Some(0.05),
            score: 0.51234,
        };
        let row = schema.labeled_row(&sample().rows()[0], &decision);
        let cells = schema.columns().read(&row);
        assert_eq!(cells.final_label, "");
        assert_eq!(cells.strategy, "human_review");
        assert_eq!(cells.margin, "0.0500");
        assert_eq!(cells.score, "0.5123");
        assert!(cells.is_human_review());
    }

    #[test]
    fn degenerate_rows_are_neutral_with_zero_score() {
        let skipped = LabelCells::from_decision(&ConsensusDecision::skipped("x"));
        assert!(skipped.is_degenerate());

        let mut real = skipped.clone();
        real.score = "0.4000".into();
        assert!(!real.is_degenerate());

        let mut positive = skipped;
        positive.final_label = Label::Positive.as_str().into();
        assert!(!positive.is_degenerate());
    }
}
