//! Events tables and design matrices.
//!
//! This module is the entry point for experimental timing data. Events
//! tables are BIDS TSV files with `onset`, `duration`, and `trial_type`
//! columns; they are validated on load and turned into per-run design
//! matrices on the scan's time axis. Every fitted unit also serializes
//! its design matrix to a TSV sidecar for audit.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use itertools::Itertools;
use ndarray::Array2;
use polars::prelude::*;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DesignError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("the required column '{0}' was not found in the events file")]
    ColumnNotFound(String),
    #[error("missing or null values were found in the events column '{0}'")]
    MissingValuesFound(String),
    #[error("the events column '{column}' contains non-numeric data (found type: {found_type})")]
    ColumnWrongType { column: String, found_type: String },
    #[error("events file declares no trials; a design matrix needs at least one condition")]
    EmptyEvents,
    #[error("repetition time must be positive, got {0}")]
    NonPositiveRepetitionTime(f64),
    #[error("column '{column}' has {found} values but the design has {expected} rows")]
    ColumnLengthMismatch {
        column: String,
        expected: usize,
        found: usize,
    },
}

/// A validated events table: one trial per row.
#[derive(Debug, Clone)]
pub struct EventsTable {
    pub onsets: Vec<f64>,
    pub durations: Vec<f64>,
    pub trial_types: Vec<String>,
}

impl EventsTable {
    /// Reads a BIDS events TSV. The condition column may be named either
    /// `trial_type` (BIDS) or `condition`.
    pub fn from_tsv(path: &Path) -> Result<EventsTable, DesignError> {
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let onsets = extract_numeric_column(&df, "onset")?;
        let durations = extract_numeric_column(&df, "duration")?;

        let condition_column = ["trial_type", "condition"]
            .into_iter()
            .find(|name| df.get_column_names().iter().any(|c| c.as_str() == *name))
            .ok_or_else(|| DesignError::ColumnNotFound("trial_type".to_string()))?;
        let trial_types = extract_string_column(&df, condition_column)?;

        Ok(EventsTable {
            onsets,
            durations,
            trial_types,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.trial_types.is_empty()
    }
}

fn extract_numeric_column(df: &DataFrame, name: &str) -> Result<Vec<f64>, DesignError> {
    let series = df
        .column(name)
        .map_err(|_| DesignError::ColumnNotFound(name.to_string()))?;
    if series.null_count() > 0 {
        return Err(DesignError::MissingValuesFound(name.to_string()));
    }
    let casted = series
        .cast(&DataType::Float64)
        .map_err(|_| DesignError::ColumnWrongType {
            column: name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        })?;
    if casted.null_count() > 0 {
        return Err(DesignError::ColumnWrongType {
            column: name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        });
    }
    Ok(casted.f64()?.rechunk().into_no_null_iter().collect())
}

fn extract_string_column(df: &DataFrame, name: &str) -> Result<Vec<String>, DesignError> {
    let series = df
        .column(name)
        .map_err(|_| DesignError::ColumnNotFound(name.to_string()))?;
    let mut values = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let value = series.get(i).unwrap_or(AnyValue::Null);
        match value {
            AnyValue::Null => return Err(DesignError::MissingValuesFound(name.to_string())),
            other => values.push(other.to_string()),
        }
    }
    Ok(values)
}

/// A design matrix: named regressor columns over rows of time points (or,
/// at group level, sample units). Built fresh per fitting unit.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl DesignMatrix {
    /// Builds a first-level design from condition timing: one boxcar
    /// regressor per distinct condition, sampled at `t = i * tr` for each
    /// of the scan's volumes. Drift and confound terms are deliberately
    /// absent; richer designs belong behind the fitting-engine seam.
    pub fn from_events(
        events: &EventsTable,
        n_volumes: usize,
        tr: f64,
    ) -> Result<DesignMatrix, DesignError> {
        if tr <= 0.0 {
            return Err(DesignError::NonPositiveRepetitionTime(tr));
        }
        if events.is_empty() {
            return Err(DesignError::EmptyEvents);
        }

        let columns: Vec<String> = events
            .trial_types
            .iter()
            .cloned()
            .sorted()
            .dedup()
            .collect();

        let mut values = Array2::<f64>::zeros((n_volumes, columns.len()));
        for ((onset, duration), trial_type) in events
            .onsets
            .iter()
            .zip(&events.durations)
            .zip(&events.trial_types)
        {
            let column = columns
                .iter()
                .position(|c| c == trial_type)
                .expect("column list was built from these trial types");
            for row in 0..n_volumes {
                let t = row as f64 * tr;
                if t >= *onset && t < onset + duration {
                    values[[row, column]] = 1.0;
                }
            }
        }

        Ok(DesignMatrix { columns, values })
    }

    /// A group-level design: a single intercept column of ones.
    pub fn intercept_only(n_rows: usize) -> DesignMatrix {
        DesignMatrix {
            columns: vec!["intercept".to_string()],
            values: Array2::ones((n_rows, 1)),
        }
    }

    /// Appends a named column, checking its length against the design.
    pub fn with_column(mut self, name: &str, column: &[f64]) -> Result<DesignMatrix, DesignError> {
        let n_rows = self.values.nrows();
        if column.len() != n_rows {
            return Err(DesignError::ColumnLengthMismatch {
                column: name.to_string(),
                expected: n_rows,
                found: column.len(),
            });
        }
        let mut values = Array2::<f64>::zeros((n_rows, self.values.ncols() + 1));
        values
            .slice_mut(ndarray::s![.., ..self.values.ncols()])
            .assign(&self.values);
        for (row, value) in column.iter().enumerate() {
            values[[row, self.values.ncols()]] = *value;
        }
        self.columns.push(name.to_string());
        self.values = values;
        Ok(self)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.values.ncols()
    }

    /// Serializes the matrix to a tab-separated sidecar file: a header of
    /// column names, then one row per time point / sample.
    pub fn write_tsv(&self, path: &Path) -> Result<(), DesignError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "{}", self.columns.join("\t"))?;
        for row in self.values.rows() {
            let line = row.iter().map(|v| format!("{v}")).join("\t");
            writeln!(writer, "{line}")?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::io::Write as IoWrite;
    use tempfile::{NamedTempFile, tempdir};

    fn write_events(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn loads_a_bids_events_table() {
        let file = write_events("onset\tduration\ttrial_type\n0.0\t10.0\ttask\n10.0\t10.0\trest\n");
        let events = EventsTable::from_tsv(file.path()).unwrap();
        assert_eq!(events.trial_types, vec!["task", "rest"]);
        assert_abs_diff_eq!(events.onsets[1], 10.0);
    }

    #[test]
    fn accepts_condition_as_a_column_name() {
        let file = write_events("onset\tduration\tcondition\n0.0\t5.0\ttask\n");
        let events = EventsTable::from_tsv(file.path()).unwrap();
        assert_eq!(events.trial_types, vec!["task"]);
    }

    #[test]
    fn missing_timing_column_is_an_error() {
        let file = write_events("onset\ttrial_type\n0.0\ttask\n");
        assert!(matches!(
            EventsTable::from_tsv(file.path()),
            Err(DesignError::ColumnNotFound(column)) if column == "duration"
        ));
    }

    #[test]
    fn boxcar_design_covers_the_scan_time_axis() {
        let events = EventsTable {
            onsets: vec![0.0, 10.0],
            durations: vec![10.0, 10.0],
            trial_types: vec!["task".to_string(), "rest".to_string()],
        };
        // 10 volumes at TR=2s span t = 0..18s.
        let design = DesignMatrix::from_events(&events, 10, 2.0).unwrap();
        assert_eq!(design.n_rows(), 10);
        assert_eq!(design.columns, vec!["rest", "task"]);

        let task = design.column_index("task").unwrap();
        let rest = design.column_index("rest").unwrap();
        // task is active for t in [0, 10): volumes 0..=4.
        assert_abs_diff_eq!(design.values[[0, task]], 1.0);
        assert_abs_diff_eq!(design.values[[4, task]], 1.0);
        assert_abs_diff_eq!(design.values[[5, task]], 0.0);
        // rest is active for t in [10, 20): volumes 5..=9.
        assert_abs_diff_eq!(design.values[[5, rest]], 1.0);
        assert_abs_diff_eq!(design.values[[9, rest]], 1.0);
        assert_abs_diff_eq!(design.values[[0, rest]], 0.0);
    }

    #[test]
    fn non_positive_tr_is_rejected() {
        let events = EventsTable {
            onsets: vec![0.0],
            durations: vec![1.0],
            trial_types: vec!["task".to_string()],
        };
        assert!(matches!(
            DesignMatrix::from_events(&events, 10, 0.0),
            Err(DesignError::NonPositiveRepetitionTime(_))
        ));
    }

    #[test]
    fn weight_column_length_is_checked() {
        let design = DesignMatrix::intercept_only(3);
        assert!(matches!(
            design.with_column("weights", &[1.0, 2.0]),
            Err(DesignError::ColumnLengthMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn tsv_sidecar_has_one_row_per_time_point() {
        let events = EventsTable {
            onsets: vec![0.0],
            durations: vec![20.0],
            trial_types: vec!["task".to_string()],
        };
        let design = DesignMatrix::from_events(&events, 10, 2.0).unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("sub-01_task-motor_bold_design.tsv");
        design.write_tsv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 11); // header + 10 rows
        assert_eq!(lines[0], "task");
    }
}
