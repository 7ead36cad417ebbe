//! # Subject Signal Loading
//!
//! Reads one delimited text file per subject into an `Array2<f64>` with one
//! row per sample and one column per feature. The first row holds the
//! feature names; every other field must be a finite number. Files ending in
//! `.tsv` are tab-separated, anything else is comma-separated.

use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A comprehensive error type for signal loading failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error reading delimited file: {0}")]
    CsvError(#[from] csv::Error),
    #[error("File '{0}' has no header row naming the features.")]
    MissingHeader(String),
    #[error("File '{0}' contains no data rows.")]
    NoDataRows(String),
    #[error("File '{path}', data row {row}, column '{column}': '{value}' is not a finite number.")]
    InvalidValue {
        path: String,
        row: usize,
        column: String,
        value: String,
    },
    #[error("Could not arrange the values of '{path}' into a matrix: {source}")]
    Shape {
        path: String,
        source: ndarray::ShapeError,
    },
    #[error("File '{path}' has features {found:?}, but '{reference}' has {expected:?}.")]
    FeatureMismatch {
        path: String,
        reference: String,
        found: Vec<String>,
        expected: Vec<String>,
    },
    #[error("No subject files were given.")]
    NoFiles,
}

/// The signals of one subject.
#[derive(Debug, Clone)]
pub struct SubjectSignals {
    pub feature_names: Vec<String>,
    /// Shape `[n_samples, n_features]`.
    pub signals: Array2<f64>,
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => b'\t',
        _ => b',',
    }
}

pub fn load_subject_signals(path: &Path) -> Result<SubjectSignals, DataError> {
    let display = path.display().to_string();
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let feature_names: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    if feature_names.is_empty() || feature_names.iter().all(String::is_empty) {
        return Err(DataError::MissingHeader(display));
    }

    let mut values = Vec::new();
    let mut n_rows = 0;
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        for (column, field) in record.iter().enumerate() {
            let value = field
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| DataError::InvalidValue {
                    path: display.clone(),
                    row: row + 1,
                    column: feature_names[column].clone(),
                    value: field.to_string(),
                })?;
            values.push(value);
        }
        n_rows += 1;
    }
    if n_rows == 0 {
        return Err(DataError::NoDataRows(display));
    }

    let signals = Array2::from_shape_vec((n_rows, feature_names.len()), values).map_err(
        |source| DataError::Shape {
            path: display.clone(),
            source,
        },
    )?;
    log::debug!(
        "Loaded {} samples of {} features from {}",
        signals.nrows(),
        signals.ncols(),
        display
    );
    Ok(SubjectSignals {
        feature_names,
        signals,
    })
}

/// Loads every file and checks that they all name the same features, in the
/// same order. Returns the shared feature names and one matrix per file.
pub fn load_subjects(paths: &[PathBuf]) -> Result<(Vec<String>, Vec<Array2<f64>>), DataError> {
    let (first_path, rest) = paths.split_first().ok_or(DataError::NoFiles)?;
    let first = load_subject_signals(first_path)?;
    let mut subjects = Vec::with_capacity(paths.len());
    subjects.push(first.signals);

    for path in rest {
        let subject = load_subject_signals(path)?;
        if subject.feature_names != first.feature_names {
            return Err(DataError::FeatureMismatch {
                path: path.display().to_string(),
                reference: first_path.display().to_string(),
                found: subject.feature_names,
                expected: first.feature_names,
            });
        }
        subjects.push(subject.signals);
    }
    Ok((first.feature_names, subjects))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn csv_and_tsv_files_are_parsed() {
        let dir = tempdir().unwrap();
        let csv_path = dir.path().join("a.csv");
        fs::write(&csv_path, "r1,r2,r3\n1.0,2.0,3.0\n-1.5, 0.5 ,2e-1\n").unwrap();
        let tsv_path = dir.path().join("b.tsv");
        fs::write(&tsv_path, "r1\tr2\tr3\n4\t5\t6\n").unwrap();

        let a = load_subject_signals(&csv_path).unwrap();
        assert_eq!(a.feature_names, vec!["r1", "r2", "r3"]);
        assert_eq!(a.signals, array![[1.0, 2.0, 3.0], [-1.5, 0.5, 0.2]]);

        let (names, subjects) = load_subjects(&[csv_path, tsv_path]).unwrap();
        assert_eq!(names.len(), 3);
        assert_eq!(subjects[1], array![[4.0, 5.0, 6.0]]);
    }

    #[test]
    fn non_numeric_fields_are_reported_with_their_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "x,y\n1,2\n3,NaN\n").unwrap();
        match load_subject_signals(&path) {
            Err(DataError::InvalidValue { row, column, .. }) => {
                assert_eq!(row, 2);
                assert_eq!(column, "y");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn differing_headers_are_rejected() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        fs::write(&a, "x,y\n1,2\n").unwrap();
        fs::write(&b, "x,z\n1,2\n").unwrap();
        assert!(matches!(
            load_subjects(&[a, b]),
            Err(DataError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn header_only_file_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        fs::write(&path, "x,y\n").unwrap();
        assert!(matches!(
            load_subject_signals(&path),
            Err(DataError::NoDataRows(_))
        ));
        assert!(matches!(load_subjects(&[]), Err(DataError::NoFiles)));
    }
}
