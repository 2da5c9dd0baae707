//! Shaping of caller-supplied feature windows.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// A validated `[T, F]` feature window.
pub type FeatureWindow = DMatrix<f64>;

/// `X` as it arrives on the wire: a `[T, F]` table or a flat `[F]` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawWindow {
    Table(Vec<Vec<f64>>),
    Row(Vec<f64>),
}

/// A `[B, T, F]` batch; each sample is one `[T, F]` matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceBatch {
    samples: Vec<DMatrix<f64>>,
}

impl SequenceBatch {
    pub fn samples(&self) -> &[DMatrix<f64>] {
        &self.samples
    }

    /// `[B, T, F]`
    pub fn shape(&self) -> (usize, usize, usize) {
        match self.samples.first() {
            Some(first) => (self.samples.len(), first.nrows(), first.ncols()),
            None => (0, 0, 0),
        }
    }
}

/// Interprets `X` as a two-dimensional array; a flat row becomes `[1, F]`.
pub fn to_array(raw: &RawWindow) -> Result<FeatureWindow, InferenceError> {
    match raw {
        RawWindow::Row(row) => {
            if row.is_empty() {
                return Err(InferenceError::InputShape("X must not be empty".to_string()));
            }
            Ok(DMatrix::from_row_slice(1, row.len(), row))
        }
        RawWindow::Table(rows) => {
            let width = match rows.first() {
                Some(first) => first.len(),
                None => return Err(InferenceError::InputShape("X must not be empty".to_string())),
            };
            if width == 0 {
                return Err(InferenceError::InputShape("X rows must not be empty".to_string()));
            }
            if let Some((idx, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != width) {
                return Err(InferenceError::InputShape(format!(
                    "X must be a 2D array [T, F]: row {} has {} values, expected {}",
                    idx,
                    row.len(),
                    width
                )));
            }
            Ok(DMatrix::from_row_iterator(
                rows.len(),
                width,
                rows.iter().flatten().copied(),
            ))
        }
    }
}

/// `[T, F] → [1, F]`: the most recent observation.
pub fn last_step(x: &FeatureWindow) -> Result<FeatureWindow, InferenceError> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(InferenceError::InputShape(
            "X must be 2D [T, F] or [1, F] with at least one value".to_string(),
        ));
    }
    Ok(x.rows(x.nrows() - 1, 1).into_owned())
}

/// `[T, F] → [1, T, F]` for single-request sequence inference.
pub fn prepare_sequence_batch(x: &FeatureWindow) -> Result<SequenceBatch, InferenceError> {
    if x.nrows() == 0 || x.ncols() == 0 {
        return Err(InferenceError::InputShape(
            "sequence models expect a 2D [T, F] window before batching".to_string(),
        ));
    }
    Ok(SequenceBatch {
        samples: vec![x.clone()],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(t: usize, f: usize) -> FeatureWindow {
        DMatrix::from_fn(t, f, |r, c| (r * 10 + c) as f64)
    }

    #[test]
    fn flat_row_becomes_single_row() {
        let x = to_array(&RawWindow::Row(vec![1.0, 2.0, 3.0])).unwrap();
        assert_eq!(x.shape(), (1, 3));
        assert_eq!(x, DMatrix::from_row_slice(1, 3, &[1.0, 2.0, 3.0]));
    }

    #[test]
    fn table_keeps_row_order() {
        let x = to_array(&RawWindow::Table(vec![vec![1.0, 2.0], vec![3.0, 4.0]])).unwrap();
        assert_eq!(x[(0, 1)], 2.0);
        assert_eq!(x[(1, 0)], 3.0);
    }

    #[test]
    fn rejects_ragged_and_empty_tables() {
        let ragged = RawWindow::Table(vec![vec![1.0, 2.0], vec![3.0]]);
        assert!(matches!(to_array(&ragged), Err(InferenceError::InputShape(_))));
        assert!(to_array(&RawWindow::Table(vec![])).is_err());
        assert!(to_array(&RawWindow::Table(vec![vec![]])).is_err());
        assert!(to_array(&RawWindow::Row(vec![])).is_err());
    }

    #[test]
    fn wire_format_accepts_both_shapes() {
        let table: RawWindow = serde_json::from_str("[[1, 2], [3, 4]]").unwrap();
        assert!(matches!(table, RawWindow::Table(_)));
        let row: RawWindow = serde_json::from_str("[1, 2, 3]").unwrap();
        assert_eq!(row, RawWindow::Row(vec![1.0, 2.0, 3.0]));
        assert!(serde_json::from_str::<RawWindow>("[[[1]]]").is_err());
    }

    #[test]
    fn last_step_takes_final_row() {
        let x = window(5, 3);
        let last = last_step(&x).unwrap();
        assert_eq!(last.shape(), (1, 3));
        assert_eq!(last, x.rows(4, 1).into_owned());
    }

    #[test]
    fn last_step_on_single_row_is_identity() {
        let x = window(1, 3);
        assert_eq!(last_step(&x).unwrap(), x);
    }

    #[test]
    fn sequence_batch_adds_leading_dimension() {
        let x = window(5, 3);
        let batch = prepare_sequence_batch(&x).unwrap();
        assert_eq!(batch.shape(), (1, 5, 3));
        assert_eq!(batch.samples()[0], x);
    }

    #[test]
    fn empty_windows_are_shape_errors() {
        let empty = DMatrix::<f64>::zeros(0, 3);
        assert!(matches!(last_step(&empty), Err(InferenceError::InputShape(_))));
        assert!(matches!(prepare_sequence_batch(&empty), Err(InferenceError::InputShape(_))));
    }
}
