//! Conversion of rating choices into numeric scores.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::dataset::DatasetError;

/// How choice strings become numbers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RatingValues {
    /// A fixed lookup table; choices missing from it are rejected.
    Table(HashMap<String, f64>),
    /// Choices are already numbers written as text (e.g. MovieLens stars).
    Numeric,
}

impl RatingValues {
    /// The table used by the website.
    pub fn choices() -> Self {
        RatingValues::from_pairs(&[
            ("favorite", 4.0),
            ("like", 2.0),
            ("dislike", -2.0),
            ("neutral", 0.1),
            ("willsee", 0.5),
            ("wontsee", -0.5),
        ])
    }

    /// The reduced table used for the diversity deck experiments.
    pub fn dpp() -> Self {
        RatingValues::from_pairs(&[("like", 2.0), ("dislike", -2.0), ("dontknow", 0.0)])
    }

    /// A table from `(choice, value)` pairs.
    pub fn from_pairs(pairs: &[(&str, f64)]) -> Self {
        RatingValues::Table(
            pairs
                .iter()
                .map(|&(choice, value)| (choice.to_owned(), value))
                .collect(),
        )
    }

    /// Numeric value of `choice`.
    pub fn value(&self, choice: &str) -> Result<f64, DatasetError> {
        let value = match self {
            RatingValues::Table(table) => table.get(choice).cloned(),
            RatingValues::Numeric => choice.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        };

        value.ok_or_else(|| DatasetError::UnknownChoice {
            choice: choice.to_owned(),
        })
    }
}

impl Default for RatingValues {
    fn default() -> Self {
        RatingValues::choices()
    }
}
