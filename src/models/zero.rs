//! The control baseline: predicts 0 for everything.
use serde::{Deserialize, Serialize};

use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Baseline model with no parameters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Zero {
    #[serde(skip)]
    dimensions: Option<(usize, usize)>,
}

impl Zero {
    /// The zero baseline.
    pub fn new() -> Self {
        Zero::default()
    }
}

impl RecommendationAlgorithm for Zero {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, _x: &[(UserIdx, WorkIdx)], _y: &[f64]) -> Result<(), FittingError> {
        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        Ok(vec![0.0; x.len()])
    }

    fn shortname(&self) -> String {
        "zero".to_owned()
    }
}
