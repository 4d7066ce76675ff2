//! Non-negative matrix factorization of the rating matrix.
//!
//! Unrated cells count as zeros, so `W · Hᵀ` approximates the whole
//! matrix. Both factors follow the multiplicative updates of Lee and Seung,
//! which keep them non-negative and never increase the squared
//! reconstruction error.
use std::time::Instant;

use ndarray::{Array2, Zip};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions, configured_shortname, seeded_rng, Factors};
use crate::data::CompressedRatings;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Keeps the multiplicative updates away from divisions by zero.
const EPSILON: f64 = 1e-10;

/// Hyperparameters for the [`Nmf`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 10,
            nb_iterations: 200,
            seed: Some(42),
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Number of non-negative components.
    pub fn nb_components(mut self, nb_components: usize) -> Self {
        self.nb_components = nb_components;
        self
    }

    /// Number of multiplicative update passes.
    pub fn nb_iterations(mut self, nb_iterations: usize) -> Self {
        self.nb_iterations = nb_iterations;
        self
    }

    /// Seed of the factor initialization; 42 unless set.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Nmf {
        Nmf {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

/// Non-negative matrix factorization model.
///
/// Only non-negative ratings are accepted, such as numeric star ratings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Nmf {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Factors>,
}

impl Nmf {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// Fitted `(W, H)` factors, one row per user and per work.
    pub fn factors(&self) -> Option<(&Array2<f64>, &Array2<f64>)> {
        self.fitted
            .as_ref()
            .map(|factors| (&factors.users, &factors.works))
    }
}

fn multiplicative_update(factor: &mut Array2<f64>, numerator: &Array2<f64>, denominator: &Array2<f64>) {
    Zip::from(factor)
        .and(numerator)
        .and(denominator)
        .for_each(|value, &num, &den| *value *= num / (den + EPSILON));
}

impl RecommendationAlgorithm for Nmf {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        if let Some(&value) = y.iter().find(|&&value| value < 0.0) {
            return Err(FittingError::NegativeRating { value });
        }
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y).to_dense();
        tracing::debug!(elapsed = ?start.elapsed(), "fill matrix");

        let nb_components = self.hyper.nb_components;
        let scale = (ratings.mean().unwrap_or(0.0) / nb_components.max(1) as f64).sqrt();
        let mut rng = seeded_rng(self.hyper.seed);
        let mut init = |rows: usize| {
            Array2::from_shape_simple_fn((rows, nb_components), || {
                scale * rng.sample::<f64, _>(StandardNormal).abs()
            })
        };
        let mut users = init(nb_users);
        let mut works = init(nb_works);

        for iteration in 0..self.hyper.nb_iterations {
            let numerator = ratings.t().dot(&users);
            let denominator = works.dot(&users.t().dot(&users));
            multiplicative_update(&mut works, &numerator, &denominator);

            let numerator = ratings.dot(&works);
            let denominator = users.dot(&works.t().dot(&works));
            multiplicative_update(&mut users, &numerator, &denominator);

            if tracing::enabled!(tracing::Level::DEBUG) {
                let residual = &ratings - &users.dot(&works.t());
                tracing::debug!(
                    iteration,
                    error = residual.mapv(|value| value * value).sum().sqrt(),
                    "NMF step"
                );
            }
        }
        tracing::debug!(elapsed = ?start.elapsed(), "factor matrix");

        self.fitted = Some(Factors::new(users, works));

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let factors = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.iter()
                .map(|&(user, work)| factors.score(user, work))
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(
            format!("nmf-{}", self.hyper.nb_components),
            &self.hyper,
            &["nb_components"],
        )
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn unzip(&mut self) {
        if let Some(ref mut factors) = self.fitted {
            factors.unzip();
        }
    }

    fn is_unzipped(&self) -> bool {
        self.fitted
            .as_ref()
            .map_or(false, |factors| factors.is_unzipped())
    }
}
