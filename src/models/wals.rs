//! Weighted alternating least squares.
//!
//! Unlike plain ALS, unobserved cells count as zero ratings with a small
//! weight, and observed cells of user `u` get weight `1 + row_weights[u]`.
//! Each row update solves
//!
//! ```text
//! (w0 · FᵀF + Σ (c - w0) f fᵀ + λ I) x = Σ c r f
//! ```
//!
//! where `F` holds the factors of the other side and the sums run over the
//! observed cells of the row, so the cost stays proportional to the number
//! of ratings.
use std::time::Instant;

use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{
    check_fit_input, check_predictions, configured_shortname, seeded_rng, uniform_init, Factors,
};
use crate::data::CompressedRatings;
use crate::linalg;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Wals`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
    unobserved_weight: f64,
    regularization: f64,
    row_weights: Option<Vec<f64>>,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 20,
            nb_iterations: 25,
            unobserved_weight: 0.1,
            regularization: 0.1,
            row_weights: None,
            seed: None,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Rank of the factorization.
    pub fn nb_components(mut self, nb_components: usize) -> Self {
        self.nb_components = nb_components;
        self
    }

    /// Number of alternating passes.
    pub fn nb_iterations(mut self, nb_iterations: usize) -> Self {
        self.nb_iterations = nb_iterations;
        self
    }

    /// Weight of every unobserved cell.
    pub fn unobserved_weight(mut self, unobserved_weight: f64) -> Self {
        self.unobserved_weight = unobserved_weight;
        self
    }

    /// L2 penalty on the factors.
    pub fn regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    /// Extra confidence of each user's observed ratings; one entry per user.
    pub fn row_weights(mut self, row_weights: Vec<f64>) -> Self {
        self.row_weights = Some(row_weights);
        self
    }

    /// Seed of the factor initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Wals {
        Wals {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    factors: Factors,
    means: Vec<f64>,
}

/// Weighted alternating least squares model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Wals {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Wals {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }
}

/// Solve the weighted system of every non-empty row of `ratings`.
///
/// `confidence(row, col)` is the weight of an observed cell.
fn update_rows<C>(
    ratings: &CompressedRatings,
    fixed: &Array2<f64>,
    unobserved_weight: f64,
    regularization: f64,
    confidence: C,
    target: &mut Array2<f64>,
) where
    C: Fn(usize, usize) -> f64 + Sync,
{
    let k = fixed.ncols();
    let mut base = fixed.t().dot(fixed) * unobserved_weight;
    for d in 0..k {
        base[[d, d]] += regularization;
    }

    let updates: Vec<Option<Array1<f64>>> = (0..ratings.num_rows())
        .into_par_iter()
        .map(|row_idx| {
            let row = ratings.row(row_idx)?;
            if row.is_empty() {
                return None;
            }

            let mut lhs = base.clone();
            let mut rhs = Array1::<f64>::zeros(k);
            for (&col, &value) in row.indices.iter().zip(row.values) {
                let weight = confidence(row_idx, col);
                let factor = fixed.row(col);
                for a in 0..k {
                    for b in 0..k {
                        lhs[[a, b]] += (weight - unobserved_weight) * factor[a] * factor[b];
                    }
                }
                rhs.scaled_add(weight * value, &factor);
            }

            linalg::solve(&lhs, &rhs)
        })
        .collect();

    for (row_idx, update) in updates.into_iter().enumerate() {
        if let Some(update) = update {
            target.row_mut(row_idx).assign(&update);
        }
    }
}

impl RecommendationAlgorithm for Wals {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;

        let row_confidence: Vec<f64> = match self.hyper.row_weights {
            Some(ref weights) if weights.len() != nb_users => {
                return Err(FittingError::DimensionMismatch {
                    what: "row weights",
                    expected: nb_users,
                    actual: weights.len(),
                })
            }
            Some(ref weights) => weights.iter().map(|weight| 1.0 + weight).collect(),
            None => vec![1.0; nb_users],
        };
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let means = ratings.row_means();
        let by_user = ratings.center_rows(&means);
        let by_work = by_user.transpose();
        tracing::debug!(elapsed = ?start.elapsed(), "fill and center matrix");

        let k = self.hyper.nb_components;
        let mut rng = seeded_rng(self.hyper.seed);
        let mut users = uniform_init(nb_users, k, &mut rng);
        let mut works = uniform_init(nb_works, k, &mut rng);

        for iteration in 0..self.hyper.nb_iterations {
            update_rows(
                &by_user,
                &works,
                self.hyper.unobserved_weight,
                self.hyper.regularization,
                |user, _| row_confidence[user],
                &mut users,
            );
            update_rows(
                &by_work,
                &users,
                self.hyper.unobserved_weight,
                self.hyper.regularization,
                |_, user| row_confidence[user],
                &mut works,
            );
            tracing::debug!(iteration, "WALS step");
        }
        tracing::debug!(elapsed = ?start.elapsed(), "factor matrix");

        self.fitted = Some(Fitted {
            factors: Factors::new(users, works),
            means,
        });

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let fitted = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.iter()
                .map(|&(user, work)| fitted.factors.score(user, work) + fitted.means[user])
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(
            format!("wals-{}", self.hyper.nb_components),
            &self.hyper,
            &["nb_components"],
        )
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn unzip(&mut self) {
        if let Some(ref mut fitted) = self.fitted {
            fitted.factors.unzip();
        }
    }

    fn is_unzipped(&self) -> bool {
        self.fitted
            .as_ref()
            .map_or(false, |fitted| fitted.factors.is_unzipped())
    }
}
