//! Alternating least squares with global, user and work biases.
//!
//! Predictions are `w + b_u + b_i + U[u]·V[i]` on raw ratings. Each row
//! update solves the ridge system for the latent vector first, then sets
//! the row bias to the shrunk mean residual.
use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::als::ridge;
use super::{
    check_fit_input, check_predictions, configured_shortname, seeded_rng, uniform_init, Factors,
};
use crate::data::CompressedRatings;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Als2`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
    lambda: f64,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 20,
            nb_iterations: 20,
            lambda: 0.1,
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

    /// Ridge penalty per observed rating.
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// Seed of the factor initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Als2 {
        Als2 {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    factors: Factors,
    global_bias: f64,
    user_biases: Vec<f64>,
    work_biases: Vec<f64>,
}

/// Biased alternating least squares model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Als2 {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Als2 {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }
}

/// One side of the alternation: new latent vectors and biases for every
/// row of `ratings`, given the other side.
fn update_side(
    ratings: &CompressedRatings,
    fixed: &Array2<f64>,
    fixed_biases: &[f64],
    global_bias: f64,
    lambda: f64,
    target: &mut Array2<f64>,
    target_biases: &mut [f64],
) {
    let updates: Vec<Option<(Array1<f64>, f64)>> = (0..ratings.num_rows())
        .into_par_iter()
        .map(|row_idx| {
            let row = ratings.row(row_idx)?;
            if row.is_empty() {
                return None;
            }

            let residuals: Array1<f64> = row
                .indices
                .iter()
                .zip(row.values)
                .map(|(&col, &value)| value - global_bias - fixed_biases[col])
                .collect();

            let basis = fixed.select(Axis(0), row.indices);
            let latent = ridge(&basis, residuals.view(), lambda)?;
            let bias = (&residuals - &basis.dot(&latent)).mean()? / (1.0 + lambda);

            Some((latent, bias))
        })
        .collect();

    for (row_idx, update) in updates.into_iter().enumerate() {
        if let Some((latent, bias)) = update {
            target.row_mut(row_idx).assign(&latent);
            target_biases[row_idx] = bias;
        }
    }
}

impl RecommendationAlgorithm for Als2 {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let start = Instant::now();

        let by_user = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let by_work = by_user.transpose();
        let global_bias = ArrayView1::from(y).mean().unwrap_or(0.0);

        let mut rng = seeded_rng(self.hyper.seed);
        let k = self.hyper.nb_components;
        let mut users = uniform_init(nb_users, k, &mut rng);
        let mut works = uniform_init(nb_works, k, &mut rng);
        let mut user_biases = vec![0.0; nb_users];
        let mut work_biases = vec![0.0; nb_works];

        for iteration in 0..self.hyper.nb_iterations {
            update_side(
                &by_user,
                &works,
                &work_biases,
                global_bias,
                self.hyper.lambda,
                &mut users,
                &mut user_biases,
            );
            update_side(
                &by_work,
                &users,
                &user_biases,
                global_bias,
                self.hyper.lambda,
                &mut works,
                &mut work_biases,
            );
            tracing::debug!(iteration, "ALS2 step");
        }
        tracing::debug!(elapsed = ?start.elapsed(), "factor matrix");

        self.fitted = Some(Fitted {
            factors: Factors::new(users, works),
            global_bias,
            user_biases,
            work_biases,
        });

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let fitted = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.iter()
                .map(|&(user, work)| {
                    fitted.factors.score(user, work)
                        + fitted.user_biases[user]
                        + fitted.work_biases[work]
                        + fitted.global_bias
                })
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(
            format!("als2-{}", self.hyper.nb_components),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_rmse;

    #[test]
    fn biases_capture_offsets() {
        // Every rating is 3, so everything is explained by the biases.
        let x: Vec<(usize, usize)> = (0..4)
            .flat_map(|user| (0..3).map(move |work| (user, work)))
            .collect();
        let y = vec![3.0; x.len()];

        let mut model = Als2::new().nb_components(2).nb_iterations(10).seed(2).build();
        model.set_parameters(4, 3);
        model.fit(&x, &y).unwrap();

        let predictions = model.predict(&x).unwrap();
        assert!(compute_rmse(&predictions, &y) < 0.1);
    }

    #[test]
    fn unseen_work_uses_global_bias() {
        let x = vec![(0, 0), (1, 0), (1, 1)];
        let y = vec![1.0, 2.0, 3.0];

        let mut model = Als2::new().nb_components(2).seed(4).build();
        model.set_parameters(2, 3);
        model.fit(&x, &y).unwrap();

        assert!(model.predict(&[(0, 2)]).unwrap()[0].is_finite());
        assert_eq!(model.shortname(), "als2-2");
    }
}
