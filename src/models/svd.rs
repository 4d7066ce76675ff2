//! Truncated SVD of the mean-centered rating matrix.
use std::time::Instant;

use ndarray::Array1;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions, configured_shortname, Factors};
use crate::data::CompressedRatings;
use crate::linalg;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Seed of the randomized decomposition. Fixed so that refitting the same
/// data gives the same factors and cached backups stay valid.
const RANDOM_STATE: u64 = 42;

/// Hyperparameters for the [`Svd`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 20,
            nb_iterations: 10,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Number of singular values kept.
    pub fn nb_components(mut self, nb_components: usize) -> Self {
        self.nb_components = nb_components;
        self
    }

    /// Number of power iterations refining the random sketch.
    pub fn nb_iterations(mut self, nb_iterations: usize) -> Self {
        self.nb_iterations = nb_iterations;
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Svd {
        Svd {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    /// `U · diag(sigma)` as users and `Vᵀ` transposed as works.
    factors: Factors,
    sigma: Array1<f64>,
    means: Vec<f64>,
}

/// Randomized truncated SVD model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Svd {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Svd {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// Singular values, largest first.
    pub fn singular_values(&self) -> Option<&Array1<f64>> {
        self.fitted.as_ref().map(|fitted| &fitted.sigma)
    }
}

impl RecommendationAlgorithm for Svd {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let means = ratings.row_means();
        let dense = ratings.center_rows(&means).to_dense();
        tracing::debug!(elapsed = ?start.elapsed(), "fill and center matrix");

        let mut rng = XorShiftRng::seed_from_u64(RANDOM_STATE);
        let svd = linalg::randomized_svd(
            &dense,
            self.hyper.nb_components,
            self.hyper.nb_iterations,
            &mut rng,
        )
        .ok_or(FittingError::NotConverged)?;
        tracing::debug!(elapsed = ?start.elapsed(), rank = svd.sigma.len(), "factor matrix");

        let mut users = svd.u;
        for (mut column, &singular_value) in users.columns_mut().into_iter().zip(svd.sigma.iter()) {
            column *= singular_value;
        }

        self.fitted = Some(Fitted {
            factors: Factors::new(users, svd.vt.reversed_axes()),
            sigma: svd.sigma,
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
            format!("svd-{}", self.hyper.nb_components),
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

    fn ratings() -> (Vec<(usize, usize)>, Vec<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for user in 0..6 {
            for work in 0..5 {
                if (user + work) % 4 != 0 {
                    x.push((user, work));
                    y.push(((user * 3 + work * 7) % 5) as f64 - 2.0);
                }
            }
        }
        (x, y)
    }

    fn fit(x: &[(usize, usize)], y: &[f64]) -> Svd {
        let mut model = Svd::new().nb_components(3).nb_iterations(5).build();
        model.set_parameters(6, 5);
        model.fit(x, y).unwrap();
        model
    }

    #[test]
    fn refitting_is_deterministic() {
        let (x, y) = ratings();
        let first = fit(&x, &y);
        let second = fit(&x, &y);

        assert_eq!(first.fitted, second.fitted);
        assert_eq!(first.predict(&x).unwrap(), second.predict(&x).unwrap());
    }

    #[test]
    fn full_rank_reconstructs_centered_matrix() {
        let (x, y) = ratings();
        let mut model = Svd::new().nb_components(5).build();
        model.set_parameters(6, 5);
        model.fit(&x, &y).unwrap();

        assert!(compute_rmse(&model.predict(&x).unwrap(), &y) < 1e-6);
        let sigma = model.singular_values().unwrap();
        assert!(sigma.windows(2).into_iter().all(|w| w[0] >= w[1]));
    }

    #[test]
    fn rank_is_capped_but_name_is_not() {
        let (x, y) = ratings();
        let mut model = Svd::new().build();
        model.set_parameters(6, 5);
        model.fit(&x, &y).unwrap();

        assert_eq!(model.singular_values().unwrap().len(), 5);
        assert_eq!(model.shortname(), "svd-20");
    }
}
