//! Alternating least squares on mean-centered ratings.
//!
//! Predictions are `mean_u + U[u]·V[i]`. Each pass solves one ridge
//! regression per user against the current work factors, then one per work
//! against the new user factors. The penalty of a row grows with its number
//! of ratings.
use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{
    check_fit_input, check_predictions, configured_shortname, seeded_rng, uniform_init, Factors,
};
use crate::data::CompressedRatings;
use crate::linalg;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Als`] model.
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
    pub fn build(self) -> Als {
        Als {
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

/// Alternating least squares model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Als {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Als {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// The hyperparameters the model was built with.
    pub fn hyperparameters(&self) -> &Hyperparameters {
        &self.hyper
    }

    /// Fitted `(U, V)` factors, if any.
    pub fn factors(&self) -> Option<(&Array2<f64>, &Array2<f64>)> {
        self.fitted
            .as_ref()
            .map(|fitted| (&fitted.factors.users, &fitted.factors.works))
    }

    /// Mean rating of every user seen at fit time.
    pub fn user_means(&self) -> Option<&[f64]> {
        self.fitted.as_ref().map(|fitted| fitted.means.as_slice())
    }
}

impl RecommendationAlgorithm for Als {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let means = ratings.row_means();
        let centered = ratings.center_rows(&means);
        tracing::debug!(elapsed = ?start.elapsed(), "fill and center matrix");

        let mut rng = seeded_rng(self.hyper.seed);
        let (users, works) = factorize(
            &centered,
            self.hyper.nb_components,
            self.hyper.nb_iterations,
            self.hyper.lambda,
            &mut rng,
        );
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
            format!("als-{}", self.hyper.nb_components),
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

/// Factorize centered `ratings` into uniformly initialized `(U, V)`.
pub(crate) fn factorize<R: Rng>(
    ratings: &CompressedRatings,
    nb_components: usize,
    nb_iterations: usize,
    lambda: f64,
    rng: &mut R,
) -> (Array2<f64>, Array2<f64>) {
    let by_work = ratings.transpose();

    let mut users = uniform_init(ratings.num_rows(), nb_components, rng);
    let mut works = uniform_init(ratings.num_cols(), nb_components, rng);

    for iteration in 0..nb_iterations {
        update_rows(ratings, &works, lambda, &mut users);
        update_rows(&by_work, &users, lambda, &mut works);

        if tracing::enabled!(tracing::Level::DEBUG) {
            tracing::debug!(
                iteration,
                train_rmse = training_rmse(ratings, &users, &works),
                "ALS step"
            );
        }
    }

    (users, works)
}

/// Replace every non-empty row of `target` with its ridge solution against
/// the `fixed` factors of the columns it rated.
///
/// Rows without ratings, or whose system is singular, are left untouched.
pub(crate) fn update_rows(
    ratings: &CompressedRatings,
    fixed: &Array2<f64>,
    lambda: f64,
    target: &mut Array2<f64>,
) {
    let updates: Vec<Option<Array1<f64>>> = (0..ratings.num_rows())
        .into_par_iter()
        .map(|row_idx| {
            let row = ratings.row(row_idx)?;
            if row.is_empty() {
                return None;
            }

            let basis = fixed.select(Axis(0), row.indices);
            ridge(&basis, ArrayView1::from(row.values), lambda)
        })
        .collect();

    for (row_idx, update) in updates.into_iter().enumerate() {
        if let Some(update) = update {
            target.row_mut(row_idx).assign(&update);
        }
    }
}

/// Closed-form `(BᵀB + λ n I)⁻¹ Bᵀ t` for a basis with `n` rows.
pub(crate) fn ridge(basis: &Array2<f64>, targets: ArrayView1<f64>, lambda: f64) -> Option<Array1<f64>> {
    let mut gram = basis.t().dot(basis);
    let penalty = lambda * basis.nrows() as f64;
    for d in 0..gram.nrows() {
        gram[[d, d]] += penalty;
    }

    linalg::solve(&gram, &basis.t().dot(&targets))
}

fn training_rmse(ratings: &CompressedRatings, users: &Array2<f64>, works: &Array2<f64>) -> f64 {
    let mut squared_error = 0.0;
    for row in ratings.iter_rows() {
        for (&work, &value) in row.indices.iter().zip(row.values) {
            let error = users.row(row.index).dot(&works.row(work)) - value;
            squared_error += error * error;
        }
    }

    (squared_error / ratings.nnz().max(1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_rmse;

    fn toy() -> (Vec<(usize, usize)>, Vec<f64>) {
        let x = vec![(0, 0), (0, 1), (1, 0), (1, 2), (2, 3), (2, 1), (3, 2)];
        let y = vec![2.0, -2.0, 2.0, 2.0, 4.0, 0.5, -0.5];
        (x, y)
    }

    #[test]
    fn fits_training_data() {
        let (x, y) = toy();
        let mut model = Als::new().nb_components(3).nb_iterations(10).lambda(0.01).seed(1).build();
        model.set_parameters(5, 4);
        model.fit(&x, &y).unwrap();

        let predictions = model.predict(&x).unwrap();
        assert!(compute_rmse(&predictions, &y) < 1.0);
    }

    #[test]
    fn empty_rows_keep_their_initialization() {
        let (x, y) = toy();
        let mut model = Als::new().nb_components(2).seed(3).build();
        model.set_parameters(5, 4);
        model.fit(&x, &y).unwrap();

        let (users, _) = model.factors().unwrap();
        assert!(users.row(4).iter().all(|value| (0.0..1.0).contains(value)));
        assert_eq!(model.user_means().unwrap()[4], 0.0);

        // A user without ratings still gets a finite score.
        assert!(model.predict(&[(4, 0)]).unwrap()[0].is_finite());
    }

    #[test]
    fn same_seed_same_model() {
        let (x, y) = toy();
        let fit = || {
            let mut model = Als::new().nb_components(2).nb_iterations(4).seed(11).build();
            model.set_parameters(5, 4);
            model.fit(&x, &y).unwrap();
            model.predict(&x).unwrap()
        };

        assert_eq!(fit(), fit());
    }

    #[test]
    fn unzip_caches_the_product() {
        let (x, y) = toy();
        let mut model = Als::new().nb_components(2).seed(5).build();
        model.set_parameters(5, 4);
        model.fit(&x, &y).unwrap();
        let before = model.predict(&x).unwrap();

        assert!(!model.is_unzipped());
        model.unzip();
        assert!(model.is_unzipped());

        for (a, b) in before.iter().zip(model.predict(&x).unwrap()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn shortname_carries_the_rank() {
        assert_eq!(Als::new().build().shortname(), "als-20");
        assert_eq!(Als::new().nb_components(7).build().shortname(), "als-7");
    }
}
