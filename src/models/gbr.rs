//! Gradient boosting on top of ALS factors.
//!
//! ALS is trained first; every `(user, work)` pair then becomes the feature
//! vector `[U[u], V[i], U[u] ⊙ V[i]]`, followed by the tags of the work when
//! side information was loaded, and a boosted tree ensemble regresses the
//! ratings on it.
use std::time::Instant;

use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use super::als::Als;
use super::boosting::GradientBoosting;
use super::{check_predictions, configured_shortname};
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Gbr`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
    lambda: f64,
    nb_estimators: usize,
    learning_rate: f64,
    max_depth: usize,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 10,
            nb_iterations: 10,
            lambda: 0.1,
            nb_estimators: 100,
            learning_rate: 0.1,
            max_depth: 3,
            seed: None,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Rank of the underlying ALS.
    pub fn nb_components(mut self, nb_components: usize) -> Self {
        self.nb_components = nb_components;
        self
    }

    /// Number of ALS passes behind the features.
    pub fn nb_iterations(mut self, nb_iterations: usize) -> Self {
        self.nb_iterations = nb_iterations;
        self
    }

    /// Ridge penalty per observed rating.
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// Number of boosted trees.
    pub fn nb_estimators(mut self, nb_estimators: usize) -> Self {
        self.nb_estimators = nb_estimators;
        self
    }

    /// Shrinkage applied to every tree.
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Depth of every regression tree.
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Seed of the ALS initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Gbr {
        let mut als = Als::new()
            .nb_components(self.nb_components)
            .nb_iterations(self.nb_iterations)
            .lambda(self.lambda);
        if let Some(seed) = self.seed {
            als = als.seed(seed);
        }

        Gbr {
            hyper: self,
            als: als.build(),
            tags: None,
            boosting: None,
        }
    }
}

/// Boosted trees over ALS features.
///
/// Only the hyperparameters are serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Hyperparameters", into = "Hyperparameters")]
pub struct Gbr {
    hyper: Hyperparameters,
    als: Als,
    tags: Option<Array2<f64>>,
    boosting: Option<GradientBoosting>,
}

impl From<Hyperparameters> for Gbr {
    fn from(hyper: Hyperparameters) -> Self {
        hyper.build()
    }
}

impl From<Gbr> for Hyperparameters {
    fn from(model: Gbr) -> Self {
        model.hyper
    }
}

impl Gbr {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// One feature row per pair.
    fn features(&self, x: &[(UserIdx, WorkIdx)]) -> Option<Array2<f64>> {
        let (users, works) = self.als.factors()?;
        let k = users.ncols();
        let nb_tags = self.tags.as_ref().map_or(0, |tags| tags.ncols());

        let mut features = Array2::zeros((x.len(), 3 * k + nb_tags));
        for (mut row, &(user, work)) in features.outer_iter_mut().zip(x) {
            let user_factors = users.row(user);
            let work_factors = works.row(work);

            row.slice_mut(s![..k]).assign(&user_factors);
            row.slice_mut(s![k..2 * k]).assign(&work_factors);
            row.slice_mut(s![2 * k..3 * k])
                .assign(&(&user_factors * &work_factors));
            if let Some(ref tags) = self.tags {
                row.slice_mut(s![3 * k..]).assign(&tags.row(work));
            }
        }

        Some(features)
    }
}

impl RecommendationAlgorithm for Gbr {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.als.set_parameters(nb_users, nb_works);
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        self.als.fit(x, y)?;
        let start = Instant::now();

        let (_, works) = self.als.factors().ok_or(FittingError::NotParameterized)?;
        if let Some(ref tags) = self.tags {
            if tags.nrows() != works.nrows() {
                return Err(FittingError::DimensionMismatch {
                    what: "tag rows",
                    expected: works.nrows(),
                    actual: tags.nrows(),
                });
            }
        }

        let features = self.features(x).ok_or(FittingError::NotParameterized)?;
        tracing::debug!(
            elapsed = ?start.elapsed(),
            nb_features = features.ncols(),
            "build features"
        );

        self.boosting = Some(GradientBoosting::fit(
            &features,
            y,
            self.hyper.nb_estimators,
            self.hyper.learning_rate,
            self.hyper.max_depth,
        ));
        tracing::debug!(elapsed = ?start.elapsed(), "boost trees");

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let boosting = self.boosting.as_ref().ok_or(PredictionError::NotFitted)?;
        let features = self.features(x).ok_or(PredictionError::NotFitted)?;

        check_predictions(
            features
                .outer_iter()
                .map(|sample| boosting.predict(sample))
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(
            format!("gbr-{}", self.hyper.nb_components),
            &self.hyper,
            &["nb_components"],
        )
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        self.tags = Some(tags.matrix().clone());
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;
    use crate::compute_rmse;

    fn ratings() -> (Vec<(usize, usize)>, Vec<f64>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for user in 0..6 {
            for work in 0..5 {
                x.push((user, work));
                y.push(if (user + work) % 2 == 0 { 2.0 } else { -2.0 });
            }
        }
        (x, y)
    }

    #[test]
    fn features_concatenate_factors_and_tags() {
        let (x, y) = ratings();
        let tags = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        let mut model = Gbr::new().nb_components(2).nb_estimators(5).seed(3).build();
        model.set_parameters(6, 5);
        model.load_tags(&SideInformation::from_dense(tags));
        model.fit(&x, &y).unwrap();

        let features = model.features(&[(1, 3), (0, 4)]).unwrap();
        let (users, works) = model.als.factors().unwrap();

        assert_eq!(features.dim(), (2, 7));
        assert_eq!(features[[0, 0]], users[[1, 0]]);
        assert_eq!(features[[0, 3]], works[[3, 1]]);
        assert_eq!(features[[0, 5]], users[[1, 1]] * works[[3, 1]]);
        assert_eq!(features.column(6).to_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn learns_the_training_ratings() {
        let (x, y) = ratings();
        let mut model = Gbr::new().nb_components(2).nb_estimators(50).seed(3).build();
        model.set_parameters(6, 5);
        model.fit(&x, &y).unwrap();

        let rmse = compute_rmse(&model.predict(&x).unwrap(), &y);
        assert!(rmse < 1.0, "rmse {}", rmse);
        assert_eq!(model.shortname(), "gbr-2");
        assert!(!model.is_serializable());
    }

    #[test]
    fn unfitted_model_refuses_to_predict() {
        let model = Gbr::new().build();
        assert!(model.predict(&[(0, 0)]).is_err());
    }
}

