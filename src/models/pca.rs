//! Principal component analysis of the user-centered rating matrix.
//!
//! Users are samples and works are features. After centering every user on
//! their mean rating and every work on its mean centered rating, the matrix
//! is projected on its leading components. Each component is then shrunk
//! by the standard deviation it explains per user, and predictions add the
//! user mean back.
use std::time::Instant;

use ndarray::Axis;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions, configured_shortname, Factors};
use crate::data::CompressedRatings;
use crate::linalg;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Pca`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters { nb_components: 10 }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Number of principal components kept.
    pub fn nb_components(mut self, nb_components: usize) -> Self {
        self.nb_components = nb_components;
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Pca {
        Pca {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    /// Shrunk component scores as users, components as works.
    factors: Factors,
    means: Vec<f64>,
}

/// Principal component analysis model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Pca {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Pca {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }
}

impl RecommendationAlgorithm for Pca {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let means = ratings.row_means();
        let mut dense = ratings.center_rows(&means).to_dense();
        if let Some(work_means) = dense.mean_axis(Axis(0)) {
            dense -= &work_means;
        }
        tracing::debug!(elapsed = ?start.elapsed(), "fill and center matrix");

        let svd = linalg::truncated_svd(&dense, self.hyper.nb_components)
            .ok_or(FittingError::NotConverged)?;

        let nb_samples = nb_users as f64;
        let degrees_of_freedom = (nb_users.max(2) - 1) as f64;
        let mut users = svd.u;
        for (mut column, &singular_value) in users.columns_mut().into_iter().zip(svd.sigma.iter()) {
            let explained_variance = singular_value * singular_value / degrees_of_freedom;
            column *= singular_value * (explained_variance / nb_samples).sqrt();
        }
        tracing::debug!(
            elapsed = ?start.elapsed(),
            rank = svd.sigma.len(),
            "factor matrix"
        );

        self.fitted = Some(Fitted {
            factors: Factors::new(users, svd.vt.reversed_axes()),
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
            format!("pca-{}", self.hyper.nb_components),
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

    #[test]
    fn identical_users_get_their_mean() {
        let x = vec![(0, 0), (0, 1), (1, 0), (1, 1)];
        let y = vec![2.0, 4.0, 2.0, 4.0];

        let mut model = Pca::new().nb_components(2).build();
        model.set_parameters(2, 2);
        model.fit(&x, &y).unwrap();

        let predictions = model.predict(&x).unwrap();
        assert!(predictions.iter().all(|p| (p - 3.0).abs() < 1e-9));
    }

    #[test]
    fn components_are_capped_by_dimensions() {
        let x = vec![(0, 0), (0, 3), (1, 1), (1, 2), (2, 0), (2, 2)];
        let y = vec![2.0, -2.0, 4.0, 0.5, -2.0, 2.0];

        let mut model = Pca::new().build();
        model.set_parameters(3, 4);
        model.fit(&x, &y).unwrap();

        let fitted = model.fitted.as_ref().unwrap();
        assert_eq!(fitted.factors.users.dim(), (3, 3));
        assert_eq!(fitted.factors.works.dim(), (4, 3));
        assert_eq!(model.shortname(), "pca-10");

        let unseen = model.predict(&[(0, 1), (1, 3)]).unwrap();
        assert!(unseen.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn components_explain_the_centered_matrix() {
        // One user disagrees with the other two on every work.
        let x = vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)];
        let y = vec![4.0, -2.0, 4.0, -2.0, -2.0, 4.0];

        let mut model = Pca::new().nb_components(1).build();
        model.set_parameters(3, 2);
        model.fit(&x, &y).unwrap();

        let predictions = model.predict(&x).unwrap();
        let means = [1.0, 1.0, 1.0];
        for (&(user, _), (&prediction, &rating)) in x.iter().zip(predictions.iter().zip(&y)) {
            // The correction points from the mean towards the rating.
            assert!((prediction - means[user]) * (rating - means[user]) > 0.0);
        }
    }
}
