//! One L1-regularized linear model per user, over the tags of the works
//! they rated.
use std::time::Instant;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions};
use crate::data::CompressedRatings;
use crate::evaluation::Summary;
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Predictions are clipped to this range.
const PREDICTION_BOUND: f64 = 2.0;
const TOLERANCE: f64 = 1e-4;
const MAX_ITERATIONS: usize = 1000;

/// Hyperparameters for the [`Lasso`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    alpha: f64,
    with_bias: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            alpha: 0.01,
            with_bias: true,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// L1 penalty.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Fit a per-user intercept.
    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Lasso {
        Lasso {
            hyper: self,
            dimensions: None,
            tags: None,
            fitted: None,
        }
    }
}

/// A sparse linear model of one user's taste.
#[derive(Clone, Debug, PartialEq)]
struct UserModel {
    weights: Array1<f64>,
    intercept: f64,
}

impl UserModel {
    fn sparsity(&self) -> f64 {
        if self.weights.is_empty() {
            return 1.0;
        }
        self.weights.iter().filter(|&&w| w == 0.0).count() as f64 / self.weights.len() as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Fitted {
    models: Vec<Option<UserModel>>,
    nb_rated: Vec<usize>,
    tags: Array2<f64>,
}

/// Per-user Lasso on tags.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lasso {
    hyper: Hyperparameters,
    #[serde(skip)]
    dimensions: Option<(usize, usize)>,
    #[serde(skip)]
    tags: Option<Array2<f64>>,
    #[serde(skip)]
    fitted: Option<Fitted>,
}

impl Lasso {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// Number of training ratings of `work`; 0 before fitting.
    pub fn nb_rated(&self, work: WorkIdx) -> usize {
        self.fitted
            .as_ref()
            .and_then(|fitted| fitted.nb_rated.get(work).cloned())
            .unwrap_or(0)
    }
}

/// Minimize `1/(2n) |y - Xw - b|² + alpha |w|₁` by cyclic coordinate descent.
fn coordinate_descent(
    features: &Array2<f64>,
    targets: ArrayView1<f64>,
    alpha: f64,
    with_bias: bool,
) -> UserModel {
    let (nb_samples, nb_features) = features.dim();
    let n = nb_samples as f64;

    let (feature_means, target_mean) = if with_bias {
        (
            features.mean_axis(Axis(0)).unwrap_or_else(|| Array1::zeros(nb_features)),
            targets.mean().unwrap_or(0.0),
        )
    } else {
        (Array1::zeros(nb_features), 0.0)
    };
    let x = features - &feature_means;
    let mut residuals = &targets - target_mean;

    let column_norms: Vec<f64> = x
        .axis_iter(Axis(1))
        .map(|column| column.dot(&column) / n)
        .collect();
    let mut weights = Array1::<f64>::zeros(nb_features);

    for _ in 0..MAX_ITERATIONS {
        let mut max_change: f64 = 0.0;

        for feature in 0..nb_features {
            if column_norms[feature] == 0.0 {
                continue;
            }
            let column = x.column(feature);
            let old = weights[feature];

            let rho = column.dot(&residuals) / n + column_norms[feature] * old;
            let new = soft_threshold(rho, alpha) / column_norms[feature];

            if new != old {
                residuals.scaled_add(old - new, &column);
                weights[feature] = new;
                max_change = max_change.max((new - old).abs());
            }
        }

        if max_change < TOLERANCE {
            break;
        }
    }

    let intercept = target_mean - feature_means.dot(&weights);
    UserModel { weights, intercept }
}

fn soft_threshold(value: f64, threshold: f64) -> f64 {
    if value > threshold {
        value - threshold
    } else if value < -threshold {
        value + threshold
    } else {
        0.0
    }
}

impl RecommendationAlgorithm for Lasso {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let tags = self
            .tags
            .clone()
            .ok_or_else(|| FittingError::MissingSideInformation {
                name: self.shortname(),
            })?;
        if tags.nrows() != nb_works {
            return Err(FittingError::DimensionMismatch {
                what: "tag rows",
                expected: nb_works,
                actual: tags.nrows(),
            });
        }
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let nb_rated = ratings.transpose().row_counts();

        let alpha = self.hyper.alpha;
        let with_bias = self.hyper.with_bias;
        let models: Vec<Option<UserModel>> = (0..nb_users)
            .into_par_iter()
            .map(|user| {
                let row = ratings.row(user)?;
                if row.is_empty() {
                    return None;
                }
                let features = tags.select(Axis(0), row.indices);
                Some(coordinate_descent(
                    &features,
                    ArrayView1::from(row.values),
                    alpha,
                    with_bias,
                ))
            })
            .collect();
        tracing::debug!(elapsed = ?start.elapsed(), "fit user models");

        let sparsities: Vec<f64> = models.iter().flatten().map(UserModel::sparsity).collect();
        tracing::info!(
            algorithm = %self.shortname(),
            nb_models = sparsities.len(),
            "sparsity: {}",
            Summary::from_values(&sparsities)
        );

        self.fitted = Some(Fitted {
            models,
            nb_rated,
            tags,
        });

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let fitted = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.iter()
                .map(|&(user, work)| match fitted.models[user] {
                    Some(ref model) => (fitted.tags.row(work).dot(&model.weights)
                        + model.intercept)
                        .max(-PREDICTION_BOUND)
                        .min(PREDICTION_BOUND),
                    None => 0.0,
                })
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        let bias = if self.hyper.with_bias { "with_bias-" } else { "" };
        format!("lasso-{}{:.6}", bias, self.hyper.alpha)
    }

    fn requires_side_information(&self) -> bool {
        true
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        self.tags = Some(tags.matrix().clone());
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn recovers_a_sparse_linear_model() {
        let features = array![
            [1.0, 0.0, 3.0],
            [2.0, 1.0, -1.0],
            [0.0, 1.0, 2.0],
            [3.0, 0.5, 0.0],
            [1.5, 2.0, 1.0],
        ];
        let targets = features.column(0).mapv(|v| 0.5 * v + 1.0);

        let model = coordinate_descent(&features, targets.view(), 1e-4, true);

        assert!((model.weights[0] - 0.5).abs() < 0.05);
        assert!(model.weights[1].abs() < 0.05);
        assert!(model.weights[2].abs() < 0.05);
        assert!((model.intercept - 1.0).abs() < 0.1);
    }

    #[test]
    fn strong_penalty_leaves_the_intercept() {
        let features = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let targets = array![1.0, 2.0, 3.0];

        let model = coordinate_descent(&features, targets.view(), 100.0, true);

        assert_eq!(model.weights, array![0.0, 0.0]);
        assert!((model.intercept - 2.0).abs() < 1e-12);
        assert_eq!(model.sparsity(), 1.0);
    }

    #[test]
    fn predictions_are_clipped_and_unknown_users_score_zero() {
        let tags = array![[1.0], [10.0]];
        let mut model = Lasso::new().alpha(1e-6).build();
        model.set_parameters(2, 2);
        model.load_tags(&SideInformation::from_dense(tags));
        model.fit(&[(0, 0), (0, 1)], &[1.0, 3.0]).unwrap();

        let predictions = model.predict(&[(0, 1), (1, 0)]).unwrap();
        assert_eq!(predictions, vec![2.0, 0.0]);
        assert_eq!(model.nb_rated(0), 1);
        assert_eq!(model.nb_rated(1), 1);
    }

    #[test]
    fn shortnames() {
        assert_eq!(Lasso::new().build().shortname(), "lasso-with_bias-0.010000");
        assert_eq!(
            Lasso::new().with_bias(false).alpha(0.5).build().shortname(),
            "lasso-0.500000"
        );
    }
}
