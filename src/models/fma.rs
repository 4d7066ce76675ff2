//! Second-order factorization machine trained by stochastic gradient descent.
//!
//! Every `(user, work)` pair is a sparse feature vector holding a one-hot
//! user indicator, a one-hot work indicator and, when side information was
//! loaded, the rounded tags of the work. The model is
//!
//! ```text
//! ŷ(x) = w0 + Σ wᵢ xᵢ + ½ Σ_f [(Σ v_if xᵢ)² - Σ v_if² xᵢ²]
//! ```
use std::time::Instant;

use ndarray::{Array1, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions, configured_shortname, seeded_rng};
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Fma`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    rank: usize,
    nb_iterations: usize,
    learning_rate: f64,
    regularization: f64,
    init_std: f64,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            rank: 20,
            nb_iterations: 10,
            learning_rate: 0.01,
            regularization: 0.01,
            init_std: 0.01,
            seed: None,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Dimension of the pairwise interaction factors.
    pub fn rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Number of passes over the training ratings.
    pub fn nb_iterations(mut self, nb_iterations: usize) -> Self {
        self.nb_iterations = nb_iterations;
        self
    }

    /// Step size.
    pub fn learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// L2 penalty on weights and factors.
    pub fn regularization(mut self, regularization: f64) -> Self {
        self.regularization = regularization;
        self
    }

    /// Standard deviation of the initial interaction factors.
    pub fn init_std(mut self, init_std: f64) -> Self {
        self.init_std = init_std;
        self
    }

    /// Seed of the initialization and of the sample order.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Fma {
        Fma {
            hyper: self,
            dimensions: None,
            tags: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
struct Fitted {
    bias: f64,
    weights: Array1<f64>,
    factors: Array2<f64>,
}

impl Fitted {
    fn predict(&self, features: &[(usize, f64)]) -> f64 {
        let linear: f64 = features
            .iter()
            .map(|&(idx, value)| self.weights[idx] * value)
            .sum();

        let mut interactions = 0.0;
        for f in 0..self.factors.ncols() {
            let mut sum = 0.0;
            let mut sum_of_squares = 0.0;
            for &(idx, value) in features {
                let term = self.factors[[idx, f]] * value;
                sum += term;
                sum_of_squares += term * term;
            }
            interactions += sum * sum - sum_of_squares;
        }

        self.bias + linear + 0.5 * interactions
    }

    /// One gradient step on the squared loss of a single sample.
    fn step(
        &mut self,
        features: &[(usize, f64)],
        target: f64,
        learning_rate: f64,
        regularization: f64,
    ) {
        let error = self.predict(features) - target;
        let rank = self.factors.ncols();

        let sums: Vec<f64> = (0..rank)
            .map(|f| {
                features
                    .iter()
                    .map(|&(idx, value)| self.factors[[idx, f]] * value)
                    .sum()
            })
            .collect();

        self.bias -= learning_rate * error;
        for &(idx, value) in features {
            self.weights[idx] -=
                learning_rate * (error * value + regularization * self.weights[idx]);
            for (f, sum) in sums.iter().enumerate() {
                let factor = self.factors[[idx, f]];
                let gradient = value * (sum - factor * value);
                self.factors[[idx, f]] -=
                    learning_rate * (error * gradient + regularization * factor);
            }
        }
    }
}

/// Factorization machine over user, work and tag indicators.
///
/// Only the hyperparameters are serialized: the tag columns are per-run
/// state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Hyperparameters", into = "Hyperparameters")]
pub struct Fma {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    tags: Option<Array2<f64>>,
    fitted: Option<Fitted>,
}

impl From<Hyperparameters> for Fma {
    fn from(hyper: Hyperparameters) -> Self {
        hyper.build()
    }
}

impl From<Fma> for Hyperparameters {
    fn from(model: Fma) -> Self {
        model.hyper
    }
}

impl Fma {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// Sparse `(feature, value)` encoding of a pair.
    fn encode(
        &self,
        nb_users: usize,
        nb_works: usize,
        user: UserIdx,
        work: WorkIdx,
    ) -> Vec<(usize, f64)> {
        let mut features = vec![(user, 1.0), (nb_users + work, 1.0)];
        if let Some(ref tags) = self.tags {
            features.extend(
                tags.row(work)
                    .iter()
                    .enumerate()
                    .filter(|&(_, value)| *value != 0.0)
                    .map(|(tag, value)| (nb_users + nb_works + tag, *value)),
            );
        }
        features
    }
}

impl RecommendationAlgorithm for Fma {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        if let Some(ref tags) = self.tags {
            if tags.nrows() != nb_works {
                return Err(FittingError::DimensionMismatch {
                    what: "tag rows",
                    expected: nb_works,
                    actual: tags.nrows(),
                });
            }
        }
        let start = Instant::now();

        let samples: Vec<Vec<(usize, f64)>> = x
            .iter()
            .map(|&(user, work)| self.encode(nb_users, nb_works, user, work))
            .collect();
        let nb_tags = self.tags.as_ref().map_or(0, |tags| tags.ncols());
        let nb_features = nb_users + nb_works + nb_tags;

        let mut rng = seeded_rng(self.hyper.seed);
        let init_std = self.hyper.init_std;
        let mut fitted = Fitted {
            bias: y.iter().sum::<f64>() / y.len() as f64,
            weights: Array1::zeros(nb_features),
            factors: Array2::from_shape_simple_fn((nb_features, self.hyper.rank), || {
                init_std * rng.sample::<f64, _>(StandardNormal)
            }),
        };

        let mut order: Vec<usize> = (0..samples.len()).collect();
        for iteration in 0..self.hyper.nb_iterations {
            order.shuffle(&mut rng);
            for &idx in &order {
                fitted.step(
                    &samples[idx],
                    y[idx],
                    self.hyper.learning_rate,
                    self.hyper.regularization,
                );
            }

            if tracing::enabled!(tracing::Level::DEBUG) {
                let loss = samples
                    .iter()
                    .zip(y)
                    .map(|(sample, target)| (fitted.predict(sample) - target).powi(2))
                    .sum::<f64>()
                    / y.len() as f64;
                tracing::debug!(iteration, loss, "SGD epoch");
            }
        }
        tracing::debug!(elapsed = ?start.elapsed(), nb_features, "fit factorization machine");

        self.fitted = Some(fitted);

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let fitted = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;
        let (nb_users, nb_works) = self.dimensions.ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.iter()
                .map(|&(user, work)| fitted.predict(&self.encode(nb_users, nb_works, user, work)))
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(format!("fma-{}", self.hyper.rank), &self.hyper, &["rank"])
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        self.tags = Some(tags.matrix().mapv(f64::round));
    }
}
