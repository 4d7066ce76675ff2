//! BALSE: ALS for well-known works, Lasso on tags for rarely rated ones.
use serde::{Deserialize, Serialize};

use super::als::Als;
use super::configured_shortname;
use super::lasso::Lasso;
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Balse`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_components: usize,
    nb_iterations: usize,
    lambda: f64,
    alpha: f64,
    with_bias: bool,
    gamma: usize,
    seed: Option<u64>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_components: 10,
            nb_iterations: 10,
            lambda: 0.1,
            alpha: 0.01,
            with_bias: true,
            gamma: 5,
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

    /// ALS regularization.
    pub fn lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    /// Lasso penalty.
    pub fn alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    /// Fit an intercept per user.
    pub fn with_bias(mut self, with_bias: bool) -> Self {
        self.with_bias = with_bias;
        self
    }

    /// Works with fewer training ratings than this are scored by Lasso.
    pub fn gamma(mut self, gamma: usize) -> Self {
        self.gamma = gamma;
        self
    }

    /// Seed of the factor initialization.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Balse {
        let mut als = Als::new()
            .nb_components(self.nb_components)
            .nb_iterations(self.nb_iterations)
            .lambda(self.lambda);
        if let Some(seed) = self.seed {
            als = als.seed(seed);
        }
        let lasso = Lasso::new().alpha(self.alpha).with_bias(self.with_bias);

        Balse {
            hyper: self,
            als: als.build(),
            lasso: lasso.build(),
        }
    }
}

/// Blend of [`Als`] and [`Lasso`], switching on the popularity of the work.
///
/// Only the hyperparameters are serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(from = "Hyperparameters", into = "Hyperparameters")]
pub struct Balse {
    hyper: Hyperparameters,
    als: Als,
    lasso: Lasso,
}

impl From<Hyperparameters> for Balse {
    fn from(hyper: Hyperparameters) -> Self {
        hyper.build()
    }
}

impl From<Balse> for Hyperparameters {
    fn from(model: Balse) -> Self {
        model.hyper
    }
}

impl Balse {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }
}

impl RecommendationAlgorithm for Balse {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.als.set_parameters(nb_users, nb_works);
        self.lasso.set_parameters(nb_users, nb_works);
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        self.lasso.fit(x, y).map_err(|error| match error {
            FittingError::MissingSideInformation { .. } => FittingError::MissingSideInformation {
                name: self.shortname(),
            },
            other => other,
        })?;
        tracing::debug!(model = %self.lasso.shortname(), "fitted");

        self.als.fit(x, y)?;
        tracing::debug!(model = %self.als.shortname(), "fitted");

        Ok(())
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let from_als = self.als.predict(x)?;
        let from_lasso = self.lasso.predict(x)?;

        Ok(x.iter()
            .zip(from_als.into_iter().zip(from_lasso))
            .map(|(&(_, work), (als, lasso))| {
                if self.lasso.nb_rated(work) < self.hyper.gamma {
                    lasso
                } else {
                    als
                }
            })
            .collect())
    }

    fn shortname(&self) -> String {
        // The inner ALS runs fewer iterations than a standalone one, so its
        // own shortname would carry a hash.
        configured_shortname(
            format!(
                "balse:(als-{})|({})",
                self.hyper.nb_components,
                self.lasso.shortname()
            ),
            &self.hyper,
            &["nb_components", "alpha", "with_bias"],
        )
    }

    fn requires_side_information(&self) -> bool {
        true
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        self.lasso.load_tags(tags);
    }
}
