//! ALS with work factors extended by frozen tag features.
//!
//! Work rows are `[latent; tags]`. User vectors are solved over the whole
//! width while only the latent part of work vectors is trained, against the
//! residual left by the tag part.
use std::time::Instant;

use ndarray::{s, Array1, Array2, ArrayView1, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::als::{ridge, update_rows};
use super::{
    check_fit_input, check_predictions, configured_shortname, seeded_rng, uniform_init, Factors,
};
use crate::data::CompressedRatings;
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Xals`] model.
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
            nb_components: 10,
            nb_iterations: 10,
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

    /// Number of trained latent components, tags excluded.
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
    pub fn build(self) -> Xals {
        Xals {
            hyper: self,
            dimensions: None,
            tags: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    factors: Factors,
    means: Vec<f64>,
}

/// Tag-augmented alternating least squares model.
///
/// The tag features end up inside the fitted work factors, so a restored
/// backup predicts without reloading them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Xals {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    #[serde(skip)]
    tags: Option<Array2<f64>>,
    fitted: Option<Fitted>,
}

impl Xals {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }
}

/// Retrain the latent columns of every rated work.
fn update_latent_works(
    by_work: &CompressedRatings,
    users: &Array2<f64>,
    tags: &Array2<f64>,
    nb_components: usize,
    lambda: f64,
    works: &mut Array2<f64>,
) {
    let latent_users = users.slice(s![.., ..nb_components]);
    let tag_users = users.slice(s![.., nb_components..]);

    let updates: Vec<Option<Array1<f64>>> = (0..by_work.num_rows())
        .into_par_iter()
        .map(|work| {
            let row = by_work.row(work)?;
            if row.is_empty() {
                return None;
            }

            let tag_part = tag_users.select(Axis(0), row.indices).dot(&tags.row(work));
            let residuals = &ArrayView1::from(row.values) - &tag_part;
            let basis = latent_users.select(Axis(0), row.indices);

            ridge(&basis, residuals.view(), lambda)
        })
        .collect();

    for (work, update) in updates.into_iter().enumerate() {
        if let Some(update) = update {
            works.slice_mut(s![work, ..nb_components]).assign(&update);
        }
    }
}

impl RecommendationAlgorithm for Xals {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let tags = self
            .tags
            .as_ref()
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
        let means = ratings.row_means();
        let by_user = ratings.center_rows(&means);
        let by_work = by_user.transpose();
        tracing::debug!(elapsed = ?start.elapsed(), "fill and center matrix");

        let k = self.hyper.nb_components;
        let mut rng = seeded_rng(self.hyper.seed);
        let mut users = uniform_init(nb_users, k + tags.ncols(), &mut rng);
        let mut works = Array2::zeros((nb_works, k + tags.ncols()));
        works
            .slice_mut(s![.., ..k])
            .assign(&uniform_init(nb_works, k, &mut rng));
        works.slice_mut(s![.., k..]).assign(tags);

        for iteration in 0..self.hyper.nb_iterations {
            update_rows(&by_user, &works, self.hyper.lambda, &mut users);
            update_latent_works(&by_work, &users, tags, k, self.hyper.lambda, &mut works);
            tracing::debug!(iteration, "XALS step");
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
            format!("xals-{}", self.hyper.nb_components),
            &self.hyper,
            &["nb_components"],
        )
    }

    fn is_serializable(&self) -> bool {
        true
    }

    fn requires_side_information(&self) -> bool {
        true
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        self.tags = Some(tags.matrix().clone());
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
