//! User-based nearest neighbours with cosine similarity.
use std::cmp::Ordering;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::{check_fit_input, check_predictions, configured_shortname};
use crate::data::CompressedRatings;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Hyperparameters for the [`Knn`] model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
    nb_neighbors: usize,
    rated_by_neighbors_at_least: usize,
    missing_is_mean: bool,
    weighted: bool,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters {
            nb_neighbors: 20,
            rated_by_neighbors_at_least: 3,
            missing_is_mean: false,
            weighted: true,
        }
    }
}

impl Hyperparameters {
    /// Default hyperparameters.
    pub fn new() -> Self {
        Hyperparameters::default()
    }

    /// Number of most similar users to average over.
    pub fn nb_neighbors(mut self, nb_neighbors: usize) -> Self {
        self.nb_neighbors = nb_neighbors;
        self
    }

    /// Below this many neighbours having rated a work, predict 0.
    pub fn rated_by_neighbors_at_least(mut self, rated_by_neighbors_at_least: usize) -> Self {
        self.rated_by_neighbors_at_least = rated_by_neighbors_at_least;
        self
    }

    /// Impute a neighbour's missing rating with the work's mean rating
    /// instead of leaving the neighbour out.
    pub fn missing_is_mean(mut self, missing_is_mean: bool) -> Self {
        self.missing_is_mean = missing_is_mean;
        self
    }

    /// Weight neighbour ratings by similarity.
    pub fn weighted(mut self, weighted: bool) -> Self {
        self.weighted = weighted;
        self
    }

    /// Build an unfitted model.
    pub fn build(self) -> Knn {
        Knn {
            hyper: self,
            dimensions: None,
            fitted: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Fitted {
    ratings: CompressedRatings,
    work_means: Vec<f64>,
    /// Most similar other users, best first, with their similarity.
    neighbors: Vec<Vec<(UserIdx, f64)>>,
}

/// Nearest-neighbour model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Knn {
    hyper: Hyperparameters,
    dimensions: Option<(usize, usize)>,
    fitted: Option<Fitted>,
}

impl Knn {
    /// Start configuring a model.
    pub fn new() -> Hyperparameters {
        Hyperparameters::new()
    }

    /// Fit, computing neighbourhoods for `users` only.
    ///
    /// Every other user predicts 0. Useful when only a few users need
    /// recommendations out of a large rating matrix.
    pub fn fit_restricted(
        &mut self,
        x: &[(UserIdx, WorkIdx)],
        y: &[f64],
        users: &[UserIdx],
    ) -> Result<(), FittingError> {
        let (nb_users, nb_works) = check_fit_input(self.dimensions, x, y)?;
        let start = Instant::now();

        let ratings = CompressedRatings::from_triplets(nb_users, nb_works, x, y);
        let by_work = ratings.transpose();
        let work_means = by_work.row_means();
        let norms: Vec<f64> = ratings.iter_rows().map(|row| row.squared_norm().sqrt()).collect();

        let nb_neighbors = self.hyper.nb_neighbors;
        let mut neighbors = vec![Vec::new(); nb_users];
        let computed: Vec<(UserIdx, Vec<(UserIdx, f64)>)> = users
            .par_iter()
            .map(|&user| {
                let closest = closest_neighbors(&ratings, &by_work, &norms, user, nb_neighbors);
                (user, closest)
            })
            .collect();
        for (user, closest) in computed {
            neighbors[user] = closest;
        }
        tracing::debug!(elapsed = ?start.elapsed(), nb_users = users.len(), "compute neighbors");

        self.fitted = Some(Fitted {
            ratings,
            work_means,
            neighbors,
        });

        Ok(())
    }

    fn predict_one(&self, fitted: &Fitted, user: UserIdx, work: WorkIdx) -> f64 {
        let neighbors = &fitted.neighbors[user];

        let nb_raters = neighbors
            .iter()
            .filter(|&&(neighbor, _)| fitted.ratings.get(neighbor, work).is_some())
            .count();
        if nb_raters < self.hyper.rated_by_neighbors_at_least {
            return 0.0;
        }

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for &(neighbor, similarity) in neighbors {
            let rating = match fitted.ratings.get(neighbor, work) {
                Some(rating) => rating,
                None if self.hyper.missing_is_mean => fitted.work_means[work],
                None => continue,
            };
            let weight = if self.hyper.weighted { similarity } else { 1.0 };

            numerator += weight * rating;
            denominator += weight;
        }

        if denominator > 0.0 {
            numerator / denominator
        } else {
            0.0
        }
    }
}

/// Up to `nb_neighbors` other users with positive cosine similarity to
/// `user`, by decreasing similarity then increasing index.
fn closest_neighbors(
    ratings: &CompressedRatings,
    by_work: &CompressedRatings,
    norms: &[f64],
    user: UserIdx,
    nb_neighbors: usize,
) -> Vec<(UserIdx, f64)> {
    let row = match ratings.row(user) {
        Some(row) if norms[user] > 0.0 => row,
        _ => return Vec::new(),
    };

    let mut dot_products = vec![0.0; ratings.num_rows()];
    for (&work, &value) in row.indices.iter().zip(row.values) {
        if let Some(raters) = by_work.row(work) {
            for (&other, &other_value) in raters.indices.iter().zip(raters.values) {
                dot_products[other] += value * other_value;
            }
        }
    }

    let mut similarities: Vec<(UserIdx, f64)> = dot_products
        .into_iter()
        .enumerate()
        .filter(|&(other, _)| other != user && norms[other] > 0.0)
        .map(|(other, dot)| (other, dot / (norms[user] * norms[other])))
        .filter(|&(_, similarity)| similarity > 0.0)
        .collect();

    similarities.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    similarities.truncate(nb_neighbors);

    similarities
}

impl RecommendationAlgorithm for Knn {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        self.dimensions = Some((nb_users, nb_works));
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        let nb_users = self.dimensions.map_or(0, |(nb_users, _)| nb_users);
        let users: Vec<UserIdx> = (0..nb_users).collect();
        self.fit_restricted(x, y, &users)
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        let fitted = self.fitted.as_ref().ok_or(PredictionError::NotFitted)?;

        check_predictions(
            x.par_iter()
                .map(|&(user, work)| self.predict_one(fitted, user, work))
                .collect(),
        )
    }

    fn shortname(&self) -> String {
        configured_shortname(
            format!("knn-{}", self.hyper.nb_neighbors),
            &self.hyper,
            &["nb_neighbors"],
        )
    }

    fn is_serializable(&self) -> bool {
        true
    }
}
