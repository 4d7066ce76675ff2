#![deny(missing_docs)]
//! # mangaki-zero
//!
//! Collaborative filtering algorithms behind the Mangaki anime and manga
//! recommendations: given `(user, work, choice)` observations, fit a model
//! and predict how much a user will like works they have not rated yet.
//!
//! ## Example
//!
//! ```rust
//! # use rand::SeedableRng;
//! use mangaki_zero::dataset::Dataset;
//! use mangaki_zero::registry::Registry;
//! use mangaki_zero::values::RatingValues;
//! use mangaki_zero::RecommendationAlgorithm;
//!
//! let triplets: Vec<(u64, u64, &str)> = vec![
//!     (1, 10, "like"),
//!     (1, 11, "dislike"),
//!     (2, 10, "like"),
//!     (2, 12, "like"),
//!     (3, 13, "favorite"),
//! ];
//!
//! let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(42);
//! let mut dataset = Dataset::new();
//! let data = dataset
//!     .make_anonymous_data(triplets, &RatingValues::default(), false, &mut rng)
//!     .unwrap()
//!     .clone();
//!
//! let registry = Registry::default();
//! let mut algo = registry.instantiate("als").unwrap();
//! algo.set_parameters(data.nb_users, data.nb_works);
//! algo.fit(&data.x, &data.y).unwrap();
//!
//! let predictions = algo.predict(&data.x).unwrap();
//! println!("Train RMSE {}", mangaki_zero::compute_rmse(&predictions, &data.y));
//! ```
use failure::Fail;

pub mod backup;
pub mod data;
pub mod dataset;
pub mod datasets;
pub mod evaluation;
mod linalg;
pub mod models;
pub mod registry;
pub mod serving;
pub mod side;
pub mod values;

pub use crate::evaluation::{compute_mae, compute_rmse};
pub use crate::models::Algorithm;

/// Alias for encoded user indices.
pub type UserIdx = usize;
/// Alias for encoded work indices.
pub type WorkIdx = usize;
/// Alias for raw (database) user and work identifiers.
pub type RawId = u64;

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// Matrix dimensions were never bound.
    #[fail(display = "Call set_parameters(nb_users, nb_works) before fitting.")]
    NotParameterized,
    /// Nothing to learn from.
    #[fail(display = "Cannot fit a model without ratings.")]
    NoRatings,
    /// `X` and `y` disagree on the number of ratings.
    #[fail(display = "X has {} rows but y has {} values.", x, y)]
    LengthMismatch {
        /// Length of `X`.
        x: usize,
        /// Length of `y`.
        y: usize,
    },
    /// A content-aware model was fitted without its tag matrix.
    #[fail(display = "{} needs side information: call load_tags before fitting.", name)]
    MissingSideInformation {
        /// Shortname of the model.
        name: String,
    },
    /// A matrix decomposition did not converge.
    #[fail(display = "The matrix decomposition did not converge.")]
    NotConverged,
    /// The model only handles non-negative ratings.
    #[fail(display = "Ratings must be non-negative, got {}.", value)]
    NegativeRating {
        /// The first offending rating.
        value: f64,
    },
    /// A per-row vector does not match the matrix dimensions.
    #[fail(display = "Expected {} {}, got {}.", expected, what, actual)]
    DimensionMismatch {
        /// What was measured.
        what: &'static str,
        /// Size implied by `set_parameters`.
        expected: usize,
        /// Size received.
        actual: usize,
    },
}

/// Prediction error types.
#[derive(Debug, Fail)]
pub enum PredictionError {
    /// `predict` was called before `fit`.
    #[fail(display = "Model must be fitted first.")]
    NotFitted,
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
}

/// The lifecycle shared by every recommendation algorithm.
///
/// `set_parameters` binds the matrix dimensions, `fit` trains once, and
/// `predict` scores `(user, work)` pairs without touching the fitted state.
/// Every pair within `[0, nb_users) × [0, nb_works)` gets a finite score,
/// whether or not the pair was seen during training; indices outside that
/// range are a caller error.
pub trait RecommendationAlgorithm {
    /// Bind matrix dimensions; must be called before `fit`.
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize);

    /// Train on encoded pairs `x` and their ratings `y`.
    ///
    /// Fitting again replaces the previous fitted state.
    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError>;

    /// Predicted ratings, parallel to `x`.
    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError>;

    /// Identity plus key hyperparameters, e.g. `als-20`.
    fn shortname(&self) -> String;

    /// Whether the fitted state can go through the backup store.
    fn is_serializable(&self) -> bool {
        false
    }

    /// Whether `fit` needs a tag matrix from [`load_tags`](Self::load_tags).
    fn requires_side_information(&self) -> bool {
        false
    }

    /// Hand the model the tag matrix of the current training run.
    fn load_tags(&mut self, _tags: &side::SideInformation) {}

    /// Cache the dense prediction matrix, trading memory for lookups.
    fn unzip(&mut self) {}

    /// Whether predictions are served from the cached dense matrix.
    fn is_unzipped(&self) -> bool {
        false
    }

    /// Backup file name derived from the shortname.
    fn backup_filename(&self) -> String {
        format!("{}.json", backup::sanitize(&self.shortname()))
    }
}
