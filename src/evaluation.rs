//! Error metrics and cross-validated comparison of algorithms.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use failure::Fail;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::{k_fold, select, shuffle_split, user_based_split, Fold};
use crate::dataset::AnonymizedData;
use crate::models::Algorithm;
use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

/// Root mean squared error. Both slices must have the same length; empty
/// slices give 0.
pub fn compute_rmse(y_pred: &[f64], y_true: &[f64]) -> f64 {
    assert_eq!(y_pred.len(), y_true.len(), "predictions and targets differ in length");
    if y_pred.is_empty() {
        return 0.0;
    }

    let squared_error: f64 = y_pred
        .iter()
        .zip(y_true)
        .map(|(prediction, truth)| (prediction - truth) * (prediction - truth))
        .sum();

    (squared_error / y_pred.len() as f64).sqrt()
}

/// Mean absolute error. Both slices must have the same length; empty slices
/// give 0.
pub fn compute_mae(y_pred: &[f64], y_true: &[f64]) -> f64 {
    assert_eq!(y_pred.len(), y_true.len(), "predictions and targets differ in length");
    if y_pred.is_empty() {
        return 0.0;
    }

    let absolute_error: f64 = y_pred
        .iter()
        .zip(y_true)
        .map(|(prediction, truth)| (prediction - truth).abs())
        .sum();

    absolute_error / y_pred.len() as f64
}

/// Evaluation error types.
#[derive(Debug, Fail)]
pub enum EvaluationError {
    /// An algorithm failed to fit a training split.
    #[fail(display = "Fitting {} failed: {}", name, cause)]
    Fitting {
        /// Shortname of the algorithm.
        name: String,
        /// What went wrong.
        #[cause]
        cause: FittingError,
    },
    /// An algorithm failed to score a test split.
    #[fail(display = "Predicting with {} failed: {}", name, cause)]
    Prediction {
        /// Shortname of the algorithm.
        name: String,
        /// What went wrong.
        #[cause]
        cause: PredictionError,
    },
    /// Two algorithms share a shortname, so their results would be merged.
    #[fail(display = "{} is configured more than once.", name)]
    DuplicateName {
        /// The shared shortname.
        name: String,
    },
    /// Every test split came out empty.
    #[fail(display = "No split holds out any rating.")]
    NoTestRatings,
}

/// An error metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Root mean squared error.
    Rmse,
    /// Mean absolute error.
    Mae,
}

impl Metric {
    /// Lowercase name used as report key.
    pub fn name(self) -> &'static str {
        match self {
            Metric::Rmse => "rmse",
            Metric::Mae => "mae",
        }
    }

    /// Score predictions against targets.
    pub fn compute(self, y_pred: &[f64], y_true: &[f64]) -> f64 {
        match self {
            Metric::Rmse => compute_rmse(y_pred, y_true),
            Metric::Mae => compute_mae(y_pred, y_true),
        }
    }
}

/// Mean, variance and 95% confidence half-width of a sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Sample mean.
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    /// Half-width of the 95% confidence interval of the mean.
    pub ci95: f64,
    /// The raw values, one per fold.
    pub values: Vec<f64>,
}

impl Summary {
    /// Summarize `values`; an empty sample summarizes to zeros.
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Summary {
                mean: 0.0,
                variance: 0.0,
                ci95: 0.0,
                values: Vec::new(),
            };
        }

        let count = values.len() as f64;
        let mean = values.iter().sum::<f64>() / count;
        let variance = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / count;

        Summary {
            mean,
            variance,
            ci95: 1.96 * (variance / count).sqrt(),
            values: values.to_vec(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:.4} ± {:.4}", self.mean, self.ci95)
    }
}

/// How ratings are split into training and test sets.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// `k` disjoint test folds covering every rating.
    KFold(usize),
    /// Independent random splits.
    Shuffle {
        /// Number of splits.
        nb_splits: usize,
        /// Share of the ratings held out by each split.
        test_fraction: f64,
    },
    /// One split holding out every rating of some users.
    UserBased {
        /// Share of the users held out.
        test_fraction: f64,
    },
}

impl Split {
    fn folds(&self, data: &AnonymizedData, rng: &mut XorShiftRng) -> Vec<Fold> {
        match *self {
            Split::KFold(nb_folds) => k_fold(data.len(), nb_folds, rng),
            Split::Shuffle {
                nb_splits,
                test_fraction,
            } => shuffle_split(data.len(), nb_splits, rng, test_fraction),
            Split::UserBased { test_fraction } => vec![user_based_split(&data.x, rng, test_fraction)],
        }
    }
}

/// Per-metric summaries of every algorithm, keyed by shortname.
pub type Report = BTreeMap<String, BTreeMap<String, Summary>>;

/// A cross-validation protocol.
#[derive(Clone, Debug)]
pub struct Experiment {
    split: Split,
    metrics: Vec<Metric>,
    seed: u64,
}

impl Default for Experiment {
    fn default() -> Self {
        Experiment {
            split: Split::KFold(5),
            metrics: vec![Metric::Rmse, Metric::Mae],
            seed: 42,
        }
    }
}

impl Experiment {
    /// Five-fold cross-validation on RMSE and MAE.
    pub fn new() -> Self {
        Experiment::default()
    }

    /// How to split the ratings.
    pub fn split(mut self, split: Split) -> Self {
        self.split = split;
        self
    }

    /// Metrics to report.
    pub fn metrics(mut self, metrics: Vec<Metric>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Seed of the split generator.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Fit a fresh copy of every algorithm on every training split and
    /// score it on the matching test split.
    ///
    /// `algorithms` are unfitted templates with distinct shortnames. Tags,
    /// when given, are handed to every copy before fitting. Splits with an
    /// empty test set are skipped rather than scored.
    pub fn run(
        &self,
        algorithms: &[Algorithm],
        data: &AnonymizedData,
        tags: Option<&SideInformation>,
    ) -> Result<Report, EvaluationError> {
        if algorithms.is_empty() {
            tracing::warn!("no algorithm to evaluate");
            return Ok(Report::new());
        }

        let mut names = BTreeSet::new();
        for template in algorithms {
            let name = template.shortname();
            if !names.insert(name.clone()) {
                return Err(EvaluationError::DuplicateName { name });
            }
        }

        let mut rng = XorShiftRng::seed_from_u64(self.seed);
        let folds: Vec<Fold> = self
            .split
            .folds(data, &mut rng)
            .into_iter()
            .enumerate()
            .filter_map(|(fold_idx, fold)| {
                if fold.test.is_empty() {
                    tracing::warn!(fold = fold_idx, "skipping fold without test ratings");
                    None
                } else {
                    Some(fold)
                }
            })
            .collect();
        if folds.is_empty() {
            return Err(EvaluationError::NoTestRatings);
        }

        let scores: Vec<Vec<Vec<f64>>> = folds
            .par_iter()
            .enumerate()
            .map(|(fold_idx, fold)| {
                algorithms
                    .iter()
                    .map(|template| self.evaluate(fold_idx, fold, template, data, tags))
                    .collect::<Result<Vec<_>, _>>()
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut report = Report::new();
        for (algo_idx, template) in algorithms.iter().enumerate() {
            let summaries = self
                .metrics
                .iter()
                .enumerate()
                .map(|(metric_idx, metric)| {
                    let values: Vec<f64> = scores
                        .iter()
                        .map(|fold_scores| fold_scores[algo_idx][metric_idx])
                        .collect();
                    (metric.name().to_owned(), Summary::from_values(&values))
                })
                .collect::<BTreeMap<_, _>>();

            for (metric, summary) in &summaries {
                tracing::info!(algorithm = %template.shortname(), metric = %metric, "{}", summary);
            }
            report.insert(template.shortname(), summaries);
        }

        Ok(report)
    }

    fn evaluate(
        &self,
        fold_idx: usize,
        fold: &Fold,
        template: &Algorithm,
        data: &AnonymizedData,
        tags: Option<&SideInformation>,
    ) -> Result<Vec<f64>, EvaluationError> {
        let name = template.shortname();
        let (train_x, train_y) = select(&data.x, &data.y, &fold.train);
        let (test_x, test_y) = select(&data.x, &data.y, &fold.test);

        let mut algo = template.clone();
        algo.set_parameters(data.nb_users, data.nb_works);
        if let Some(tags) = tags {
            algo.load_tags(tags);
        }
        algo.fit(&train_x, &train_y)
            .map_err(|cause| EvaluationError::Fitting {
                name: name.clone(),
                cause,
            })?;
        let y_pred = algo
            .predict(&test_x)
            .map_err(|cause| EvaluationError::Prediction {
                name: name.clone(),
                cause,
            })?;

        let scores: Vec<f64> = self
            .metrics
            .iter()
            .map(|metric| metric.compute(&y_pred, &test_y))
            .collect();
        tracing::info!(fold = fold_idx, algorithm = %name, scores = ?scores, "fold evaluated");

        Ok(scores)
    }
}

/// Log and return the train and test RMSE of a fitted model.
pub fn compute_all_errors<T: RecommendationAlgorithm>(
    algo: &T,
    train: (&[(UserIdx, WorkIdx)], &[f64]),
    test: (&[(UserIdx, WorkIdx)], &[f64]),
) -> Result<(f64, f64), PredictionError> {
    let train_rmse = compute_rmse(&algo.predict(train.0)?, train.1);
    let test_rmse = compute_rmse(&algo.predict(test.0)?, test.1);

    tracing::info!(algorithm = %algo.shortname(), train_rmse, test_rmse, "errors");

    Ok((train_rmse, test_rmse))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Als, Lasso, Zero};
    use crate::registry::Registry;

    #[test]
    fn rmse_and_mae() {
        assert_eq!(compute_rmse(&[1.0, 2.0, 3.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(compute_rmse(&[0.0, 0.0, 0.0], &[1.0, 1.0, 1.0]), 1.0);
        assert_eq!(compute_rmse(&[], &[]), 0.0);

        assert_eq!(compute_mae(&[1.0, -1.0], &[0.0, 0.0]), 1.0);
        assert_eq!(compute_rmse(&[2.0, 0.0], &[0.0, 0.0]), 2.0_f64.sqrt());
    }

    #[test]
    #[should_panic]
    fn lengths_must_match() {
        compute_rmse(&[1.0], &[1.0, 2.0]);
    }

    #[test]
    fn summary_statistics() {
        let summary = Summary::from_values(&[1.0, 2.0, 3.0, 4.0]);

        assert_eq!(summary.mean, 2.5);
        assert_eq!(summary.variance, 1.25);
        assert!((summary.ci95 - 1.96 * (1.25_f64 / 4.0).sqrt()).abs() < 1e-12);
        assert_eq!(Summary::from_values(&[]).mean, 0.0);
    }

    fn data() -> AnonymizedData {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for user in 0..8 {
            for work in 0..6 {
                x.push((user, work));
                y.push(1.0 + ((user + work) % 3) as f64);
            }
        }
        AnonymizedData {
            y_text: y.iter().map(|v| v.to_string()).collect(),
            x,
            y,
            nb_users: 8,
            nb_works: 6,
        }
    }

    #[test]
    fn report_is_keyed_by_shortname() {
        let algorithms: Vec<Algorithm> = vec![
            Zero::new().into(),
            Als::new().nb_components(2).seed(0).build().into(),
            Als::new().nb_components(3).seed(0).build().into(),
        ];

        let report = Experiment::new()
            .split(Split::KFold(3))
            .run(&algorithms, &data(), None)
            .unwrap();

        assert_eq!(report.len(), 3);
        assert!(report.contains_key("als-2") && report.contains_key("als-3"));
        let zero = &report["zero"]["rmse"];
        assert_eq!(zero.values.len(), 3);
        assert!(report["als-2"]["rmse"].mean < zero.mean);
    }

    #[test]
    fn differently_configured_instances_are_reported_apart() {
        let registry = Registry::default();
        let algorithms: Vec<Algorithm> = [
            "knn:nb_neighbors=5",
            "knn:nb_neighbors=5,weighted=false,rated_by_neighbors_at_least=1",
            "als:nb_components=2,lambda=0.1,seed=0",
            "als:nb_components=2,lambda=5.0,seed=0",
        ]
        .iter()
        .map(|configuration| registry.instantiate_configuration(configuration).unwrap())
        .collect();

        let report = Experiment::new()
            .split(Split::KFold(2))
            .run(&algorithms, &data(), None)
            .unwrap();

        assert_eq!(report.len(), 4);
        assert!(report.contains_key("knn-5") && report.contains_key("als-2"));
    }

    #[test]
    fn duplicate_shortnames_are_refused() {
        let algorithms: Vec<Algorithm> = vec![
            Als::new().nb_components(2).seed(0).build().into(),
            Als::new().nb_components(2).seed(1).build().into(),
        ];

        match Experiment::new().run(&algorithms, &data(), None) {
            Err(EvaluationError::DuplicateName { name }) => assert_eq!(name, "als-2"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_test_folds_are_skipped() {
        let data = AnonymizedData {
            x: vec![(0, 0), (1, 0), (1, 1)],
            y: vec![2.0, -2.0, 2.0],
            y_text: vec!["like".into(), "dislike".into(), "like".into()],
            nb_users: 2,
            nb_works: 2,
        };
        let algorithms: Vec<Algorithm> = vec![Zero::new().into()];

        let report = Experiment::new()
            .split(Split::KFold(5))
            .run(&algorithms, &data, None)
            .unwrap();

        let rmse = &report["zero"]["rmse"];
        assert_eq!(rmse.values, vec![2.0, 2.0, 2.0]);
        assert_eq!(rmse.mean, 2.0);
    }

    #[test]
    fn splits_without_test_ratings_are_an_error() {
        let data = AnonymizedData {
            x: vec![(0, 0)],
            y: vec![2.0],
            y_text: vec!["like".into()],
            nb_users: 1,
            nb_works: 1,
        };
        let algorithms: Vec<Algorithm> = vec![Zero::new().into()];
        let result = Experiment::new()
            .split(Split::Shuffle {
                nb_splits: 2,
                test_fraction: 0.0,
            })
            .run(&algorithms, &data, None);

        match result {
            Err(EvaluationError::NoTestRatings) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_algorithm_list_is_not_an_error() {
        let report = Experiment::new().run(&[], &data(), None).unwrap();
        assert!(report.is_empty());
    }

    #[test]
    fn missing_tags_are_reported() {
        let algorithms: Vec<Algorithm> = vec![Lasso::new().build().into()];
        let result = Experiment::new()
            .split(Split::Shuffle {
                nb_splits: 2,
                test_fraction: 0.25,
            })
            .run(&algorithms, &data(), None);

        match result {
            Err(EvaluationError::Fitting { name, .. }) => assert!(name.starts_with("lasso")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
