//! Predictions over raw identifiers.
//!
//! Models only know encoded indices; [`Recommender`] pairs a fitted model
//! with the [`Dataset`] that produced its encoding and translates at the
//! edge.
use std::cmp::Ordering;
use std::collections::HashSet;

use crate::dataset::Dataset;
use crate::models::Algorithm;
use crate::{PredictionError, RawId, RecommendationAlgorithm};

/// A fitted model together with its encoding.
#[derive(Clone, Debug)]
pub struct Recommender<A = Algorithm> {
    dataset: Dataset,
    algorithm: A,
}

impl<A: RecommendationAlgorithm> Recommender<A> {
    /// Pair a fitted `algorithm` with the dataset it was fitted on.
    pub fn new(dataset: Dataset, algorithm: A) -> Self {
        Recommender { dataset, algorithm }
    }

    /// The encoding.
    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// The fitted model.
    pub fn algorithm(&self) -> &A {
        &self.algorithm
    }

    /// Scores of raw `(user_id, work_id)` pairs, parallel to `pairs`.
    ///
    /// Pairs mentioning a user or work unknown to the dataset score 0.
    pub fn predict_raw(&self, pairs: &[(RawId, RawId)]) -> Result<Vec<f64>, PredictionError> {
        let mut known_positions = Vec::with_capacity(pairs.len());
        let mut known_pairs = Vec::with_capacity(pairs.len());
        for (position, &(user_id, work_id)) in pairs.iter().enumerate() {
            if let (Some(user), Some(work)) = (
                self.dataset.encode_user(user_id),
                self.dataset.encode_work(work_id),
            ) {
                known_positions.push(position);
                known_pairs.push((user, work));
            }
        }
        tracing::debug!(
            nb_pairs = pairs.len(),
            nb_unknown = pairs.len() - known_pairs.len(),
            "encode raw pairs"
        );

        let mut scores = vec![0.0; pairs.len()];
        if !known_pairs.is_empty() {
            let predictions = self.algorithm.predict(&known_pairs)?;
            for (position, prediction) in known_positions.into_iter().zip(predictions) {
                scores[position] = prediction;
            }
        }

        Ok(scores)
    }

    /// The `nb_works` best interesting works `user_id` has not rated yet,
    /// best first, as raw identifiers with their scores.
    ///
    /// Unknown users get no recommendations.
    pub fn recommend(
        &self,
        user_id: RawId,
        nb_works: usize,
    ) -> Result<Vec<(RawId, f64)>, PredictionError> {
        let user = match self.dataset.encode_user(user_id) {
            Some(user) => user,
            None => return Ok(Vec::new()),
        };

        let rated: HashSet<_> = self
            .dataset
            .anonymized()
            .map(|data| {
                data.x
                    .iter()
                    .filter(|&&(rater, _)| rater == user)
                    .map(|&(_, work)| work)
                    .collect()
            })
            .unwrap_or_default();

        let candidates: Vec<_> = self
            .dataset
            .interesting_works()
            .iter()
            .filter(|work| !rated.contains(*work))
            .map(|&work| (user, work))
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let predictions = self.algorithm.predict(&candidates)?;
        let mut scored: Vec<(RawId, f64)> = candidates
            .iter()
            .zip(predictions)
            .filter_map(|(&(_, work), score)| Some((self.dataset.decode_work(work)?, score)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(nb_works);

        Ok(scored)
    }
}
