//! Anonymization of raw rating triplets into dense, shuffled indices.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io;
use std::path::Path;

use failure::Fail;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::backup::write_json_atomically;
use crate::values::RatingValues;
use crate::{RawId, UserIdx, WorkIdx};

/// Works rated fewer times than this are not "interesting".
pub const RATED_BY_AT_LEAST: usize = 2;

/// Dataset error types.
#[derive(Debug, Fail)]
pub enum DatasetError {
    /// A choice is missing from the conversion table.
    #[fail(
        display = "Unknown rating choice \"{}\": it has no entry in the rating values table.",
        choice
    )]
    UnknownChoice {
        /// The offending choice.
        choice: String,
    },
    /// An encoded user index that this dataset never produced.
    #[fail(display = "Encoded user {} does not exist in this dataset.", index)]
    UnknownEncodedUser {
        /// The offending index.
        index: UserIdx,
    },
    /// The dataset holds no anonymized ratings yet.
    #[fail(display = "No anonymized data: call make_anonymous_data or load a dataset first.")]
    NotAnonymized,
    /// Underlying I/O failure.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    /// Malformed CSV input.
    #[fail(display = "CSV error: {}", _0)]
    Csv(#[cause] csv::Error),
    /// Malformed dataset backup.
    #[fail(display = "Serialization error: {}", _0)]
    Serialization(#[cause] serde_json::Error),
}

impl From<io::Error> for DatasetError {
    fn from(err: io::Error) -> Self {
        DatasetError::Io(err)
    }
}

impl From<csv::Error> for DatasetError {
    fn from(err: csv::Error) -> Self {
        DatasetError::Csv(err)
    }
}

impl From<serde_json::Error> for DatasetError {
    fn from(err: serde_json::Error) -> Self {
        DatasetError::Serialization(err)
    }
}

/// One observation: a user chose something about a work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingTriplet {
    /// Raw user identifier.
    pub user_id: RawId,
    /// Raw work identifier.
    pub work_id: RawId,
    /// Choice text, such as `like`.
    pub choice: String,
}

impl RatingTriplet {
    /// Build a triplet.
    pub fn new<S: Into<String>>(user_id: RawId, work_id: RawId, choice: S) -> Self {
        RatingTriplet {
            user_id,
            work_id,
            choice: choice.into(),
        }
    }
}

impl<'a> From<(RawId, RawId, &'a str)> for RatingTriplet {
    fn from((user_id, work_id, choice): (RawId, RawId, &'a str)) -> Self {
        RatingTriplet::new(user_id, work_id, choice)
    }
}

impl From<(RawId, RawId, String)> for RatingTriplet {
    fn from((user_id, work_id, choice): (RawId, RawId, String)) -> Self {
        RatingTriplet::new(user_id, work_id, choice)
    }
}

/// Ratings expressed over encoded indices, ready for training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnonymizedData {
    /// `(encoded_user, encoded_work)` pairs.
    pub x: Vec<(UserIdx, WorkIdx)>,
    /// Numeric ratings, parallel to `x`.
    pub y: Vec<f64>,
    /// The original choices, parallel to `x`.
    pub y_text: Vec<String>,
    /// Number of distinct users.
    pub nb_users: usize,
    /// Number of distinct works.
    pub nb_works: usize,
}

impl AnonymizedData {
    /// Number of ratings.
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// Whether there are no ratings.
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Bijections between raw identifiers and dense indices, plus the
/// anonymized ratings they were built from.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Dataset {
    anonymized: Option<AnonymizedData>,
    encode_user: HashMap<RawId, UserIdx>,
    decode_user: Vec<RawId>,
    encode_work: HashMap<RawId, WorkIdx>,
    decode_work: Vec<RawId>,
    interesting_works: BTreeSet<WorkIdx>,
    /// Work titles, used when exporting CSV files.
    pub titles: Option<HashMap<RawId, String>>,
    /// Work categories, used when exporting CSV files.
    pub categories: Option<HashMap<RawId, String>>,
}

impl Dataset {
    /// An empty dataset.
    pub fn new() -> Self {
        Dataset::default()
    }

    /// Encode raw triplets.
    ///
    /// Users and works get randomly permuted indices so that no ordering of
    /// the raw identifiers leaks into the models. With `ordered`, works are
    /// instead numbered by decreasing number of ratings (ties in random
    /// order). The observations themselves are shuffled as well.
    pub fn make_anonymous_data<I, R>(
        &mut self,
        triplets: I,
        convert: &RatingValues,
        ordered: bool,
        rng: &mut R,
    ) -> Result<&AnonymizedData, DatasetError>
    where
        I: IntoIterator,
        I::Item: Into<RatingTriplet>,
        R: Rng,
    {
        let triplets: Vec<RatingTriplet> = triplets.into_iter().map(Into::into).collect();
        let mut triplets = supersede_duplicates(triplets);

        let mut users: Vec<RawId> = Vec::new();
        let mut works: Vec<RawId> = Vec::new();
        let mut seen_users: HashSet<RawId> = HashSet::new();
        let mut nb_ratings: HashMap<RawId, usize> = HashMap::new();

        for triplet in &triplets {
            if seen_users.insert(triplet.user_id) {
                users.push(triplet.user_id);
            }
            let count = nb_ratings.entry(triplet.work_id).or_insert(0);
            if *count == 0 {
                works.push(triplet.work_id);
            }
            *count += 1;
        }

        // Scramble time.
        triplets.shuffle(rng);

        let mut anonymous_u: Vec<UserIdx> = (0..users.len()).collect();
        let mut anonymous_w: Vec<WorkIdx> = (0..works.len()).collect();
        anonymous_u.shuffle(rng);
        if ordered {
            works.shuffle(rng);
            works.sort_by(|a, b| nb_ratings[b].cmp(&nb_ratings[a]));
        } else {
            anonymous_w.shuffle(rng);
        }

        let mut encode_user = HashMap::with_capacity(users.len());
        let mut decode_user = vec![0; users.len()];
        for (&raw, &encoded) in users.iter().zip(&anonymous_u) {
            encode_user.insert(raw, encoded);
            decode_user[encoded] = raw;
        }

        let mut encode_work = HashMap::with_capacity(works.len());
        let mut decode_work = vec![0; works.len()];
        for (&raw, &encoded) in works.iter().zip(&anonymous_w) {
            encode_work.insert(raw, encoded);
            decode_work[encoded] = raw;
        }

        let interesting_works = nb_ratings
            .iter()
            .filter(|&(_, &count)| count >= RATED_BY_AT_LEAST)
            .map(|(work_id, _)| encode_work[work_id])
            .collect();

        let mut x = Vec::with_capacity(triplets.len());
        let mut y = Vec::with_capacity(triplets.len());
        let mut y_text = Vec::with_capacity(triplets.len());
        for triplet in triplets {
            y.push(convert.value(&triplet.choice)?);
            x.push((encode_user[&triplet.user_id], encode_work[&triplet.work_id]));
            y_text.push(triplet.choice);
        }

        tracing::debug!(
            nb_ratings = x.len(),
            nb_users = users.len(),
            nb_works = works.len(),
            "anonymized ratings"
        );

        self.encode_user = encode_user;
        self.decode_user = decode_user;
        self.encode_work = encode_work;
        self.decode_work = decode_work;
        self.interesting_works = interesting_works;

        Ok(self.anonymized.insert(AnonymizedData {
            x,
            y,
            y_text,
            nb_users: users.len(),
            nb_works: works.len(),
        }))
    }

    /// The encoded ratings, once built.
    pub fn anonymized(&self) -> Option<&AnonymizedData> {
        self.anonymized.as_ref()
    }

    /// Number of encoded users.
    pub fn nb_users(&self) -> usize {
        self.decode_user.len()
    }

    /// Number of encoded works.
    pub fn nb_works(&self) -> usize {
        self.decode_work.len()
    }

    /// Encoded index of a raw user.
    pub fn encode_user(&self, user_id: RawId) -> Option<UserIdx> {
        self.encode_user.get(&user_id).cloned()
    }

    /// Raw identifier of an encoded user.
    pub fn decode_user(&self, user: UserIdx) -> Option<RawId> {
        self.decode_user.get(user).cloned()
    }

    /// Encoded index of a raw work.
    pub fn encode_work(&self, work_id: RawId) -> Option<WorkIdx> {
        self.encode_work.get(&work_id).cloned()
    }

    /// Raw identifier of an encoded work.
    pub fn decode_work(&self, work: WorkIdx) -> Option<RawId> {
        self.decode_work.get(work).cloned()
    }

    /// Encoded works rated at least [`RATED_BY_AT_LEAST`] times.
    pub fn interesting_works(&self) -> &BTreeSet<WorkIdx> {
        &self.interesting_works
    }

    /// Whether `work` is among the interesting works.
    pub fn is_interesting(&self, work: WorkIdx) -> bool {
        self.interesting_works.contains(&work)
    }

    /// Decode users; every index must come from this dataset.
    pub fn decode_users(&self, users: &[UserIdx]) -> Result<Vec<RawId>, DatasetError> {
        users
            .iter()
            .map(|&index| {
                self.decode_user(index)
                    .ok_or(DatasetError::UnknownEncodedUser { index })
            })
            .collect()
    }

    /// Encode works, silently dropping the ones this dataset has never seen.
    pub fn encode_works(&self, work_ids: &[RawId]) -> Vec<WorkIdx> {
        work_ids
            .iter()
            .filter_map(|&work_id| self.encode_work(work_id))
            .collect()
    }

    /// Write the dataset as JSON, replacing `path` atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DatasetError> {
        write_json_atomically(path.as_ref(), self)?;
        Ok(())
    }

    /// Read a dataset written by [`save`](Self::save).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Dataset, DatasetError> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(io::BufReader::new(file))?)
    }

    /// Export anonymized ratings as `ratings{suffix}.csv` and, when titles
    /// and categories are known, works as `works{suffix}.csv`.
    pub fn save_csv<P: AsRef<Path>>(&self, directory: P, suffix: &str) -> Result<(), DatasetError> {
        let anonymized = self.anonymized.as_ref().ok_or(DatasetError::NotAnonymized)?;
        let directory = directory.as_ref();

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(directory.join(format!("ratings{}.csv", suffix)))?;
        for (&(user, work), choice) in anonymized.x.iter().zip(&anonymized.y_text) {
            writer.serialize((user, work, choice))?;
        }
        writer.flush()?;

        if let (Some(titles), Some(categories)) = (&self.titles, &self.categories) {
            let mut lines: Vec<(WorkIdx, &str, &str)> = titles
                .iter()
                .filter_map(|(work_id, title)| {
                    let encoded = self.encode_work(*work_id)?;
                    let category = categories.get(work_id).map(String::as_str).unwrap_or("");
                    Some((encoded, title.as_str(), category))
                })
                .collect();
            lines.sort();

            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_path(directory.join(format!("works{}.csv", suffix)))?;
            for line in lines {
                writer.serialize(line)?;
            }
            writer.flush()?;
        }

        Ok(())
    }

    /// Read an already anonymized `user,work,rating` CSV file.
    ///
    /// Indices in the file are kept as they are, so encoding is the identity.
    pub fn load_csv<P: AsRef<Path>>(path: P, convert: &RatingValues) -> Result<Dataset, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(path)?;

        let mut x = Vec::new();
        let mut y = Vec::new();
        let mut y_text = Vec::new();
        for record in reader.deserialize() {
            let (user, work, rating): (UserIdx, WorkIdx, String) = record?;
            y.push(convert.value(&rating)?);
            x.push((user, work));
            y_text.push(rating);
        }

        let nb_users = x.iter().map(|&(user, _)| user + 1).max().unwrap_or(0);
        let nb_works = x.iter().map(|&(_, work)| work + 1).max().unwrap_or(0);

        let mut nb_ratings = vec![0; nb_works];
        for &(_, work) in &x {
            nb_ratings[work] += 1;
        }

        Ok(Dataset {
            encode_user: (0..nb_users).map(|idx| (idx as RawId, idx)).collect(),
            decode_user: (0..nb_users).map(|idx| idx as RawId).collect(),
            encode_work: (0..nb_works).map(|idx| (idx as RawId, idx)).collect(),
            decode_work: (0..nb_works).map(|idx| idx as RawId).collect(),
            interesting_works: (0..nb_works)
                .filter(|&work| nb_ratings[work] >= RATED_BY_AT_LEAST)
                .collect(),
            anonymized: Some(AnonymizedData {
                x,
                y,
                y_text,
                nb_users,
                nb_works,
            }),
            titles: None,
            categories: None,
        })
    }
}

/// Keep only the last triplet of every `(user, work)` pair, in input order.
fn supersede_duplicates(triplets: Vec<RatingTriplet>) -> Vec<RatingTriplet> {
    let mut last_seen: HashMap<(RawId, RawId), usize> = HashMap::with_capacity(triplets.len());
    for (idx, triplet) in triplets.iter().enumerate() {
        last_seen.insert((triplet.user_id, triplet.work_id), idx);
    }

    triplets
        .into_iter()
        .enumerate()
        .filter(|(idx, triplet)| last_seen[&(triplet.user_id, triplet.work_id)] == *idx)
        .map(|(_, triplet)| triplet)
        .collect()
}
