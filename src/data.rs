//! Sparse rating matrices and train/test splitting.
use std::hash::Hasher;

use itertools::izip;
use ndarray::Array2;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher;

use crate::{UserIdx, WorkIdx};

/// A rating matrix in compressed-row form.
///
/// Rows are users and columns are works unless the matrix was obtained
/// through [`CompressedRatings::transpose`], in which case rows are works.
/// Column indices are sorted within each row, and every `(row, column)`
/// cell holds at most one value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompressedRatings {
    num_rows: usize,
    num_cols: usize,
    pointers: Vec<usize>,
    indices: Vec<usize>,
    values: Vec<f64>,
}

impl CompressedRatings {
    /// Build the matrix from parallel `(row, column)` pairs and values.
    ///
    /// When the same cell appears several times the last occurrence wins:
    /// a later observation supersedes an earlier one.
    pub fn from_triplets(
        num_rows: usize,
        num_cols: usize,
        x: &[(UserIdx, WorkIdx)],
        y: &[f64],
    ) -> Self {
        let mut entries: Vec<(usize, usize, f64)> = izip!(x, y)
            .map(|(&(row, col), &value)| (row, col, value))
            .collect();
        // Stable, so duplicates keep their input order.
        entries.sort_by_key(|&(row, col, _)| (row, col));

        let mut pointers = vec![0; num_rows + 1];
        let mut indices: Vec<usize> = Vec::with_capacity(entries.len());
        let mut values: Vec<f64> = Vec::with_capacity(entries.len());
        let mut last_cell = None;

        for (row, col, value) in entries {
            if last_cell == Some((row, col)) {
                if let Some(last) = values.last_mut() {
                    *last = value;
                }
                continue;
            }
            last_cell = Some((row, col));
            indices.push(col);
            values.push(value);
            pointers[row + 1] += 1;
        }

        for idx in 1..pointers.len() {
            pointers[idx] += pointers[idx - 1];
        }

        CompressedRatings {
            num_rows,
            num_cols,
            pointers,
            indices,
            values,
        }
    }

    /// Swap rows and columns (CSR of the transpose, i.e. CSC of `self`).
    pub fn transpose(&self) -> CompressedRatings {
        let mut x = Vec::with_capacity(self.nnz());
        let mut y = Vec::with_capacity(self.nnz());

        for row in self.iter_rows() {
            for (&col, &value) in row.indices.iter().zip(row.values) {
                x.push((col, row.index));
                y.push(value);
            }
        }

        CompressedRatings::from_triplets(self.num_cols, self.num_rows, &x, &y)
    }

    /// Iterate over the rows, empty ones included.
    pub fn iter_rows(&self) -> CompressedRowIterator {
        CompressedRowIterator {
            ratings: self,
            idx: 0,
        }
    }

    /// Row `row`, or `None` past the last one.
    pub fn row(&self, row: usize) -> Option<CompressedRow> {
        if row >= self.num_rows {
            return None;
        }

        let start = self.pointers[row];
        let stop = self.pointers[row + 1];

        Some(CompressedRow {
            index: row,
            indices: &self.indices[start..stop],
            values: &self.values[start..stop],
        })
    }

    /// Value stored at `(row, col)`, if any.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let row = self.row(row)?;
        row.indices
            .binary_search(&col)
            .ok()
            .map(|position| row.values[position])
    }

    /// Number of stored values in each row.
    pub fn row_counts(&self) -> Vec<usize> {
        self.pointers.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Mean of the stored values of each row; empty rows get 0.
    pub fn row_means(&self) -> Vec<f64> {
        self.iter_rows()
            .map(|row| {
                let mean = row.values.iter().sum::<f64>() / row.values.len() as f64;
                if mean.is_nan() {
                    0.0
                } else {
                    mean
                }
            })
            .collect()
    }

    /// Subtract `offsets[row]` from every stored value of that row.
    pub fn center_rows(&self, offsets: &[f64]) -> CompressedRatings {
        let mut centered = self.clone();

        for row in 0..self.num_rows {
            let (start, stop) = (self.pointers[row], self.pointers[row + 1]);
            for value in &mut centered.values[start..stop] {
                *value -= offsets[row];
            }
        }

        centered
    }

    /// Dense copy, unobserved cells filled with zeros.
    pub fn to_dense(&self) -> Array2<f64> {
        let mut dense = Array2::zeros((self.num_rows, self.num_cols));

        for row in self.iter_rows() {
            for (&col, &value) in row.indices.iter().zip(row.values) {
                dense[[row.index, col]] = value;
            }
        }

        dense
    }

    /// Number of stored ratings.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Number of columns.
    pub fn num_cols(&self) -> usize {
        self.num_cols
    }

    /// `(num_rows, num_cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows, self.num_cols)
    }
}

/// Iterator over the rows of a [`CompressedRatings`] matrix.
pub struct CompressedRowIterator<'a> {
    ratings: &'a CompressedRatings,
    idx: usize,
}

/// A borrowed row of a [`CompressedRatings`] matrix.
#[derive(Debug)]
pub struct CompressedRow<'a> {
    /// Row index.
    pub index: usize,
    /// Sorted column indices of the stored values.
    pub indices: &'a [usize],
    /// Stored values, parallel to `indices`.
    pub values: &'a [f64],
}

impl<'a> CompressedRow<'a> {
    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the row stores nothing.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Squared L2 norm of the stored values.
    pub fn squared_norm(&self) -> f64 {
        self.values.iter().map(|value| value * value).sum()
    }
}

impl<'a> Iterator for CompressedRowIterator<'a> {
    type Item = CompressedRow<'a>;
    fn next(&mut self) -> Option<Self::Item> {
        let value = self.ratings.row(self.idx);
        self.idx += 1;
        value
    }
}

/// A train/test partition expressed as indices into `(X, y)`.
#[derive(Clone, Debug, PartialEq)]
pub struct Fold {
    /// Training indices.
    pub train: Vec<usize>,
    /// Held-out indices.
    pub test: Vec<usize>,
}

/// Shuffle and cut off the first `test_fraction` of the observations.
pub fn train_test_split<R: Rng>(num_ratings: usize, rng: &mut R, test_fraction: f64) -> Fold {
    let mut indices: Vec<usize> = (0..num_ratings).collect();
    indices.shuffle(rng);

    let cutoff = (test_fraction * num_ratings as f64) as usize;
    let (test, train) = indices.split_at(cutoff);

    Fold {
        train: train.to_vec(),
        test: test.to_vec(),
    }
}

/// Independent random splits, each holding out `test_fraction` of the ratings.
pub fn shuffle_split<R: Rng>(
    num_ratings: usize,
    num_splits: usize,
    rng: &mut R,
    test_fraction: f64,
) -> Vec<Fold> {
    (0..num_splits)
        .map(|_| train_test_split(num_ratings, rng, test_fraction))
        .collect()
}

/// Partition shuffled observations into `num_folds` disjoint test sets.
pub fn k_fold<R: Rng>(num_ratings: usize, num_folds: usize, rng: &mut R) -> Vec<Fold> {
    let mut indices: Vec<usize> = (0..num_ratings).collect();
    indices.shuffle(rng);

    let num_folds = num_folds.max(1);

    (0..num_folds)
        .map(|fold| {
            let start = fold * num_ratings / num_folds;
            let stop = (fold + 1) * num_ratings / num_folds;

            let mut train = Vec::with_capacity(num_ratings - (stop - start));
            train.extend_from_slice(&indices[..start]);
            train.extend_from_slice(&indices[stop..]);

            Fold {
                train,
                test: indices[start..stop].to_vec(),
            }
        })
        .collect()
}

/// Hold out every rating of roughly `test_fraction` of the users.
pub fn user_based_split<R: Rng>(x: &[(UserIdx, WorkIdx)], rng: &mut R, test_fraction: f64) -> Fold {
    let denominator = 100_000;
    let train_cutoff = (test_fraction * denominator as f64) as u64;

    let (key_0, key_1) = (rng.gen::<u64>(), rng.gen::<u64>());

    let is_train = |user_id: UserIdx| {
        let mut hasher = SipHasher::new_with_keys(key_0, key_1);
        hasher.write_usize(user_id);
        hasher.finish() % denominator > train_cutoff
    };

    let (train, test): (Vec<usize>, Vec<usize>) =
        (0..x.len()).partition(|&idx| is_train(x[idx].0));

    Fold { train, test }
}

/// Gather the rows of `(X, y)` listed in `indices`.
pub fn select(
    x: &[(UserIdx, WorkIdx)],
    y: &[f64],
    indices: &[usize],
) -> (Vec<(UserIdx, WorkIdx)>, Vec<f64>) {
    indices.iter().map(|&idx| (x[idx], y[idx])).unzip()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;

    fn sample() -> CompressedRatings {
        let x = vec![(0, 1), (2, 0), (0, 0), (1, 2), (0, 1)];
        let y = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        CompressedRatings::from_triplets(3, 3, &x, &y)
    }

    #[test]
    fn later_observation_supersedes_earlier() {
        let ratings = sample();

        assert_eq!(ratings.nnz(), 4);
        assert_eq!(ratings.get(0, 1), Some(5.0));
        assert_eq!(ratings.get(0, 0), Some(3.0));
        assert_eq!(ratings.get(1, 1), None);
    }

    #[test]
    fn rows_and_transpose() {
        let ratings = sample();
        let row = ratings.row(0).unwrap();
        assert_eq!(row.indices, &[0, 1]);
        assert_eq!(row.values, &[3.0, 5.0]);
        assert!(ratings.row(3).is_none());

        let transposed = ratings.transpose();
        assert_eq!(transposed.shape(), (3, 3));
        assert_eq!(transposed.get(1, 0), Some(5.0));
        assert_eq!(transposed.get(0, 2), Some(2.0));
        assert_eq!(transposed.row(0).unwrap().indices, &[0, 2]);
    }

    #[test]
    fn means_guard_empty_rows() {
        let x = vec![(0, 0), (0, 1)];
        let y = vec![1.0, 3.0];
        let ratings = CompressedRatings::from_triplets(2, 2, &x, &y);

        assert_eq!(ratings.row_means(), vec![2.0, 0.0]);
        assert_eq!(ratings.row_counts(), vec![2, 0]);

        let centered = ratings.center_rows(&ratings.row_means());
        assert_eq!(centered.row(0).unwrap().values, &[-1.0, 1.0]);
    }

    #[test]
    fn k_fold_partitions_everything() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let folds = k_fold(10, 3, &mut rng);

        assert_eq!(folds.len(), 3);

        let mut tested: Vec<usize> = folds.iter().flat_map(|f| f.test.clone()).collect();
        tested.sort();
        assert_eq!(tested, (0..10).collect::<Vec<_>>());

        for fold in &folds {
            assert_eq!(fold.train.len() + fold.test.len(), 10);
            assert!(fold.test.iter().all(|idx| !fold.train.contains(idx)));
        }
    }

    #[test]
    fn user_based_split_keeps_users_together() {
        let mut rng = XorShiftRng::seed_from_u64(7);
        let x: Vec<(usize, usize)> = (0..200).map(|i| (i % 20, i)).collect();

        let fold = user_based_split(&x, &mut rng, 0.3);
        assert_eq!(fold.train.len() + fold.test.len(), 200);

        for &test_idx in &fold.test {
            let user = x[test_idx].0;
            assert!(fold.train.iter().all(|&idx| x[idx].0 != user));
        }
    }
}
