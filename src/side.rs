//! Side information: a dense `(nb_works × nb_tags)` content feature matrix.
use std::io;
use std::path::Path;

use failure::Fail;
use ndarray::{Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::dataset::Dataset;
use crate::{RawId, WorkIdx};

/// Side information error types.
#[derive(Debug, Fail)]
pub enum SideInformationError {
    /// A tag row refers to a work outside the matrix.
    #[fail(display = "Work {} is out of range for {} works.", work, nb_works)]
    WorkOutOfRange {
        /// The offending encoded work.
        work: WorkIdx,
        /// Number of rows of the tag matrix.
        nb_works: usize,
    },
    /// Underlying I/O failure.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    /// Malformed CSV input.
    #[fail(display = "CSV error: {}", _0)]
    Csv(#[cause] csv::Error),
}

impl From<io::Error> for SideInformationError {
    fn from(err: io::Error) -> Self {
        SideInformationError::Io(err)
    }
}

impl From<csv::Error> for SideInformationError {
    fn from(err: csv::Error) -> Self {
        SideInformationError::Csv(err)
    }
}

/// Tag features of every work, one row per encoded work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SideInformation {
    t: Array2<f64>,
}

impl SideInformation {
    /// Wrap a dense `(nb_works, nb_tags)` matrix.
    pub fn from_dense(t: Array2<f64>) -> Self {
        SideInformation { t }
    }

    /// Build the matrix from `(work, tag, value)` coordinates.
    ///
    /// The number of tags is one past the largest tag index seen.
    pub fn from_triplets(
        nb_works: usize,
        triplets: &[(WorkIdx, usize, f64)],
    ) -> Result<Self, SideInformationError> {
        let nb_tags = triplets.iter().map(|&(_, tag, _)| tag + 1).max().unwrap_or(0);
        let mut t = Array2::zeros((nb_works, nb_tags));

        for &(work, tag, value) in triplets {
            if work >= nb_works {
                return Err(SideInformationError::WorkOutOfRange { work, nb_works });
            }
            t[[work, tag]] = value;
        }

        Ok(SideInformation { t })
    }

    /// Read `work,tag,value` lines over encoded work indices.
    pub fn from_csv<P: AsRef<Path>>(path: P, nb_works: usize) -> Result<Self, SideInformationError> {
        let triplets = read_triplets::<P, WorkIdx>(path)?;
        SideInformation::from_triplets(nb_works, &triplets)
    }

    /// Read `work_id,tag,value` lines over raw work identifiers.
    ///
    /// Works the dataset does not know are dropped, since tag files usually
    /// cover the whole catalogue.
    pub fn from_raw_csv<P: AsRef<Path>>(
        path: P,
        dataset: &Dataset,
    ) -> Result<Self, SideInformationError> {
        let triplets: Vec<(WorkIdx, usize, f64)> = read_triplets::<P, RawId>(path)?
            .into_iter()
            .filter_map(|(work_id, tag, value)| {
                dataset.encode_work(work_id).map(|work| (work, tag, value))
            })
            .collect();

        SideInformation::from_triplets(dataset.nb_works(), &triplets)
    }

    /// Scale every column to unit variance, centering it first if `with_mean`.
    ///
    /// Constant columns are left unscaled.
    pub fn scale(mut self, with_mean: bool) -> Self {
        let nb_works = self.t.nrows() as f64;
        if nb_works == 0.0 {
            return self;
        }

        for mut column in self.t.axis_iter_mut(Axis(1)) {
            let mean = column.sum() / nb_works;
            let variance = column
                .iter()
                .map(|value| (value - mean) * (value - mean))
                .sum::<f64>()
                / nb_works;
            let std = variance.sqrt();

            if with_mean {
                column.mapv_inplace(|value| value - mean);
            }
            if std > 0.0 {
                column.mapv_inplace(|value| value / std);
            }
        }

        self
    }

    /// Number of rows.
    pub fn nb_works(&self) -> usize {
        self.t.nrows()
    }

    /// Number of tag columns.
    pub fn nb_tags(&self) -> usize {
        self.t.ncols()
    }

    /// The underlying matrix.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.t
    }

    /// Tags of one encoded work.
    pub fn row(&self, work: WorkIdx) -> ArrayView1<f64> {
        self.t.row(work)
    }
}

fn read_triplets<P, W>(path: P) -> Result<Vec<(W, usize, f64)>, SideInformationError>
where
    P: AsRef<Path>,
    W: serde::de::DeserializeOwned,
{
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_path(path)?;

    let triplets = reader.deserialize().collect::<Result<Vec<_>, _>>()?;
    Ok(triplets)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use ndarray::array;
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::values::RatingValues;

    #[test]
    fn scaling_gives_unit_variance() {
        let side = SideInformation::from_dense(array![[1.0, 5.0], [3.0, 5.0], [5.0, 5.0]]).scale(true);
        let t = side.matrix();

        let column = t.column(0);
        assert!(column.sum().abs() < 1e-12);
        let variance = column.iter().map(|v| v * v).sum::<f64>() / 3.0;
        assert!((variance - 1.0).abs() < 1e-12);

        // Constant columns are centered but not divided.
        assert_eq!(t.column(1).to_vec(), vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn scaling_without_mean_keeps_zeros() {
        let side = SideInformation::from_dense(array![[0.0], [2.0]]).scale(false);
        assert_eq!(side.matrix()[[0, 0]], 0.0);
        assert!((side.matrix()[[1, 0]] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_works_are_rejected() {
        match SideInformation::from_triplets(2, &[(0, 0, 1.0), (2, 1, 1.0)]) {
            Err(SideInformationError::WorkOutOfRange { work, nb_works }) => {
                assert_eq!((work, nb_works), (2, 2))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn raw_csv_drops_unknown_works() {
        let mut dataset = Dataset::new();
        let mut rng = XorShiftRng::seed_from_u64(3);
        let triplets: Vec<(RawId, RawId, &str)> = vec![(1, 100, "like"), (2, 101, "dislike")];
        dataset
            .make_anonymous_data(triplets, &RatingValues::default(), false, &mut rng)
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "100,0,0.5").unwrap();
        writeln!(file, "101,2,1.5").unwrap();
        writeln!(file, "999,1,3.0").unwrap();

        let side = SideInformation::from_raw_csv(&path, &dataset).unwrap();
        assert_eq!(side.nb_works(), 2);
        assert_eq!(side.nb_tags(), 3);
        assert_eq!(side.row(dataset.encode_work(100).unwrap())[0], 0.5);
        assert_eq!(side.row(dataset.encode_work(101).unwrap())[2], 1.5);
        assert_eq!(side.matrix().column(1).sum(), 0.0);
    }
}
