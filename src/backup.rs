//! Saving and restoring fitted models.
//!
//! A model lands in `<directory>/<shortname>.json`, so refitting with the
//! same hyperparameters overwrites the previous backup while differently
//! configured models never collide. Files are written to a temporary name
//! first and renamed into place, so a failed write never leaves a truncated
//! backup behind.
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use failure::Fail;
use rand::Rng;
use serde::Serialize;

use crate::dataset::{Dataset, DatasetError, RatingTriplet};
use crate::models::Algorithm;
use crate::registry::{Registry, RegistryError};
use crate::side::SideInformation;
use crate::values::RatingValues;
use crate::{FittingError, RecommendationAlgorithm};

/// Backup error types.
#[derive(Debug, Fail)]
pub enum BackupError {
    /// Nothing was saved under this name yet; train a fresh model instead.
    #[fail(display = "No backup found at {:?}.", path)]
    NoBackup {
        /// Where the backup was expected.
        path: PathBuf,
    },
    /// The model keeps no serializable state.
    #[fail(display = "{} is not serializable.", name)]
    NotSerializable {
        /// Shortname of the model.
        name: String,
    },
    /// Underlying I/O failure.
    #[fail(display = "I/O error: {}", _0)]
    Io(#[cause] io::Error),
    /// Malformed or unserializable backup.
    #[fail(display = "Serialization error: {}", _0)]
    Serialization(#[cause] serde_json::Error),
    /// The algorithm could not be instantiated.
    #[fail(display = "{}", _0)]
    Registry(#[cause] RegistryError),
    /// The ratings could not be encoded.
    #[fail(display = "{}", _0)]
    Dataset(#[cause] DatasetError),
    /// The algorithm failed to fit.
    #[fail(display = "{}", _0)]
    Fitting(#[cause] FittingError),
}

impl From<io::Error> for BackupError {
    fn from(err: io::Error) -> Self {
        BackupError::Io(err)
    }
}

impl From<serde_json::Error> for BackupError {
    fn from(err: serde_json::Error) -> Self {
        BackupError::Serialization(err)
    }
}

impl From<RegistryError> for BackupError {
    fn from(err: RegistryError) -> Self {
        BackupError::Registry(err)
    }
}

impl From<DatasetError> for BackupError {
    fn from(err: DatasetError) -> Self {
        BackupError::Dataset(err)
    }
}

impl From<FittingError> for BackupError {
    fn from(err: FittingError) -> Self {
        BackupError::Fitting(err)
    }
}

/// Make a shortname safe to use as a file name.
///
/// Anything outside `[A-Za-z0-9._-]` becomes an underscore.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Serialize `value` as JSON to `path`, replacing any previous file
/// atomically.
pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let written = File::create(&temp_path).and_then(|file| {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
        writer.get_ref().sync_all()
    });

    match written {
        Ok(()) => fs::rename(&temp_path, path),
        Err(err) => {
            let _ = fs::remove_file(&temp_path);
            Err(err)
        }
    }
}

/// A directory of model backups.
#[derive(Clone, Debug)]
pub struct BackupStore {
    directory: PathBuf,
}

impl BackupStore {
    /// A store over `directory`, created on first save.
    pub fn new<P: AsRef<Path>>(directory: P) -> Self {
        BackupStore {
            directory: directory.as_ref().to_path_buf(),
        }
    }

    /// Directory holding the backups.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Where the model named `name` is stored. `name` is either a shortname
    /// or a backup file name.
    pub fn path_for(&self, name: &str) -> PathBuf {
        if name.ends_with(".json") {
            self.directory.join(sanitize(name))
        } else {
            self.directory.join(format!("{}.json", sanitize(name)))
        }
    }

    /// Save a fitted model and return the path of its backup.
    ///
    /// Models that are not serializable are refused before touching the
    /// filesystem.
    pub fn save(&self, algorithm: &Algorithm) -> Result<PathBuf, BackupError> {
        if !algorithm.is_serializable() {
            return Err(BackupError::NotSerializable {
                name: algorithm.shortname(),
            });
        }

        fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(algorithm.backup_filename());
        write_json_atomically(&path, algorithm)?;

        tracing::info!(algorithm = %algorithm.shortname(), path = ?path, "saved backup");
        Ok(path)
    }

    /// Load the model saved under a shortname or file name.
    pub fn load(&self, name: &str) -> Result<Algorithm, BackupError> {
        let path = self.path_for(name);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(BackupError::NoBackup { path })
            }
            Err(err) => return Err(err.into()),
        };

        let algorithm: Algorithm = serde_json::from_reader(BufReader::new(file))?;
        tracing::info!(algorithm = %algorithm.shortname(), path = ?path, "loaded backup");

        Ok(algorithm)
    }

    /// Save the dataset a model was fitted on, next to the model.
    pub fn save_dataset(&self, dataset: &Dataset, name: &str) -> Result<PathBuf, BackupError> {
        fs::create_dir_all(&self.directory)?;
        let path = self.dataset_path(name);
        write_json_atomically(&path, dataset)?;

        Ok(path)
    }

    /// Load the dataset saved for the model named `name`.
    pub fn load_dataset(&self, name: &str) -> Result<Dataset, BackupError> {
        let path = self.dataset_path(name);
        if !path.exists() {
            return Err(BackupError::NoBackup { path });
        }

        Ok(Dataset::load(path)?)
    }

    fn dataset_path(&self, name: &str) -> PathBuf {
        let stem = name.trim_end_matches(".json");
        self.directory
            .join(format!("dataset-{}.json", sanitize(stem)))
    }
}

/// Instantiate `name` from the registry, fit it on raw triplets and back
/// it up when it is serializable.
///
/// `name` is a registry name, optionally with hyperparameters as in
/// `als:nb_components=10`.
///
/// Returns the dataset holding the encoding together with the fitted model.
pub fn fit_algo<I, R>(
    registry: &Registry,
    store: &BackupStore,
    name: &str,
    triplets: I,
    convert: &RatingValues,
    tags: Option<&SideInformation>,
    rng: &mut R,
) -> Result<(Dataset, Algorithm), BackupError>
where
    I: IntoIterator,
    I::Item: Into<RatingTriplet>,
    R: Rng,
{
    let mut algorithm = registry.instantiate_configuration(name)?;

    let mut dataset = Dataset::new();
    let data = dataset.make_anonymous_data(triplets, convert, false, rng)?;

    algorithm.set_parameters(data.nb_users, data.nb_works);
    if let Some(tags) = tags {
        algorithm.load_tags(tags);
    }
    algorithm.fit(&data.x, &data.y)?;

    if algorithm.is_serializable() {
        store.save(&algorithm)?;
        store.save_dataset(&dataset, &algorithm.shortname())?;
    } else {
        tracing::info!(
            algorithm = %algorithm.shortname(),
            "not serializable, skipping backup"
        );
    }

    Ok((dataset, algorithm))
}

/// Restore the backup of the registry algorithm `name`, configured the
/// same way as for [`fit_algo`].
///
/// Non-serializable algorithms are refused before any I/O.
pub fn get_algo_backup(
    registry: &Registry,
    store: &BackupStore,
    name: &str,
) -> Result<Algorithm, BackupError> {
    let algorithm = registry.instantiate_configuration(name)?;
    if !algorithm.is_serializable() {
        return Err(BackupError::NotSerializable {
            name: algorithm.shortname(),
        });
    }

    store.load(&algorithm.backup_filename())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::models::{Als, Zero};

    fn triplets() -> Vec<(u64, u64, &'static str)> {
        vec![
            (1, 10, "like"),
            (1, 11, "dislike"),
            (2, 10, "favorite"),
            (2, 12, "like"),
            (3, 11, "neutral"),
            (3, 12, "willsee"),
        ]
    }

    #[test]
    fn sanitized_names() {
        assert_eq!(sanitize("als-20"), "als-20");
        assert_eq!(
            sanitize("balse:(als-10)|(lasso-with_bias-0.010000)"),
            "balse__als-10___lasso-with_bias-0.010000_"
        );
        assert_eq!(Als::new().build().backup_filename(), "als-20.json");
    }

    #[test]
    fn missing_backup_is_distinguishable() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());

        match store.load("als-20") {
            Err(BackupError::NoBackup { path }) => assert_eq!(path, dir.path().join("als-20.json")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn non_serializable_models_are_refused_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path().join("never-created"));

        match store.save(&Zero::new().into()) {
            Err(BackupError::NotSerializable { name }) => assert_eq!(name, "zero"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!store.directory().exists());

        match get_algo_backup(&Registry::default(), &store, "zero") {
            Err(BackupError::NotSerializable { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn overwrites_instead_of_accumulating() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let mut rng = XorShiftRng::seed_from_u64(3);
        let registry = Registry::default();

        fit_algo(&registry, &store, "als", triplets(), &RatingValues::default(), None, &mut rng)
            .unwrap();
        fit_algo(&registry, &store, "als", triplets(), &RatingValues::default(), None, &mut rng)
            .unwrap();

        let mut files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        files.sort();
        assert_eq!(files, vec!["als-20.json", "dataset-als-20.json"]);
    }

    #[test]
    fn differently_configured_models_get_their_own_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let mut rng = XorShiftRng::seed_from_u64(5);
        let registry = Registry::default();

        let (_, mild) = fit_algo(
            &registry,
            &store,
            "als:nb_components=2",
            triplets(),
            &RatingValues::default(),
            None,
            &mut rng,
        )
        .unwrap();
        let (_, strong) = fit_algo(
            &registry,
            &store,
            "als:nb_components=2,lambda=5.0",
            triplets(),
            &RatingValues::default(),
            None,
            &mut rng,
        )
        .unwrap();

        assert_ne!(mild.backup_filename(), strong.backup_filename());
        assert!(store.path_for(&mild.shortname()).exists());
        assert!(store.path_for(&strong.shortname()).exists());
    }

    #[test]
    fn failed_write_keeps_the_previous_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let path = store.path_for("als-20");

        // Tuple keys cannot become JSON object keys.
        let mut unserializable = BTreeMap::new();
        unserializable.insert((1u8, 2u8), 3u8);

        assert!(write_json_atomically(&path, &unserializable).is_err());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
        match store.load("als-20") {
            Err(BackupError::NoBackup { .. }) => {}
            other => panic!("unexpected {:?}", other),
        }

        store.save(&Als::new().build().into()).unwrap();
        assert!(write_json_atomically(&path, &unserializable).is_err());
        assert!(write_json_atomically(&dir.path().join(".."), &1).is_err());

        let files: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["als-20.json"]);
        assert_eq!(store.load("als-20").unwrap().shortname(), "als-20");
    }

    #[test]
    fn fitted_model_comes_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let mut rng = XorShiftRng::seed_from_u64(4);
        let registry = Registry::default();

        let (dataset, algorithm) = fit_algo(
            &registry,
            &store,
            "als",
            triplets(),
            &RatingValues::default(),
            None,
            &mut rng,
        )
        .unwrap();
        let restored = get_algo_backup(&registry, &store, "als").unwrap();
        let restored_dataset = store.load_dataset(&restored.shortname()).unwrap();

        let x = &dataset.anonymized().unwrap().x;
        assert_eq!(algorithm.predict(x).unwrap(), restored.predict(x).unwrap());
        assert_eq!(restored_dataset.encode_user(2), dataset.encode_user(2));
    }

    #[test]
    fn unserializable_fits_skip_the_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());
        let mut rng = XorShiftRng::seed_from_u64(5);

        let (_, algorithm) = fit_algo(
            &Registry::default(),
            &store,
            "zero",
            triplets(),
            &RatingValues::default(),
            None,
            &mut rng,
        )
        .unwrap();

        assert_eq!(algorithm.shortname(), "zero");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
