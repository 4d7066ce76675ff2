//! Models module.
use std::hash::{Hash, Hasher};

use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use siphasher::sip::SipHasher;

use crate::side::SideInformation;
use crate::{FittingError, PredictionError, RecommendationAlgorithm, UserIdx, WorkIdx};

pub mod als;
pub mod als2;
pub mod balse;
mod boosting;
pub mod fma;
pub mod gbr;
pub mod knn;
pub mod lasso;
pub mod nmf;
pub mod pca;
pub mod svd;
pub mod wals;
pub mod xals;
pub mod zero;

pub use self::als::Als;
pub use self::als2::Als2;
pub use self::balse::Balse;
pub use self::fma::Fma;
pub use self::gbr::Gbr;
pub use self::knn::Knn;
pub use self::lasso::Lasso;
pub use self::nmf::Nmf;
pub use self::pca::Pca;
pub use self::svd::Svd;
pub use self::wals::Wals;
pub use self::xals::Xals;
pub use self::zero::Zero;

/// Any of the built-in algorithms.
///
/// The serialized form is internally tagged by the registry name, so a
/// backup file is self-describing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Algorithm {
    /// Constant zero baseline.
    Zero(Zero),
    /// Alternating least squares on user-centered ratings.
    Als(Als),
    /// Alternating least squares with biases.
    Als2(Als2),
    /// Alternating least squares with frozen tag factors.
    Xals(Xals),
    /// Randomized truncated SVD.
    Svd(Svd),
    /// Weighted alternating least squares over the full matrix.
    Wals(Wals),
    /// User-based nearest neighbours.
    Knn(Knn),
    /// Per-user Lasso on tags.
    Lasso(Lasso),
    /// ALS, or Lasso for rarely rated works.
    Balse(Balse),
    /// Gradient-boosted trees over ALS features.
    Gbr(Gbr),
    /// Factorization machine.
    Fma(Fma),
    /// Non-negative matrix factorization.
    Nmf(Nmf),
    /// Principal component analysis.
    Pca(Pca),
}

macro_rules! dispatch {
    ($algorithm:expr, $model:ident => $body:expr) => {
        match $algorithm {
            Algorithm::Zero($model) => $body,
            Algorithm::Als($model) => $body,
            Algorithm::Als2($model) => $body,
            Algorithm::Xals($model) => $body,
            Algorithm::Svd($model) => $body,
            Algorithm::Wals($model) => $body,
            Algorithm::Knn($model) => $body,
            Algorithm::Lasso($model) => $body,
            Algorithm::Balse($model) => $body,
            Algorithm::Gbr($model) => $body,
            Algorithm::Fma($model) => $body,
            Algorithm::Nmf($model) => $body,
            Algorithm::Pca($model) => $body,
        }
    };
}

macro_rules! impl_from_model {
    ($($variant:ident),*) => {
        $(
            impl From<$variant> for Algorithm {
                fn from(model: $variant) -> Self {
                    Algorithm::$variant(model)
                }
            }
        )*
    };
}

impl_from_model!(Zero, Als, Als2, Xals, Svd, Wals, Knn, Lasso, Balse, Gbr, Fma, Nmf, Pca);

impl RecommendationAlgorithm for Algorithm {
    fn set_parameters(&mut self, nb_users: usize, nb_works: usize) {
        dispatch!(self, model => model.set_parameters(nb_users, nb_works))
    }

    fn fit(&mut self, x: &[(UserIdx, WorkIdx)], y: &[f64]) -> Result<(), FittingError> {
        dispatch!(self, model => model.fit(x, y))
    }

    fn predict(&self, x: &[(UserIdx, WorkIdx)]) -> Result<Vec<f64>, PredictionError> {
        dispatch!(self, model => model.predict(x))
    }

    fn shortname(&self) -> String {
        dispatch!(self, model => model.shortname())
    }

    fn is_serializable(&self) -> bool {
        dispatch!(self, model => model.is_serializable())
    }

    fn requires_side_information(&self) -> bool {
        dispatch!(self, model => model.requires_side_information())
    }

    fn load_tags(&mut self, tags: &SideInformation) {
        dispatch!(self, model => model.load_tags(tags))
    }

    fn unzip(&mut self) {
        dispatch!(self, model => model.unzip())
    }

    fn is_unzipped(&self) -> bool {
        dispatch!(self, model => model.is_unzipped())
    }
}

/// Latent factors whose row products give the predictions, with the dense
/// product optionally cached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct Factors {
    pub(crate) users: Array2<f64>,
    pub(crate) works: Array2<f64>,
    #[serde(default)]
    pub(crate) product: Option<Array2<f64>>,
}

impl Factors {
    pub(crate) fn new(users: Array2<f64>, works: Array2<f64>) -> Self {
        Factors {
            users,
            works,
            product: None,
        }
    }

    pub(crate) fn score(&self, user: UserIdx, work: WorkIdx) -> f64 {
        match self.product {
            Some(ref product) => product[[user, work]],
            None => self.users.row(user).dot(&self.works.row(work)),
        }
    }

    pub(crate) fn unzip(&mut self) {
        tracing::debug!(
            nb_users = self.users.nrows(),
            nb_works = self.works.nrows(),
            "computing dense prediction matrix"
        );
        self.product = Some(self.users.dot(&self.works.t()));
    }

    pub(crate) fn is_unzipped(&self) -> bool {
        self.product.is_some()
    }
}

/// Validate the arguments of `fit` and return the bound dimensions.
pub(crate) fn check_fit_input(
    dimensions: Option<(usize, usize)>,
    x: &[(UserIdx, WorkIdx)],
    y: &[f64],
) -> Result<(usize, usize), FittingError> {
    let dimensions = dimensions.ok_or(FittingError::NotParameterized)?;

    if x.len() != y.len() {
        return Err(FittingError::LengthMismatch {
            x: x.len(),
            y: y.len(),
        });
    }
    if x.is_empty() {
        return Err(FittingError::NoRatings);
    }

    Ok(dimensions)
}

/// Reject predictions that went numerically wrong.
pub(crate) fn check_predictions(predictions: Vec<f64>) -> Result<Vec<f64>, PredictionError> {
    if predictions.iter().all(|value| value.is_finite()) {
        Ok(predictions)
    } else {
        Err(PredictionError::InvalidPredictionValue)
    }
}

/// A fresh generator, seeded when reproducibility is requested.
pub(crate) fn seeded_rng(seed: Option<u64>) -> XorShiftRng {
    match seed {
        Some(seed) => XorShiftRng::seed_from_u64(seed),
        None => XorShiftRng::seed_from_u64(rand::thread_rng().gen()),
    }
}

/// `base` as is for an otherwise default configuration, or suffixed with a
/// hash of the hyperparameters that differ from their defaults.
///
/// `named` lists the hyperparameters `base` already spells out. The seed
/// only picks a draw and never takes part in the name.
pub(crate) fn configured_shortname<H: Serialize + Default>(
    base: String,
    hyper: &H,
    named: &[&str],
) -> String {
    let unnamed = |hyper: &H| -> Option<Map<String, Value>> {
        match serde_json::to_value(hyper) {
            Ok(Value::Object(mut map)) => {
                map.remove("seed");
                for key in named {
                    map.remove(*key);
                }
                Some(map)
            }
            _ => None,
        }
    };

    match (unnamed(hyper), unnamed(&H::default())) {
        (Some(own), Some(default)) if own != default => {
            // Keys are sorted, so the text is stable across runs.
            let mut hasher = SipHasher::new();
            Value::Object(own).to_string().hash(&mut hasher);
            format!("{}-{:08x}", base, hasher.finish() as u32)
        }
        _ => base,
    }
}

/// Matrix with independent uniform `[0, 1)` entries.
pub(crate) fn uniform_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen::<f64>())
}

#[cfg(test)]
mod tests {
    use ndarray::Array2;
    use rand::{Rng, SeedableRng};
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::backup::BackupStore;
    use crate::data::{select, train_test_split};
    use crate::dataset::Dataset;
    use crate::registry::Registry;
    use crate::values::RatingValues;
    use crate::{compute_rmse, RawId};

    /// Nearly dense ratings around 2 with a rank-2 signal, and matching tags.
    pub(crate) fn synthetic(
        nb_users: usize,
        nb_works: usize,
        seed: u64,
    ) -> (Vec<(UserIdx, WorkIdx)>, Vec<f64>, SideInformation) {
        let mut rng = XorShiftRng::seed_from_u64(seed);
        let user_factors = uniform_init(nb_users, 2, &mut rng) - 0.5;
        let work_factors = uniform_init(nb_works, 2, &mut rng) - 0.5;

        let mut x = Vec::new();
        let mut y = Vec::new();
        for user in 0..nb_users {
            for work in 0..nb_works {
                if rng.gen::<f64>() < 0.9 {
                    x.push((user, work));
                    y.push(2.0 + 2.0 * user_factors.row(user).dot(&work_factors.row(work)));
                }
            }
        }

        let mut tags = Array2::zeros((nb_works, 3));
        for work in 0..nb_works {
            tags[[work, 0]] = work_factors[[work, 0]];
            tags[[work, 1]] = work_factors[[work, 1]];
            tags[[work, 2]] = if work % 2 == 0 { 1.0 } else { 0.0 };
        }

        (x, y, SideInformation::from_dense(tags).scale(false))
    }

    fn candidates() -> Vec<Algorithm> {
        vec![
            Als::new().nb_components(4).nb_iterations(10).seed(7).build().into(),
            Als2::new().nb_components(4).nb_iterations(10).seed(7).build().into(),
            Xals::new().nb_components(4).nb_iterations(10).seed(7).build().into(),
            Svd::new().nb_components(4).build().into(),
            Wals::new().nb_components(4).nb_iterations(10).seed(7).build().into(),
            Knn::new().nb_neighbors(10).build().into(),
            Lasso::new().build().into(),
            Balse::new().nb_components(4).seed(7).build().into(),
            Gbr::new().nb_components(4).nb_estimators(30).seed(7).build().into(),
            Fma::new().rank(4).nb_iterations(30).seed(7).build().into(),
            Nmf::new().nb_components(4).build().into(),
            Pca::new().nb_components(4).build().into(),
        ]
    }

    fn fitted(
        mut algo: Algorithm,
        nb_users: usize,
        nb_works: usize,
        x: &[(UserIdx, WorkIdx)],
        y: &[f64],
        tags: &SideInformation,
    ) -> Algorithm {
        algo.set_parameters(nb_users, nb_works);
        algo.load_tags(tags);
        algo.fit(x, y).unwrap();
        algo
    }

    #[test]
    fn every_registered_algorithm_predicts_finite_values() {
        let (x, y, tags) = synthetic(15, 12, 1);
        let registry = Registry::default();

        for name in registry.list_available() {
            let algo = fitted(registry.instantiate(&name).unwrap(), 15, 12, &x, &y, &tags);
            let predictions = algo.predict(&x).unwrap();

            assert_eq!(predictions.len(), x.len(), "{}", name);
            assert!(predictions.iter().all(|p| p.is_finite()), "{}", name);
        }
    }

    #[test]
    fn unseen_pairs_get_finite_predictions() {
        let (x, y, tags) = synthetic(15, 12, 2);
        let train: Vec<usize> = (0..x.len()).filter(|&idx| x[idx].0 != 3).collect();
        let (train_x, train_y) = select(&x, &y, &train);
        let all_pairs: Vec<(usize, usize)> = (0..15)
            .flat_map(|user| (0..12).map(move |work| (user, work)))
            .collect();

        for algo in candidates() {
            let algo = fitted(algo, 15, 12, &train_x, &train_y, &tags);
            let predictions = algo.predict(&all_pairs).unwrap();
            assert!(predictions.iter().all(|p| p.is_finite()), "{}", algo.shortname());
        }
    }

    #[test]
    fn every_algorithm_beats_zero() {
        let (x, y, tags) = synthetic(40, 25, 3);
        let mut rng = XorShiftRng::seed_from_u64(5);
        let fold = train_test_split(x.len(), &mut rng, 0.2);
        let (train_x, train_y) = select(&x, &y, &fold.train);
        let (test_x, test_y) = select(&x, &y, &fold.test);

        let zero = fitted(Zero::new().into(), 40, 25, &train_x, &train_y, &tags);
        let baseline = compute_rmse(&zero.predict(&test_x).unwrap(), &test_y);

        for algo in candidates() {
            let algo = fitted(algo, 40, 25, &train_x, &train_y, &tags);
            let rmse = compute_rmse(&algo.predict(&test_x).unwrap(), &test_y);
            assert!(
                rmse < baseline,
                "{} has RMSE {} against {} for zero",
                algo.shortname(),
                rmse,
                baseline
            );
        }
    }

    #[test]
    fn serializable_algorithms_survive_backup() {
        let (x, y, tags) = synthetic(15, 12, 4);
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());

        for algo in candidates() {
            let mut algo = fitted(algo, 15, 12, &x, &y, &tags);
            if !algo.is_serializable() {
                assert!(store.save(&algo).is_err());
                continue;
            }

            let before = algo.predict(&x).unwrap();
            store.save(&algo).unwrap();
            let loaded = store.load(&algo.shortname()).unwrap();
            let after = loaded.predict(&x).unwrap();

            assert_eq!(loaded.shortname(), algo.shortname());
            for (a, b) in before.iter().zip(&after) {
                assert!((a - b).abs() < 1e-9, "{}", algo.shortname());
            }

            algo.unzip();
            let unzipped = algo.predict(&x).unwrap();
            for (a, b) in before.iter().zip(&unzipped) {
                assert!((a - b).abs() < 1e-9, "{}", algo.shortname());
            }
        }
    }

    #[test]
    fn only_default_configurations_keep_bare_names() {
        let registry = Registry::default();
        let name = |configuration: &str| {
            registry
                .instantiate_configuration(configuration)
                .unwrap()
                .shortname()
        };

        assert_eq!(name("als:nb_components=2"), "als-2");
        assert_eq!(name("als:nb_components=2,seed=3"), "als-2");
        assert_eq!(name("als:nb_components=2,lambda=0.1"), "als-2");
        assert_eq!(name("knn"), "knn-20");
        assert_eq!(name("balse"), "balse:(als-10)|(lasso-with_bias-0.010000)");

        let tuned = name("als:nb_components=2,lambda=5.0");
        assert!(tuned.starts_with("als-2-"), "{}", tuned);
        assert_eq!(tuned, name("als:lambda=5.0,nb_components=2"));
        assert_ne!(tuned, name("als:nb_components=2,lambda=4.0"));

        assert_ne!(name("knn:nb_neighbors=5"), name("knn:nb_neighbors=5,weighted=false"));
        assert_ne!(name("wals"), name("wals:unobserved_weight=0.5"));
        assert_ne!(name("gbr"), name("gbr:max_depth=2"));
        assert_ne!(name("fma"), name("fma:learning_rate=0.1"));
        assert_ne!(name("balse"), name("balse:gamma=3"));
    }

    #[test]
    fn small_als_scenario() {
        let triplets: Vec<(RawId, RawId, &str)> = vec![
            (0, 0, "like"),
            (0, 1, "dislike"),
            (1, 0, "like"),
            (1, 2, "like"),
            (2, 3, "favorite"),
        ];
        let mut rng = XorShiftRng::seed_from_u64(0);
        let mut dataset = Dataset::new();
        let data = dataset
            .make_anonymous_data(triplets, &RatingValues::default(), false, &mut rng)
            .unwrap()
            .clone();

        assert_eq!(data.nb_users, 3);
        assert_eq!(data.nb_works, 4);

        let mut als: Algorithm = Als::new().nb_components(2).nb_iterations(5).seed(0).build().into();
        als.set_parameters(data.nb_users, data.nb_works);
        als.fit(&data.x, &data.y).unwrap();

        let pair = (dataset.encode_user(0).unwrap(), dataset.encode_work(0).unwrap());
        let prediction = als.predict(&[pair]).unwrap()[0];
        assert!(prediction > -2.0 && prediction < 4.0);
    }

    #[test]
    fn fitting_requires_parameters() {
        let mut als: Algorithm = Als::new().build().into();
        match als.fit(&[(0, 0)], &[1.0]) {
            Err(FittingError::NotParameterized) => {}
            other => panic!("unexpected {:?}", other),
        }

        als.set_parameters(1, 1);
        match als.fit(&[(0, 0)], &[1.0, 2.0]) {
            Err(FittingError::LengthMismatch { x: 1, y: 2 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(als.predict(&[(0, 0)]).is_err());
    }
}
