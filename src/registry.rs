//! Algorithm lookup by name.
//!
//! A [`Registry`] maps a name such as `"als"` to a constructor and the
//! default hyperparameters used when instantiating it. Registries are plain
//! values: tests can build isolated ones with [`Registry::new`], while
//! [`Registry::default`] knows every built-in algorithm.
use std::collections::BTreeMap;

use failure::Fail;
use serde_json::{json, Map, Value};

use crate::models::{
    als, als2, balse, fma, gbr, knn, lasso, nmf, pca, svd, wals, xals, Algorithm, Zero,
};

/// Registry error types.
#[derive(Debug, Fail)]
pub enum RegistryError {
    /// Nothing registered under this name.
    #[fail(
        display = "No algorithm named \"{}\" in the registry. Is it registered, or is there a typo?",
        name
    )]
    UnknownAlgorithm {
        /// The requested name.
        name: String,
    },
    /// The hyperparameters do not fit the algorithm.
    #[fail(display = "Invalid hyperparameters for {}: {}", name, cause)]
    InvalidParameters {
        /// The requested name.
        name: String,
        /// Why the hyperparameters were rejected.
        #[cause]
        cause: serde_json::Error,
    },
    /// A `name[:key=value,...]` configuration that cannot be parsed.
    #[fail(display = "Malformed algorithm configuration \"{}\".", configuration)]
    MalformedConfiguration {
        /// The configuration as given.
        configuration: String,
    },
}

/// Builds an algorithm from a JSON object of hyperparameters.
pub type Constructor = fn(Value) -> Result<Algorithm, serde_json::Error>;

#[derive(Clone, Debug)]
struct Entry {
    constructor: Constructor,
    defaults: Map<String, Value>,
}

/// Name to constructor table.
#[derive(Clone, Debug)]
pub struct Registry {
    entries: BTreeMap<String, Entry>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Registry {
            entries: BTreeMap::new(),
        }
    }

    /// Register `constructor` under `name`; a later registration under the
    /// same name replaces the earlier one.
    pub fn register(&mut self, name: &str, constructor: Constructor, defaults: Value) {
        let defaults = match defaults {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        tracing::debug!(name, defaults = %serde_json::Value::Object(defaults.clone()), "registering algorithm");

        self.entries.insert(
            name.to_owned(),
            Entry {
                constructor,
                defaults,
            },
        );
    }

    /// Instantiate `name` with its default hyperparameters.
    pub fn instantiate(&self, name: &str) -> Result<Algorithm, RegistryError> {
        self.instantiate_with(name, &Map::new())
    }

    /// Instantiate `name`, with `overrides` taking precedence over the
    /// registered defaults.
    pub fn instantiate_with(
        &self,
        name: &str,
        overrides: &Map<String, Value>,
    ) -> Result<Algorithm, RegistryError> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| RegistryError::UnknownAlgorithm {
                name: name.to_owned(),
            })?;

        let mut parameters = entry.defaults.clone();
        for (key, value) in overrides {
            parameters.insert(key.clone(), value.clone());
        }

        (entry.constructor)(Value::Object(parameters)).map_err(|cause| {
            RegistryError::InvalidParameters {
                name: name.to_owned(),
                cause,
            }
        })
    }

    /// Instantiate from a `name[:key=value,...]` configuration string.
    pub fn instantiate_configuration(&self, configuration: &str) -> Result<Algorithm, RegistryError> {
        let (name, overrides) = parse_configuration(configuration)?;
        self.instantiate_with(&name, &overrides)
    }

    /// Registered names, sorted.
    pub fn list_available(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Registry::new();

        registry.register(
            "zero",
            |params| Ok(serde_json::from_value::<Zero>(params)?.into()),
            json!({}),
        );
        registry.register(
            "als",
            |params| Ok(serde_json::from_value::<als::Hyperparameters>(params)?.build().into()),
            json!({ "nb_components": 20 }),
        );
        registry.register(
            "als2",
            |params| Ok(serde_json::from_value::<als2::Hyperparameters>(params)?.build().into()),
            json!({ "nb_components": 20 }),
        );
        registry.register(
            "xals",
            |params| Ok(serde_json::from_value::<xals::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "svd",
            |params| Ok(serde_json::from_value::<svd::Hyperparameters>(params)?.build().into()),
            json!({ "nb_components": 20 }),
        );
        registry.register(
            "wals",
            |params| Ok(serde_json::from_value::<wals::Hyperparameters>(params)?.build().into()),
            json!({ "nb_components": 20 }),
        );
        registry.register(
            "knn",
            |params| Ok(serde_json::from_value::<knn::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "lasso",
            |params| Ok(serde_json::from_value::<lasso::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "balse",
            |params| Ok(serde_json::from_value::<balse::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "gbr",
            |params| Ok(serde_json::from_value::<gbr::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "fma",
            |params| Ok(serde_json::from_value::<fma::Hyperparameters>(params)?.build().into()),
            json!({ "rank": 20 }),
        );
        registry.register(
            "nmf",
            |params| Ok(serde_json::from_value::<nmf::Hyperparameters>(params)?.build().into()),
            json!({}),
        );
        registry.register(
            "pca",
            |params| Ok(serde_json::from_value::<pca::Hyperparameters>(params)?.build().into()),
            json!({}),
        );

        registry
    }
}

/// Split `name[:key=value,...]` into a name and hyperparameter overrides.
///
/// Values are read as JSON when possible (`nb_components=10`,
/// `weighted=false`) and as strings otherwise.
pub fn parse_configuration(
    configuration: &str,
) -> Result<(String, Map<String, Value>), RegistryError> {
    let malformed = || RegistryError::MalformedConfiguration {
        configuration: configuration.to_owned(),
    };

    let mut parts = configuration.splitn(2, ':');
    let name = parts.next().map(str::trim).unwrap_or("");
    if name.is_empty() {
        return Err(malformed());
    }

    let mut overrides = Map::new();
    if let Some(assignments) = parts.next() {
        for assignment in assignments.split(',').filter(|a| !a.trim().is_empty()) {
            let mut pair = assignment.splitn(2, '=');
            let key = pair.next().map(str::trim).unwrap_or("");
            let value = pair.next().map(str::trim).ok_or_else(malformed)?;
            if key.is_empty() {
                return Err(malformed());
            }

            let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
            overrides.insert(key.to_owned(), value);
        }
    }

    Ok((name.to_owned(), overrides))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RecommendationAlgorithm;

    #[test]
    fn lists_every_builtin() {
        assert_eq!(
            Registry::default().list_available(),
            vec![
                "als", "als2", "balse", "fma", "gbr", "knn", "lasso", "nmf", "pca", "svd", "wals",
                "xals", "zero"
            ]
        );
    }

    #[test]
    fn defaults_and_overrides() {
        let registry = Registry::default();
        assert_eq!(registry.instantiate("als").unwrap().shortname(), "als-20");
        assert_eq!(registry.instantiate("fma").unwrap().shortname(), "fma-20");
        assert_eq!(registry.instantiate("xals").unwrap().shortname(), "xals-10");

        let mut overrides = Map::new();
        overrides.insert("nb_components".to_owned(), json!(5));
        assert_eq!(
            registry.instantiate_with("als", &overrides).unwrap().shortname(),
            "als-5"
        );
    }

    #[test]
    fn unknown_names_are_reported() {
        match Registry::default().instantiate("alss") {
            Err(err @ RegistryError::UnknownAlgorithm { .. }) => {
                assert!(err.to_string().contains("\"alss\""))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn bad_parameters_are_reported() {
        let registry = Registry::default();
        let mut overrides = Map::new();
        overrides.insert("nb_componnets".to_owned(), json!(5));

        match registry.instantiate_with("als", &overrides) {
            Err(RegistryError::InvalidParameters { name, .. }) => assert_eq!(name, "als"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn isolated_registries() {
        let mut registry = Registry::new();
        assert!(registry.list_available().is_empty());

        registry.register(
            "baseline",
            |params| Ok(serde_json::from_value::<Zero>(params)?.into()),
            json!({}),
        );
        assert!(registry.contains("baseline"));
        assert_eq!(registry.instantiate("baseline").unwrap().shortname(), "zero");
    }

    #[test]
    fn configurations() {
        let (name, overrides) = parse_configuration("knn:nb_neighbors=5, weighted=false").unwrap();
        assert_eq!(name, "knn");
        assert_eq!(overrides["nb_neighbors"], json!(5));
        assert_eq!(overrides["weighted"], json!(false));

        let algorithm = Registry::default()
            .instantiate_configuration("lasso:alpha=0.5,with_bias=false")
            .unwrap();
        assert_eq!(algorithm.shortname(), "lasso-0.500000");

        assert!(parse_configuration("").is_err());
        assert!(parse_configuration("als:nb_components").is_err());
    }
}
