//! Loading and querying agent configuration.
//!
//! Configuration is assembled from any number of sources, where sources added later override values from sources
//! added earlier. Components then pull out the part they care about, either as a whole typed struct or key by key.
use std::{borrow::Cow, collections::HashSet, path::Path, sync::Arc};

use figment::{
    error::Kind,
    providers::{Env, Serialized},
    Figment, Provider as _,
};
pub use figment::value;
use monagent_error::GenericError;
use serde::Deserialize;
use snafu::{ResultExt as _, Snafu};
use tracing::debug;

mod provider;
use self::provider::FileProvider;

/// A configuration error.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConfigurationError {
    /// The environment variable prefix was empty.
    #[snafu(display("Environment variable prefix must not be empty."))]
    EmptyPrefix,

    /// A required field was not present in any source.
    #[snafu(display("Missing field '{}' in configuration. {}", field, help_text))]
    MissingField {
        /// Hint telling the user which keys, including environment variable names, would satisfy the lookup.
        help_text: String,

        /// Name of the missing field.
        field: Cow<'static, str>,
    },

    /// A field was present but held a value of the wrong type.
    #[snafu(display(
        "Expected value for field '{}' to be '{}', got '{}' instead.",
        field,
        expected_ty,
        actual_ty
    ))]
    InvalidFieldType {
        /// Period-separated path to the field.
        field: String,

        /// Expected data type.
        expected_ty: String,

        /// Actual data type.
        actual_ty: String,
    },

    /// Any other failure while loading or extracting configuration.
    #[snafu(display("Failed to load or query configuration."))]
    Generic {
        /// Error source.
        source: GenericError,
    },
}

impl From<figment::Error> for ConfigurationError {
    fn from(e: figment::Error) -> Self {
        translate_error(&HashSet::new(), e)
    }
}

struct BoxedProvider(Box<dyn figment::Provider + Send + Sync>);

impl figment::Provider for BoxedProvider {
    fn metadata(&self) -> figment::Metadata {
        self.0.metadata()
    }

    fn data(&self) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        self.0.data()
    }
}

/// Builds a configuration from files and the environment.
///
/// Supported sources are YAML files, JSON files, and environment variables sharing a common prefix. Precedence
/// follows insertion order: the last source added wins.
#[derive(Default)]
pub struct ConfigurationLoader {
    env_prefixes: HashSet<String>,
    providers: Vec<BoxedProvider>,
}

impl ConfigurationLoader {
    /// Loads the given YAML configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or is not valid YAML, an error is returned.
    pub fn from_yaml<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_yaml(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads the given YAML configuration file if it can be read and parsed, and otherwise does nothing.
    pub fn try_from_yaml<P: AsRef<Path>>(mut self, path: P) -> Self {
        match FileProvider::from_yaml(&path) {
            Ok(provider) => self.providers.push(BoxedProvider(Box::new(provider))),
            Err(e) => {
                debug!(error = %e, file_path = %path.as_ref().display(), "Unable to load YAML configuration file. Ignoring.")
            }
        }
        self
    }

    /// Loads the given JSON configuration file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read, or is not valid JSON, an error is returned.
    pub fn from_json<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigurationError> {
        let provider = FileProvider::from_json(&path).map_err(GenericError::from).context(Generic)?;
        self.providers.push(BoxedProvider(Box::new(provider)));
        Ok(self)
    }

    /// Loads every environment variable starting with `prefix`.
    ///
    /// An underscore is appended to the prefix when missing, so `monagent` matches `MONAGENT_LOG_LEVEL` as the key
    /// `log_level`. Matching is case-insensitive.
    ///
    /// # Errors
    ///
    /// If the prefix is empty, or the environment cannot be read, an error is returned.
    pub fn from_environment(mut self, prefix: &str) -> Result<Self, ConfigurationError> {
        if prefix.is_empty() {
            return Err(ConfigurationError::EmptyPrefix);
        }

        let prefix = if prefix.ends_with('_') {
            prefix.to_uppercase()
        } else {
            format!("{}_", prefix.to_uppercase())
        };

        // `Env` is not `Send + Sync`, so the variables are captured now and stored as serialized defaults.
        let values = Env::prefixed(&prefix).data()?;
        if let Some(dict) = values.get(&figment::Profile::Default) {
            self.providers
                .push(BoxedProvider(Box::new(Serialized::defaults(dict.clone()))));
            self.env_prefixes.insert(prefix);
        }
        Ok(self)
    }

    /// Adds a set of in-memory values, layered on top of everything loaded so far.
    pub fn add_values<T>(mut self, values: T) -> Self
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        self.providers
            .push(BoxedProvider(Box::new(Serialized::defaults(values))));
        self
    }

    /// Consumes the loader and deserializes the merged configuration as `T`.
    ///
    /// # Errors
    ///
    /// If the merged configuration cannot be deserialized into `T`, an error is returned.
    pub fn into_typed<'a, T>(self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        let figment = merge(&self.providers);
        figment
            .extract()
            .map_err(|e| translate_error(&self.env_prefixes, e))
    }

    /// Consumes the loader and wraps the merged configuration for key-based access.
    pub fn into_generic(self) -> GenericConfiguration {
        GenericConfiguration {
            inner: Arc::new(Inner {
                figment: merge(&self.providers),
                env_prefixes: self.env_prefixes,
            }),
        }
    }

    /// Builds a configuration from a JSON value, for tests.
    pub fn for_tests(values: Option<serde_json::Value>) -> GenericConfiguration {
        let loader = ConfigurationLoader::default();
        match values {
            Some(values) => loader.add_values(values).into_generic(),
            None => loader.into_generic(),
        }
    }
}

fn merge(providers: &[BoxedProvider]) -> Figment {
    providers
        .iter()
        .fold(Figment::new(), |figment, provider| figment.admerge(provider))
}

#[derive(Debug)]
struct Inner {
    figment: Figment,
    env_prefixes: HashSet<String>,
}

/// Merged configuration, queryable by key.
///
/// Keys use `.` to reach into nested values: with `{"forwarder": {"url": "..."}}`, the key `forwarder.url` yields the
/// string. Since environment variables cannot express nesting, a missing nested key is retried with `.` replaced by
/// `_`, so `MONAGENT_FORWARDER_URL` also satisfies `forwarder.url`.
#[derive(Clone, Debug)]
pub struct GenericConfiguration {
    inner: Arc<Inner>,
}

impl GenericConfiguration {
    fn get<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.inner.figment.extract_inner(key) {
            Ok(value) => Ok(value),
            Err(e) if matches!(e.kind, Kind::MissingField(_)) => {
                let fallback_key = key.replace('.', "_");
                self.inner
                    .figment
                    .extract_inner(&fallback_key)
                    .map_err(|e| translate_error(&self.inner.env_prefixes, e))
            }
            Err(e) => Err(translate_error(&self.inner.env_prefixes, e)),
        }
    }

    /// Gets the value at `key`.
    ///
    /// # Errors
    ///
    /// If the key does not exist, or its value cannot be deserialized into `T`, an error is returned.
    pub fn get_typed<'a, T>(&self, key: &str) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.get(key)
    }

    /// Gets the value at `key`, falling back to `T::default()` when it is missing or malformed.
    pub fn get_typed_or_default<'a, T>(&self, key: &str) -> T
    where
        T: Default + Deserialize<'a>,
    {
        self.get(key).unwrap_or_default()
    }

    /// Gets the value at `key`, or `None` if it is missing.
    ///
    /// # Errors
    ///
    /// If the key exists but its value cannot be deserialized into `T`, an error is returned.
    pub fn try_get_typed<'a, T>(&self, key: &str) -> Result<Option<T>, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ConfigurationError::MissingField { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deserializes the whole configuration as `T`.
    ///
    /// Component configuration structs use this, relying on `#[serde(default)]` for every key they own.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized into `T`, an error is returned.
    pub fn as_typed<'a, T>(&self) -> Result<T, ConfigurationError>
    where
        T: Deserialize<'a>,
    {
        self.inner
            .figment
            .extract()
            .map_err(|e| translate_error(&self.inner.env_prefixes, e))
    }
}

fn translate_error(env_prefixes: &HashSet<String>, e: figment::Error) -> ConfigurationError {
    match e.kind {
        Kind::MissingField(field) => {
            let mut keys = vec![field.to_string()];
            let env_key = field.replace('.', "_").to_uppercase();
            let mut env_keys = env_prefixes
                .iter()
                .map(|prefix| format!("{}{}", prefix, env_key))
                .collect::<Vec<_>>();
            env_keys.sort();
            keys.extend(env_keys);

            let help_text = format!("Try setting `{}`.", keys.join("` or `"));
            ConfigurationError::MissingField { help_text, field }
        }
        Kind::InvalidType(actual_ty, expected_ty) => ConfigurationError::InvalidFieldType {
            field: e.path.join("."),
            expected_ty,
            actual_ty: actual_ty.to_string(),
        },
        _ => ConfigurationError::Generic { source: e.into() },
    }
}
