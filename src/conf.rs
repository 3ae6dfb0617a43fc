use crate::{
    kafka::{BrokerEndpoint, DEFAULT_DISCOVERY_TIMEOUT},
    utils::o11y::logging::as_error,
};

use std::{
    collections::HashMap,
    env,
    path::Path,
    sync::LazyLock,
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, instrument, warn};

#[derive(thiserror::Error, Debug)]
pub enum CensusConfigError {
    #[error("failed to load config")]
    InvalidConfigError(#[from] config::ConfigError),
    #[error("could not find config file {0}")]
    ConfigFileNotFound(String),
    #[error("could not read config file")]
    ReadError(#[from] std::io::Error),
    #[error("environment variable expansion error")]
    EnvExpansionError(#[from] ExpandError),
}

#[derive(thiserror::Error, Debug)]
pub enum ExpandError {
    #[error("Missing environment variable '{var_name}' for placeholder '{placeholder}'")]
    MissingVariable {
        var_name: String,
        placeholder: String,
    },
}

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([^}:]+)(?::-(.*?))?\}").expect("placeholder pattern is valid")
});

/// Loads environment variables from a .env file if it exists.
///
/// The current working directory is tried first, then its parent. Without
/// either file the process environment is used as is.
pub fn load_dotenv() {
    for path in [".env", "../.env"] {
        if Path::new(path).exists() {
            match dotenvy::from_path(path) {
                Ok(_) => info!("Loaded environment variables from {} file", path),
                Err(e) => warn!("Found {} file but failed to load it: {}", path, e),
            }
            return;
        }
    }
    debug!("No .env file found, using system environment variables only");
}

/// Expands environment variable placeholders in a string.
/// Supports both ${VAR_NAME} and ${VAR_NAME:-default_value} syntax.
///
/// Examples:
/// - "${KAFKA_PASSWORD}" -> reads from KAFKA_PASSWORD env var
/// - "${KAFKA_BROKER:-localhost:9092}" -> reads from KAFKA_BROKER, falls back to "localhost:9092"
pub fn expand_env_vars(input: &str) -> Result<String, ExpandError> {
    let mut replacements: HashMap<&str, String> = HashMap::new();

    for capture in PLACEHOLDER.captures_iter(input) {
        let (Some(full_match), Some(var_name)) = (capture.get(0), capture.get(1)) else {
            continue;
        };
        let (full_match, var_name) = (full_match.as_str(), var_name.as_str());
        if replacements.contains_key(full_match) {
            continue;
        }

        let value = match env::var(var_name) {
            Ok(value) => {
                debug!("Expanded environment variable: {} = [REDACTED]", var_name);
                value
            }
            Err(_) => match capture.get(2) {
                Some(default) => {
                    warn!(
                        "Environment variable {} not found, using default value",
                        var_name
                    );
                    default.as_str().to_string()
                }
                None => {
                    return Err(ExpandError::MissingVariable {
                        var_name: var_name.to_string(),
                        placeholder: full_match.to_string(),
                    });
                }
            },
        };
        replacements.insert(full_match, value);
    }

    let expanded = replacements
        .iter()
        .fold(input.to_string(), |acc, (placeholder, value)| {
            acc.replace(placeholder, value)
        });
    Ok(expanded)
}

fn file_format(path: &Path) -> FileFormat {
    match path.extension().and_then(|extension| extension.to_str()) {
        Some("toml") => FileFormat::Toml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Yaml,
    }
}

/// Load a config file, expanding environment variable placeholders before the
/// contents are parsed.
#[instrument(err)]
pub fn load_config(path: &Path) -> Result<Config, CensusConfigError> {
    if !path.exists() {
        return Err(CensusConfigError::ConfigFileNotFound(
            path.display().to_string(),
        ));
    }

    let file_content = std::fs::read_to_string(path)?;
    let expanded_content = expand_env_vars(&file_content)?;

    let conf = Config::builder()
        .add_source(File::from_str(&expanded_content, file_format(path)))
        .build()?;

    Ok(conf)
}

/// Connection settings for the Kafka cluster.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        KafkaConfig {
            brokers: vec!["localhost:9092".to_string()],
            username: None,
            password: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl KafkaConfig {
    /// The endpoint described by this section. Credentials are only used
    /// when both the username and the password are set.
    pub fn endpoint(&self) -> BrokerEndpoint {
        let endpoint = BrokerEndpoint::new(self.brokers.iter().cloned());
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => endpoint.with_credentials(username, password),
            (Some(_), None) | (None, Some(_)) => {
                warn!("kafka username and password must be set together, connecting without SASL");
                endpoint
            }
            (None, None) => endpoint,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub timeout_ms: u64,
    pub include_internal: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            timeout_ms: DEFAULT_DISCOVERY_TIMEOUT.as_millis() as u64,
            include_internal: true,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct DetailConfig {
    /// Topic name answered with canned data instead of broker queries.
    pub stub_topic: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CensusConfig {
    #[serde(deserialize_with = "null_as_default")]
    pub kafka: KafkaConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub discovery: DiscoveryConfig,
    #[serde(deserialize_with = "null_as_default")]
    pub detail: DetailConfig,
}

// A section key holding only comments parses as null.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CensusConfig {
    /// Load the config file at `path`, then apply `CENSUS__`-prefixed
    /// environment overrides such as `CENSUS__KAFKA__BROKERS=a:9092,b:9092`.
    pub fn load(path: &Path) -> Result<Self, CensusConfigError> {
        let file = load_config(path).inspect_err(as_error!("failed to load config file"))?;
        let config: CensusConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("CENSUS")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers"),
            )
            .build()?
            .try_deserialize()?;
        debug!(brokers = ?config.kafka.brokers, "loaded config");
        Ok(config)
    }
}
