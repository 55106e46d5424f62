use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

use super::{
    Config, ConfigMetadata, ConfigWarnings, FeedsConfig, StoreBackend,
    sources::{EnvConfig, FileConfig},
};

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["threatintel.toml", "config/threatintel.toml"];
const DEFAULT_FEED_MANIFEST: &str = "feeds.json";
const DEFAULT_STORE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
    /// Used instead of the process environment when set.
    pub env: Option<EnvConfig>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn with_env(mut self, env: EnvConfig) -> Self {
        self.options.env = Some(env);
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?,
        };

        let env = match &self.options.env {
            Some(env) => env.clone(),
            None => EnvConfig::gather(),
        };

        let (file_config, config_path) = self.load_file_config(&env)?;
        let (config, warnings) =
            self.compose_config(file_config, env, config_path, env_file_loaded)?;
        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let (path, explicit) = if let Some(explicit) = &self.options.config_path {
            (explicit.clone(), true)
        } else if let Some(from_env) = &env.config_path {
            (from_env.clone(), true)
        } else {
            match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(found) => (found, false),
                None => return Ok((None, None)),
            }
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            return Ok((None, None));
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig =
            toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
                path: path.clone(),
                source,
            })?;
        Ok((Some(file_config), Some(path)))
    }

    fn compose_config(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigLoadError> {
        let mut warnings = ConfigWarnings::default();
        if config_path.is_none() {
            warnings.push_with_hint(
                "No threatintel.toml detected; using defaults and environment variables",
                "Create threatintel.toml or point THREATINTEL_CONFIG at one",
            );
        }

        let FileConfig {
            engine: mut engine,
            store: file_store,
            feeds: file_feeds,
        } = file_config.unwrap_or_default();

        if let Some(raw) = &env.lock_duration {
            engine.lock.lock_duration_secs =
                parse_duration("THREATINTEL_LOCK_DURATION", raw)?.as_secs();
        }
        if let Some(raw) = &env.renew_after {
            engine.lock.renew_after_secs =
                parse_duration("THREATINTEL_LOCK_RENEW_AFTER", raw)?.as_secs();
        }
        if let Some(raw) = &env.shard_wait_timeout {
            engine.rotation.shard_wait_timeout_ms =
                parse_duration("THREATINTEL_SHARD_WAIT_TIMEOUT", raw)?.as_millis() as u64;
        }
        if let Some(raw) = &env.shard_poll_interval {
            engine.rotation.shard_poll_interval_ms =
                parse_duration("THREATINTEL_SHARD_POLL_INTERVAL", raw)?.as_millis() as u64;
        }
        if let Some(raw) = &env.batch_size {
            engine.rotation.batch_size = parse_number("THREATINTEL_BATCH_SIZE", raw)?;
        }
        if let Some(raw) = &env.max_concurrent_runs {
            engine.runner.max_concurrent_runs =
                parse_number("THREATINTEL_MAX_CONCURRENT_RUNS", raw)?;
        }
        if let Some(prefix) = &env.data_index_prefix {
            engine.rotation.data_index_prefix = prefix.clone();
        }
        engine.validate().map_err(ConfigLoadError::Engine)?;

        let store = self.resolve_store(&env, &file_store, &mut warnings)?;

        let manifest = env
            .feed_manifest
            .clone()
            .or(file_feeds.manifest)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FEED_MANIFEST));
        if !manifest.exists() {
            warnings.push_with_hint(
                format!("feed manifest {} does not exist yet", manifest.display()),
                "Jobs cannot be created or refreshed until it lists their feeds",
            );
        }

        let config = Config {
            engine,
            store,
            feeds: FeedsConfig { manifest },
            metadata: ConfigMetadata {
                config_path,
                env_file_loaded,
            },
        };
        Ok((config, warnings))
    }

    fn resolve_store(
        &self,
        env: &EnvConfig,
        file_store: &super::sources::FileStoreConfig,
        warnings: &mut ConfigWarnings,
    ) -> Result<StoreBackend, ConfigLoadError> {
        let url = env.store_url.clone().or_else(|| file_store.url.clone());
        let backend = env
            .store_backend
            .clone()
            .or_else(|| file_store.backend.clone())
            .unwrap_or_else(|| if url.is_some() { "opensearch" } else { "memory" }.to_string());

        match backend.trim().to_ascii_lowercase().as_str() {
            "opensearch" => {
                let raw = url.ok_or(ConfigLoadError::MissingStoreUrl)?;
                let url = Url::parse(raw.trim())
                    .map_err(|source| ConfigLoadError::InvalidStoreUrl { url: raw.clone(), source })?;
                let request_timeout = match env
                    .store_request_timeout
                    .as_ref()
                    .or(file_store.request_timeout.as_ref())
                {
                    Some(raw) => parse_duration("store.request_timeout", raw)?,
                    None => DEFAULT_STORE_REQUEST_TIMEOUT,
                };
                Ok(StoreBackend::OpenSearch {
                    url,
                    request_timeout,
                })
            }
            "memory" => {
                warnings.push_with_hint(
                    "Using the in-memory store; job state is lost when the process exits",
                    "Set store.url or THREATINTEL_OPENSEARCH_URL to persist jobs",
                );
                Ok(StoreBackend::Memory)
            }
            other => Err(ConfigLoadError::UnknownStoreBackend {
                backend: other.to_string(),
            }),
        }
    }
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigLoadError> {
    humantime::parse_duration(raw.trim()).map_err(|source| ConfigLoadError::InvalidDuration {
        key: key.to_string(),
        value: raw.to_string(),
        source,
    })
}

fn parse_number(key: &str, raw: &str) -> Result<usize, ConfigLoadError> {
    raw.trim().parse().map_err(|_| ConfigLoadError::InvalidNumber {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid duration for {key}: '{value}'")]
    InvalidDuration {
        key: String,
        value: String,
        #[source]
        source: humantime::DurationError,
    },
    #[error("invalid number for {key}: '{value}'")]
    InvalidNumber { key: String, value: String },
    #[error("opensearch store selected but no URL configured")]
    MissingStoreUrl,
    #[error("invalid store URL '{url}'")]
    InvalidStoreUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unknown store backend '{backend}' (expected opensearch or memory)")]
    UnknownStoreBackend { backend: String },
    #[error("invalid engine configuration")]
    Engine(#[source] threatintel_core::FeedJobError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

impl ConfigLoad {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.metadata.config_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn env(vars: &[(&str, &str)]) -> EnvConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvConfig::from_lookup(|name| vars.get(name).cloned())
    }

    fn loader_for(file: &tempfile::NamedTempFile, vars: &[(&str, &str)]) -> ConfigLoader {
        let env_file = file.path().with_extension("env-missing");
        ConfigLoader::new()
            .with_config_path(file.path())
            .with_env_file(env_file)
            .with_env(env(vars))
    }

    fn toml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_are_applied_over_defaults() {
        let file = toml_file(
            r#"
            [engine.rotation]
            batch_size = 500
            data_index_prefix = ".ioc-"

            [store]
            url = "http://search.internal:9200"
            request_timeout = "45s"

            [feeds]
            manifest = "/etc/threatintel/feeds.json"
            "#,
        );

        let ConfigLoad { config, .. } = loader_for(&file, &[]).load().unwrap();
        assert_eq!(config.engine.rotation.batch_size, 500);
        assert_eq!(config.engine.rotation.data_index_prefix, ".ioc-");
        assert_eq!(config.engine.lock.lock_duration_secs, 300);
        assert_eq!(
            config.store,
            StoreBackend::OpenSearch {
                url: Url::parse("http://search.internal:9200").unwrap(),
                request_timeout: Duration::from_secs(45),
            }
        );
        assert_eq!(config.feeds.manifest, PathBuf::from("/etc/threatintel/feeds.json"));
        assert_eq!(config.metadata.config_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn environment_overrides_file() {
        let file = toml_file("[engine.lock]\nlock_duration_secs = 600\n");
        let ConfigLoad { config, .. } = loader_for(
            &file,
            &[
                ("THREATINTEL_LOCK_DURATION", "10m"),
                ("THREATINTEL_LOCK_RENEW_AFTER", "2m"),
                ("THREATINTEL_SHARD_WAIT_TIMEOUT", "1h"),
                ("THREATINTEL_MAX_CONCURRENT_RUNS", "8"),
            ],
        )
        .load()
        .unwrap();
        assert_eq!(config.engine.lock.lock_duration_secs, 600);
        assert_eq!(config.engine.lock.renew_after_secs, 120);
        assert_eq!(config.engine.rotation.shard_wait_timeout_ms, 3_600_000);
        assert_eq!(config.engine.runner.max_concurrent_runs, 8);
    }

    #[test]
    fn memory_backend_is_the_fallback_and_warns() {
        let file = toml_file("");
        let ConfigLoad { config, warnings } = loader_for(&file, &[]).load().unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(
            warnings
                .items
                .iter()
                .any(|w| w.message.contains("in-memory store"))
        );
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        let file = toml_file("[store]\nbackend = \"opensearch\"\n");
        assert!(matches!(
            loader_for(&file, &[]).load(),
            Err(ConfigLoadError::MissingStoreUrl)
        ));

        let file = toml_file("[store]\nbackend = \"redis\"\n");
        assert!(matches!(
            loader_for(&file, &[]).load(),
            Err(ConfigLoadError::UnknownStoreBackend { .. })
        ));

        let file = toml_file("");
        assert!(matches!(
            loader_for(&file, &[("THREATINTEL_LOCK_DURATION", "soon")]).load(),
            Err(ConfigLoadError::InvalidDuration { .. })
        ));

        // Lease shorter than two renewal intervals.
        assert!(matches!(
            loader_for(&file, &[("THREATINTEL_LOCK_DURATION", "3m")]).load(),
            Err(ConfigLoadError::Engine(_))
        ));

        let file = toml_file("[engine.rotation\nbatch_size = 1");
        assert!(matches!(
            loader_for(&file, &[]).load(),
            Err(ConfigLoadError::Parse { .. })
        ));
    }

    #[test]
    fn explicit_missing_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = ConfigLoader::new()
            .with_config_path(dir.path().join("absent.toml"))
            .with_env_file(dir.path().join(".env"))
            .with_env(EnvConfig::default())
            .load();
        assert!(matches!(result, Err(ConfigLoadError::MissingConfig { .. })));
    }
}
