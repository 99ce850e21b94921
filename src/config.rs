use std::{env, net::SocketAddr, num::NonZeroUsize, path::PathBuf, time::Duration};

use thiserror::Error;

#[cfg(test)]
use once_cell::sync::Lazy;
#[cfg(test)]
pub(crate) static ENV_MUTEX: Lazy<std::sync::Mutex<()>> = Lazy::new(|| std::sync::Mutex::new(()));

/// Which implementation answers similarity queries during clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimilarityBackend {
    /// Remote NLU service over HTTP.
    Nlu,
    /// In-process cosine over token counts.
    Lexical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    http_bind: SocketAddr,
    db_dsn: String,
    db_max_connections: u32,
    db_min_connections: u32,
    db_acquire_timeout: Duration,
    db_idle_timeout: Duration,
    db_max_lifetime: Duration,
    cluster_batch_size: NonZeroUsize,
    early_stop_threshold: NonZeroUsize,
    min_cluster_size: usize,
    max_input_size: usize,
    similarity_threshold: f32,
    tag_count: usize,
    similarity_backend: SimilarityBackend,
    nlu_url: String,
    nlu_connect_timeout: Duration,
    nlu_total_timeout: Duration,
    nlu_max_retries: usize,
    nlu_backoff_base_ms: u64,
    nlu_backoff_cap_ms: u64,
    idf_cache_path: Option<PathBuf>,
    stopwords_path: Option<PathBuf>,
    otel_exporter_endpoint: Option<String>,
    otel_sampling_ratio: f64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {source}")]
    Invalid {
        name: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

impl Config {
    /// Reads worker settings from the environment.
    ///
    /// Absent variables fall back to their defaults; present but unparsable
    /// values are rejected.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when `SELFLEARN_DB_DSN` is unset or any value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_dsn = env_var("SELFLEARN_DB_DSN")?;
        let http_bind = parse_socket_addr("SELFLEARN_HTTP_BIND", "0.0.0.0:9010")?;

        let db_max_connections = parse_u32("SELFLEARN_DB_MAX_CONNECTIONS", 10)?;
        let db_min_connections = parse_u32("SELFLEARN_DB_MIN_CONNECTIONS", 1)?;
        let db_acquire_timeout = parse_duration_secs("SELFLEARN_DB_ACQUIRE_TIMEOUT_SECS", 30)?;
        let db_idle_timeout = parse_duration_secs("SELFLEARN_DB_IDLE_TIMEOUT_SECS", 600)?;
        let db_max_lifetime = parse_duration_secs("SELFLEARN_DB_MAX_LIFETIME_SECS", 1800)?;

        // Clustering policy
        let cluster_batch_size = parse_non_zero_usize("CLUSTER_BATCH", 50)?;
        let early_stop_threshold = parse_non_zero_usize("EARLY_STOP_THRESHOLD", 3)?;
        let min_cluster_size = parse_usize("MIN_SIZE_CLUSTER", 10)?;
        let max_input_size = parse_usize("MAX_NUM_TO_CLUSTER", 10_000)?;
        let similarity_threshold = parse_unit_interval("CLUSTER_SIMILARITY_THRESHOLD", 0.75)?;
        let tag_count = parse_usize("CLUSTER_TAG_COUNT", 2)?;

        // Similarity service
        let similarity_backend = parse_similarity_backend("SIMILARITY_BACKEND", "nlu")?;
        let nlu_url = env::var("NLU_URL").unwrap_or_else(|_| "http://127.0.0.1:13901".to_string());
        let nlu_connect_timeout = parse_duration_ms("NLU_CONNECT_TIMEOUT_MS", 3000)?;
        let nlu_total_timeout = parse_duration_ms("NLU_TOTAL_TIMEOUT_MS", 10_000)?;
        let nlu_max_retries = parse_usize("NLU_MAX_RETRIES", 2)?;
        let nlu_backoff_base_ms = parse_u64("NLU_BACKOFF_BASE_MS", 100)?;
        let nlu_backoff_cap_ms = parse_u64("NLU_BACKOFF_CAP_MS", 2000)?;

        let idf_cache_path = env::var("IDF_CACHE_PATH").ok().map(PathBuf::from);
        let stopwords_path = env::var("STOPWORDS_PATH").ok().map(PathBuf::from);

        let otel_exporter_endpoint = env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok();
        let otel_sampling_ratio = parse_f64("OTEL_SAMPLING_RATIO", 1.0)?;

        Ok(Self {
            http_bind,
            db_dsn,
            db_max_connections,
            db_min_connections,
            db_acquire_timeout,
            db_idle_timeout,
            db_max_lifetime,
            cluster_batch_size,
            early_stop_threshold,
            min_cluster_size,
            max_input_size,
            similarity_threshold,
            tag_count,
            similarity_backend,
            nlu_url,
            nlu_connect_timeout,
            nlu_total_timeout,
            nlu_max_retries,
            nlu_backoff_base_ms,
            nlu_backoff_cap_ms,
            idf_cache_path,
            stopwords_path,
            otel_exporter_endpoint,
            otel_sampling_ratio,
        })
    }

    #[must_use]
    pub fn http_bind(&self) -> SocketAddr {
        self.http_bind
    }

    #[must_use]
    pub fn db_dsn(&self) -> &str {
        &self.db_dsn
    }

    #[must_use]
    pub fn db_max_connections(&self) -> u32 {
        self.db_max_connections
    }

    #[must_use]
    pub fn db_min_connections(&self) -> u32 {
        self.db_min_connections
    }

    #[must_use]
    pub fn db_acquire_timeout(&self) -> Duration {
        self.db_acquire_timeout
    }

    #[must_use]
    pub fn db_idle_timeout(&self) -> Duration {
        self.db_idle_timeout
    }

    #[must_use]
    pub fn db_max_lifetime(&self) -> Duration {
        self.db_max_lifetime
    }

    #[must_use]
    pub fn cluster_batch_size(&self) -> NonZeroUsize {
        self.cluster_batch_size
    }

    #[must_use]
    pub fn early_stop_threshold(&self) -> NonZeroUsize {
        self.early_stop_threshold
    }

    #[must_use]
    pub fn min_cluster_size(&self) -> usize {
        self.min_cluster_size
    }

    #[must_use]
    pub fn max_input_size(&self) -> usize {
        self.max_input_size
    }

    #[must_use]
    pub fn similarity_threshold(&self) -> f32 {
        self.similarity_threshold
    }

    #[must_use]
    pub fn tag_count(&self) -> usize {
        self.tag_count
    }

    #[must_use]
    pub fn similarity_backend(&self) -> SimilarityBackend {
        self.similarity_backend
    }

    #[must_use]
    pub fn nlu_url(&self) -> &str {
        &self.nlu_url
    }

    #[must_use]
    pub fn nlu_connect_timeout(&self) -> Duration {
        self.nlu_connect_timeout
    }

    #[must_use]
    pub fn nlu_total_timeout(&self) -> Duration {
        self.nlu_total_timeout
    }

    #[must_use]
    pub fn nlu_max_retries(&self) -> usize {
        self.nlu_max_retries
    }

    #[must_use]
    pub fn nlu_backoff_base_ms(&self) -> u64 {
        self.nlu_backoff_base_ms
    }

    #[must_use]
    pub fn nlu_backoff_cap_ms(&self) -> u64 {
        self.nlu_backoff_cap_ms
    }

    #[must_use]
    pub fn idf_cache_path(&self) -> Option<&PathBuf> {
        self.idf_cache_path.as_ref()
    }

    #[must_use]
    pub fn stopwords_path(&self) -> Option<&PathBuf> {
        self.stopwords_path.as_ref()
    }

    #[must_use]
    pub fn otel_exporter_endpoint(&self) -> Option<&str> {
        self.otel_exporter_endpoint.as_deref()
    }

    #[must_use]
    pub fn otel_sampling_ratio(&self) -> f64 {
        self.otel_sampling_ratio
    }
}

fn env_var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parse_socket_addr(name: &'static str, default: &str) -> Result<SocketAddr, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());

    raw.parse().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_non_zero_usize(name: &'static str, default: usize) -> Result<NonZeroUsize, ConfigError> {
    let parsed = parse_usize(name, default)?;
    NonZeroUsize::new(parsed).ok_or_else(|| ConfigError::Invalid {
        name,
        source: anyhow::anyhow!("must be greater than zero"),
    })
}

fn parse_duration_secs(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_secs)?;
    Ok(Duration::from_secs(value))
}

fn parse_duration_ms(name: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    let value = parse_u64(name, default_ms)?;
    Ok(Duration::from_millis(value))
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<usize>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u32(name: &'static str, default: u32) -> Result<u32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<u32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<u64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_f64(name: &'static str, default: f64) -> Result<f64, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    raw.trim().parse::<f64>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })
}

fn parse_unit_interval(name: &'static str, default: f32) -> Result<f32, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.trim().parse::<f32>().map_err(|error| ConfigError::Invalid {
        name,
        source: anyhow::Error::new(error),
    })?;
    if !(0.0..=1.0).contains(&parsed) {
        return Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("value must be between 0.0 and 1.0"),
        });
    }
    Ok(parsed)
}

fn parse_similarity_backend(
    name: &'static str,
    default: &str,
) -> Result<SimilarityBackend, ConfigError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    match raw.trim().to_lowercase().as_str() {
        "nlu" => Ok(SimilarityBackend::Nlu),
        "lexical" => Ok(SimilarityBackend::Lexical),
        other => Err(ConfigError::Invalid {
            name,
            source: anyhow::anyhow!("unknown similarity backend: {other}"),
        }),
    }
}
