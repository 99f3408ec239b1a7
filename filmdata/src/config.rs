//! Service configuration
//!
//! Loaded from a TOML file where every key is optional, then overridden by
//! secrets from the environment and validated.

use crate::interface::FilmDataError;
use crate::models::RankPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

pub const API_KEY_ENV: &str = "FILMDATA_API_KEY";
pub const ADMIN_TOKEN_ENV: &str = "FILMDATA_ADMIN_TOKEN";

const DATABASE_FILE: &str = "filmdata.sqlite";
const INDEX_DIR: &str = "films_index";

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct Settings {
    #[serde(default)]
    #[validate]
    pub storage: StorageSettings,
    #[serde(default)]
    #[validate]
    pub upstream: UpstreamSettings,
    #[serde(default)]
    #[validate]
    pub crawler: CrawlerSettings,
    #[serde(default)]
    #[validate]
    pub queue: QueueSettings,
    #[serde(default)]
    #[validate]
    pub api: ApiSettings,
    #[serde(default)]
    #[validate]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpstreamSettings {
    #[serde(default = "default_base_url")]
    #[validate(url)]
    pub base_url: String,
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Usually supplied through `FILMDATA_API_KEY`
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_page_limit")]
    #[validate(range(min = 1, max = 1000))]
    pub page_limit: u32,
    #[serde(default = "default_timeout_secs")]
    #[validate(range(min = 1))]
    pub timeout_secs: u64,
    /// Genre ids whose films are never fetched
    #[serde(default = "default_excluded_genres")]
    pub excluded_genres: Vec<String>,
}

fn default_base_url() -> String {
    "https://www.googleapis.com/freebase/v1/mqlread/".to_string()
}

fn default_lang() -> String {
    "/lang/en".to_string()
}

fn default_page_limit() -> u32 {
    100
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_excluded_genres() -> Vec<String> {
    vec!["/en/gay_pornography".to_string(), "/en/pornographic_movie".to_string()]
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            lang: default_lang(),
            api_key: String::new(),
            page_limit: default_page_limit(),
            timeout_secs: default_timeout_secs(),
            excluded_genres: default_excluded_genres(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CrawlerSettings {
    /// Oldest year the back-fill reaches
    #[serde(default = "default_min_year")]
    #[validate(range(min = 1850, max = 2200))]
    pub min_year: i32,
    #[serde(default)]
    pub rank_policy: RankPolicy,
    /// Fail the task (and let the queue retry) on a page without `result`
    #[serde(default)]
    pub retry_malformed_pages: bool,
    /// Seconds between scheduler invocations under `serve`; 0 disables the timer
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
}

fn default_min_year() -> i32 {
    1960
}

fn default_scheduler_interval_secs() -> u64 {
    300
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            min_year: default_min_year(),
            rank_policy: RankPolicy::default(),
            retry_malformed_pages: false,
            scheduler_interval_secs: default_scheduler_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueSettings {
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 10))]
    pub poll_interval_ms: u64,
    #[serde(default = "default_lease_secs")]
    #[validate(range(min = 1))]
    pub lease_secs: u64,
    #[serde(default = "default_retry_base_secs")]
    #[validate(range(min = 1))]
    pub retry_base_secs: u64,
    #[serde(default = "default_retry_max_secs")]
    #[validate(range(min = 1))]
    pub retry_max_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_lease_secs() -> u64 {
    120
}

fn default_retry_base_secs() -> u64 {
    5
}

fn default_retry_max_secs() -> u64 {
    600
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            lease_secs: default_lease_secs(),
            retry_base_secs: default_retry_base_secs(),
            retry_max_secs: default_retry_max_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApiSettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_limit")]
    #[validate(range(min = 1))]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    #[validate(range(min = 1))]
    pub max_limit: usize,
    /// Inbound application ids allowed to call `/api`
    #[serde(default = "default_authorized_apps")]
    pub authorized_apps: Vec<String>,
    #[serde(default = "default_app_id_header")]
    #[validate(length(min = 1))]
    pub app_id_header: String,
    /// Bearer token granting administrator access; empty disables it.
    /// Usually supplied through `FILMDATA_ADMIN_TOKEN`
    #[serde(default)]
    pub admin_token: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_limit() -> usize {
    10
}

fn default_max_limit() -> usize {
    100
}

fn default_authorized_apps() -> Vec<String> {
    vec!["dev~ffc-app".to_string(), "ffc-app".to_string()]
}

fn default_app_id_header() -> String {
    "X-Appengine-Inbound-Appid".to_string()
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            default_limit: default_limit(),
            max_limit: default_max_limit(),
            authorized_apps: default_authorized_apps(),
            app_id_header: default_app_id_header(),
            admin_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CacheSettings {
    #[serde(default = "default_cache_capacity")]
    #[validate(range(min = 1))]
    pub max_capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    #[validate(range(min = 1))]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> u64 {
    10_000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults when `path` is `None`, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, FilmDataError> {
        let mut settings = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    FilmDataError::ConfigError(format!("failed to read {}: {}", path.display(), e))
                })?;
                tracing::info!("Loaded configuration from: {}", path.display());
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };

        settings.apply_env(|key| std::env::var(key).ok());
        settings.check()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, FilmDataError> {
        toml::from_str(content).map_err(|e| FilmDataError::ConfigError(e.to_string()))
    }

    /// Override secrets from `lookup` (the process environment in production)
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.upstream.api_key = key;
        }
        if let Some(token) = lookup(ADMIN_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.api.admin_token = token;
        }
    }

    /// Field-level validation plus cross-field checks
    pub fn check(&self) -> Result<(), FilmDataError> {
        self.validate()
            .map_err(|e| FilmDataError::ConfigError(e.to_string()))?;

        if self.api.default_limit > self.api.max_limit {
            return Err(FilmDataError::ConfigError(format!(
                "api.default_limit ({}) exceeds api.max_limit ({})",
                self.api.default_limit, self.api.max_limit
            )));
        }
        if self.queue.retry_base_secs > self.queue.retry_max_secs {
            return Err(FilmDataError::ConfigError(
                "queue.retry_base_secs exceeds queue.retry_max_secs".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(DATABASE_FILE)
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage.data_dir.join(INDEX_DIR)
    }
}
