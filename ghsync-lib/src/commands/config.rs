use crate::Result;
use crate::collect::DEFAULT_BASE_URL;
use camino::{Utf8Path, Utf8PathBuf};
use core::time::Duration;
use ohno::{EnrichableExt, IntoAppError, app_err};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use url::Url;

/// The default configuration TOML content, embedded from `default_config.toml`
pub const DEFAULT_CONFIG_TOML: &str = include_str!("../../default_config.toml");

/// The configuration file looked for in the current directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "ghsync.toml";

/// GitHub never returns more than this many records per page.
const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Identifies the connection the collected rows belong to
    #[serde(default = "default_connection_id")]
    pub connection_id: u64,

    /// Repository to collect, as `owner/name`
    #[serde(default)]
    pub repo: Option<String>,

    /// REST API root
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Access tokens used in rotation
    #[serde(default)]
    pub tokens: Vec<String>,

    /// SQLite database file
    #[serde(default)]
    pub database: Option<Utf8PathBuf>,

    /// Requests per hour per token, overriding what the server advertises
    #[serde(default)]
    pub rate_limit_per_hour: Option<u32>,

    /// Requests per hour per token when the server advertises nothing
    #[serde(default = "default_rate_limit_per_hour")]
    pub default_rate_limit_per_hour: u32,

    /// Records requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Work items paged at the same time
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Safety cap on the pages fetched for one work item
    #[serde(default = "default_max_pages_per_item")]
    pub max_pages_per_item: u32,

    /// Rows read per batch when streaming stored rows
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Longest pause honored when the quota is exhausted
    #[serde(default = "default_max_rate_limit_wait", with = "humantime_serde")]
    pub max_rate_limit_wait: Duration,
}

const fn default_connection_id() -> u64 {
    1
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

const fn default_rate_limit_per_hour() -> u32 {
    5000
}

const fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

const fn default_concurrency() -> usize {
    8
}

const fn default_max_pages_per_item() -> u32 {
    1000
}

const fn default_batch_size() -> u32 {
    500
}

const fn default_max_rate_limit_wait() -> Duration {
    Duration::from_hours(1)
}

impl Config {
    /// Load configuration from a file or use defaults
    ///
    /// Without an explicit path, `ghsync.toml` in the current directory is used if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation
    pub fn load(config_path: Option<&Utf8PathBuf>) -> Result<Self> {
        let (final_path, text) = if let Some(path) = config_path {
            let text = fs::read_to_string(path).into_app_err_with(|| format!("reading ghsync configuration file '{path}'"))?;
            (path.clone(), text)
        } else {
            let path = Utf8PathBuf::from(DEFAULT_CONFIG_FILE);
            match fs::read_to_string(&path) {
                Ok(text) => (path, text),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // No config file found, use defaults
                    return Ok(Self::default());
                }
                Err(e) => return Err(e).into_app_err_with(|| format!("reading ghsync configuration file '{path}'")),
            }
        };

        Self::parse(&text).map_err(|e| e.enrich_with(|| format!("loading configuration file '{final_path}'")))
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this configuration, or fails validation
    pub fn parse(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).into_app_err("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Save the default configuration to a TOML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written
    pub fn save_default(output_path: &Utf8Path) -> Result<()> {
        fs::write(output_path, DEFAULT_CONFIG_TOML).into_app_err_with(|| format!("writing default configuration to {output_path}"))?;
        Ok(())
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if !(1..=MAX_PAGE_SIZE).contains(&self.page_size) {
            return Err(app_err!("page_size must be between 1 and {MAX_PAGE_SIZE}, got {}", self.page_size));
        }

        if self.concurrency == 0 {
            return Err(app_err!("concurrency must be at least 1"));
        }

        if self.max_pages_per_item == 0 {
            return Err(app_err!("max_pages_per_item must be at least 1"));
        }

        if self.batch_size == 0 {
            return Err(app_err!("batch_size must be at least 1"));
        }

        if self.default_rate_limit_per_hour == 0 {
            return Err(app_err!("default_rate_limit_per_hour must be at least 1"));
        }

        if self.rate_limit_per_hour == Some(0) {
            return Err(app_err!("rate_limit_per_hour must be at least 1 when set"));
        }

        if self.max_rate_limit_wait.is_zero() {
            return Err(app_err!("max_rate_limit_wait must be greater than zero"));
        }

        let _ = Url::parse(&self.base_url).into_app_err_with(|| format!("base_url '{}' is not a valid URL", self.base_url))?;

        if let Some(repo) = &self.repo {
            validate_repo(repo)?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str(DEFAULT_CONFIG_TOML).expect("default_config.toml should be valid TOML that deserializes to Config")
    }
}

/// Check that a repository name has the `owner/name` shape.
pub fn validate_repo(repo: &str) -> Result<()> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() && !name.contains('/') => Ok(()),
        _ => Err(app_err!("repository '{repo}' must be of the form 'owner/name'")),
    }
}
