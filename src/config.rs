use chrono::NaiveDate;
use config::{self, File};
use log::{debug, error};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::batch::DEFAULT_FLUSH_THRESHOLD;
use crate::error::{Result, StressError};
use crate::point::Precision;
use crate::retry::RetryConfig;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "STRESS";

/// Date format used for `start_date`
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Database connection configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database host
    pub host: String,
    /// Database port
    pub port: u16,
    /// Database name
    pub name: String,
    /// Database username
    pub username: String,
    /// Database password
    pub password: String,
    /// SSL mode
    pub ssl_mode: SslMode,
    /// CA certificate path
    pub ca_cert: Option<String>,
    /// Client certificate path
    pub client_cert: Option<String>,
    /// Client key path
    pub client_key: Option<String>,
    /// Maximum pooled connections
    pub pool_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "postgres".to_string(),
            username: "postgres".to_string(),
            password: String::new(),
            ssl_mode: SslMode::default(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            pool_size: 10,
        }
    }
}

/// SSL mode for database connections
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Disable SSL
    #[default]
    Disable,
    /// Prefer SSL
    Prefer,
    /// Require SSL
    Require,
    /// Verify CA
    VerifyCa,
    /// Verify full
    VerifyFull,
}

/// Logging level
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    #[default]
    Info,
    /// Debug level
    Debug,
    /// Trace level
    Trace,
}

/// Settings for one test run
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StressConfig {
    /// Database that results are written to
    pub test_db: String,
    /// Precision of generated points
    pub precision: String,
    /// Date of the first point entered into the database
    pub start_date: String,
    /// Points per results write
    pub batch_size: usize,
    /// Capacity of the package and directive channels
    pub channel_capacity: usize,
    /// Extra tags attached to every result point
    pub tags: BTreeMap<String, String>,
    /// Logging level
    pub log_level: LogLevel,
    /// Retry policy for bootstrapping the results store
    pub retry: RetryConfig,
    /// Results store connection
    pub database: DatabaseConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            test_db: "_stressTest".to_string(),
            precision: "s".to_string(),
            start_date: "2016-01-02".to_string(),
            batch_size: DEFAULT_FLUSH_THRESHOLD,
            channel_capacity: 1,
            tags: BTreeMap::new(),
            log_level: LogLevel::default(),
            retry: RetryConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl StressConfig {
    /// Check that every value can be applied to a test run
    pub fn validate(&self) -> Result<()> {
        if self.test_db.is_empty() {
            return Err(StressError::Config("test_db must not be empty".to_string()));
        }
        self.precision()?;
        self.start_date()?;
        if self.batch_size == 0 {
            return Err(StressError::Config("batch_size must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Parsed point precision
    pub fn precision(&self) -> Result<Precision> {
        self.precision
            .parse()
            .map_err(|e: StressError| StressError::Config(e.to_string()))
    }

    /// Parsed start date
    pub fn start_date(&self) -> Result<NaiveDate> {
        parse_date(&self.start_date).map_err(|e| StressError::Config(e.to_string()))
    }
}

/// Parse a `YYYY-MM-DD` date
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT)
        .map_err(|e| StressError::invalid("startdate", value, e.to_string()))
}

/// Load configuration from a file, with `STRESS__*` environment overrides
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StressConfig> {
    let path = path.as_ref();
    debug!("Loading configuration from {}", path.display());

    // Check if the file exists
    if !path.exists() {
        error!("Configuration file {} does not exist", path.display());
        return Err(StressError::Config(format!(
            "Configuration file not found: {}",
            path.display()
        )));
    }

    let extension = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_lowercase(),
        None => {
            error!("Configuration file has no extension");
            return Err(StressError::Config(format!(
                "Configuration file has no extension: {}",
                path.display()
            )));
        }
    };

    let format = match extension.as_str() {
        "toml" => config::FileFormat::Toml,
        "json" => config::FileFormat::Json,
        "yaml" | "yml" => config::FileFormat::Yaml,
        format => {
            error!("Unsupported configuration format: {}", format);
            return Err(StressError::Config(format!(
                "Unsupported config format: {}",
                format
            )));
        }
    };

    let config = config::Config::builder()
        .add_source(File::from(path).format(format))
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .map_err(|e| StressError::Config(e.to_string()))?;

    let config: StressConfig = config
        .try_deserialize()
        .map_err(|e| StressError::Config(e.to_string()))?;
    config.validate()?;

    debug!("Configuration loaded: {:?}", config);
    Ok(config)
}
