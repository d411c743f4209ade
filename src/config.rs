use std::{collections::BTreeMap, fs, path::Path, path::PathBuf, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use clap::Parser;
use serde::Deserialize;

use crate::charts::QueryParams;
use crate::constants::{CacheTtl, DEFAULT_CACHE_PREFIX};
use crate::error::ConfigError;
use crate::rate::parse_timestamp;

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub postgrest_url: String,
    pub api_url: String,
    pub exporter: String,
    pub interface: String,
    /// RFC 3339, `YYYY-MM-DDTHH:MM` (UTC) or epoch seconds.
    pub start: Option<String>,
    pub end: Option<String>,
    /// Read interface counters from the internal API instead of PostgREST.
    pub use_api: bool,
    pub filters: BTreeMap<String, String>,
    pub request_timeout_secs: Option<u64>,
    pub selection_tolerance: f64,
    pub log_file: PathBuf,
    pub cache: CacheConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub prefix: String,
    pub path: PathBuf,
    pub quota_bytes: Option<usize>,
    pub default_ttl_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            postgrest_url: String::from("http://localhost:3000/"),
            api_url: String::from("http://localhost:8080"),
            exporter: String::from("1"),
            interface: String::from("1"),
            start: None,
            end: None,
            use_api: false,
            filters: BTreeMap::new(),
            request_timeout_secs: None,
            selection_tolerance: 1.0,
            log_file: PathBuf::from("flow_dash.log"),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            prefix: String::from(DEFAULT_CACHE_PREFIX),
            path: PathBuf::from("flow_dash_cache.json"),
            // Browser storage allowance per origin.
            quota_bytes: Some(5 * 1024 * 1024),
            default_ttl_secs: CacheTtl::MEDIUM / 1000,
        }
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, ConfigError> {
    let invalid = || ConfigError::Time {
        value: value.to_string(),
    };
    if let Ok(epoch) = value.parse::<i64>() {
        return Utc.timestamp_opt(epoch, 0).single().ok_or_else(invalid);
    }
    parse_timestamp(value).ok_or_else(invalid)
}

impl Config {
    /// Query window; a missing bound defaults to the last hour before `now`.
    pub fn time_range(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), ConfigError> {
        let end = self.end.as_deref().map(parse_time).transpose()?.unwrap_or(now);
        let start = match self.start.as_deref() {
            Some(s) => parse_time(s)?,
            None => end - ChronoDuration::hours(1),
        };
        Ok((start, end))
    }

    pub fn query_params(&self, now: DateTime<Utc>) -> Result<QueryParams, ConfigError> {
        let (start, end) = self.time_range(now)?;
        Ok(QueryParams {
            postgrest_url: self.postgrest_url.clone(),
            api_url: self.api_url.clone(),
            exporter: self.exporter.clone(),
            interface: self.interface.clone(),
            start,
            end,
            filters: self.filters.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.default_ttl_secs)
    }
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Terminal dashboard for NetFlow and interface traffic", long_about = None)]
pub struct CliArgs {
    #[arg(short, long, default_value = "flow_dash.toml")]
    pub config: PathBuf,

    #[arg(short, long)]
    pub exporter: Option<String>,

    #[arg(short, long)]
    pub interface: Option<String>,

    #[arg(long)]
    pub start: Option<String>,

    #[arg(long)]
    pub end: Option<String>,

    #[arg(long)]
    pub postgrest_url: Option<String>,

    #[arg(long)]
    pub api_url: Option<String>,

    /// Read interface counters from the internal metrics API.
    #[arg(long)]
    pub use_api: bool,

    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// File settings (if the file exists) with command-line overrides on top.
pub fn load_config(cli_args: &CliArgs) -> Result<Config, ConfigError> {
    let mut config = if Path::new(&cli_args.config).exists() {
        let contents = fs::read_to_string(&cli_args.config)?;
        toml::from_str(&contents)?
    } else {
        Config::default()
    };

    if let Some(exporter) = &cli_args.exporter {
        config.exporter = exporter.clone();
    }
    if let Some(interface) = &cli_args.interface {
        config.interface = interface.clone();
    }
    if let Some(start) = &cli_args.start {
        config.start = Some(start.clone());
    }
    if let Some(end) = &cli_args.end {
        config.end = Some(end.clone());
    }
    if let Some(url) = &cli_args.postgrest_url {
        config.postgrest_url = url.clone();
    }
    if let Some(url) = &cli_args.api_url {
        config.api_url = url.clone();
    }
    if cli_args.use_api {
        config.use_api = true;
    }
    if let Some(log_file) = &cli_args.log_file {
        config.log_file = log_file.clone();
    }

    // Reject bad times up front rather than on the first fetch.
    config.time_range(Utc::now())?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.prefix, "netflow_");
        assert_eq!(config.default_ttl(), Duration::from_secs(300));
        assert!(!config.use_api);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            exporter = "3"
            use_api = true

            [filters]
            protocol = "eq.17"

            [cache]
            quota_bytes = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.exporter, "3");
        assert!(config.use_api);
        assert_eq!(config.filters.get("protocol").map(String::as_str), Some("eq.17"));
        assert_eq!(config.cache.quota_bytes, Some(1024));
        assert_eq!(config.cache.prefix, "netflow_");
    }

    #[test]
    fn test_time_range_defaults_to_last_hour() {
        let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
        let (start, end) = Config::default().time_range(now).unwrap();
        assert_eq!(end, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 9, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_time_range_formats() {
        let config = Config {
            start: Some("1756684800".into()),
            end: Some("2025-09-01T06:30".into()),
            ..Config::default()
        };
        let (start, end) = config.time_range(Utc::now()).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 9, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 9, 1, 6, 30, 0).unwrap());

        let bad = Config {
            start: Some("yesterday".into()),
            ..Config::default()
        };
        assert!(matches!(bad.time_range(Utc::now()), Err(ConfigError::Time { .. })));
    }

    #[test]
    fn test_cli_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dash.toml");
        fs::write(&path, "exporter = \"3\"\ninterface = \"4\"\n").unwrap();

        let args = CliArgs::parse_from([
            "flow_dash",
            "--config",
            path.to_str().unwrap(),
            "--interface",
            "9",
            "--use-api",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.exporter, "3");
        assert_eq!(config.interface, "9");
        assert!(config.use_api);
    }
}
