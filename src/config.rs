use std::env;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable must be set")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub base_url: String,
    /// When unset, pool-backed runs default to one VU per pool entry.
    pub vus: Option<usize>,
    pub iterations_per_vu: usize,
    pub max_duration: Duration,
    pub think_time_min: Duration,
    pub think_time_max: Duration,
    pub credentials_file: Option<String>,
    pub random_seed: Option<u64>,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = env::var("BASE_URL").map_err(|_| ConfigError::Missing("BASE_URL"))?;

        let vus = match env::var("VUS") {
            Ok(raw) => Some(parse_positive(&raw, "VUS")?),
            Err(_) => None,
        };

        let iterations_per_vu = match env::var("ITERATIONS") {
            Ok(raw) => parse_positive(&raw, "ITERATIONS")?,
            Err(_) => 1,
        };

        let max_duration_str = env::var("MAX_DURATION").unwrap_or_else(|_| "1m".to_string());
        let max_duration =
            parse_duration_string(&max_duration_str).map_err(|reason| ConfigError::Invalid {
                name: "MAX_DURATION",
                reason,
            })?;

        let think_time_min = parse_secs_var("THINK_TIME_MIN_SECS", 1)?;
        let think_time_max = parse_secs_var("THINK_TIME_MAX_SECS", 2)?;
        if think_time_max < think_time_min {
            return Err(ConfigError::Invalid {
                name: "THINK_TIME_MAX_SECS",
                reason: "must not be smaller than THINK_TIME_MIN_SECS".to_string(),
            });
        }

        let credentials_file = env::var("CREDENTIALS_FILE").ok();

        let random_seed = match env::var("RANDOM_SEED") {
            Ok(raw) => Some(raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                name: "RANDOM_SEED",
                reason: format!("'{}' is not a valid u64", raw),
            })?),
            Err(_) => None,
        };

        Ok(Config {
            base_url,
            vus,
            iterations_per_vu,
            max_duration,
            think_time_min,
            think_time_max,
            credentials_file,
            random_seed,
        })
    }

    pub fn print_summary(&self) {
        info!("Run configuration:");
        info!("  base URL: {}", self.base_url);
        match self.vus {
            Some(vus) => info!("  VUs: {}", vus),
            None => info!("  VUs: one per credential pool entry"),
        }
        info!("  iterations per VU: {}", self.iterations_per_vu);
        info!("  max duration: {:?}", self.max_duration);
        info!(
            "  think time: {}..{}s",
            self.think_time_min.as_secs(),
            self.think_time_max.as_secs()
        );
        match &self.credentials_file {
            Some(path) => info!("  credentials: pool from {}", path),
            None => info!("  credentials: generated per VU"),
        }
        if let Some(seed) = self.random_seed {
            info!("  random seed: {}", seed);
        }
    }
}

fn parse_positive(raw: &str, name: &'static str) -> Result<usize, ConfigError> {
    let value: usize = raw.parse().map_err(|_| ConfigError::Invalid {
        name,
        reason: format!("'{}' is not a valid number", raw),
    })?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(value)
}

fn parse_secs_var(name: &'static str, default_secs: u64) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                name,
                reason: format!("'{}' is not a valid number of seconds", raw),
            })?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(Duration::from_secs(default_secs)),
    }
}

/// Parses durations like "30s", "10m", "2h", "1d".
pub fn parse_duration_string(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("duration string cannot be empty".to_string());
    }

    let unit_char = s.chars().last().unwrap();
    let value_str = &s[0..s.len() - 1];

    let value: u64 = value_str
        .parse()
        .map_err(|_| format!("invalid numeric value in duration: '{}'", value_str))?;

    match unit_char {
        's' => Ok(Duration::from_secs(value)),
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 60 * 60)),
        'd' => Ok(Duration::from_secs(value * 24 * 60 * 60)),
        _ => Err(format!(
            "unknown duration unit: '{}'. Use 's', 'm', 'h', or 'd'.",
            unit_char
        )),
    }
}
