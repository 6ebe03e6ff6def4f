use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub offer_timeout_secs: u64,
    pub location_ttl_secs: u64,
    pub geohash_precision: usize,
    pub min_broadcast_distance_m: f64,
    pub broadcast_interval_ms: u64,
    pub max_queue_len: usize,
    pub default_search_radius_m: f64,
    pub sweep_interval_secs: u64,
    pub event_buffer_size: usize,
    pub subscription_buffer_size: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            offer_timeout_secs: parse_or_default("OFFER_TIMEOUT_SECS", 20)?,
            location_ttl_secs: parse_or_default("LOCATION_TTL_SECS", 60)?,
            geohash_precision: parse_or_default("GEOHASH_PRECISION", 6)?,
            min_broadcast_distance_m: parse_or_default("MIN_BROADCAST_DISTANCE_M", 25.0)?,
            broadcast_interval_ms: parse_or_default("BROADCAST_INTERVAL_MS", 1000)?,
            max_queue_len: parse_or_default("MAX_QUEUE_LEN", 10)?,
            default_search_radius_m: parse_or_default("DEFAULT_SEARCH_RADIUS_M", 5000.0)?,
            sweep_interval_secs: parse_or_default("SWEEP_INTERVAL_SECS", 5)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            subscription_buffer_size: parse_or_default("SUBSCRIPTION_BUFFER_SIZE", 256)?,
        })
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_secs(self.offer_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
