use std::{env, io};

use tracing::debug;

use crate::refine::BoundingRegion;

const DEFAULT_GEOCODER_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_USER_AGENT: &str = concat!("insee-geocoder/", env!("CARGO_PKG_VERSION"));
const DEFAULT_TELEMETRY_BUFFER_MAX_BYTES: u64 = 5 * 1024 * 1024;

// Vienne (département 86) envelope used to sanity-check resolved coordinates.
const DEFAULT_REGION_MIN_LAT: f64 = 46.0;
const DEFAULT_REGION_MAX_LAT: f64 = 47.6;
const DEFAULT_REGION_MIN_LON: f64 = -0.5;
const DEFAULT_REGION_MAX_LON: f64 = 1.5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub geocoder_endpoint: String,
    pub geocoder_user_agent: String,
    pub geocoder_timeout_secs: u64,
    pub geocoder_retry_attempts: u32,
    pub geocoder_retry_backoff_ms: u64,
    pub geocoder_pacing_ms: u64,
    pub country: String,
    pub region: BoundingRegion,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            geocoder_endpoint: env::var("GEOCODER_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODER_ENDPOINT.to_string()),
            geocoder_user_agent: env::var("GEOCODER_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            geocoder_timeout_secs: parse_u64("GEOCODER_TIMEOUT_SECS", 10),
            geocoder_retry_attempts: parse_u32("GEOCODER_RETRY_ATTEMPTS", 3).max(1),
            geocoder_retry_backoff_ms: parse_u64("GEOCODER_RETRY_BACKOFF_MS", 2_000),
            geocoder_pacing_ms: parse_u64("GEOCODER_PACING_MS", 1_000),
            country: env::var("GEOCODER_COUNTRY").unwrap_or_else(|_| "France".to_string()),
            region: BoundingRegion::new(
                parse_f64("REGION_MIN_LAT", DEFAULT_REGION_MIN_LAT),
                parse_f64("REGION_MAX_LAT", DEFAULT_REGION_MAX_LAT),
                parse_f64("REGION_MIN_LON", DEFAULT_REGION_MIN_LON),
                parse_f64("REGION_MAX_LON", DEFAULT_REGION_MAX_LON),
            ),
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25),
            telemetry_buffer_max_bytes: parse_u64(
                "TELEMETRY_BUFFER_MAX_BYTES",
                DEFAULT_TELEMETRY_BUFFER_MAX_BYTES,
            ),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
