//! Server configuration from environment

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use picam::mode::RedactedString;

/// Credentials for the sunrise/sunset lookup
#[derive(Debug, Clone)]
pub struct SunConfig {
    pub location: String,
    pub api_key: RedactedString,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub web_port: u16,
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub framerate: f64,
    pub capture_bin: String,
    pub snapshot_dir: Option<PathBuf>,
    pub retention: Duration,
    pub log_file: Option<PathBuf>,
    /// Day/night switching is disabled without it
    pub sun: Option<SunConfig>,
    pub tick_interval: Duration,
    pub night_settle: Duration,
    pub test_source: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        Self::from_lookup(|key| std::env::var(key).ok(), &args)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, args: &[String]) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let web_port: u16 = parse_or(&var, "PICAM_WEB_PORT", 8000)?;
        let title = var("PICAM_TITLE").unwrap_or_else(|| "pi-camera".to_string());

        let width: u32 = parse_or(&var, "PICAM_WIDTH", 1296)?;
        let height: u32 = parse_or(&var, "PICAM_HEIGHT", 972)?;
        if width == 0 || height == 0 {
            bail!("Capture resolution must be non-zero, got {}x{}", width, height);
        }
        let framerate: f64 = parse_or(&var, "PICAM_FPS", 32.0)?;
        if !framerate.is_finite() || framerate <= 0.0 {
            bail!("PICAM_FPS must be a positive number, got {}", framerate);
        }
        let capture_bin =
            var("PICAM_CAPTURE_BIN").unwrap_or_else(|| picam::capture::rpicam::DEFAULT_PROGRAM.to_string());

        let snapshot_dir = var("PICAM_SNAPSHOT_DIR").map(PathBuf::from);
        let retention_hours: u64 = parse_or(&var, "PICAM_RETENTION_HOURS", 48)?;
        if retention_hours == 0 {
            bail!("PICAM_RETENTION_HOURS must be at least 1");
        }
        let log_file = var("PICAM_LOG_FILE").map(PathBuf::from);

        let sun = match (var("PICAM_SUN_LOCATION"), var("PICAM_SUN_API_KEY")) {
            (Some(location), Some(api_key)) => Some(SunConfig {
                location,
                api_key: api_key.into(),
            }),
            (None, None) => None,
            _ => bail!("PICAM_SUN_LOCATION and PICAM_SUN_API_KEY must be set together"),
        };

        let tick_secs: u64 = parse_or(&var, "PICAM_TICK_SECS", 5)?;
        if tick_secs == 0 {
            bail!("PICAM_TICK_SECS must be at least 1");
        }
        let settle_secs: u64 = parse_or(&var, "PICAM_NIGHT_SETTLE_SECS", 30)?;

        let test_source = args.iter().any(|arg| arg == "--test-source");

        Ok(Self {
            web_port,
            title,
            width,
            height,
            framerate,
            capture_bin,
            snapshot_dir,
            retention: Duration::from_secs(retention_hours * 60 * 60),
            log_file,
            sun,
            tick_interval: Duration::from_secs(tick_secs),
            night_settle: Duration::from_secs(settle_secs),
            test_source,
        })
    }
}

fn parse_or<T>(var: impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}
