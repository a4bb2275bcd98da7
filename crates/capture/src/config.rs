use crate::clock::parse_clock;
use anyhow::{Context, bail};
use nix::time::ClockId;
use pool::ClaimBackoff;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use v4l::FourCC;

pub use common::Environment;

const FOURCC_YUYV: FourCC = FourCC { repr: *b"YUYV" };

/// Parameters for [`crate::Session::init`].
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device_path: PathBuf,
    pub pixel_format: FourCC,
    pub width: u32,
    pub height: u32,
    /// Must be greater than 1
    pub buffer_count: usize,
    pub clock_id: ClockId,
    /// Upper bound on one readiness wait
    pub read_timeout: Duration,
    /// Readiness timeouts in a row that end the capture loop
    pub max_consecutive_timeouts: u32,
    pub claim_backoff: ClaimBackoff,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/video0"),
            pixel_format: FOURCC_YUYV,
            width: 640,
            height: 480,
            buffer_count: 2,
            clock_id: ClockId::CLOCK_MONOTONIC,
            read_timeout: Duration::from_secs(2),
            max_consecutive_timeouts: 1,
            claim_backoff: ClaimBackoff::default(),
        }
    }
}

impl CaptureConfig {
    pub fn new(
        device_path: impl Into<PathBuf>,
        pixel_format: FourCC,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            device_path: device_path.into(),
            pixel_format,
            width,
            height,
            ..Self::default()
        }
    }
}

/// Settings of the `capture` binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub capture: CaptureConfig,
    /// Run the period estimator for this long before capturing
    pub estimate_period: Option<Duration>,
    pub init_attempts: u32,
    pub status_interval: Duration,
    pub otel_endpoint: Option<String>,
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn parse_fourcc(code: &str) -> anyhow::Result<FourCC> {
    let bytes: [u8; 4] = code
        .as_bytes()
        .try_into()
        .with_context(|| format!("PIXEL_FORMAT must be 4 characters, got '{code}'"))?;
    Ok(FourCC::new(&bytes))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();
        let defaults = CaptureConfig::default();

        let device_path = env::var("DEVICE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.device_path);

        let pixel_format = match env::var("PIXEL_FORMAT") {
            Ok(code) => parse_fourcc(&code)?,
            Err(_) => defaults.pixel_format,
        };

        let clock_id = match env::var("CLOCK") {
            Ok(name) => match parse_clock(&name) {
                Some(id) => id,
                None => bail!(
                    "Unknown CLOCK '{name}' \
                     (expected monotonic, realtime, monotonic_raw or boottime)"
                ),
            },
            Err(_) => defaults.clock_id,
        };

        let capture = CaptureConfig {
            device_path,
            pixel_format,
            width: env_or("CAPTURE_WIDTH", defaults.width),
            height: env_or("CAPTURE_HEIGHT", defaults.height),
            buffer_count: env_or("BUFFER_COUNT", defaults.buffer_count),
            clock_id,
            read_timeout: Duration::from_millis(env_or("READ_TIMEOUT_MS", 2000)),
            max_consecutive_timeouts: env_or(
                "MAX_CONSECUTIVE_TIMEOUTS",
                defaults.max_consecutive_timeouts,
            ),
            claim_backoff: defaults.claim_backoff,
        };

        let estimate_seconds: f64 = env_or("ESTIMATE_SECONDS", 0.0);
        let estimate_period = (estimate_seconds > 0.0)
            .then(|| Duration::try_from_secs_f64(estimate_seconds).ok())
            .flatten();

        Ok(Self {
            environment,
            capture,
            estimate_period,
            init_attempts: env_or("INIT_ATTEMPTS", 10),
            status_interval: Duration::from_millis(env_or("STATUS_INTERVAL_MS", 1000)),
            otel_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .ok()
                .filter(|s| !s.is_empty()),
        })
    }
}
