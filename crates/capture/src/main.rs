use anyhow::Context;
use capture::{
    AppConfig, CaptureError, CaptureState, Session, Timestamp,
    logging::{DEFAULT_LOG_FILTER, setup_logging},
};
use common::{TelemetryGuard, retry_with_backoff_if};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;

    let _telemetry = match config.otel_endpoint.as_deref() {
        Some(endpoint) => Some(TelemetryGuard::init(
            "capture",
            endpoint,
            config.environment,
            DEFAULT_LOG_FILTER,
        )?),
        None => {
            setup_logging(&config);
            None
        }
    };

    tracing::info!(config = ?config, "Loaded configuration");

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;
    tracing::info!("Signal handlers registered (SIGTERM, SIGINT)");

    let mut session = retry_with_backoff_if(
        || Session::init(config.capture.clone()),
        config.init_attempts,
        INIT_RETRY_DELAY,
        "Capture init",
        CaptureError::is_transient,
    )
    .context("Failed to initialize capture - check V4L2 device availability")?;

    let (width, height) = session.capture_size();
    tracing::info!(
        device = %session.device_path().display(),
        format = %session.pixel_format(),
        width,
        height,
        buffer_size = session.buffer_size(),
        buffers = session.buffer_count(),
        adjusted = session.format_adjusted(),
        "Capture session ready"
    );

    if let Some(duration) = config.estimate_period {
        let estimate = session
            .estimate_period(duration)
            .context("Capture period estimation failed")?;
        tracing::info!(
            "Device delivers {:.2} fps (period {:.4}s, jitter {:.4}s)",
            estimate.frames_per_second(),
            estimate.mean,
            estimate.std_dev
        );
    }

    session.start_capture()?;
    let consumed = consume(&session, &shutdown, config.status_interval);

    let finished = session.finish();
    match (&consumed, &finished) {
        (Ok(()), Ok(())) => tracing::info!("Capture stopped gracefully"),
        (_, Err(e)) | (Err(e), _) => tracing::error!("Capture failed: {}", e),
    }

    consumed?;
    finished?;
    Ok(())
}

/// Samples the newest frame every `interval` until shutdown or until the
/// capture loop faults.
fn consume(
    session: &Session,
    shutdown: &AtomicBool,
    interval: Duration,
) -> Result<(), CaptureError> {
    let stats = session.stats();
    let mut last_seen = Timestamp::MIN;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(interval);

        if session.capture_state() == CaptureState::Faulted {
            tracing::warn!("Capture loop exited, shutting down");
            break;
        }

        let arrived = session.count_newer_than(last_seen);
        let frames = session.borrow_newest(1);

        if let Some(frame) = frames.first() {
            tracing::info!(
                arrived,
                newest = %frame.timestamp(),
                bytes = frame.len(),
                captured = stats.frames_captured(),
                claim_retries = stats.claim_retries(),
                timeouts = stats.timeouts(),
                "Capture status"
            );
            last_seen = frame.timestamp();
        }

        session.release(frames)?;
    }

    Ok(())
}
