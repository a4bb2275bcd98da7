use crate::clock::{SystemClock, TimerInfo};
use crate::config::CaptureConfig;
use crate::device::{FormatRequest, FrameSource, NegotiatedFormat, V4l2Device};
use crate::errors::CaptureError;
use crate::estimator::{self, PeriodEstimate};
use crate::stats::CaptureStats;
use crate::worker::{CaptureWorker, LoopContext};
use nix::time::ClockId;
use pool::{BorrowedFrame, FramePool, Timestamp};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use v4l::FourCC;
use v4l::control::{Control, Description};
use v4l::format::FieldOrder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Running,
    /// The loop ended on its own; `stop_capture` reports why.
    Faulted,
}

/// A negotiated device plus its frame pool and (optionally) a running
/// capture loop.
///
/// While capturing, the worker thread owns the device; the pool lock is the
/// only state shared with consumers. Consumers on other threads can hold a
/// clone of [`Session::pool`] and borrow from it directly.
pub struct Session<D: FrameSource = V4l2Device> {
    config: CaptureConfig,
    clock: SystemClock,
    timer: TimerInfo,
    format: NegotiatedFormat,
    format_adjusted: bool,
    pool: Option<Arc<FramePool>>,
    device: Option<D>,
    worker: Option<CaptureWorker<D>>,
    paused: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    finished: bool,
}

fn validate_buffer_count(count: usize) -> Result<(), CaptureError> {
    if count < 2 {
        return Err(CaptureError::InvalidBufferCount(count));
    }
    Ok(())
}

impl Session<V4l2Device> {
    /// Opens and negotiates the V4L2 device at `config.device_path` and
    /// allocates the frame pool. Capture is not started.
    pub fn init(config: CaptureConfig) -> Result<Self, CaptureError> {
        validate_buffer_count(config.buffer_count)?;
        let clock = SystemClock::new(config.clock_id)?;
        let device = V4l2Device::open(&config.device_path)?;
        Self::assemble(device, clock, config)
    }

    pub fn controls(&self) -> Result<Vec<Description>, CaptureError> {
        self.idle_device()?.controls()
    }

    pub fn control(&self, id: u32) -> Result<Control, CaptureError> {
        self.idle_device()?.control(id)
    }

    pub fn set_control(&mut self, control: Control) -> Result<(), CaptureError> {
        self.idle_device_mut()?.set_control(control)
    }
}

impl<D: FrameSource> Session<D> {
    /// Like [`Session::init`] for an already opened frame source.
    pub fn with_device(device: D, config: CaptureConfig) -> Result<Self, CaptureError> {
        validate_buffer_count(config.buffer_count)?;
        let clock = SystemClock::new(config.clock_id)?;
        Self::assemble(device, clock, config)
    }

    fn assemble(
        mut device: D,
        clock: SystemClock,
        config: CaptureConfig,
    ) -> Result<Self, CaptureError> {
        let prepared = prepare(&mut device, &clock, &config);
        let (format, format_adjusted, pool, timer) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(close_err) = device.close() {
                    tracing::warn!("Closing device after failed init: {}", close_err);
                }
                return Err(e);
            }
        };

        Ok(Self {
            config,
            clock,
            timer,
            format,
            format_adjusted,
            pool: Some(pool),
            device: Some(device),
            worker: None,
            paused: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(CaptureStats::default()),
            finished: false,
        })
    }

    /// Spawns the capture loop. Fails if it is already running.
    pub fn start_capture(&mut self) -> Result<(), CaptureError> {
        if self.finished {
            return Err(CaptureError::Finished);
        }
        if self.worker.is_some() {
            return Err(CaptureError::AlreadyCapturing);
        }
        let pool = self.pool.clone().ok_or(CaptureError::Finished)?;
        let device = self.device.take().ok_or(CaptureError::DeviceLost)?;

        let ctx = LoopContext {
            pool,
            clock: self.clock,
            read_timeout: self.config.read_timeout,
            max_consecutive_timeouts: self.config.max_consecutive_timeouts,
            backoff: self.config.claim_backoff.clone(),
            paused: Arc::clone(&self.paused),
            stats: Arc::clone(&self.stats),
        };

        self.worker = Some(CaptureWorker::spawn(device, ctx)?);
        Ok(())
    }

    /// Cancels the capture loop and waits for it to exit, which can take up
    /// to the read timeout. Returns the error that ended the loop, if any.
    /// Does nothing when no loop is running.
    pub fn stop_capture(&mut self) -> Result<(), CaptureError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        match worker.stop() {
            Some((device, result)) => {
                self.device = Some(device);
                result
            }
            None => Err(CaptureError::WorkerPanicked),
        }
    }

    /// Parks the capture loop without stopping it. The device is left idle
    /// while paused.
    pub fn pause_capture(&self, pause: bool) {
        self.paused.store(pause, Ordering::Release);
        tracing::info!(paused = pause, "Capture pause toggled");
    }

    pub fn capture_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// True while a loop is attached, including one that already faulted.
    pub fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }

    pub fn capture_state(&self) -> CaptureState {
        match &self.worker {
            None => CaptureState::Idle,
            Some(worker) if worker.is_finished() => CaptureState::Faulted,
            Some(_) => CaptureState::Running,
        }
    }

    /// Borrows up to `n` of the newest frames, newest first.
    pub fn borrow_newest(&self, n: usize) -> Vec<BorrowedFrame> {
        match &self.pool {
            Some(pool) => pool.borrow_newest(n),
            None => Vec::new(),
        }
    }

    /// Returns frames obtained from [`Session::borrow_newest`].
    pub fn release(&self, frames: Vec<BorrowedFrame>) -> Result<(), CaptureError> {
        match &self.pool {
            Some(pool) => Ok(pool.release(frames)?),
            // Handles keep their pool alive and release into it on drop.
            None => Ok(()),
        }
    }

    /// Number of frames stamped strictly after `timestamp`.
    pub fn count_newer_than(&self, timestamp: Timestamp) -> usize {
        self.pool
            .as_ref()
            .map_or(0, |pool| pool.count_newer_than(timestamp))
    }

    /// Measures the device's delivered frame interval over `duration`.
    ///
    /// Reads from the device directly, so it is refused while capturing.
    pub fn estimate_period(&mut self, duration: Duration) -> Result<PeriodEstimate, CaptureError> {
        let frame_size = self.buffer_size();
        let read_timeout = self.config.read_timeout;
        let clock = self.clock;
        let device = self.idle_device_mut()?;
        estimator::estimate_period(device, &clock, frame_size, duration, read_timeout)
    }

    /// Stops capture, closes the device and releases the pool. Safe to call
    /// more than once. Teardown always completes; the first error met is
    /// returned.
    pub fn finish(&mut self) -> Result<(), CaptureError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let stopped = self.stop_capture();

        let closed = match self.device.take() {
            Some(mut device) => device.close().map_err(CaptureError::Close),
            None => Ok(()),
        };

        if let Some(pool) = self.pool.take() {
            let outstanding: u32 = pool.snapshot().iter().map(|slot| slot.readers).sum();
            if outstanding > 0 {
                tracing::warn!(outstanding, "Session finished with frames still borrowed");
            }
        }

        tracing::info!(
            frames = self.stats.frames_captured(),
            claim_retries = self.stats.claim_retries(),
            timeouts = self.stats.timeouts(),
            "Capture session finished"
        );

        stopped.and(closed)
    }

    fn idle_device(&self) -> Result<&D, CaptureError> {
        if self.finished {
            return Err(CaptureError::Finished);
        }
        if self.worker.is_some() {
            return Err(CaptureError::DeviceBusy);
        }
        self.device.as_ref().ok_or(CaptureError::DeviceLost)
    }

    fn idle_device_mut(&mut self) -> Result<&mut D, CaptureError> {
        if self.finished {
            return Err(CaptureError::Finished);
        }
        if self.worker.is_some() {
            return Err(CaptureError::DeviceBusy);
        }
        self.device.as_mut().ok_or(CaptureError::DeviceLost)
    }

    pub fn device_path(&self) -> &Path {
        &self.config.device_path
    }

    pub fn clock_id(&self) -> ClockId {
        self.config.clock_id
    }

    pub fn pixel_format(&self) -> FourCC {
        self.format.fourcc
    }

    /// Negotiated width and height.
    pub fn capture_size(&self) -> (u32, u32) {
        (self.format.width, self.format.height)
    }

    pub fn field_order(&self) -> FieldOrder {
        self.format.field_order
    }

    pub fn stride(&self) -> u32 {
        self.format.stride
    }

    /// Bytes per frame buffer.
    pub fn buffer_size(&self) -> usize {
        self.format.image_size as usize
    }

    pub fn buffer_count(&self) -> usize {
        self.config.buffer_count
    }

    pub fn read_timeout(&self) -> Duration {
        self.config.read_timeout
    }

    pub fn format(&self) -> &NegotiatedFormat {
        &self.format
    }

    /// Whether the device substituted any requested parameter.
    pub fn format_adjusted(&self) -> bool {
        self.format_adjusted
    }

    pub fn timer_info(&self) -> TimerInfo {
        self.timer
    }

    /// Shared handle for consumers on other threads. `None` once finished.
    pub fn pool(&self) -> Option<Arc<FramePool>> {
        self.pool.clone()
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }
}

type Prepared = (NegotiatedFormat, bool, Arc<FramePool>, TimerInfo);

fn prepare<D: FrameSource>(
    device: &mut D,
    clock: &SystemClock,
    config: &CaptureConfig,
) -> Result<Prepared, CaptureError> {
    let request = FormatRequest {
        fourcc: config.pixel_format,
        width: config.width,
        height: config.height,
    };

    let negotiated = device
        .negotiate(&request)
        .map_err(CaptureError::Negotiation)?;

    let adjusted = negotiated.differs_from(&request);
    if adjusted {
        tracing::warn!(
            "Device changed capture parameters: requested {}x{} {} progressive, got {}x{} {} {:?}",
            request.width,
            request.height,
            request.fourcc,
            negotiated.width,
            negotiated.height,
            negotiated.fourcc,
            negotiated.field_order
        );
    }

    let format = negotiated.sanitized();

    let pool = FramePool::new(config.buffer_count, format.image_size as usize)?;
    tracing::info!(
        "Allocated {} buffers of {} bytes ({}x{} {}, stride {})",
        config.buffer_count,
        format.image_size,
        format.width,
        format.height,
        format.fourcc,
        format.stride
    );

    let timer = TimerInfo::capture(clock)?;
    tracing::info!(
        resolution_ns = timer.resolution.as_nanos() as u64,
        start = %timer.clock_start,
        "Session clock ready"
    );

    Ok((format, adjusted, pool, timer))
}

impl<D: FrameSource> Drop for Session<D> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("Session dropped without finish(), tearing down");
            if let Err(e) = self.finish() {
                tracing::error!("Teardown of dropped session failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeDevice, frame_sequence};
    use std::thread;
    use std::time::Instant;

    const YUYV: FourCC = FourCC { repr: *b"YUYV" };

    fn config(width: u32, height: u32, buffer_count: usize) -> CaptureConfig {
        CaptureConfig {
            buffer_count,
            read_timeout: Duration::from_millis(500),
            ..CaptureConfig::new("/dev/fake0", YUYV, width, height)
        }
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_adopts_substituted_format_and_fixes_stride() {
        let device = FakeDevice::new(Duration::from_millis(5))
            .with_native_format(YUYV, 352, 288, 0, 0);
        let mut session = Session::with_device(device, config(640, 480, 3)).unwrap();

        assert_eq!(session.capture_size(), (352, 288));
        assert_eq!(session.stride(), 704);
        assert_eq!(session.buffer_size(), 704 * 288);
        assert!(session.format_adjusted());
        assert_eq!(session.field_order(), FieldOrder::Progressive);

        let pool = session.pool().unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.frame_size(), 202752);
        assert!(pool.snapshot().iter().all(|slot| slot.timestamp.is_min() && slot.readers == 0));

        session.finish().unwrap();
    }

    #[test]
    fn test_rejects_single_buffer() {
        let result = Session::with_device(FakeDevice::new(Duration::ZERO), config(64, 48, 1));
        assert!(matches!(result, Err(CaptureError::InvalidBufferCount(1))));
    }

    #[test]
    fn test_unavailable_clock_is_a_configuration_error() {
        let device = FakeDevice::new(Duration::ZERO);
        let control = device.control();
        let config = CaptureConfig {
            clock_id: ClockId::from_raw(4242),
            ..config(64, 48, 2)
        };

        let result = Session::with_device(device, config);
        assert!(matches!(result, Err(CaptureError::ClockUnavailable { .. })));
        // The device was dropped without ever being negotiated.
        assert_eq!(control.reads(), 0);
    }

    #[test]
    fn test_capture_publishes_newest_first() {
        let device = FakeDevice::new(Duration::from_millis(2));
        let mut session = Session::with_device(device, config(64, 48, 3)).unwrap();
        let stats = session.stats();

        session.start_capture().unwrap();
        assert_eq!(session.capture_state(), CaptureState::Running);
        wait_until("five frames", || stats.frames_captured() >= 5);
        session.stop_capture().unwrap();
        assert_eq!(session.capture_state(), CaptureState::Idle);

        let frames = session.borrow_newest(2);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].timestamp() > frames[1].timestamp());

        let newest = frame_sequence(frames[0].data()).unwrap();
        let previous = frame_sequence(frames[1].data()).unwrap();
        assert_eq!(newest, previous + 1);
        assert_eq!(newest, stats.frames_captured());

        let pool = session.pool().unwrap();
        assert_eq!(pool.reader_count(frames[0].index()), Some(1));
        assert_eq!(pool.reader_count(frames[1].index()), Some(1));

        assert_eq!(session.count_newer_than(frames[1].timestamp()), 1);
        assert_eq!(session.count_newer_than(frames[0].timestamp()), 0);
        assert_eq!(session.count_newer_than(Timestamp::MIN), 3);

        session.release(frames).unwrap();
        assert!(pool.snapshot().iter().all(|slot| slot.readers == 0));

        session.finish().unwrap();
    }

    #[test]
    fn test_held_oldest_buffer_is_skipped_until_released() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let mut session = Session::with_device(device, config(64, 48, 3)).unwrap();
        let stats = session.stats();

        // Keep only the oldest buffer borrowed.
        let mut frames = session.borrow_newest(3);
        let held = frames.pop().unwrap();
        session.release(frames).unwrap();
        let held_index = held.index();

        session.start_capture().unwrap();
        wait_until("a refused claim", || stats.claim_retries() > 0);

        assert_eq!(stats.frames_captured(), 0);
        assert_eq!(session.capture_state(), CaptureState::Running);
        assert!(held.data().iter().all(|&b| b == 0));

        session.release(vec![held]).unwrap();
        wait_until("frames after release", || stats.frames_captured() >= 3);
        session.stop_capture().unwrap();

        let newest = session.borrow_newest(3);
        assert!(newest.iter().any(|f| f.index() == held_index && !f.timestamp().is_min()));
        session.release(newest).unwrap();

        session.finish().unwrap();
    }

    #[test]
    fn test_readiness_timeout_ends_loop_with_typed_error() {
        let device = FakeDevice::new(Duration::from_millis(1));
        device.control().set_stalled(true);
        let config = CaptureConfig {
            read_timeout: Duration::from_millis(20),
            ..config(64, 48, 2)
        };
        let mut session = Session::with_device(device, config).unwrap();

        session.start_capture().unwrap();
        wait_until("loop to fault", || session.capture_state() == CaptureState::Faulted);

        let err = session.stop_capture().unwrap_err();
        assert!(matches!(err, CaptureError::ReadTimeout(t) if t == Duration::from_millis(20)));
        assert_eq!(session.stats().timeouts(), 1);

        // The device came back with the worker and can be reused.
        assert_eq!(session.capture_state(), CaptureState::Idle);
        session.finish().unwrap();
    }

    #[test]
    fn test_tolerated_timeouts_keep_capturing() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let control = device.control();
        control.set_stalled(true);
        let config = CaptureConfig {
            read_timeout: Duration::from_millis(20),
            max_consecutive_timeouts: 50,
            ..config(64, 48, 2)
        };
        let mut session = Session::with_device(device, config).unwrap();
        let stats = session.stats();

        session.start_capture().unwrap();
        wait_until("a timeout", || stats.timeouts() >= 1);
        control.set_stalled(false);
        wait_until("frames after stall", || stats.frames_captured() >= 2);

        assert_eq!(session.capture_state(), CaptureState::Running);
        session.stop_capture().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_read_error_returns_claimed_buffer() {
        let device = FakeDevice::new(Duration::from_millis(1));
        device.control().set_fail_reads(true);
        let mut session = Session::with_device(device, config(64, 48, 3)).unwrap();

        session.start_capture().unwrap();
        wait_until("loop to fault", || session.capture_state() == CaptureState::Faulted);

        assert!(matches!(session.stop_capture(), Err(CaptureError::Read(_))));

        let snapshot = session.pool().unwrap().snapshot();
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.iter().all(|slot| slot.timestamp.is_min()));

        session.finish().unwrap();
    }

    #[test]
    fn test_short_read_is_fatal() {
        let device = FakeDevice::new(Duration::from_millis(1));
        device.control().set_short_reads(true);
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();

        session.start_capture().unwrap();
        wait_until("loop to fault", || session.capture_state() == CaptureState::Faulted);

        let err = session.stop_capture().unwrap_err();
        assert!(matches!(
            err,
            CaptureError::ShortRead {
                expected: 6144,
                actual: 3072
            }
        ));
        assert_eq!(session.stats().frames_captured(), 0);
        session.finish().unwrap();
    }

    #[test]
    fn test_pause_stops_device_reads() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let control = device.control();
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();
        let stats = session.stats();

        session.start_capture().unwrap();
        wait_until("first frames", || stats.frames_captured() >= 2);

        session.pause_capture(true);
        assert!(session.capture_paused());
        thread::sleep(Duration::from_millis(50));
        let reads_while_paused = control.reads();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(control.reads(), reads_while_paused);

        session.pause_capture(false);
        wait_until("frames after resume", || control.reads() > reads_while_paused);

        session.stop_capture().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_second_start_is_refused() {
        let mut session =
            Session::with_device(FakeDevice::new(Duration::from_millis(1)), config(64, 48, 2))
                .unwrap();

        session.start_capture().unwrap();
        assert!(matches!(
            session.start_capture(),
            Err(CaptureError::AlreadyCapturing)
        ));
        assert!(session.is_capturing());

        session.stop_capture().unwrap();
        session.stop_capture().unwrap();
        assert!(!session.is_capturing());

        // Restart after a clean stop.
        session.start_capture().unwrap();
        session.finish().unwrap();
    }

    #[test]
    fn test_estimate_period_at_thirty_fps() {
        let device = FakeDevice::new(Duration::from_nanos(1_000_000_000 / 30));
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();

        let estimate = session.estimate_period(Duration::from_secs(1)).unwrap();

        assert!(estimate.samples >= 29, "samples: {}", estimate.samples);
        assert!(
            (estimate.mean - 1.0 / 30.0).abs() < 0.003,
            "mean: {}",
            estimate.mean
        );
        assert!(estimate.std_dev < 0.005, "std_dev: {}", estimate.std_dev);

        session.finish().unwrap();
    }

    #[test]
    fn test_estimate_with_zero_duration_still_measures_an_interval() {
        let device = FakeDevice::new(Duration::from_millis(33));
        let control = device.control();
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();

        let estimate = session.estimate_period(Duration::ZERO).unwrap();

        assert!(estimate.samples >= 1);
        assert!(control.reads() >= 2);
        assert!(estimate.mean > 0.0);

        session.finish().unwrap();
    }

    #[test]
    fn test_estimate_refused_while_capturing() {
        let mut session =
            Session::with_device(FakeDevice::new(Duration::from_millis(1)), config(64, 48, 2))
                .unwrap();

        session.start_capture().unwrap();
        assert!(matches!(
            session.estimate_period(Duration::from_millis(10)),
            Err(CaptureError::DeviceBusy)
        ));
        session.finish().unwrap();
    }

    #[test]
    fn test_finish_is_idempotent_and_closes_device() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let control = device.control();
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();

        session.start_capture().unwrap();
        session.finish().unwrap();
        session.finish().unwrap();

        assert!(control.is_closed());
        assert!(session.pool().is_none());
        assert!(session.borrow_newest(2).is_empty());
        assert_eq!(session.count_newer_than(Timestamp::MIN), 0);
        assert!(matches!(session.start_capture(), Err(CaptureError::Finished)));
        assert!(matches!(
            session.estimate_period(Duration::from_millis(10)),
            Err(CaptureError::Finished)
        ));
    }

    #[test]
    fn test_frames_outlive_finished_session() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();
        let stats = session.stats();

        session.start_capture().unwrap();
        wait_until("a frame", || stats.frames_captured() >= 1);
        let frames = session.borrow_newest(1);
        session.finish().unwrap();

        assert_eq!(frames[0].len(), 64 * 2 * 48);
        assert!(frame_sequence(frames[0].data()).is_some());
        session.release(frames).unwrap();
    }

    #[test]
    fn test_drop_tears_down_running_session() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let control = device.control();
        let mut session = Session::with_device(device, config(64, 48, 2)).unwrap();

        session.start_capture().unwrap();
        drop(session);

        assert!(control.is_closed());
    }

    #[test]
    fn test_consumer_thread_borrows_while_capturing() {
        let device = FakeDevice::new(Duration::from_millis(1));
        let mut session = Session::with_device(device, config(64, 48, 4)).unwrap();
        let pool = session.pool().unwrap();
        let stats = session.stats();

        session.start_capture().unwrap();

        let consumer = thread::spawn(move || {
            let mut last_seen = Timestamp::MIN;
            let mut observed = 0;
            while observed < 20 {
                let frames = pool.borrow_newest(2);
                for pair in frames.windows(2) {
                    assert!(pair[0].timestamp() >= pair[1].timestamp());
                }
                if let Some(frame) = frames.first()
                    && frame.timestamp() > last_seen
                {
                    last_seen = frame.timestamp();
                    observed += 1;
                }
                pool.release(frames).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });

        consumer.join().unwrap();
        assert!(stats.frames_captured() >= 20);
        session.finish().unwrap();
    }
}
