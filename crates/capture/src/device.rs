use crate::errors::{CaptureError, DeviceError};
use nix::errno::Errno;
use std::fs;
use std::os::raw::c_int;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use v4l::{
    Device, Format, FourCC,
    capability::Flags,
    control::{Control, Description},
    format::FieldOrder,
    video::Capture,
};

/// What the caller asks the device for. Interlacing is never requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
}

/// What the device actually agreed to. Authoritative over the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub fourcc: FourCC,
    pub width: u32,
    pub height: u32,
    pub field_order: FieldOrder,
    /// Bytes per line
    pub stride: u32,
    /// Bytes per frame
    pub image_size: u32,
}

impl NegotiatedFormat {
    /// True when the device substituted any of the requested parameters.
    pub fn differs_from(&self, request: &FormatRequest) -> bool {
        self.fourcc != request.fourcc
            || self.width != request.width
            || self.height != request.height
            || self.field_order != FieldOrder::Progressive
    }

    /// Some drivers report a zero or undersized stride/image size. Recompute
    /// both from the dimensions when they are smaller than two bytes per
    /// pixel allows.
    pub fn sanitized(mut self) -> Self {
        let min_stride = self.width.saturating_mul(2);
        if self.stride < min_stride {
            tracing::warn!(
                reported = self.stride,
                corrected = min_stride,
                "Device reported an undersized line stride"
            );
            self.stride = min_stride;
        }

        let min_size = self.stride.saturating_mul(self.height);
        if self.image_size < min_size {
            tracing::warn!(
                reported = self.image_size,
                corrected = min_size,
                "Device reported an undersized image size"
            );
            self.image_size = min_size;
        }

        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Timeout,
}

/// A streaming frame source with blocking-read semantics.
///
/// The capture worker takes the source by value while running, so
/// implementations never see concurrent calls.
pub trait FrameSource: Send + 'static {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat, DeviceError>;

    /// Blocks until a frame can be read or `timeout` elapses.
    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness, DeviceError>;

    /// Reads one frame into `buffer`, returning the number of bytes written.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError>;

    /// Releases the underlying handle. Calling it twice is harmless.
    fn close(&mut self) -> Result<(), DeviceError>;
}

// videodev2.h
const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct V4l2Rect {
    left: i32,
    top: i32,
    width: u32,
    height: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct V4l2Fract {
    numerator: u32,
    denominator: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct V4l2Cropcap {
    buf_type: u32,
    bounds: V4l2Rect,
    defrect: V4l2Rect,
    pixelaspect: V4l2Fract,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct V4l2Crop {
    buf_type: u32,
    c: V4l2Rect,
}

nix::ioctl_readwrite!(vidioc_cropcap, b'V', 58, V4l2Cropcap);
nix::ioctl_write_ptr!(vidioc_s_crop, b'V', 60, V4l2Crop);

/// Retries an ioctl interrupted by a signal.
fn retry_eintr<F>(mut f: F) -> Result<c_int, Errno>
where
    F: FnMut() -> Result<c_int, Errno>,
{
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// V4L2 capture device using read() I/O.
pub struct V4l2Device {
    path: PathBuf,
    device: Option<Device>,
}

impl V4l2Device {
    /// Opens `path` after checking that it is a character device with video
    /// capture and read() support.
    pub fn open(path: &Path) -> Result<Self, CaptureError> {
        let metadata = fs::metadata(path).map_err(|source| CaptureError::DeviceNotFound {
            path: path.to_path_buf(),
            source,
        })?;

        if !metadata.file_type().is_char_device() {
            return Err(CaptureError::NotCharDevice {
                path: path.to_path_buf(),
            });
        }

        let device = Device::with_path(path).map_err(|source| CaptureError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let fd = device.handle().fd();
        set_nonblocking(fd).map_err(|errno| CaptureError::Open {
            path: path.to_path_buf(),
            source: errno.into(),
        })?;

        let caps = device
            .query_caps()
            .map_err(|source| CaptureError::QueryCaps {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!("Device opened: {} ({}, {})", caps.card, caps.driver, caps.bus);

        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CaptureError::NotCaptureDevice {
                path: path.to_path_buf(),
            });
        }
        if !caps.capabilities.contains(Flags::READ_WRITE) {
            return Err(CaptureError::NoReadIo {
                path: path.to_path_buf(),
            });
        }

        reset_crop(fd);

        Ok(Self {
            path: path.to_path_buf(),
            device: Some(device),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn device(&self) -> Result<&Device, DeviceError> {
        self.device.as_ref().ok_or(DeviceError::Closed)
    }

    fn fd(&self) -> Result<c_int, DeviceError> {
        Ok(self.device()?.handle().fd())
    }

    fn open_device(&self) -> Result<&Device, CaptureError> {
        self.device.as_ref().ok_or(CaptureError::Finished)
    }

    pub fn controls(&self) -> Result<Vec<Description>, CaptureError> {
        self.open_device()?
            .query_controls()
            .map_err(CaptureError::Control)
    }

    pub fn control(&self, id: u32) -> Result<Control, CaptureError> {
        self.open_device()?
            .control(id)
            .map_err(CaptureError::Control)
    }

    pub fn set_control(&mut self, control: Control) -> Result<(), CaptureError> {
        self.open_device()?
            .set_control(control)
            .map_err(CaptureError::Control)
    }
}

fn set_nonblocking(fd: c_int) -> Result<(), Errno> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Errno::last());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Best effort: many devices do not support cropping at all.
fn reset_crop(fd: c_int) {
    let mut cropcap = V4l2Cropcap {
        buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
        ..Default::default()
    };

    // SAFETY: cropcap is a valid, properly laid out v4l2_cropcap for the
    // duration of the call.
    if let Err(e) = retry_eintr(|| unsafe { vidioc_cropcap(fd, &mut cropcap) }) {
        tracing::debug!("Crop capabilities unavailable: {}", e);
        return;
    }

    let crop = V4l2Crop {
        buf_type: V4L2_BUF_TYPE_VIDEO_CAPTURE,
        c: cropcap.defrect,
    };

    // SAFETY: crop outlives the call and matches v4l2_crop.
    if let Err(e) = retry_eintr(|| unsafe { vidioc_s_crop(fd, &crop) }) {
        tracing::debug!("Default crop rejected: {}", e);
    }
}

impl FrameSource for V4l2Device {
    fn negotiate(&mut self, request: &FormatRequest) -> Result<NegotiatedFormat, DeviceError> {
        let device = self.device()?;

        let mut format = Format::new(request.width, request.height, request.fourcc);
        format.field_order = FieldOrder::Progressive;

        let format = device.set_format(&format)?;

        Ok(NegotiatedFormat {
            fourcc: format.fourcc,
            width: format.width,
            height: format.height,
            field_order: format.field_order,
            stride: format.stride,
            image_size: format.size,
        })
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness, DeviceError> {
        let fd = self.fd()?;
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);

        loop {
            let mut pollfd = libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            };

            let ret = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
            match ret {
                0 => return Ok(Readiness::Timeout),
                r if r > 0 => {
                    if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                        return Err(DeviceError::Hangup {
                            revents: pollfd.revents,
                        });
                    }
                    return Ok(Readiness::Ready);
                }
                _ => match Errno::last() {
                    Errno::EINTR => continue,
                    errno => {
                        return Err(DeviceError::Sys {
                            operation: "poll",
                            errno,
                        });
                    }
                },
            }
        }
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<usize, DeviceError> {
        let fd = self.fd()?;

        loop {
            // SAFETY: buffer is valid for writes of buffer.len() bytes.
            let ret = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => {
                    return Err(DeviceError::Sys {
                        operation: "read",
                        errno,
                    });
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.device.take().is_some() {
            tracing::debug!(path = %self.path.display(), "Device closed");
        }
        Ok(())
    }
}
