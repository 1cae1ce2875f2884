//! Live camera input over V4L2.

use crate::frame::{self, Frame};
use image::{ImageFormat, RgbImage};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Resolution asked of the driver; it may settle on something else.
const PREFERRED_SIZE: (u32, u32) = (640, 480);
const MMAP_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    ResourceUnavailable(String),
    #[error("camera is in use by another process")]
    DeviceBusy,
    #[error("frame capture failed: {0}")]
    CaptureFailed(String),
    #[error("no usable pixel format: {0}")]
    FormatNegotiationFailed(String),
}

/// A V4L2 node that can capture video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDevice {
    pub path: PathBuf,
    /// Human-readable card name reported by the driver.
    pub card: String,
    pub driver: String,
}

/// Pixel layouts this module can turn into RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Packed 4:2:2, two pixels per four bytes.
    Yuyv,
    /// One byte per pixel, typical of IR sensors.
    Grey,
    /// Each buffer is a complete JPEG.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            b"MJPG" => Some(PixelFormat::Mjpeg),
            _ => None,
        }
    }

    fn decode(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, CameraError> {
        let converted = match self {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height).map_err(|e| e.to_string()),
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height).map_err(|e| e.to_string()),
            PixelFormat::Mjpeg => image::load_from_memory_with_format(buf, ImageFormat::Jpeg)
                .map(|decoded| decoded.to_rgb8())
                .map_err(|e| e.to_string()),
        };
        converted.map_err(|reason| CameraError::CaptureFailed(format!("{self:?} buffer: {reason}")))
    }
}

/// What the driver agreed to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// An open capture device. Released when dropped.
pub struct Camera {
    device: Device,
    path: PathBuf,
    format: CaptureFormat,
}

impl Camera {
    /// Open `path` (e.g. `/dev/video0`) and negotiate a format.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CameraError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CameraError::ResourceUnavailable(format!("{}: no such device", path.display())));
        }

        let device = Device::with_path(path).map_err(|e| classify_open_error(path, e))?;
        let caps = device
            .query_caps()
            .map_err(|e| CameraError::ResourceUnavailable(format!("{}: {e}", path.display())))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::ResourceUnavailable(format!(
                "{} ({}) cannot capture video",
                path.display(),
                caps.card
            )));
        }

        let format = negotiate(&device)?;
        tracing::info!(
            device = %path.display(),
            card = %caps.card,
            width = format.width,
            height = format.height,
            pixel_format = ?format.pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            path: path.to_path_buf(),
            format,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    /// Block until the next frame arrives and return it as RGB.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, MMAP_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("mapping buffers: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeuing buffer: {e}")))?;

        let CaptureFormat {
            width,
            height,
            pixel_format,
        } = self.format;
        Ok(Frame {
            image: pixel_format.decode(buf, width, height)?,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        })
    }

    /// Every `/dev/video*` node that reports video capture, sorted by path.
    pub fn list_devices() -> Vec<CaptureDevice> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut devices: Vec<CaptureDevice> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("video"))
            })
            .filter_map(|path| {
                let caps = Device::with_path(&path).and_then(|dev| dev.query_caps()).ok()?;
                caps.capabilities.contains(Flags::VIDEO_CAPTURE).then(|| CaptureDevice {
                    path,
                    card: caps.card,
                    driver: caps.driver,
                })
            })
            .collect();
        devices.sort_by(|a, b| a.path.cmp(&b.path));
        devices
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        tracing::debug!(device = %self.path.display(), "camera released");
    }
}

fn classify_open_error(path: &Path, e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(EBUSY) {
        CameraError::DeviceBusy
    } else {
        CameraError::ResourceUnavailable(format!("{}: {e}", path.display()))
    }
}

/// Ask for YUYV at the preferred size and accept any format we can decode.
fn negotiate(device: &Device) -> Result<CaptureFormat, CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("reading current format: {e}")))?;
    wanted.fourcc = FourCC::new(b"YUYV");
    (wanted.width, wanted.height) = PREFERRED_SIZE;

    let granted = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("setting format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(granted.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!("driver offers {}, need YUYV, GREY or MJPG", granted.fourcc))
    })?;

    Ok(CaptureFormat {
        width: granted.width,
        height: granted.height,
        pixel_format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = Camera::open("/dev/video-rosto-missing");
        assert!(matches!(result, Err(CameraError::ResourceUnavailable(_))));
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), Some(PixelFormat::Grey));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"H264")), None);
    }

    #[test]
    fn test_decode_grey_buffer() {
        let image = PixelFormat::Grey.decode(&[7, 8, 9, 10], 2, 2).unwrap();
        assert_eq!(image.get_pixel(1, 1), &image::Rgb([10, 10, 10]));
    }

    #[test]
    fn test_decode_short_buffer_is_capture_failure() {
        let result = PixelFormat::Yuyv.decode(&[1, 2], 2, 2);
        assert!(matches!(result, Err(CameraError::CaptureFailed(_))));
    }

    #[test]
    fn test_busy_errno_maps_to_device_busy() {
        let err = classify_open_error(Path::new("/dev/video0"), io::Error::from_raw_os_error(EBUSY));
        assert!(matches!(err, CameraError::DeviceBusy));
        let err = classify_open_error(Path::new("/dev/video0"), io::Error::from_raw_os_error(13));
        assert!(matches!(err, CameraError::ResourceUnavailable(_)));
    }
}
