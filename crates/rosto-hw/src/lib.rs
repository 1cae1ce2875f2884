//! rosto-hw — Camera capture and the frame acquisition thread.
//!
//! Provides V4L2-based camera access converted to RGB frames, and a
//! cooperative capture/cancel loop that runs off the caller's thread.

pub mod acquisition;
pub mod camera;
pub mod frame;

pub use acquisition::{spawn_acquisition, AcquisitionError, AcquisitionHandle, AcquisitionOutcome, FrameSource, Signal};
pub use camera::{Camera, CameraError, CaptureDevice, CaptureFormat, PixelFormat};
pub use frame::Frame;
