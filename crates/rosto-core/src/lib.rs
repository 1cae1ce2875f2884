//! rosto-core — Detections, identity keys, cropping and metadata validation.
//!
//! Everything here is pure or file-local: no registry state, no camera.

pub mod crop;
pub mod detector;
pub mod keys;
pub mod types;
pub mod validate;

pub use crop::{crop_region, draw_regions, CropError};
pub use detector::{CommandDetector, DetectorError, ManifestDetector, RegionDetector};
pub use keys::KeyPolicy;
pub use types::{Detection, DetectionKind, IdentityKey, IdentityRecord, Metadata, SourceImage};
pub use validate::{validate_metadata, ValidationError};
