//! Region detector seam.
//!
//! The detection algorithm itself lives outside this workspace. Detectors
//! here adapt an external source of rectangles (a precomputed manifest or a
//! detector program) into ordered [`Detection`]s.

use crate::types::{Detection, DetectionKind, SourceImage};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

/// Regions smaller than this on either side are dropped.
pub const DEFAULT_MIN_REGION_SIZE: u32 = 30;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown detector type: {0} (expected face, eye or mouth)")]
    UnknownDetectorType(String),
    #[error("detector command failed: {0}")]
    CommandFailed(String),
}

/// Maps an image to the regions of one kind, in detector order.
///
/// Order matters: ordinal identity keys are derived from it.
pub trait RegionDetector {
    fn detect(&mut self, image: &SourceImage, kind: DetectionKind) -> Result<Vec<Detection>, DetectorError>;
}

impl<D: RegionDetector + ?Sized> RegionDetector for Box<D> {
    fn detect(&mut self, image: &SourceImage, kind: DetectionKind) -> Result<Vec<Detection>, DetectorError> {
        (**self).detect(image, kind)
    }
}

/// Rectangle as emitted by external detectors: `[x, y, width, height]`.
type RawRegion = [i64; 4];

/// Convert raw rectangles, rejecting degenerate ones and dropping small ones.
fn to_detections(
    raw: &[RawRegion],
    kind: DetectionKind,
    min_size: u32,
) -> Result<Vec<Detection>, DetectorError> {
    let mut detections = Vec::with_capacity(raw.len());

    for &[x, y, w, h] in raw {
        if w <= 0 || h <= 0 {
            return Err(DetectorError::InvalidInput(format!(
                "{kind} region [{x}, {y}, {w}, {h}] has non-positive size"
            )));
        }
        let coord = |v: i64| {
            i32::try_from(v).map_err(|_| DetectorError::InvalidInput(format!("coordinate out of range: {v}")))
        };
        let side = |v: i64| {
            u32::try_from(v).map_err(|_| DetectorError::InvalidInput(format!("size out of range: {v}")))
        };
        let (width, height) = (side(w)?, side(h)?);

        if width < min_size || height < min_size {
            tracing::debug!(%kind, x, y, width, height, min_size, "dropping region below minimum size");
            continue;
        }
        detections.push(Detection::new(coord(x)?, coord(y)?, width, height, kind));
    }

    Ok(detections)
}

/// Serves precomputed regions from a JSON manifest:
///
/// ```json
/// { "face": [[10, 10, 50, 50], [200, 200, 40, 40]], "eye": [] }
/// ```
///
/// Kind names accept the same aliases as [`DetectionKind`]'s `FromStr`.
pub struct ManifestDetector {
    regions: HashMap<DetectionKind, Vec<RawRegion>>,
    min_size: u32,
}

impl ManifestDetector {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DetectorError::InvalidInput(format!("{}: {e}", path.display())))?;
        let detector = Self::from_json(&text)?;
        tracing::info!(
            path = %path.display(),
            kinds = ?detector.regions.keys().collect::<Vec<_>>(),
            "loaded region manifest"
        );
        Ok(detector)
    }

    pub fn from_json(text: &str) -> Result<Self, DetectorError> {
        #[derive(Deserialize)]
        #[serde(transparent)]
        struct Manifest(HashMap<String, Vec<RawRegion>>);

        let Manifest(raw) = serde_json::from_str(text)
            .map_err(|e| DetectorError::InvalidInput(format!("region manifest: {e}")))?;

        let mut regions = HashMap::new();
        for (name, rects) in raw {
            let kind: DetectionKind = name.parse()?;
            regions.entry(kind).or_insert_with(Vec::new).extend(rects);
        }

        Ok(Self {
            regions,
            min_size: DEFAULT_MIN_REGION_SIZE,
        })
    }

    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }
}

impl RegionDetector for ManifestDetector {
    fn detect(&mut self, _image: &SourceImage, kind: DetectionKind) -> Result<Vec<Detection>, DetectorError> {
        match self.regions.get(&kind) {
            Some(raw) => to_detections(raw, kind, self.min_size),
            None => Ok(Vec::new()),
        }
    }
}

/// Runs an external detector program once per call:
///
/// ```text
/// <program> [args...] --kind <face|eye|mouth> <image-path>
/// ```
///
/// The program prints a JSON array of `[x, y, width, height]` rectangles on
/// stdout. In-memory images (camera frames) are written to a temporary PNG
/// first.
pub struct CommandDetector {
    program: PathBuf,
    args: Vec<String>,
    min_size: u32,
}

impl CommandDetector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            min_size: DEFAULT_MIN_REGION_SIZE,
        }
    }

    /// Parse a shell-like command line (`python3 detect.py --model x`),
    /// splitting on whitespace. Returns `None` for an empty line.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        let mut detector = Self::new(program);
        detector.args = parts.map(str::to_string).collect();
        Some(detector)
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_min_size(mut self, min_size: u32) -> Self {
        self.min_size = min_size;
        self
    }

    fn run(&self, image_path: &Path, kind: DetectionKind) -> Result<Vec<RawRegion>, DetectorError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--kind")
            .arg(kind.as_str())
            .arg(image_path)
            .output()
            .map_err(|e| DetectorError::CommandFailed(format!("{}: {e}", self.program.display())))?;

        if !output.status.success() {
            return Err(DetectorError::CommandFailed(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        serde_json::from_slice(&output.stdout)
            .map_err(|e| DetectorError::CommandFailed(format!("unparseable detector output: {e}")))
    }
}

impl RegionDetector for CommandDetector {
    fn detect(&mut self, image: &SourceImage, kind: DetectionKind) -> Result<Vec<Detection>, DetectorError> {
        let raw = match &image.path {
            Some(path) => self.run(path, kind)?,
            None => {
                let frame_file = tempfile::Builder::new()
                    .prefix("rosto-frame-")
                    .suffix(".png")
                    .tempfile()
                    .map_err(|e| DetectorError::InvalidInput(format!("temporary frame file: {e}")))?;
                image
                    .pixels
                    .save(frame_file.path())
                    .map_err(|e| DetectorError::InvalidInput(format!("writing temporary frame: {e}")))?;
                self.run(frame_file.path(), kind)?
            }
        };

        let detections = to_detections(&raw, kind, self.min_size)?;
        tracing::debug!(
            program = %self.program.display(),
            %kind,
            raw = raw.len(),
            kept = detections.len(),
            "detector command finished"
        );
        Ok(detections)
    }
}
