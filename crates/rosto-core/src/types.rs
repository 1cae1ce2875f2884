use crate::detector::DetectorError;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of region a detector is asked to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionKind {
    Face,
    Eye,
    Mouth,
}

impl DetectionKind {
    pub const ALL: [DetectionKind; 3] = [DetectionKind::Face, DetectionKind::Eye, DetectionKind::Mouth];

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionKind::Face => "face",
            DetectionKind::Eye => "eye",
            DetectionKind::Mouth => "mouth",
        }
    }
}

impl fmt::Display for DetectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectionKind {
    type Err = DetectorError;

    /// Accepts the English selectors and the Portuguese ones used by older
    /// front ends (`rosto`, `olho`, `boca`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "face" | "rosto" => Ok(DetectionKind::Face),
            "eye" | "olho" => Ok(DetectionKind::Eye),
            "mouth" | "boca" => Ok(DetectionKind::Mouth),
            other => Err(DetectorError::UnknownDetectorType(other.to_string())),
        }
    }
}

/// A rectangular region found by a detector, in source-image pixel space.
///
/// `x`/`y` may be negative or past the image edge; cropping clamps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub kind: DetectionKind,
}

impl Detection {
    pub fn new(x: i32, y: i32, width: u32, height: u32, kind: DetectionKind) -> Self {
        Self { x, y, width, height, kind }
    }
}

/// Deduplication handle for one registered identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Free-text contact details attached to an identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub email: String,
    pub telephone: String,
}

impl Metadata {
    pub fn new(name: impl Into<String>, email: impl Into<String>, telephone: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            telephone: telephone.into(),
        }
    }

    /// Copy with surrounding whitespace removed from every field.
    pub fn trimmed(&self) -> Self {
        Self {
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            telephone: self.telephone.trim().to_string(),
        }
    }

    /// Case-insensitive substring match over all three fields.
    ///
    /// `needle` must already be lowercase.
    pub fn contains_lowercase(&self, needle: &str) -> bool {
        [&self.name, &self.email, &self.telephone]
            .iter()
            .any(|field| field.to_lowercase().contains(needle))
    }
}

/// A persisted identity: key, owned crop file and optional metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub key: IdentityKey,
    pub cropped_image_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_image_path: Option<PathBuf>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
    /// RFC 3339 creation time.
    pub created_at: String,
    /// RFC 3339 time of the last metadata change.
    pub updated_at: String,
}

impl IdentityRecord {
    pub fn new(key: IdentityKey, cropped_image_path: PathBuf, metadata: Option<Metadata>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            key,
            cropped_image_path,
            original_image_path: None,
            metadata,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Paths of every image file this record owns.
    pub fn owned_files(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(self.cropped_image_path.as_path()).chain(self.original_image_path.as_deref())
    }
}

/// An RGB image handed to the pipeline, with the file it came from (if any).
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub pixels: RgbImage,
    pub path: Option<PathBuf>,
}

impl SourceImage {
    /// Decode an image file. Any decode failure maps to `InvalidInput`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DetectorError> {
        let path = path.as_ref();
        let decoded = image::open(path)
            .map_err(|e| DetectorError::InvalidInput(format!("{}: {e}", path.display())))?;
        let mut source = Self::from_rgb(decoded.to_rgb8())?;
        source.path = Some(path.to_path_buf());
        Ok(source)
    }

    /// Wrap an in-memory image, e.g. a camera frame.
    pub fn from_rgb(pixels: RgbImage) -> Result<Self, DetectorError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(DetectorError::InvalidInput(format!(
                "image has no pixels ({}x{})",
                pixels.width(),
                pixels.height()
            )));
        }
        Ok(Self { pixels, path: None })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse_aliases() {
        assert_eq!("face".parse::<DetectionKind>().unwrap(), DetectionKind::Face);
        assert_eq!("Rosto".parse::<DetectionKind>().unwrap(), DetectionKind::Face);
        assert_eq!("olho".parse::<DetectionKind>().unwrap(), DetectionKind::Eye);
        assert_eq!(" boca ".parse::<DetectionKind>().unwrap(), DetectionKind::Mouth);
    }

    #[test]
    fn test_kind_parse_unknown() {
        let err = "nose".parse::<DetectionKind>().unwrap_err();
        assert!(matches!(err, DetectorError::UnknownDetectorType(ref s) if s == "nose"));
    }

    #[test]
    fn test_metadata_contains_is_case_insensitive() {
        let m = Metadata::new("Ana Souza", "Ana@Example.com", "+55 11 9999");
        assert!(m.contains_lowercase("souza"));
        assert!(m.contains_lowercase("ana@example"));
        assert!(m.contains_lowercase("9999"));
        assert!(!m.contains_lowercase("bruno"));
    }

    #[test]
    fn test_metadata_trimmed() {
        let m = Metadata::new("  Ana ", "\ta@b.co\n", " 123 ").trimmed();
        assert_eq!(m, Metadata::new("Ana", "a@b.co", "123"));
    }

    #[test]
    fn test_record_owned_files() {
        let mut record = IdentityRecord::new("usuario_0".into(), PathBuf::from("img/usuario_0.png"), None);
        assert_eq!(record.owned_files().count(), 1);
        record.original_image_path = Some(PathBuf::from("img/usuario_0_original.png"));
        let files: Vec<_> = record.owned_files().collect();
        assert_eq!(files.len(), 2);
        assert_eq!(files[1], Path::new("img/usuario_0_original.png"));
    }

    #[test]
    fn test_source_image_rejects_empty() {
        let result = SourceImage::from_rgb(RgbImage::new(0, 10));
        assert!(matches!(result, Err(DetectorError::InvalidInput(_))));
    }

    #[test]
    fn test_source_image_open_missing_file() {
        let result = SourceImage::open("/nonexistent/photo.jpg");
        assert!(matches!(result, Err(DetectorError::InvalidInput(_))));
    }

    #[test]
    fn test_source_image_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.png");
        RgbImage::from_pixel(8, 6, image::Rgb([10, 20, 30])).save(&path).unwrap();

        let source = SourceImage::open(&path).unwrap();
        assert_eq!((source.width(), source.height()), (8, 6));
        assert_eq!(source.path.as_deref(), Some(path.as_path()));
    }
}
