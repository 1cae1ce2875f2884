//! Registration workflow: detections → identity keys → registry.
//!
//! Per batch:
//!
//! ```text
//! process(image, kind)
//!   ├─ no regions ─────────────────────────────▶ NoDetections
//!   └─ each region, in detector order
//!        key derived ─┬─ key in registry ─────▶ AlreadyRegistered(record)
//!                     ├─ key already pending ─▶ Skipped(KeyPending)
//!                     ├─ crop empty ──────────▶ Skipped(error)
//!                     └─ otherwise ───────────▶ AwaitingMetadata
//!                                                 ├─ confirm(key, meta) ▶ persisted
//!                                                 └─ abandon(key)       ▶ dropped
//! ```
//!
//! Pending identities are held in memory until the caller confirms or
//! abandons them; nothing touches the registry before `confirm`.

use image::RgbImage;
use indexmap::IndexMap;
use rosto_core::{
    crop_region, validate_metadata, CropError, Detection, DetectionKind, DetectorError, IdentityKey,
    IdentityRecord, KeyPolicy, Metadata, RegionDetector, SourceImage, ValidationError,
};
use rosto_store::{export_to_file, Registry, RegistryError, Search};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Crop(#[from] CropError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("no identity is awaiting metadata under {0}")]
    NotPending(IdentityKey),
    #[error("{0} was registered while awaiting metadata")]
    AlreadyRegistered(IdentityKey),
    #[error("another region is already awaiting metadata under {0}")]
    KeyPending(IdentityKey),
}

/// Coarse error category, for front ends that branch on the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidInput,
    UnknownDetectorType,
    CorruptRegistry,
    RecordNotFound,
    DuplicateEmail,
    /// Two regions derived the same identity key.
    KeyCollision,
    Validation,
    EmptyRegistry,
    ResourceUnavailable,
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkflowError::Detector(DetectorError::InvalidInput(_)) => ErrorKind::InvalidInput,
            WorkflowError::Detector(DetectorError::UnknownDetectorType(_)) => ErrorKind::UnknownDetectorType,
            WorkflowError::Detector(DetectorError::CommandFailed(_)) => ErrorKind::ResourceUnavailable,
            WorkflowError::Crop(_) => ErrorKind::InvalidInput,
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Registry(e) => match e {
                RegistryError::Corrupt { .. } => ErrorKind::CorruptRegistry,
                RegistryError::RecordNotFound(_) => ErrorKind::RecordNotFound,
                RegistryError::DuplicateEmail { .. } => ErrorKind::DuplicateEmail,
                RegistryError::EmptyRegistry => ErrorKind::EmptyRegistry,
                RegistryError::InvalidDelimiter(_) => ErrorKind::InvalidInput,
                RegistryError::Io { .. } | RegistryError::Image { .. } => ErrorKind::ResourceUnavailable,
            },
            WorkflowError::NotPending(_) => ErrorKind::RecordNotFound,
            WorkflowError::AlreadyRegistered(_) | WorkflowError::KeyPending(_) => ErrorKind::KeyCollision,
        }
    }

    /// One-line status text for the person at the front end.
    pub fn user_message(&self) -> String {
        let prefix = match self.kind() {
            ErrorKind::InvalidInput => "Invalid input",
            ErrorKind::UnknownDetectorType => "Unknown detection type",
            ErrorKind::CorruptRegistry => "Registry is corrupt",
            ErrorKind::RecordNotFound => "Not found",
            ErrorKind::DuplicateEmail => "Email already registered",
            ErrorKind::KeyCollision => "Key already in use",
            ErrorKind::Validation => "Invalid metadata",
            ErrorKind::EmptyRegistry => "Nothing to export",
            ErrorKind::ResourceUnavailable => "Unavailable",
        };
        format!("{prefix}: {self}")
    }
}

/// A region waiting for `confirm` or `abandon`.
#[derive(Debug, Clone)]
pub struct PendingIdentity {
    pub key: IdentityKey,
    pub detection: Detection,
    crop: RgbImage,
    original: Option<Arc<RgbImage>>,
}

impl PendingIdentity {
    pub fn crop(&self) -> &RgbImage {
        &self.crop
    }
}

/// What happened to one region of a batch.
#[derive(Debug)]
pub enum RegionOutcome {
    AlreadyRegistered {
        key: IdentityKey,
        detection: Detection,
        record: IdentityRecord,
    },
    AwaitingMetadata {
        key: IdentityKey,
        detection: Detection,
    },
    /// The region could not be processed; siblings are unaffected.
    Skipped {
        key: IdentityKey,
        detection: Detection,
        error: WorkflowError,
    },
}

impl RegionOutcome {
    pub fn key(&self) -> &IdentityKey {
        match self {
            RegionOutcome::AlreadyRegistered { key, .. }
            | RegionOutcome::AwaitingMetadata { key, .. }
            | RegionOutcome::Skipped { key, .. } => key,
        }
    }

    pub fn detection(&self) -> &Detection {
        match self {
            RegionOutcome::AlreadyRegistered { detection, .. }
            | RegionOutcome::AwaitingMetadata { detection, .. }
            | RegionOutcome::Skipped { detection, .. } => detection,
        }
    }

    pub fn status_message(&self) -> String {
        match self {
            RegionOutcome::AlreadyRegistered { key, record, .. } => match &record.metadata {
                Some(m) if !m.name.is_empty() => format!("{key}: already registered ({})", m.name),
                _ => format!("{key}: already registered"),
            },
            RegionOutcome::AwaitingMetadata { key, .. } => format!("{key}: new identity, awaiting metadata"),
            RegionOutcome::Skipped { key, error, .. } => format!("{key}: skipped. {}", error.user_message()),
        }
    }
}

/// Result of processing one image for one detection kind.
#[derive(Debug)]
pub enum BatchReport {
    NoDetections { kind: DetectionKind },
    Processed { kind: DetectionKind, regions: Vec<RegionOutcome> },
}

impl BatchReport {
    pub fn regions(&self) -> &[RegionOutcome] {
        match self {
            BatchReport::NoDetections { .. } => &[],
            BatchReport::Processed { regions, .. } => regions,
        }
    }
}

pub struct Workflow<D> {
    detector: D,
    registry: Registry,
    policy: KeyPolicy,
    keep_originals: bool,
    pending: IndexMap<IdentityKey, PendingIdentity>,
}

impl<D> Workflow<D> {
    pub fn new(detector: D, registry: Registry, policy: KeyPolicy) -> Self {
        Self {
            detector,
            registry,
            policy,
            keep_originals: false,
            pending: IndexMap::new(),
        }
    }

    /// Also store the uncropped source image next to each new crop.
    pub fn keep_originals(mut self, keep: bool) -> Self {
        self.keep_originals = keep;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn policy(&self) -> KeyPolicy {
        self.policy
    }
}

impl<D: RegionDetector> Workflow<D> {
    /// Detect regions of `kind` and sort each into known / new / skipped.
    ///
    /// Detector failures fail the whole batch; crop failures and keys already
    /// held by a pending identity only skip their own region. The registry is read but never written here.
    pub fn process(&mut self, source: &SourceImage, kind: DetectionKind) -> Result<BatchReport, WorkflowError> {
        let detections = self.detector.detect(source, kind)?;
        tracing::info!(%kind, count = detections.len(), "regions detected");

        if detections.is_empty() {
            return Ok(BatchReport::NoDetections { kind });
        }

        let known = self.registry.load()?;
        let original = self.keep_originals.then(|| Arc::new(source.pixels.clone()));
        let mut regions = Vec::with_capacity(detections.len());

        for (index, detection) in detections.into_iter().enumerate() {
            let key = self.policy.derive(&detection, index);

            if let Some(record) = known.get(&key) {
                tracing::info!(%key, "region already registered");
                regions.push(RegionOutcome::AlreadyRegistered {
                    key,
                    detection,
                    record: record.clone(),
                });
                continue;
            }

            // The first region to claim a key keeps it until confirmed or abandoned.
            if self.pending.contains_key(&key) {
                tracing::warn!(%key, %kind, "region skipped, key already pending");
                regions.push(RegionOutcome::Skipped {
                    error: WorkflowError::KeyPending(key.clone()),
                    key,
                    detection,
                });
                continue;
            }

            match crop_region(&source.pixels, &detection) {
                Ok(crop) => {
                    tracing::info!(%key, "new identity awaiting metadata");
                    self.pending.insert(
                        key.clone(),
                        PendingIdentity {
                            key: key.clone(),
                            detection,
                            crop,
                            original: original.clone(),
                        },
                    );
                    regions.push(RegionOutcome::AwaitingMetadata { key, detection });
                }
                Err(e) => {
                    tracing::warn!(%key, error = %e, "region skipped");
                    regions.push(RegionOutcome::Skipped {
                        key,
                        detection,
                        error: e.into(),
                    });
                }
            }
        }

        Ok(BatchReport::Processed { kind, regions })
    }
}

/// Everything past detection needs only the registry.
impl<D> Workflow<D> {
    /// Identities awaiting metadata, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &PendingIdentity> {
        self.pending.values()
    }

    pub fn pending_identity(&self, key: &IdentityKey) -> Option<&PendingIdentity> {
        self.pending.get(key)
    }

    /// Validate `metadata` and persist the pending identity under `key`.
    ///
    /// On any failure the registry is unchanged and the identity stays
    /// pending, so the caller can correct the metadata and retry.
    pub fn confirm(&mut self, key: &IdentityKey, metadata: Metadata) -> Result<IdentityRecord, WorkflowError> {
        if !self.pending.contains_key(key) {
            return Err(WorkflowError::NotPending(key.clone()));
        }

        let metadata = validate_metadata(&metadata).map_err(|e| {
            tracing::info!(%key, rule = %e, "metadata rejected");
            e
        })?;

        if self.registry.exists(key)? {
            self.pending.shift_remove(key);
            return Err(WorkflowError::AlreadyRegistered(key.clone()));
        }

        let pending = &self.pending[key];
        let record = self.registry.upsert(
            key,
            &pending.crop,
            pending.original.as_deref(),
            Some(metadata),
        )?;
        self.pending.shift_remove(key);
        Ok(record)
    }

    /// Drop a pending identity without touching the registry.
    pub fn abandon(&mut self, key: &IdentityKey) -> Result<(), WorkflowError> {
        self.pending
            .shift_remove(key)
            .map(|_| tracing::info!(%key, "pending identity abandoned"))
            .ok_or_else(|| WorkflowError::NotPending(key.clone()))
    }

    /// Stored record for `key`.
    pub fn lookup(&self, key: &IdentityKey) -> Result<IdentityRecord, WorkflowError> {
        self.registry
            .get(key)?
            .ok_or_else(|| RegistryError::RecordNotFound(key.clone()).into())
    }

    pub fn list(&self) -> Result<Vec<IdentityRecord>, WorkflowError> {
        Ok(self.registry.list()?)
    }

    /// Replace the metadata of a registered identity, with the same rules as
    /// `confirm`.
    pub fn edit(&self, key: &IdentityKey, metadata: Metadata) -> Result<IdentityRecord, WorkflowError> {
        let metadata = validate_metadata(&metadata)?;
        Ok(self.registry.update_metadata(key, metadata)?)
    }

    pub fn remove(&self, key: &IdentityKey) -> Result<IdentityRecord, WorkflowError> {
        Ok(self.registry.remove(key)?)
    }

    pub fn search(&self, query: &str) -> Result<Search, WorkflowError> {
        Ok(self.registry.search(query)?)
    }

    /// Write the registry as delimited text. Returns the row count.
    pub fn export(&self, path: &Path, delimiter: char) -> Result<usize, WorkflowError> {
        Ok(export_to_file(&self.registry, path, delimiter)?)
    }
}
