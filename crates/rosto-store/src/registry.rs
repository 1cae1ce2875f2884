//! Persistent identity registry.
//!
//! The whole mapping lives in one JSON file. Every operation loads it fresh,
//! mutates, and writes it back through a temp file + rename, so a crash never
//! leaves a truncated registry. There is no locking: one process at a time.

use image::{ImageFormat, RgbImage};
use indexmap::IndexMap;
use rosto_core::validate::normalize_email;
use rosto_core::{IdentityKey, IdentityRecord, Metadata};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key → record, in insertion order.
pub type IdentityMap = IndexMap<IdentityKey, IdentityRecord>;

const CROP_EXTENSION: &str = "png";
const ORIGINAL_SUFFIX: &str = "_original";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("no identity registered under {0}")]
    RecordNotFound(IdentityKey),
    #[error("email {email} is already registered to {owner}")]
    DuplicateEmail { email: String, owner: IdentityKey },
    #[error("registry is empty, nothing to export")]
    EmptyRegistry,
    #[error("invalid export delimiter {0:?}")]
    InvalidDelimiter(char),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("encoding image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl RegistryError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Handle to a registry file and its image directory.
///
/// Holds no records itself; see the module docs.
#[derive(Debug, Clone)]
pub struct Registry {
    blob_path: PathBuf,
    images_dir: PathBuf,
}

impl Registry {
    pub fn new(blob_path: impl Into<PathBuf>, images_dir: impl Into<PathBuf>) -> Self {
        Self {
            blob_path: blob_path.into(),
            images_dir: images_dir.into(),
        }
    }

    pub fn blob_path(&self) -> &Path {
        &self.blob_path
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Path of the cropped image owned by `key`.
    pub fn crop_path(&self, key: &IdentityKey) -> PathBuf {
        self.images_dir.join(format!("{key}.{CROP_EXTENSION}"))
    }

    /// Path of the uncropped source image kept for `key`.
    pub fn original_path(&self, key: &IdentityKey) -> PathBuf {
        self.images_dir.join(format!("{key}{ORIGINAL_SUFFIX}.{CROP_EXTENSION}"))
    }

    /// Read the full mapping. A missing file is an empty registry; anything
    /// unreadable or undecodable is an error.
    pub fn load(&self) -> Result<IdentityMap, RegistryError> {
        let text = match std::fs::read_to_string(&self.blob_path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.blob_path.display(), "no registry file yet, starting empty");
                return Ok(IdentityMap::new());
            }
            Err(e) => {
                return Err(RegistryError::io(format!("reading {}", self.blob_path.display()), e));
            }
        };

        let map: IdentityMap = serde_json::from_str(&text).map_err(|e| RegistryError::Corrupt {
            path: self.blob_path.clone(),
            reason: e.to_string(),
        })?;

        if let Some((key, record)) = map.iter().find(|(key, record)| **key != record.key) {
            return Err(RegistryError::Corrupt {
                path: self.blob_path.clone(),
                reason: format!("entry {key} holds a record for {}", record.key),
            });
        }

        Ok(map)
    }

    /// Replace the backing file with `map`.
    pub fn save(&self, map: &IdentityMap) -> Result<(), RegistryError> {
        let json = serde_json::to_vec_pretty(map).map_err(|e| {
            RegistryError::io("serializing registry", io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        write_atomic(&self.blob_path, &json)?;
        tracing::debug!(path = %self.blob_path.display(), records = map.len(), "registry saved");
        Ok(())
    }

    pub fn exists(&self, key: &IdentityKey) -> Result<bool, RegistryError> {
        Ok(self.load()?.contains_key(key))
    }

    pub fn get(&self, key: &IdentityKey) -> Result<Option<IdentityRecord>, RegistryError> {
        Ok(self.load()?.shift_remove(key))
    }

    /// All records in insertion order.
    pub fn list(&self) -> Result<Vec<IdentityRecord>, RegistryError> {
        Ok(self.load()?.into_values().collect())
    }

    /// Insert or replace the identity under `key`.
    ///
    /// The crop (and original, if given) is written before the registry file
    /// references it. On replace, the previous record's files are moved aside
    /// first; they are restored if anything fails and deleted once the
    /// registry is saved, so an original the new record drops does not linger.
    pub fn upsert(
        &self,
        key: &IdentityKey,
        crop: &RgbImage,
        original: Option<&RgbImage>,
        metadata: Option<Metadata>,
    ) -> Result<IdentityRecord, RegistryError> {
        let mut map = self.load()?;
        if let Some(metadata) = &metadata {
            ensure_email_free(&map, key, &metadata.email)?;
        }

        let previous = map.get(key).cloned();
        let mut stash = Stash::default();
        if let Some(previous) = &previous {
            for path in previous.owned_files() {
                if let Err(e) = stash.take(path) {
                    stash.restore();
                    return Err(e);
                }
            }
        }

        let mut record = IdentityRecord::new(key.clone(), self.crop_path(key), metadata);
        record.original_image_path = original.map(|_| self.original_path(key));
        if let Some(previous) = &previous {
            record.created_at = previous.created_at.clone();
        }

        let stored = write_png(&record.cropped_image_path, crop)
            .and_then(|()| match (original, &record.original_image_path) {
                (Some(original), Some(path)) => write_png(path, original),
                _ => Ok(()),
            })
            .and_then(|()| {
                map.insert(key.clone(), record.clone());
                self.save(&map)
            });

        if let Err(e) = stored {
            for path in record.owned_files() {
                match std::fs::remove_file(path) {
                    Ok(()) => {}
                    Err(cleanup) if cleanup.kind() == io::ErrorKind::NotFound => {}
                    Err(cleanup) => {
                        tracing::warn!(path = %path.display(), error = %cleanup, "failed to clean up image after store error");
                    }
                }
            }
            stash.restore();
            return Err(e);
        }
        stash.discard();

        tracing::info!(
            %key,
            replaced = previous.is_some(),
            has_metadata = record.metadata.is_some(),
            "identity stored"
        );
        Ok(record)
    }

    /// Overwrite the metadata of an existing record.
    pub fn update_metadata(&self, key: &IdentityKey, metadata: Metadata) -> Result<IdentityRecord, RegistryError> {
        let mut map = self.load()?;
        ensure_email_free(&map, key, &metadata.email)?;

        let record = map
            .get_mut(key)
            .ok_or_else(|| RegistryError::RecordNotFound(key.clone()))?;
        record.metadata = Some(metadata);
        record.updated_at = chrono::Utc::now().to_rfc3339();
        let updated = record.clone();

        self.save(&map)?;
        tracing::info!(%key, "identity metadata updated");
        Ok(updated)
    }

    /// Delete the record and every image file it owns.
    ///
    /// The registry is saved first, so a failed file deletion leaves an
    /// orphaned file rather than a record pointing at nothing. Files that are
    /// already gone are only logged; any other deletion failure is returned.
    pub fn remove(&self, key: &IdentityKey) -> Result<IdentityRecord, RegistryError> {
        let mut map = self.load()?;
        let record = map
            .shift_remove(key)
            .ok_or_else(|| RegistryError::RecordNotFound(key.clone()))?;
        self.save(&map)?;

        for path in record.owned_files() {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    tracing::warn!(%key, path = %path.display(), "image file already missing");
                }
                Err(e) => {
                    return Err(RegistryError::io(format!("deleting {}", path.display()), e));
                }
            }
        }

        tracing::info!(%key, "identity removed");
        Ok(record)
    }

    /// Records whose name, email or telephone contains `query`,
    /// case-insensitively. An empty query matches every record.
    pub fn search(&self, query: &str) -> Result<Search, RegistryError> {
        Ok(Search {
            records: self.list()?,
            needle: query.trim().to_lowercase(),
        })
    }
}

/// A search over one snapshot of the registry.
///
/// Filtering happens lazily in [`Search::iter`], which can be called any
/// number of times.
#[derive(Debug, Clone)]
pub struct Search {
    records: Vec<IdentityRecord>,
    needle: String,
}

impl Search {
    pub fn iter(&self) -> impl Iterator<Item = &IdentityRecord> + '_ {
        self.records.iter().filter(move |record| {
            self.needle.is_empty()
                || record
                    .metadata
                    .as_ref()
                    .is_some_and(|m| m.contains_lowercase(&self.needle))
        })
    }
}

impl<'a> IntoIterator for &'a Search {
    type Item = &'a IdentityRecord;
    type IntoIter = Box<dyn Iterator<Item = &'a IdentityRecord> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

/// Fail if a record other than `key` already uses `email`.
fn ensure_email_free(map: &IdentityMap, key: &IdentityKey, email: &str) -> Result<(), RegistryError> {
    let wanted = normalize_email(email);
    if wanted.is_empty() {
        return Ok(());
    }
    let owner = map.iter().find(|(other, record)| {
        *other != key
            && record
                .metadata
                .as_ref()
                .is_some_and(|m| normalize_email(&m.email) == wanted)
    });
    match owner {
        Some((owner, _)) => Err(RegistryError::DuplicateEmail {
            email: email.trim().to_string(),
            owner: owner.clone(),
        }),
        None => Ok(()),
    }
}

/// Sibling temp path used while replacing `path`.
fn temp_path(path: &Path) -> PathBuf {
    sibling_path(path, ".tmp")
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Image files of a record being replaced, moved to `<file>.bak`.
#[derive(Debug, Default)]
struct Stash {
    moved: Vec<(PathBuf, PathBuf)>,
}

impl Stash {
    /// Move `path` aside. A file that is already gone is skipped.
    fn take(&mut self, path: &Path) -> Result<(), RegistryError> {
        let aside = sibling_path(path, ".bak");
        match std::fs::rename(path, &aside) {
            Ok(()) => {
                self.moved.push((path.to_path_buf(), aside));
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RegistryError::io(format!("moving aside {}", path.display()), e)),
        }
    }

    fn restore(self) {
        for (path, aside) in self.moved.into_iter().rev() {
            if let Err(e) = std::fs::rename(&aside, &path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to restore previous image");
            }
        }
    }

    fn discard(self) {
        for (_, aside) in self.moved {
            if let Err(e) = std::fs::remove_file(&aside) {
                tracing::warn!(path = %aside.display(), error = %e, "failed to delete previous image");
            }
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), RegistryError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| RegistryError::io(format!("creating {}", parent.display()), e))?;
    }
    Ok(())
}

/// Write `bytes` to `path` via a synced temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    {
        let mut file =
            File::create(&tmp).map_err(|e| RegistryError::io(format!("creating {}", tmp.display()), e))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| RegistryError::io(format!("writing {}", tmp.display()), e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        RegistryError::io(format!("replacing {}", path.display()), e)
    })
}

fn write_png(path: &Path, image: &RgbImage) -> Result<(), RegistryError> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    image
        .save_with_format(&tmp, ImageFormat::Png)
        .map_err(|source| RegistryError::Image {
            path: path.to_path_buf(),
            source,
        })?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        RegistryError::io(format!("replacing {}", path.display()), e)
    })
}
