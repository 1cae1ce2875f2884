//! rosto-store — Persistent identity registry, search and tabular export.

pub mod export;
pub mod registry;

pub use export::{export_to_file, write_table, ExportRow, DEFAULT_DELIMITER, EXPORT_HEADER, MISSING_FIELD};
pub use registry::{IdentityMap, Registry, RegistryError, Search};
