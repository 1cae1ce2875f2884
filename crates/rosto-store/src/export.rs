//! Tabular export of the registry.

use crate::registry::{write_atomic, Registry, RegistryError};
use rosto_core::{IdentityKey, IdentityRecord};
use std::borrow::Cow;
use std::io::{self, Write};
use std::path::Path;

pub const EXPORT_HEADER: [&str; 4] = ["Identifier", "Name", "Email", "Telephone"];

/// Rendered in place of absent or empty metadata fields.
pub const MISSING_FIELD: &str = "N/A";

pub const DEFAULT_DELIMITER: char = ',';

/// One exported line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    pub key: IdentityKey,
    pub name: String,
    pub email: String,
    pub telephone: String,
}

impl From<&IdentityRecord> for ExportRow {
    fn from(record: &IdentityRecord) -> Self {
        let field = |value: Option<&String>| match value {
            Some(v) if !v.trim().is_empty() => v.clone(),
            _ => MISSING_FIELD.to_string(),
        };
        let meta = record.metadata.as_ref();
        Self {
            key: record.key.clone(),
            name: field(meta.map(|m| &m.name)),
            email: field(meta.map(|m| &m.email)),
            telephone: field(meta.map(|m| &m.telephone)),
        }
    }
}

impl Registry {
    /// One row per record, in insertion order. Fails on an empty registry.
    pub fn export_table(&self) -> Result<Vec<ExportRow>, RegistryError> {
        let map = self.load()?;
        if map.is_empty() {
            return Err(RegistryError::EmptyRegistry);
        }
        Ok(map.values().map(ExportRow::from).collect())
    }
}

fn check_delimiter(delimiter: char) -> Result<(), RegistryError> {
    if matches!(delimiter, '"' | '\n' | '\r') {
        return Err(RegistryError::InvalidDelimiter(delimiter));
    }
    Ok(())
}

/// Quote a field if it contains the delimiter, a quote or a line break.
fn escape_field(field: &str, delimiter: char) -> Cow<'_, str> {
    if field.contains(|c: char| c == delimiter || c == '"' || c == '\n' || c == '\r') {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn write_line<W: Write>(out: &mut W, fields: [&str; 4], delimiter: char) -> io::Result<()> {
    let mut sep = [0u8; 4];
    let sep = delimiter.encode_utf8(&mut sep);
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.write_all(sep.as_bytes())?;
        }
        out.write_all(escape_field(field, delimiter).as_bytes())?;
    }
    out.write_all(b"\n")
}

/// Write the header and `rows` as delimited text.
pub fn write_table<W: Write>(rows: &[ExportRow], delimiter: char, mut out: W) -> Result<(), RegistryError> {
    check_delimiter(delimiter)?;
    let wrap = |e: io::Error| RegistryError::Io {
        context: "writing export table".to_string(),
        source: e,
    };
    write_line(&mut out, EXPORT_HEADER, delimiter).map_err(wrap)?;
    for row in rows {
        write_line(
            &mut out,
            [row.key.as_str(), &row.name, &row.email, &row.telephone],
            delimiter,
        )
        .map_err(wrap)?;
    }
    out.flush().map_err(wrap)
}

/// Export the whole registry to `path`. Nothing is written when the registry
/// is empty. Returns the number of rows exported.
pub fn export_to_file(registry: &Registry, path: &Path, delimiter: char) -> Result<usize, RegistryError> {
    check_delimiter(delimiter)?;
    let rows = registry.export_table()?;
    let mut buf = Vec::new();
    write_table(&rows, delimiter, &mut buf)?;
    write_atomic(path, &buf)?;
    tracing::info!(path = %path.display(), rows = rows.len(), "registry exported");
    Ok(rows.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use rosto_core::Metadata;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Registry {
        Registry::new(dir.path().join("registry.json"), dir.path().join("images"))
    }

    #[test]
    fn test_export_table_empty_registry() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(registry(&dir).export_table(), Err(RegistryError::EmptyRegistry)));
    }

    #[test]
    fn test_export_to_file_empty_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("export.csv");
        let result = export_to_file(&registry(&dir), &out, DEFAULT_DELIMITER);
        assert!(matches!(result, Err(RegistryError::EmptyRegistry)));
        assert!(!out.exists());
    }

    #[test]
    fn test_row_sentinels() {
        let mut record = rosto_core::IdentityRecord::new("usuario_0".into(), "a.png".into(), None);
        let row = ExportRow::from(&record);
        assert_eq!((row.name.as_str(), row.email.as_str(), row.telephone.as_str()), ("N/A", "N/A", "N/A"));

        record.metadata = Some(Metadata::new("Ana", "", " "));
        let row = ExportRow::from(&record);
        assert_eq!(row.name, "Ana");
        assert_eq!(row.email, MISSING_FIELD);
        assert_eq!(row.telephone, MISSING_FIELD);
    }

    #[test]
    fn test_write_table_quoting() {
        let rows = vec![ExportRow {
            key: "usuario_0".into(),
            name: "Souza, Ana \"Nina\"".into(),
            email: "ana@example.com".into(),
            telephone: "555".into(),
        }];
        let mut buf = Vec::new();
        write_table(&rows, ',', &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(
            text,
            "Identifier,Name,Email,Telephone\nusuario_0,\"Souza, Ana \"\"Nina\"\"\",ana@example.com,555\n"
        );
    }

    #[test]
    fn test_write_table_custom_delimiter() {
        let rows = vec![ExportRow {
            key: "usuario_1".into(),
            name: "Ana, Souza".into(),
            email: "a@b.co".into(),
            telephone: "1".into(),
        }];
        let mut buf = Vec::new();
        write_table(&rows, ';', &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "Identifier;Name;Email;Telephone\nusuario_1;Ana, Souza;a@b.co;1\n"
        );
    }

    #[test]
    fn test_invalid_delimiter() {
        let result = write_table(&[], '"', Vec::new());
        assert!(matches!(result, Err(RegistryError::InvalidDelimiter('"'))));
    }

    #[test]
    fn test_export_to_file_rows_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        let crop = RgbImage::new(2, 2);
        reg.upsert(&"usuario_1".into(), &crop, None, Some(Metadata::new("Bruno", "b@x.io", "2")))
            .unwrap();
        reg.upsert(&"usuario_0".into(), &crop, None, None).unwrap();

        let out = dir.path().join("out").join("export.csv");
        assert_eq!(export_to_file(&reg, &out, DEFAULT_DELIMITER).unwrap(), 2);

        let text = std::fs::read_to_string(&out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                "Identifier,Name,Email,Telephone",
                "usuario_1,Bruno,b@x.io,2",
                "usuario_0,N/A,N/A,N/A",
            ]
        );
    }
}
