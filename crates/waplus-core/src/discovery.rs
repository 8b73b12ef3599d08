use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::warn;

use crate::error::SourceError;
use crate::types::{Checksum, SourceFile};

/// Format tag implied by a file extension, if any.
pub fn format_for_path(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "csv" => Some("csv_long"),
        "tsv" | "tab" => Some("tsv_long"),
        "json" => Some("raster_json"),
        "hdr" => Some("raster_hdr"),
        _ => None,
    }
}

/// Hashes a local file and tags it, preferring `format` over the extension.
pub async fn describe_path(path: &Path, format: Option<&str>) -> Result<SourceFile, SourceError> {
    let uri = path.display().to_string();
    let format = match format {
        Some(tag) => tag.to_string(),
        None => format_for_path(path)
            .ok_or_else(|| SourceError::UnknownFormat { uri: uri.clone() })?
            .to_string(),
    };
    let contents = tokio::fs::read(path).await.map_err(|source| io_error(&uri, source))?;
    Ok(SourceFile::new(uri, format, Checksum::of(&contents)))
}

/// Expands glob patterns (plain paths pass through) into a sorted, de-duplicated
/// list of regular files.
pub fn expand_patterns<I, S>(patterns: I) -> Result<Vec<PathBuf>, SourceError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut paths = Vec::new();
    for pattern in patterns {
        let pattern = pattern.as_ref();
        let entries = glob::glob(pattern).map_err(|err| SourceError::Pattern {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })?;
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(err) => warn!(pattern, error = %err, "skipping unreadable path"),
            }
        }
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn io_error(uri: &str, source: std::io::Error) -> SourceError {
    if source.kind() == std::io::ErrorKind::NotFound {
        SourceError::NotFound {
            uri: uri.to_string(),
        }
    } else {
        SourceError::Io {
            uri: uri.to_string(),
            source,
        }
    }
}

/// Fetches the bytes behind a source URI for the parse stage.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, source: &SourceFile) -> Result<Bytes, SourceError>;
}

/// Reads sources whose URI is a local filesystem path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSourceReader;

#[async_trait]
impl SourceReader for FsSourceReader {
    async fn read(&self, source: &SourceFile) -> Result<Bytes, SourceError> {
        let contents = tokio::fs::read(&source.uri)
            .await
            .map_err(|err| io_error(&source.uri, err))?;
        Ok(Bytes::from(contents))
    }
}

/// URI-keyed in-memory sources.
#[derive(Debug, Default)]
pub struct MemorySourceReader {
    files: RwLock<HashMap<String, Bytes>>,
}

impl MemorySourceReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, contents: impl Into<Bytes>) {
        self.files.write().insert(uri.into(), contents.into());
    }

    /// Registers the bytes and returns the matching discovery tuple.
    pub fn add(&self, uri: &str, format: &str, contents: impl Into<Bytes>) -> SourceFile {
        let contents = contents.into();
        let checksum = Checksum::of(&contents);
        self.insert(uri, contents);
        SourceFile::new(uri, format, checksum)
    }
}

#[async_trait]
impl SourceReader for MemorySourceReader {
    async fn read(&self, source: &SourceFile) -> Result<Bytes, SourceError> {
        self.files
            .read()
            .get(&source.uri)
            .cloned()
            .ok_or_else(|| SourceError::NotFound {
                uri: source.uri.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_map_to_format_tags() {
        assert_eq!(format_for_path(Path::new("a/b/basin42_2023.CSV")), Some("csv_long"));
        assert_eq!(format_for_path(Path::new("runoff.tsv")), Some("tsv_long"));
        assert_eq!(format_for_path(Path::new("evap.hdr")), Some("raster_hdr"));
        assert_eq!(format_for_path(Path::new("notes.txt")), None);
        assert_eq!(format_for_path(Path::new("README")), None);
    }

    #[tokio::test]
    async fn memory_reader_serves_registered_bytes() {
        let reader = MemorySourceReader::new();
        let source = reader.add("mem://a.csv", "csv_long", &b"basin_id,indicator\n"[..]);
        assert_eq!(source.checksum, Checksum::of(b"basin_id,indicator\n"));
        assert_eq!(reader.read(&source).await.unwrap().as_ref(), b"basin_id,indicator\n");

        let missing = SourceFile::new("mem://gone.csv", "csv_long", Checksum::of(b""));
        assert!(matches!(reader.read(&missing).await, Err(SourceError::NotFound { .. })));
    }
}
