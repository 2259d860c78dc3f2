//! Durable snapshot file kept by backups.
//!
//! Layout:
//! ```text
//! ┌───────────┬─────────┬──────────────────────────────────────────┐
//! │ magic     │ version │ LZ4 block (size-prepended)               │
//! │ "QSNP"    │ 1 byte  │   └── bincode(Snapshot)                  │
//! └───────────┴─────────┴──────────────────────────────────────────┘
//! ```
//!
//! Writes go to a sibling temp file which is then renamed over the target,
//! so a crash mid-write leaves the previous snapshot intact.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::store::Snapshot;

const MAGIC: &[u8; 4] = b"QSNP";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = MAGIC.len() + 1;
/// Largest decoded snapshot accepted from disk.
const MAX_DECODED_LEN: usize = 256 * 1024 * 1024;
/// Upper bound of the LZ4 block format's expansion per input byte.
const LZ4_MAX_RATIO: usize = 255;

/// Snapshot persistence errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("not a snapshot file (bad header)")]
    BadHeader,
    #[error("unsupported snapshot format version {0}")]
    UnsupportedVersion(u8),
    #[error("snapshot declares {declared} decoded bytes, limit is {limit}")]
    Oversized { declared: usize, limit: usize },
}

/// Encode a snapshot into the on-disk format.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, StorageError> {
    let raw = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let compressed = lz4_flex::compress_prepend_size(&raw);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.push(FORMAT_VERSION);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Decode the on-disk format.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot, StorageError> {
    if bytes.len() < HEADER_LEN || &bytes[..MAGIC.len()] != MAGIC {
        return Err(StorageError::BadHeader);
    }
    let version = bytes[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(StorageError::UnsupportedVersion(version));
    }

    let body = &bytes[HEADER_LEN..];
    let Some(prefix) = body.get(..4) else {
        return Err(StorageError::Decompression("missing size prefix".into()));
    };
    let declared = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let limit = MAX_DECODED_LEN.min(body.len().saturating_mul(LZ4_MAX_RATIO));
    if declared > limit {
        return Err(StorageError::Oversized { declared, limit });
    }

    let raw = lz4_flex::decompress_size_prepended(body)
        .map_err(|e| StorageError::Decompression(e.to_string()))?;
    let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok(snapshot)
}

/// The single snapshot file of a node.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, source: std::io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Load the last persisted snapshot. A missing file is not an error.
    pub async fn load(&self) -> Result<Option<Snapshot>, StorageError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => decode_snapshot(&bytes).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    /// Overwrite the snapshot. Returns the number of bytes written.
    pub async fn persist(&self, snapshot: &Snapshot) -> Result<usize, StorageError> {
        let bytes = encode_snapshot(snapshot)?;
        let temp = self.temp_path();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| self.io_error(e))?;
            }
        }
        tokio::fs::write(&temp, &bytes)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        Ok(bytes.len())
    }
}
