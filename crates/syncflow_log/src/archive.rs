//! Whole-log CBOR archives.

use serde::{Deserialize, Serialize};

use crate::edge::ProvenanceEdge;
use crate::error::{LogError, LogResult};
use crate::record::ActionRecord;

/// Current archive format version.
pub const ARCHIVE_VERSION: u16 = 1;

/// Serializable snapshot of an entire log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogArchive {
    /// Format version.
    pub version: u16,
    /// Records in arrival order.
    pub records: Vec<ActionRecord>,
    /// Edges in append order.
    pub edges: Vec<ProvenanceEdge>,
}

impl LogArchive {
    /// Creates an archive at the current version.
    #[must_use]
    pub fn new(records: Vec<ActionRecord>, edges: Vec<ProvenanceEdge>) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            records,
            edges,
        }
    }

    /// Encodes the archive as CBOR.
    ///
    /// # Errors
    ///
    /// Returns a codec error if serialization fails.
    pub fn encode(&self) -> LogResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes).map_err(|e| LogError::codec(e.to_string()))?;
        Ok(bytes)
    }

    /// Decodes an archive.
    ///
    /// # Errors
    ///
    /// Returns a codec error for malformed bytes or an unknown version.
    pub fn decode(bytes: &[u8]) -> LogResult<Self> {
        let archive: Self =
            ciborium::from_reader(bytes).map_err(|e| LogError::codec(e.to_string()))?;
        if archive.version != ARCHIVE_VERSION {
            return Err(LogError::codec(format!(
                "unsupported archive version {} (expected {})",
                archive.version, ARCHIVE_VERSION
            )));
        }
        Ok(archive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unknown_version() {
        let mut archive = LogArchive::new(Vec::new(), Vec::new());
        archive.version = 99;
        let bytes = archive.encode().unwrap();
        let err = LogArchive::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unsupported archive version 99"));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            LogArchive::decode(b"not cbor at all"),
            Err(LogError::Codec(_))
        ));
    }
}
