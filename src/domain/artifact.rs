//! Artifacts produced by pipeline stages.
//!
//! Artifacts are content-addressed: the hash covers every file's relative
//! path and bytes, so the same build output always lands at the same location.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stored build output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// SHA-256 of the artifact contents (hex)
    pub hash: String,

    /// Directory holding the artifact files
    pub location: PathBuf,

    /// Run that first produced this artifact
    pub run_id: Uuid,

    /// Stage that produced this artifact
    pub stage: String,

    /// Files in the artifact, relative to `location`
    pub files: Vec<String>,

    /// Total size in bytes
    pub size_bytes: u64,

    /// When the artifact was written
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Short form of the hash for display
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}
