//! Content-addressable storage for stage outputs.
//!
//! An artifact's files are copied under `<root>/<sha256>/` with an
//! `artifact.json` manifest. Writes go to a temporary directory that is
//! renamed into place, so a visible artifact is always complete. Storing the
//! same content twice returns the existing artifact.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use crate::domain::Artifact;

const MANIFEST: &str = "artifact.json";

pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Collect files matching `patterns` (relative to `workspace`) and store them
    pub async fn store_files(
        &self,
        run_id: Uuid,
        stage: &str,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Artifact> {
        let files = collect_files(workspace, patterns)?;
        if files.is_empty() {
            anyhow::bail!(
                "Artifact patterns {:?} matched no files in {}",
                patterns,
                workspace.display()
            );
        }

        let mut hasher = Sha256::new();
        let mut size_bytes = 0u64;
        for rel in &files {
            let content = fs::read(workspace.join(rel))
                .await
                .with_context(|| format!("Failed to read artifact file: {}", rel))?;
            hasher.update(rel.as_bytes());
            hasher.update([0u8]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
            size_bytes += content.len() as u64;
        }
        let hash = hex::encode(hasher.finalize());

        if let Some(existing) = self.load(&hash).await? {
            debug!(hash = %existing.short_hash(), "Artifact already stored");
            return Ok(existing);
        }

        let location = self.root.join(&hash);
        let staging = self.root.join(format!(".tmp-{}", Uuid::new_v4()));
        for rel in &files {
            let dest = staging.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::copy(workspace.join(rel), &dest)
                .await
                .with_context(|| format!("Failed to copy artifact file: {}", rel))?;
        }

        let artifact = Artifact {
            hash: hash.clone(),
            location: location.clone(),
            run_id,
            stage: stage.to_string(),
            files,
            size_bytes,
            created_at: Utc::now(),
        };
        let manifest = serde_json::to_vec_pretty(&artifact).context("Failed to serialize artifact manifest")?;
        fs::write(staging.join(MANIFEST), manifest)
            .await
            .context("Failed to write artifact manifest")?;

        if let Err(e) = fs::rename(&staging, &location).await {
            // Lost a race with an identical artifact
            let _ = fs::remove_dir_all(&staging).await;
            if let Some(existing) = self.load(&hash).await? {
                return Ok(existing);
            }
            return Err(e).with_context(|| format!("Failed to move artifact into {}", location.display()));
        }

        debug!(hash = %artifact.short_hash(), files = artifact.files.len(), "Stored artifact");
        Ok(artifact)
    }

    /// Load an artifact's manifest by hash
    pub async fn load(&self, hash: &str) -> Result<Option<Artifact>> {
        let manifest = self.root.join(hash).join(MANIFEST);
        if !manifest.exists() {
            return Ok(None);
        }

        let content = fs::read(&manifest)
            .await
            .with_context(|| format!("Failed to read artifact manifest: {}", manifest.display()))?;
        let artifact = serde_json::from_slice(&content)
            .with_context(|| format!("Failed to parse artifact manifest: {}", manifest.display()))?;
        Ok(Some(artifact))
    }

    pub async fn contains(&self, hash: &str) -> bool {
        self.root.join(hash).join(MANIFEST).exists()
    }
}

/// Relative paths of regular files matching any pattern, sorted and deduplicated
fn collect_files(workspace: &Path, patterns: &[String]) -> Result<Vec<String>> {
    let mut files = Vec::new();

    for pattern in patterns {
        let full = workspace.join(pattern);
        let full = full.to_string_lossy();
        let entries = glob::glob(&full)
            .with_context(|| format!("Invalid artifact pattern: {}", pattern))?;

        for entry in entries {
            let path = entry.with_context(|| format!("Failed to read match for {}", pattern))?;
            if !path.is_file() {
                continue;
            }
            if let Ok(rel) = path.strip_prefix(workspace) {
                files.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn workspace_with(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let root = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path());
        let workspace = workspace_with(&[("dist/app.js", "console.log(1)"), ("dist/index.html", "<html>")]);

        let first_run = Uuid::new_v4();
        let artifact = store
            .store_files(first_run, "build", workspace.path(), &["dist/**/*".to_string()])
            .await
            .unwrap();

        assert_eq!(artifact.files, vec!["dist/app.js", "dist/index.html"]);
        assert_eq!(artifact.hash.len(), 64);
        assert!(artifact.location.join("dist/app.js").exists());
        assert!(store.contains(&artifact.hash).await);

        // Same content from another run maps to the same artifact
        let again = store
            .store_files(Uuid::new_v4(), "build", workspace.path(), &["dist/**/*".to_string()])
            .await
            .unwrap();
        assert_eq!(again.hash, artifact.hash);
        assert_eq!(again.run_id, first_run);
    }

    #[tokio::test]
    async fn test_different_content_different_hash() {
        let root = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path());
        let a = workspace_with(&[("out.bin", "a")]);
        let b = workspace_with(&[("out.bin", "b")]);

        let pattern = vec!["out.bin".to_string()];
        let first = store.store_files(Uuid::new_v4(), "build", a.path(), &pattern).await.unwrap();
        let second = store.store_files(Uuid::new_v4(), "build", b.path(), &pattern).await.unwrap();

        assert_ne!(first.hash, second.hash);
    }

    #[tokio::test]
    async fn test_no_matches_is_an_error() {
        let root = TempDir::new().unwrap();
        let store = ArtifactStore::new(root.path());
        let workspace = workspace_with(&[("README.md", "hi")]);

        let result = store
            .store_files(Uuid::new_v4(), "build", workspace.path(), &["dist/*".to_string()])
            .await;
        assert!(result.is_err());
    }
}
