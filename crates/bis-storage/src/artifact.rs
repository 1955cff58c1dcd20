use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Swap the new bytes in even if the target exists.
    Replace,
    /// Leave an existing target alone.
    KeepExisting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    KeptExisting,
}

/// Writes through a sibling temp file and a rename; readers see the old file or
/// the new one, never a prefix.
pub async fn write_atomic(path: &Path, bytes: &[u8], mode: WriteMode) -> Result<WriteOutcome> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    if mode == WriteMode::KeepExisting && fs::try_exists(path).await.unwrap_or(false) {
        return Ok(WriteOutcome::KeptExisting);
    }

    let temp = dir.join(format!(".bis-{}.partial", Uuid::new_v4().simple()));
    if let Err(err) = write_synced(&temp, bytes).await {
        discard_temp(&temp).await;
        return Err(err);
    }

    // another writer may have landed the same content-addressed file meanwhile
    if mode == WriteMode::KeepExisting && fs::try_exists(path).await.unwrap_or(false) {
        discard_temp(&temp).await;
        return Ok(WriteOutcome::KeptExisting);
    }

    if let Err(err) = fs::rename(&temp, path).await {
        discard_temp(&temp).await;
        return Err(err).with_context(|| format!("moving {} into place", path.display()));
    }
    Ok(WriteOutcome::Written)
}

async fn discard_temp(temp: &Path) {
    if let Err(err) = fs::remove_file(temp).await {
        warn!(path = %temp.display(), error = %err, "could not remove temp file");
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("creating {}", path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub sha256: String,
    /// Relative to the store root.
    pub relative_path: PathBuf,
    pub path: PathBuf,
    pub size: usize,
    /// An identical page from the same fetch was already on disk.
    pub reused: bool,
}

/// Raw upstream pages, laid out as `<source_id>/<fetch stamp>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
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

    pub fn relative_path_for(
        source_id: &str,
        fetched_at: DateTime<Utc>,
        sha256: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        Path::new(source_id)
            .join(fetched_at.format("%Y%m%dT%H%M%SZ").to_string())
            .join(format!("{sha256}.{ext}"))
    }

    pub async fn store_page(
        &self,
        source_id: &str,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let sha256 = sha256_hex(bytes);
        let relative_path = Self::relative_path_for(source_id, fetched_at, &sha256, extension);
        let path = self.root.join(&relative_path);
        let outcome = write_atomic(&path, bytes, WriteMode::KeepExisting)
            .await
            .with_context(|| format!("storing raw page for {source_id}"))?;
        Ok(StoredArtifact {
            sha256,
            relative_path,
            path,
            size: bytes.len(),
            reused: outcome == WriteOutcome::KeptExisting,
        })
    }
}
