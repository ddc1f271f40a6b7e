use std::path::Path;

use crate::config;
use crate::error::SnapshotError;

/// Write snapshot data and metadata to disk atomically.
///
/// Data is committed before meta, so a crash between the two leaves the
/// previous consistent pair on disk.
pub async fn write_snapshot(
    dir: &Path,
    data: &[u8],
    meta: &config::SnapshotMeta,
) -> Result<(), SnapshotError> {
    atomic_write(dir, "snapshot.bin", data).await?;

    let meta_json =
        serde_json::to_vec_pretty(meta).map_err(|e| SnapshotError::Encode(e.to_string()))?;
    atomic_write(dir, "snapshot-meta.json", &meta_json).await?;

    Ok(())
}

/// Read a persisted snapshot from disk, if a complete pair exists.
pub async fn read_snapshot(
    dir: &Path,
) -> Result<Option<(Vec<u8>, config::SnapshotMeta)>, SnapshotError> {
    let data_path = dir.join("snapshot.bin");
    let meta_path = dir.join("snapshot-meta.json");

    if !tokio::fs::try_exists(&data_path).await.unwrap_or(false)
        || !tokio::fs::try_exists(&meta_path).await.unwrap_or(false)
    {
        return Ok(None);
    }

    let data = tokio::fs::read(&data_path).await?;
    let meta_bytes = tokio::fs::read(&meta_path).await?;
    let meta: config::SnapshotMeta =
        serde_json::from_slice(&meta_bytes).map_err(|e| SnapshotError::Decode(e.to_string()))?;

    Ok(Some((data, meta)))
}

/// Persist the current vote.
pub async fn write_vote(dir: &Path, vote: &config::Vote) -> Result<(), SnapshotError> {
    let json = serde_json::to_vec_pretty(vote).map_err(|e| SnapshotError::Encode(e.to_string()))?;
    atomic_write(dir, "vote.json", &json).await
}

/// Read the persisted vote, if one exists.
pub async fn read_vote(dir: &Path) -> Result<Option<config::Vote>, SnapshotError> {
    let path = dir.join("vote.json");
    if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }

    let bytes = tokio::fs::read(&path).await?;
    let vote: config::Vote =
        serde_json::from_slice(&bytes).map_err(|e| SnapshotError::Decode(e.to_string()))?;
    Ok(Some(vote))
}

/// tmp + fsync + rename.
async fn atomic_write(dir: &Path, filename: &str, data: &[u8]) -> Result<(), SnapshotError> {
    let tmp = dir.join(format!("{filename}.tmp"));
    let path = dir.join(filename);
    tokio::fs::write(&tmp, data).await?;
    let file = tokio::fs::File::open(&tmp).await?;
    file.sync_all().await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}
