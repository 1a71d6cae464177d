use std::path::PathBuf;

use async_trait::async_trait;
use ticker_core::{Checkpoint, CheckpointId, Error, Result};
use tokio::fs;

use crate::CheckpointStore;

const PREFIX: &str = "chk-";
const SUFFIX: &str = ".json";

/// Checkpoints as JSON files under one directory, `chk-<id>.json`.
///
/// Each save writes a temp file and renames it into place, so a crash never
/// leaves a half-written checkpoint behind under the final name.
pub struct FileCheckpointStore {
    dir: PathBuf,
    retained: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retained: usize) -> Self {
        Self {
            dir: dir.into(),
            retained: retained.max(1),
        }
    }

    fn path_for(&self, id: CheckpointId) -> PathBuf {
        self.dir.join(format!("{PREFIX}{id:020}{SUFFIX}"))
    }

    fn parse_id(name: &str) -> Option<CheckpointId> {
        name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
    }

    async fn ids(&self) -> Result<Vec<CheckpointId>> {
        let mut out = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = entry.file_name().to_str().and_then(Self::parse_id) {
                out.push(id);
            }
        }
        out.sort_unstable();
        Ok(out)
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        let path = self.path_for(checkpoint.id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;

        let ids = self.ids().await?;
        if ids.len() > self.retained {
            for id in &ids[..ids.len() - self.retained] {
                if let Err(e) = fs::remove_file(self.path_for(*id)).await {
                    tracing::warn!(checkpoint = id, error = %e, "failed to prune old checkpoint");
                }
            }
        }
        Ok(())
    }

    async fn latest(&self) -> Result<Option<Checkpoint>> {
        let Some(id) = self.ids().await?.last().copied() else {
            return Ok(None);
        };
        let bytes = fs::read(self.path_for(id)).await?;
        let cp: Checkpoint = serde_json::from_slice(&bytes).map_err(|e| {
            Error::StateCorruption(format!("checkpoint file {id} is unreadable: {e}"))
        })?;
        if cp.id != id {
            return Err(Error::StateCorruption(format!(
                "checkpoint file {id} contains checkpoint {}",
                cp.id
            )));
        }
        Ok(Some(cp))
    }

    async fn list(&self) -> Result<Vec<CheckpointId>> {
        self.ids().await
    }
}
