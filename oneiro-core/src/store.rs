//! Optional persistence for finished interpretations.
//!
//! A store only ever sees a fully assembled result; nothing is written
//! mid-run, so a cancelled or failed run leaves no partial state behind.
//! Save failures are logged by the service and never surfaced to the
//! caller.

use crate::id::{DreamId, ResultId};
use crate::result::InterpretationResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Bumped when the stored envelope changes shape.
pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported stored version {found} (this build reads {expected})")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Persistence seam for finished runs.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, result: &InterpretationResult) -> Result<(), StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredResult {
    version: u32,
    saved_at: DateTime<Utc>,
    result: InterpretationResult,
}

/// Just enough of the envelope to identify a file without reading the
/// full result into typed form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoredResultMeta {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub result_id: ResultId,
    pub dream_id: DreamId,
    pub persona: String,
    pub persona_version: u32,
}

#[derive(Debug, Deserialize)]
struct PartialStored {
    version: u32,
    saved_at: DateTime<Utc>,
    result: PartialResult,
}

#[derive(Debug, Deserialize)]
struct PartialResult {
    result_id: ResultId,
    dream_id: DreamId,
    persona: String,
    persona_version: u32,
}

/// One pretty-printed JSON file per `(dream, persona, version)` key.
///
/// The filename is deterministic, so rerunning the same dream through the
/// same persona version overwrites rather than accumulates: at most one
/// terminal result exists per key.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Where the result for this run key lives.
    pub fn result_path(&self, dream_id: DreamId, persona: &str, persona_version: u32) -> PathBuf {
        self.dir.join(format!(
            "{dream_id}-{}-v{persona_version}.json",
            sanitize(persona)
        ))
    }

    /// Load the stored result for a run key.
    pub async fn load(
        &self,
        dream_id: DreamId,
        persona: &str,
        persona_version: u32,
    ) -> Result<InterpretationResult, StoreError> {
        let path = self.result_path(dream_id, persona, persona_version);
        let content = fs::read_to_string(&path).await?;

        // Check the envelope version before committing to the full shape.
        let partial: PartialStored = serde_json::from_str(&content)?;
        if partial.version != STORE_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_VERSION,
                found: partial.version,
            });
        }

        let stored: StoredResult = serde_json::from_str(&content)?;
        Ok(stored.result)
    }

    /// Read identifying metadata from one stored file.
    pub async fn peek_meta(&self, path: &Path) -> Result<StoredResultMeta, StoreError> {
        let content = fs::read_to_string(path).await?;
        let partial: PartialStored = serde_json::from_str(&content)?;
        Ok(StoredResultMeta {
            version: partial.version,
            saved_at: partial.saved_at,
            result_id: partial.result.result_id,
            dream_id: partial.result.dream_id,
            persona: partial.result.persona,
            persona_version: partial.result.persona_version,
        })
    }

    /// Metadata for every readable stored result, newest first.
    /// Unreadable or foreign files are skipped.
    pub async fn list(&self) -> Result<Vec<StoredResultMeta>, StoreError> {
        let mut found = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(meta) = self.peek_meta(&path).await {
                    found.push(meta);
                }
            }
        }
        found.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(found)
    }
}

#[async_trait]
impl ResultStore for JsonFileStore {
    async fn save(&self, result: &InterpretationResult) -> Result<(), StoreError> {
        let stored = StoredResult {
            version: STORE_VERSION,
            saved_at: Utc::now(),
            result: result.clone(),
        };
        let json = serde_json::to_string_pretty(&stored)?;
        let path = self.result_path(result.dream_id, &result.persona, result.persona_version);

        fs::create_dir_all(&self.dir).await?;
        fs::write(&path, json).await?;
        debug!(path = %path.display(), "interpretation result saved");
        Ok(())
    }
}

/// Keep run-key filenames shell- and filesystem-safe.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
