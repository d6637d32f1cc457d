//! Artifact sink for `file_upload` frames. Best effort: failures are logged
//! and never affect the task they belong to.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{info, warn};
use uuid::Uuid;

use crate::protocol::MAX_UPLOAD_BYTES;

/// Writes uploaded artifacts under `<root>/<task_id>/`.
#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode and store one artifact. Returns the written path.
    pub async fn store(
        &self,
        agent: &str,
        task_id: Uuid,
        filename: &str,
        content: &str,
    ) -> Option<PathBuf> {
        let Some(name) = sanitize_filename(filename) else {
            warn!(agent = %agent, task_id = %task_id, filename = %filename, "Upload rejected: bad filename");
            return None;
        };

        // Cheap bound before decoding: base64 is 4 chars per 3 bytes.
        if (content.len() as u64) / 4 * 3 > MAX_UPLOAD_BYTES + 3 {
            warn!(agent = %agent, task_id = %task_id, filename = %name, "Upload rejected: too large");
            return None;
        }
        let bytes = match STANDARD.decode(content) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(agent = %agent, task_id = %task_id, error = %e, "Upload rejected: invalid base64");
                return None;
            }
        };
        if bytes.len() as u64 > MAX_UPLOAD_BYTES {
            warn!(agent = %agent, task_id = %task_id, filename = %name, "Upload rejected: too large");
            return None;
        }

        let dir = self.root.join(task_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create upload directory");
            return None;
        }
        let path = dir.join(name);
        match tokio::fs::write(&path, &bytes).await {
            Ok(()) => {
                info!(
                    agent = %agent,
                    task_id = %task_id,
                    path = %path.display(),
                    bytes = bytes.len(),
                    "Artifact stored"
                );
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to write artifact");
                None
            }
        }
    }
}

/// Strip any directory components; refuse names that are empty or dot-only.
fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}
