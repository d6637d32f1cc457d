//! Output artifacts: files a task leaves in its output directory are shipped
//! to the hub as `file_upload` frames.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::{AgentMessage, MAX_UPLOAD_BYTES};

/// Read regular files in `dir` into upload frames. Oversized or unreadable
/// files are skipped with a warning.
pub async fn collect_uploads(task_id: Uuid, dir: &Path) -> Vec<AgentMessage> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!(task_id = %task_id, dir = %dir.display(), error = %e, "No output directory");
            return Vec::new();
        }
    };

    let mut uploads = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let filename = entry.file_name().to_string_lossy().into_owned();
        if meta.len() > MAX_UPLOAD_BYTES {
            warn!(
                task_id = %task_id,
                filename = %filename,
                size = meta.len(),
                "Artifact too large, skipping"
            );
            continue;
        }
        match tokio::fs::read(entry.path()).await {
            Ok(bytes) => uploads.push(AgentMessage::FileUpload {
                task_id,
                filename,
                size: bytes.len() as u64,
                content: STANDARD.encode(&bytes),
            }),
            Err(e) => warn!(task_id = %task_id, filename = %filename, error = %e, "Failed to read artifact"),
        }
    }
    uploads.sort_by(|a, b| upload_name(a).cmp(upload_name(b)));
    uploads
}

fn upload_name(msg: &AgentMessage) -> &str {
    match msg {
        AgentMessage::FileUpload { filename, .. } => filename,
        _ => "",
    }
}

/// Remove a task's output directory once its artifacts were sent.
pub async fn cleanup(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        debug!(dir = %dir.display(), error = %e, "Output directory cleanup failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_files_and_skips_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("b.txt"), "bee").unwrap();
        std::fs::write(tmp.path().join("a.md"), "# a").unwrap();
        std::fs::create_dir(tmp.path().join("nested")).unwrap();

        let task_id = Uuid::new_v4();
        let uploads = collect_uploads(task_id, tmp.path()).await;
        assert_eq!(uploads.len(), 2);

        match &uploads[0] {
            AgentMessage::FileUpload {
                task_id: id,
                filename,
                size,
                content,
            } => {
                assert_eq!(*id, task_id);
                assert_eq!(filename, "a.md");
                assert_eq!(*size, 3);
                assert_eq!(STANDARD.decode(content).unwrap(), b"# a");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_dir_yields_nothing() {
        let uploads = collect_uploads(Uuid::new_v4(), Path::new("/no/such/dir")).await;
        assert!(uploads.is_empty());
    }

    #[tokio::test]
    async fn cleanup_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("out");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("x"), "x").unwrap();

        cleanup(&dir).await;
        assert!(!dir.exists());
    }
}
