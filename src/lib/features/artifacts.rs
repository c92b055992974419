use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::Feature;
use crate::lib::error::FeatureError;
use crate::lib::queue::types::{ArtifactBody, ArtifactRequest};
use crate::lib::tasks::docker::ArchiveStream;
use crate::lib::tasks::execution::TaskExecution;
use crate::lib::tasks::log::fmt_log;
use crate::lib::tasks::types::{ArtifactKind, ArtifactSpec};

/// Copies the paths listed in `payload.artifacts` out of the stopped
/// container and uploads them to the queue.
pub struct Artifacts;

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Other(&'static str),
}

impl EntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "directory",
            EntryKind::Other(kind) => kind,
        }
    }

    fn matches(&self, expected: ArtifactKind) -> bool {
        matches!(
            (self, expected),
            (EntryKind::File, ArtifactKind::File) | (EntryKind::Directory, ArtifactKind::Directory)
        )
    }
}

/// One tar entry. Regular files are spooled to `file`.
#[derive(Debug)]
struct ArchiveEntry {
    kind: EntryKind,
    path: String,
    file: Option<PathBuf>,
}

/// Write the download to `dest` chunk by chunk.
async fn spool(mut stream: ArchiveStream, dest: &Path) -> Result<(), FeatureError> {
    let mut file = tokio::fs::File::create(dest).await?;
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Split a spooled tar into one file per regular entry under `dir`.
fn unpack_archive(archive: &Path, dir: &Path) -> std::io::Result<Vec<ArchiveEntry>> {
    let mut archive = tar::Archive::new(std::fs::File::open(archive)?);
    let mut entries = Vec::new();
    for (index, entry) in archive.entries()?.enumerate() {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let kind = if entry_type.is_file() {
            EntryKind::File
        } else if entry_type.is_dir() {
            EntryKind::Directory
        } else if entry_type.is_symlink() {
            EntryKind::Other("symlink")
        } else {
            EntryKind::Other("other")
        };
        let path = entry.path()?.to_string_lossy().into_owned();
        let file = if kind == EntryKind::File {
            let dest = dir.join(format!("entry-{index}"));
            let mut out = std::fs::File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)?;
            Some(dest)
        } else {
            None
        };
        entries.push(ArchiveEntry { kind, path, file });
    }
    Ok(entries)
}

/// Download `path` from the container into a scratch directory and unpack it.
async fn fetch_entries(
    stream: ArchiveStream,
    scratch: &Path,
) -> Result<Vec<ArchiveEntry>, FeatureError> {
    let archive = scratch.join("archive.tar");
    spool(stream, &archive).await?;

    let dir = scratch.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || {
        let entries = unpack_archive(&archive, &dir);
        let _ = std::fs::remove_file(&archive);
        entries
    })
    .await
    .map_err(|e| FeatureError::Failed {
        feature: "artifacts",
        reason: format!("archive unpacking panicked: {e}"),
    })??;
    Ok(entries)
}

/// Artifact name for a tar entry: the archive root maps to `name` itself.
fn entry_name(name: &str, entry_path: &str) -> String {
    let rest: Vec<&str> = entry_path
        .trim_end_matches('/')
        .split('/')
        .skip(1)
        .filter(|part| !part.is_empty())
        .collect();
    if rest.is_empty() {
        name.to_string()
    } else {
        format!("{name}/{}", rest.join("/"))
    }
}

pub fn content_type(path: &str) -> &'static str {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("txt" | "log") => "text/plain",
        Some("html" | "htm") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("xml") => "application/xml",
        Some("gz" | "tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("zip") => "application/zip",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

impl Artifacts {
    async fn upload_artifact(
        &self,
        task: &TaskExecution,
        container_id: &str,
        name: &str,
        artifact: &ArtifactSpec,
    ) -> Result<(), FeatureError> {
        let queue = &task.runtime().queue;
        let expires = artifact
            .expires
            .unwrap_or_else(|| default_expiry(task.runtime().config.logging.bulk_log_expires_ms));

        let scratch = tempfile::Builder::new().prefix("artifact-").tempdir()?;
        let download = match task
            .runtime()
            .docker
            .download_from_container(container_id, &artifact.path)
            .await
        {
            Ok(stream) => fetch_entries(stream, scratch.path()).await,
            Err(e) => Err(FeatureError::Docker(e)),
        };
        let entries = match download {
            Ok(entries) => entries,
            Err(FeatureError::Docker(e)) => {
                tracing::debug!(task_id = task.task_id(), name, error = %e, "artifact download failed");
                task.log().write(fmt_log(&format!(
                    "Artifact \"{name}\" not found at path \"{}\" skipping.",
                    artifact.path
                )));
                queue
                    .create_artifact(
                        task.task_id(),
                        task.run_id(),
                        name,
                        &ArtifactRequest::error(
                            expires,
                            "file-missing-on-worker",
                            format!("Artifact not found in path: \"{}\"", artifact.path),
                        ),
                    )
                    .await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Docker returns entries in order, so the first one is the path itself.
        if let Some(first) = entries.first() {
            if !first.kind.matches(artifact.kind) {
                queue
                    .create_artifact(
                        task.task_id(),
                        task.run_id(),
                        name,
                        &ArtifactRequest::error(
                            expires,
                            "invalid-resource-on-worker",
                            format!(
                                "Expected artifact to be a \"{}\" was \"{}\"",
                                artifact.kind.as_str(),
                                first.kind.as_str()
                            ),
                        ),
                    )
                    .await?;
                return Ok(());
            }
        }

        for entry in entries {
            let Some(file) = entry.file else { continue };
            let artifact_name = entry_name(name, &entry.path);
            let content_type = content_type(&entry.path);
            let created = queue
                .create_artifact(
                    task.task_id(),
                    task.run_id(),
                    &artifact_name,
                    &ArtifactRequest::s3(expires, content_type),
                )
                .await?;

            if task.is_aborted() || task.is_canceled() {
                tracing::debug!(task_id = task.task_id(), "task interrupted, stopping artifact upload");
                return Ok(());
            }

            let Some(put_url) = created.put_url else {
                return Err(FeatureError::Failed {
                    feature: "artifacts",
                    reason: format!("queue returned no upload url for {artifact_name}"),
                });
            };
            if let Err(e) = queue
                .put_artifact(&put_url, ArtifactBody::File(file), content_type, None)
                .await
            {
                task.log().write(fmt_log(&format!(
                    "Artifact \"{name}\" failed to upload \"{}\" error: {e}",
                    entry.path
                )));
            }
        }
        Ok(())
    }
}

fn default_expiry(after_ms: u64) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(after_ms as i64)
}

#[async_trait]
impl Feature for Artifacts {
    fn name(&self) -> &'static str {
        "artifacts"
    }

    async fn stopped(&self, task: &TaskExecution) -> Result<(), FeatureError> {
        // Artifacts cannot be added to a resolved run.
        if task.is_canceled() {
            return Ok(());
        }
        let (Some(payload), Some(container_id)) = (task.payload(), task.container_id()) else {
            return Ok(());
        };
        for (name, artifact) in &payload.artifacts {
            self.upload_artifact(task, &container_id, name, artifact)
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::testing::{tar_with_dir, tar_with_file};

    #[test]
    fn entry_names_drop_the_archive_root() {
        assert_eq!(entry_name("public/build.log", "build.log"), "public/build.log");
        assert_eq!(entry_name("public/dist", "dist/"), "public/dist");
        assert_eq!(entry_name("public/dist", "dist/a/b.txt"), "public/dist/a/b.txt");
    }

    fn chunked(tar: Vec<u8>) -> ArchiveStream {
        let chunks: Vec<Result<Vec<u8>, crate::lib::error::DockerError>> =
            tar.chunks(512).map(|c| Ok(c.to_vec())).collect();
        futures_util::stream::iter(chunks).boxed()
    }

    #[tokio::test]
    async fn archive_entries_keep_order_and_spool_file_data() {
        let scratch = tempfile::tempdir().unwrap();
        let tar = tar_with_dir("dist", &[("a.txt", b"alpha"), ("b.json", b"{}")]);
        let entries = fetch_entries(chunked(tar), scratch.path()).await.unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert!(entries[0].file.is_none());
        assert_eq!(entries[1].path, "dist/a.txt");
        assert_eq!(std::fs::read(entries[1].file.as_ref().unwrap()).unwrap(), b"alpha");
        // The spooled tar is gone once unpacked.
        assert!(!scratch.path().join("archive.tar").exists());

        let single = fetch_entries(chunked(tar_with_file("out.log", b"x")), scratch.path())
            .await
            .unwrap();
        assert_eq!(single[0].kind, EntryKind::File);
    }

    #[tokio::test]
    async fn broken_download_is_a_docker_error() {
        let scratch = tempfile::tempdir().unwrap();
        let stream = futures_util::stream::iter(vec![
            Ok(vec![0u8; 512]),
            Err(crate::lib::error::DockerError::ClientError("connection reset".to_string())),
        ])
        .boxed();
        assert!(matches!(
            fetch_entries(stream, scratch.path()).await,
            Err(FeatureError::Docker(_))
        ));
    }

    #[test]
    fn content_types_are_guessed_from_extension() {
        assert_eq!(content_type("a/b/report.JSON"), "application/json");
        assert_eq!(content_type("build.log"), "text/plain");
        assert_eq!(content_type("binary"), "application/octet-stream");
    }
}
