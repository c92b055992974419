use std::io::Write;

use async_trait::async_trait;
use chrono::Utc;
use flate2::{Compression, write::GzEncoder};

use super::Feature;
use crate::lib::error::FeatureError;
use crate::lib::queue::types::{ArtifactBody, ArtifactRequest};
use crate::lib::tasks::execution::TaskExecution;

pub const BULK_LOG_ARTIFACT: &str = "public/logs/live_backing.log";

/// Uploads the whole task log, gzipped, once the run is over.
pub struct BulkLog;

fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

#[async_trait]
impl Feature for BulkLog {
    fn name(&self) -> &'static str {
        "bulkLog"
    }

    async fn killed(&self, task: &TaskExecution) -> Result<(), FeatureError> {
        let queue = &task.runtime().queue;
        let expires_ms = task.runtime().config.logging.bulk_log_expires_ms;
        let expires = Utc::now() + chrono::Duration::milliseconds(expires_ms as i64);

        let body = gzip(&task.log().contents())?;
        let created = queue
            .create_artifact(
                task.task_id(),
                task.run_id(),
                BULK_LOG_ARTIFACT,
                &ArtifactRequest::s3(expires, "text/plain"),
            )
            .await?;
        let put_url = created.put_url.ok_or_else(|| FeatureError::Failed {
            feature: "bulkLog",
            reason: "queue returned no upload url for the task log".to_string(),
        })?;

        let size = body.len();
        queue
            .put_artifact(&put_url, ArtifactBody::Bytes(body), "text/plain", Some("gzip"))
            .await?;

        tracing::info!(
            task_id = task.task_id(),
            run_id = task.run_id(),
            size,
            url = %queue.build_artifact_url(task.task_id(), task.run_id(), BULK_LOG_ARTIFACT),
            "uploaded bulk log"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn gzip_round_trips_log_bytes() {
        let compressed = gzip(b"[dockworker] hello\r\n").unwrap();
        let mut out = String::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_string(&mut out)
            .unwrap();
        assert_eq!(out, "[dockworker] hello\r\n");
    }
}
