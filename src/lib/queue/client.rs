use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use super::types::{
    ArtifactBody, ArtifactRequest, ArtifactResponse, Claim, ClaimWorkRequest, ClaimWorkResponse,
    ExceptionReason, ExceptionRequest, TaskDefinition,
};
use crate::lib::config::{QueueConfig, WorkerIdentity};
use crate::lib::error::QueueError;

/// The remote work queue.
#[async_trait]
pub trait Queue: Send + Sync {
    async fn claim_work(&self, count: usize) -> Result<Vec<Claim>, QueueError>;

    async fn task(&self, task_id: &str) -> Result<TaskDefinition, QueueError>;

    async fn reclaim_task(&self, task_id: &str, run_id: u32) -> Result<Claim, QueueError>;

    async fn report_completed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError>;

    async fn report_failed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError>;

    async fn report_exception(
        &self,
        task_id: &str,
        run_id: u32,
        reason: ExceptionReason,
    ) -> Result<(), QueueError>;

    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: u32,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<ArtifactResponse, QueueError>;

    /// Public URL of an artifact.
    fn build_artifact_url(&self, task_id: &str, run_id: u32, name: &str) -> String;

    /// Upload a body to a put URL handed out by `create_artifact`.
    async fn put_artifact(
        &self,
        put_url: &str,
        body: ArtifactBody,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), QueueError>;
}

pub struct HttpQueue {
    client: reqwest::Client,
    root_url: String,
    access_token: Option<String>,
    identity: WorkerIdentity,
}

impl HttpQueue {
    pub fn new(config: &QueueConfig, identity: WorkerIdentity) -> Self {
        Self {
            client: reqwest::Client::new(),
            root_url: config.root_url.trim_end_matches('/').to_string(),
            access_token: config.access_token.clone(),
            identity,
        }
    }

    fn run_url(&self, task_id: &str, run_id: u32, action: &str) -> String {
        format!("{}/task/{}/runs/{}/{}", self.root_url, task_id, run_id, action)
    }

    async fn post<B, T>(&self, url: &str, body: &B) -> Result<T, QueueError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let mut req = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        Self::decode(url, resp).await
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, QueueError> {
        let mut req = self.client.get(url);
        if let Some(token) = &self.access_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await?;
        Self::decode(url, resp).await
    }

    async fn decode<T: DeserializeOwned>(
        url: &str,
        resp: reqwest::Response,
    ) -> Result<T, QueueError> {
        let status = resp.status();
        if status.is_success() {
            let body = resp.text().await?;
            // Report endpoints answer with an empty body.
            let body = if body.trim().is_empty() { "null" } else { body.as_str() };
            serde_json::from_str(body).map_err(|e| {
                QueueError::InvalidResponse(format!("{url}: {e}"))
            })
        } else {
            let message = resp.text().await.unwrap_or_default();
            Err(QueueError::Status {
                endpoint: url.to_string(),
                status: status.as_u16(),
                message,
            })
        }
    }
}

#[async_trait]
impl Queue for HttpQueue {
    async fn claim_work(&self, count: usize) -> Result<Vec<Claim>, QueueError> {
        let url = format!(
            "{}/claim-work/{}/{}",
            self.root_url, self.identity.provisioner_id, self.identity.worker_type
        );
        let request = ClaimWorkRequest {
            tasks: count,
            worker_group: self.identity.worker_group.clone(),
            worker_id: self.identity.worker_id.clone(),
        };
        let resp: ClaimWorkResponse = self.post(&url, &request).await?;
        tracing::debug!(requested = count, claimed = resp.tasks.len(), "claimed work");
        Ok(resp.tasks)
    }

    async fn task(&self, task_id: &str) -> Result<TaskDefinition, QueueError> {
        self.get(&format!("{}/task/{}", self.root_url, task_id)).await
    }

    async fn reclaim_task(&self, task_id: &str, run_id: u32) -> Result<Claim, QueueError> {
        self.post(&self.run_url(task_id, run_id, "reclaim"), &serde_json::json!({}))
            .await
    }

    async fn report_completed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError> {
        let _: serde_json::Value = self
            .post(&self.run_url(task_id, run_id, "completed"), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn report_failed(&self, task_id: &str, run_id: u32) -> Result<(), QueueError> {
        let _: serde_json::Value = self
            .post(&self.run_url(task_id, run_id, "failed"), &serde_json::json!({}))
            .await?;
        Ok(())
    }

    async fn report_exception(
        &self,
        task_id: &str,
        run_id: u32,
        reason: ExceptionReason,
    ) -> Result<(), QueueError> {
        let _: serde_json::Value = self
            .post(
                &self.run_url(task_id, run_id, "exception"),
                &ExceptionRequest { reason },
            )
            .await?;
        Ok(())
    }

    async fn create_artifact(
        &self,
        task_id: &str,
        run_id: u32,
        name: &str,
        request: &ArtifactRequest,
    ) -> Result<ArtifactResponse, QueueError> {
        let url = self.run_url(task_id, run_id, &format!("artifacts/{name}"));
        self.post(&url, request).await
    }

    fn build_artifact_url(&self, task_id: &str, run_id: u32, name: &str) -> String {
        self.run_url(task_id, run_id, &format!("artifacts/{name}"))
    }

    async fn put_artifact(
        &self,
        put_url: &str,
        body: ArtifactBody,
        content_type: &str,
        content_encoding: Option<&str>,
    ) -> Result<(), QueueError> {
        let mut req = self
            .client
            .put(put_url)
            .header("Content-Type", content_type);
        if let Some(encoding) = content_encoding {
            req = req.header("Content-Encoding", encoding);
        }
        let body = match body {
            ArtifactBody::Bytes(bytes) => reqwest::Body::from(bytes),
            ArtifactBody::File(path) => {
                let file = tokio::fs::File::open(&path).await?;
                let len = file.metadata().await?.len();
                req = req.header("Content-Length", len);
                reqwest::Body::from(file)
            }
        };
        let resp = req.body(body).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(QueueError::Status {
                endpoint: put_url.to_string(),
                status: resp.status().as_u16(),
                message: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> HttpQueue {
        let config = QueueConfig {
            root_url: "http://queue.test/v1/".to_string(),
            ..Default::default()
        };
        HttpQueue::new(&config, WorkerIdentity::default())
    }

    #[test]
    fn urls_are_built_from_trimmed_root() {
        let queue = queue();
        assert_eq!(
            queue.run_url("abc", 2, "reclaim"),
            "http://queue.test/v1/task/abc/runs/2/reclaim"
        );
        assert_eq!(
            queue.build_artifact_url("abc", 0, "public/logs/live_backing.log"),
            "http://queue.test/v1/task/abc/runs/0/artifacts/public/logs/live_backing.log"
        );
    }
}
