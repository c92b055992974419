use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::lib::error::TaskError;

/// Turns `payload.encryptedEnv` entries into plain environment variables.
#[async_trait]
pub trait SecretDecryptor: Send + Sync {
    async fn decrypt_env(
        &self,
        task_id: &str,
        encrypted: &[String],
    ) -> Result<BTreeMap<String, String>, TaskError>;
}

/// Used when the worker has no private key: tasks carrying encrypted
/// variables cannot be configured.
pub struct NoPrivateKey;

#[async_trait]
impl SecretDecryptor for NoPrivateKey {
    async fn decrypt_env(
        &self,
        task_id: &str,
        encrypted: &[String],
    ) -> Result<BTreeMap<String, String>, TaskError> {
        if encrypted.is_empty() {
            return Ok(BTreeMap::new());
        }
        tracing::warn!(task_id, count = encrypted.len(), "task carries encrypted env but no key is configured");
        Err(TaskError::Decrypt(format!(
            "{} encrypted environment variable(s) present but this worker has no private key",
            encrypted.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plain_tasks_pass_through() {
        assert!(NoPrivateKey.decrypt_env("abc", &[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn encrypted_env_is_rejected() {
        let err = NoPrivateKey
            .decrypt_env("abc", &["wcBMA...".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Decrypt(_)));
    }
}
