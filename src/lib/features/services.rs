use std::sync::Mutex;

use async_trait::async_trait;

use super::{Feature, LinkInfo};
use crate::lib::error::FeatureError;
use crate::lib::tasks::execution::TaskExecution;
use crate::lib::tasks::types::{ContainerSpec, Link, ServiceSpec, env_to_docker};

/// Starts the containers listed in `payload.services` and links them into
/// the task container under their alias.
#[derive(Default)]
pub struct Services {
    containers: Mutex<Vec<String>>,
}

impl Services {
    async fn create_service(
        &self,
        task: &TaskExecution,
        service: &ServiceSpec,
    ) -> Result<Link, FeatureError> {
        let docker = &task.runtime().docker;

        if !docker.image_exists(&service.image).await? {
            docker.pull_image(&service.image, None, task.log()).await?;
        }

        let mut env = service.env.clone();
        env.insert("TASK_ID".to_string(), task.task_id().to_string());
        env.insert("RUN_ID".to_string(), task.run_id().to_string());

        let spec = ContainerSpec {
            image: service.image.clone(),
            cmd: service.command.clone(),
            env: env_to_docker(&env),
            tty: true,
            ..Default::default()
        };
        let id = docker.create_container(&spec).await?;
        // Tracked before start so a failed start is still cleaned up.
        self.containers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.clone());

        docker.start_container(&id).await?;
        let status = docker.inspect_container(&id).await?;
        tracing::debug!(
            task_id = task.task_id(),
            container_id = %id,
            alias = %service.alias,
            "started service container"
        );
        Ok(Link {
            name: status.name,
            alias: service.alias.clone(),
        })
    }
}

#[async_trait]
impl Feature for Services {
    fn name(&self) -> &'static str {
        "services"
    }

    async fn link(&self, task: &TaskExecution) -> Result<LinkInfo, FeatureError> {
        let services: Vec<ServiceSpec> = match task.raw_payload().get("services") {
            Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| FeatureError::Failed {
                feature: "services",
                reason: format!("invalid services definition: {e}"),
            })?,
            None => return Ok(LinkInfo::default()),
        };

        let mut info = LinkInfo::default();
        for service in &services {
            info.links.push(self.create_service(task, service).await?);
        }
        Ok(info)
    }

    async fn killed(&self, task: &TaskExecution) -> Result<(), FeatureError> {
        let containers = std::mem::take(&mut *self.containers.lock().unwrap_or_else(|e| e.into_inner()));
        for id in containers {
            task.runtime().gc.remove_container(&id, Vec::new());
        }
        Ok(())
    }
}
