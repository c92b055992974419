use async_trait::async_trait;
use bollard::{
    Docker,
    auth::DockerCredentials,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        KillContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
        WaitContainerOptions,
    },
    image::{CreateImageOptions, RemoveImageOptions},
    models::{DeviceMapping, HostConfig},
};
use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use super::log::{TaskLog, fmt_log};
use super::types::ContainerSpec;
use crate::lib::error::DockerError;

/// Output of a running container, chunk by chunk.
pub type LogStream = BoxStream<'static, Result<Vec<u8>, DockerError>>;

/// Tar bytes of a path copied out of a container.
pub type ArchiveStream = BoxStream<'static, Result<Vec<u8>, DockerError>>;

#[derive(Debug, Clone)]
pub struct RegistryAuth {
    pub server: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerStatus {
    pub name: String,
    pub running: bool,
}

/// The container engine operations the worker depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image`, writing progress into the task log.
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<RegistryAuth>,
        log: &TaskLog,
    ) -> Result<(), DockerError>;

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError>;

    async fn remove_image(&self, image: &str) -> Result<(), DockerError>;

    /// Returns the new container id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError>;

    async fn start_container(&self, id: &str) -> Result<(), DockerError>;

    /// Follow stdout and stderr until the container exits.
    async fn logs(&self, id: &str) -> Result<LogStream, DockerError>;

    /// Block until the container stops and return its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, DockerError>;

    async fn kill_container(&self, id: &str) -> Result<(), DockerError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, DockerError>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), DockerError>;

    /// Tar archive of `path` inside the container, streamed.
    async fn download_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<ArchiveStream, DockerError>;
}

#[derive(Debug, Clone)]
pub struct DockerClient {
    pub client: Docker,
}

impl DockerClient {
    pub fn new() -> Result<Self, DockerError> {
        let docker_client = Docker::connect_with_unix_defaults()?;
        Ok(DockerClient {
            client: docker_client,
        })
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let devices: Vec<DeviceMapping> = spec
            .devices
            .iter()
            .map(|d| DeviceMapping {
                path_on_host: Some(d.path_on_host.clone()),
                path_in_container: Some(d.path_in_container.clone()),
                cgroup_permissions: Some(d.cgroup_permissions.clone()),
            })
            .collect();

        let host_config = HostConfig {
            privileged: Some(spec.privileged),
            binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
            links: (!spec.links.is_empty()).then(|| spec.links.clone()),
            devices: (!devices.is_empty()).then_some(devices),
            cpuset_cpus: spec.cpuset.clone(),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            cmd: (!spec.cmd.is_empty()).then(|| spec.cmd.clone()),
            env: Some(spec.env.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn pull_image(
        &self,
        image: &str,
        auth: Option<RegistryAuth>,
        log: &TaskLog,
    ) -> Result<(), DockerError> {
        tracing::info!(image, "pulling image");
        log.write(fmt_log(&format!("Pulling docker image {image}")));

        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username),
            password: Some(a.password),
            serveraddress: Some(a.server),
            ..Default::default()
        });

        let mut stream = Box::pin(self.client.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            credentials,
        ));

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(DockerError::PullFailed {
                            image: image.to_string(),
                            reason: error,
                        });
                    }
                    if let Some(status) = info.status {
                        // Per-layer progress is noise in a task log.
                        if info.progress.is_none() {
                            log.write(fmt_log(&status));
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(image, error = %e, "image pull stream failed");
                    return Err(DockerError::PullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(image, "image pulled");
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, DockerError> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = DockerError::from(e);
                if err.is_not_found() { Ok(false) } else { Err(err) }
            }
        }
    }

    async fn remove_image(&self, image: &str) -> Result<(), DockerError> {
        self.client
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: false,
                    noprune: false,
                }),
                None,
            )
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        });
        let resp = self
            .client
            .create_container(options, Self::container_config(spec))
            .await?;
        for warning in &resp.warnings {
            tracing::warn!(container_id = %resp.id, warning = %warning, "container created with warning");
        }
        tracing::debug!(container_id = %resp.id, image = %spec.image, "container created");
        Ok(resp.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        tracing::debug!(container_id = id, "container started");
        Ok(())
    }

    async fn logs(&self, id: &str) -> Result<LogStream, DockerError> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(client.logs(
                &id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            ));
            while let Some(chunk) = stream.next().await {
                let item = chunk
                    .map(|output| output.into_bytes().to_vec())
                    .map_err(DockerError::from);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, DockerError> {
        let mut stream = Box::pin(self.client.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));
        match stream.next().await {
            Some(Ok(resp)) => Ok(resp.status_code),
            // Non-zero exits surface as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(DockerError::ClientError(format!(
                "wait stream for {id} ended without a status"
            ))),
        }
    }

    async fn kill_container(&self, id: &str) -> Result<(), DockerError> {
        self.client
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerStatus, DockerError> {
        let inspect = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(ContainerStatus {
            name: inspect
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running: inspect.state.and_then(|s| s.running).unwrap_or(false),
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        self.client
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn download_from_container(
        &self,
        id: &str,
        path: &str,
    ) -> Result<ArchiveStream, DockerError> {
        let (tx, mut rx) = mpsc::channel(8);
        let client = self.client.clone();
        let id = id.to_string();
        let path = path.to_string();

        tokio::spawn(async move {
            let mut stream = Box::pin(client.download_from_container(
                &id,
                Some(DownloadFromContainerOptions { path }),
            ));
            while let Some(chunk) = stream.next().await {
                let item = chunk.map(|bytes| bytes.to_vec()).map_err(DockerError::from);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        // A missing path fails on the first chunk; surface it from the call.
        let first = match rx.recv().await {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => return Err(e),
            None => Vec::new(),
        };
        let rest = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(stream::once(async move { Ok(first) }).chain(rest).boxed())
    }
}
