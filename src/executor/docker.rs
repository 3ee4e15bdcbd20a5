//! Docker-backed container runtime with hardening defaults.

use bollard::container::{
    AttachContainerOptions, Config as ContainerConfig, CreateContainerOptions,
    InspectContainerOptions, KillContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;

use super::{AttachedOutput, ContainerRuntime, ContainerSpec, ContainerState, OutputChunk, RuntimeError};

/// Buffered chunks between the demux task and the engine.
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Docker implementation of [`ContainerRuntime`] via bollard.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error when the daemon socket is unreachable.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Infrastructure(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Returns true if the Docker daemon responds to a ping.
    pub async fn available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        // Skip the pull when the image is already local.
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let options = CreateImageOptions {
            from_image: image.to_owned(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| RuntimeError::ImageUnavailable(e.to_string()))?;
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let binds: Vec<String> = spec
            .binds
            .iter()
            .map(|b| {
                if b.read_only {
                    format!("{}:{}:ro", b.host, b.container)
                } else {
                    format!("{}:{}", b.host, b.container)
                }
            })
            .collect();

        let host_config = HostConfig {
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
            auto_remove: Some(spec.auto_remove),
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.argv.clone()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(|e| RuntimeError::Infrastructure(e.to_string()))?;
        Ok(created.id)
    }

    async fn attach(&self, id: &str) -> Result<AttachedOutput, RuntimeError> {
        let options = AttachContainerOptions::<String> {
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let results = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| RuntimeError::Infrastructure(e.to_string()))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let mut output = results.output;
        tokio::spawn(async move {
            while let Some(chunk) = output.next().await {
                let item = match chunk {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::Console { message }) => {
                        OutputChunk::Stdout(String::from_utf8_lossy(&message).into_owned())
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        OutputChunk::Stderr(String::from_utf8_lossy(&message).into_owned())
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::debug!(error = %e, "container output stream ended with error");
                        break;
                    }
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(AttachedOutput { rx })
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::Infrastructure(e.to_string()))
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let inspected = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| RuntimeError::Infrastructure(e.to_string()))?;
        let state = inspected.state.unwrap_or_default();
        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
        })
    }

    async fn kill(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped or already reaped by AutoRemove.
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Infrastructure(e.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Infrastructure(e.to_string())),
        }
    }
}

/// Largest core count the quota accepts; no host this runs on is bigger,
/// and the bound keeps the nano product far inside `i64`.
const MAX_CPU_CORES: f64 = 1024.0;

/// Convert a fractional core count to the daemon's nano-CPU quota unit.
///
/// The range check makes the rounded product exactly representable, so
/// the conversion to `i64` cannot truncate or wrap.
pub fn f64_to_nano_cpu(cpu_cores: f64) -> Result<i64, RuntimeError> {
    if !cpu_cores.is_finite() || cpu_cores <= 0.0 || cpu_cores > MAX_CPU_CORES {
        return Err(RuntimeError::Infrastructure(format!(
            "cpu_cores must be in (0, {MAX_CPU_CORES}], got {cpu_cores}"
        )));
    }

    let nanos = (cpu_cores * 1e9).round();
    #[allow(clippy::cast_possible_truncation)]
    let nanos = nanos as i64;
    if nanos == 0 {
        // Below half a nano CPU; the daemon would reject a zero quota.
        return Err(RuntimeError::Infrastructure(format!(
            "cpu_cores {cpu_cores} rounds to a zero quota"
        )));
    }
    Ok(nanos)
}
