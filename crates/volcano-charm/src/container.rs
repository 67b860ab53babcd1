//! The workload container and the Pebble service running the Volcano binary in it.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::certs::{self, CertificateBundle};

/// Name of the Pebble service and of the workload container.
pub const SERVICE_NAME: &str = "volcano";

/// Returned by [`ContainerLifecycle::version`] when the version can not be determined.
pub const UNKNOWN_VERSION: &str = "Unknown";

#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum PebbleError {
    #[snafu(display("failed to connect to Pebble: {message}"))]
    Connection { message: String },

    #[snafu(display("command {command:?} exited with code {exit_code}"))]
    Exec {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[snafu(display("Pebble request failed: {message}"))]
    Api { message: String },
}

impl PebbleError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to {action} in the workload container"))]
    Pebble {
        source: PebbleError,
        action: String,
    },

    #[snafu(display("failed to install server certificates"))]
    Certificates { source: certs::CertificateError },
}

impl Error {
    /// Whether the workload container could not be reached, which is expected to resolve itself.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Pebble { source, .. } => source.is_connection(),
            Self::Certificates { source } => source.is_connection(),
        }
    }
}

/// A Pebble layer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub summary: String,
    pub description: String,
    pub services: BTreeMap<String, LayerService>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerService {
    #[serde(rename = "override")]
    pub override_: String,
    pub summary: String,
    pub command: String,
    pub startup: String,
}

impl Layer {
    /// The layer running `command` as the `volcano` service.
    pub fn volcano(command: &str) -> Self {
        let service = LayerService {
            override_: "replace".to_owned(),
            summary: SERVICE_NAME.to_owned(),
            command: command.to_owned(),
            startup: "enabled".to_owned(),
        };

        Self {
            summary: "volcano service layer".to_owned(),
            description: "pebble config layer for volcano service".to_owned(),
            services: BTreeMap::from([(SERVICE_NAME.to_owned(), service)]),
        }
    }
}

/// A file pushed into the workload container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushFile {
    pub path: PathBuf,
    pub content: String,
    pub permissions: u32,
    pub user_id: u32,
    pub group_id: u32,
    pub make_dirs: bool,
}

impl PushFile {
    /// A file owned by `root:root`, creating missing parent directories.
    pub fn root_owned(
        path: impl Into<PathBuf>,
        content: impl Into<String>,
        permissions: u32,
    ) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            permissions,
            user_id: 0,
            group_id: 0,
            make_dirs: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The Pebble API of the workload container.
#[async_trait]
pub trait Container: Send + Sync {
    fn name(&self) -> &str;

    async fn can_connect(&self) -> bool;

    async fn add_layer(&self, label: &str, layer: &Layer, combine: bool)
    -> Result<(), PebbleError>;

    async fn push(&self, file: &PushFile) -> Result<(), PebbleError>;

    /// Files in `path` matching the glob `pattern`.
    async fn list_files(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>, PebbleError>;

    /// Runs `command` to completion. A non-zero exit code is a [`PebbleError::Exec`].
    async fn exec(&self, command: &[String]) -> Result<ExecOutput, PebbleError>;

    async fn autostart(&self) -> Result<(), PebbleError>;

    async fn restart(&self, service: &str) -> Result<(), PebbleError>;

    async fn stop(&self, service: &str) -> Result<(), PebbleError>;

    /// Names of the services out of `names` which are known to Pebble.
    async fn get_services(&self, names: &[&str]) -> Result<Vec<String>, PebbleError>;
}

/// Drives the Pebble service running a Volcano binary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerLifecycle {
    pub service: String,
    pub binary: PathBuf,
}

impl ContainerLifecycle {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            service: SERVICE_NAME.to_owned(),
            binary: binary.into(),
        }
    }

    /// Installs `layer` and `files`, prepares the server certificates if there are any and
    /// restarts the service.
    pub async fn restart(
        &self,
        container: &dyn Container,
        layer: &Layer,
        files: &[PushFile],
        tls: Option<&dyn CertificateBundle>,
    ) -> Result<(), Error> {
        let command = layer
            .services
            .get(&self.service)
            .map_or("", |service| service.command.as_str());
        tracing::info!("starting volcano binary with command {command}");

        container
            .add_layer(container.name(), layer, true)
            .await
            .context(PebbleSnafu { action: "add layer" })?;

        for file in files {
            container.push(file).await.with_context(|_| PebbleSnafu {
                action: format!("push {}", file.path.display()),
            })?;
        }

        if let Some(tls) = tls {
            if !tls.available() {
                return Err(certs::CertificateError::NotAvailable).context(CertificatesSnafu);
            }
            tls.prepare(container).await.context(CertificatesSnafu)?;
        }

        container
            .autostart()
            .await
            .context(PebbleSnafu { action: "autostart services" })?;
        container
            .restart(&self.service)
            .await
            .context(PebbleSnafu {
                action: "restart service",
            })?;

        Ok(())
    }

    /// Whether the binary exists in the container. Failing to list counts as absent.
    pub async fn executable(&self, container: &dyn Container) -> bool {
        let (Some(dir), Some(file_name)) = (self.binary.parent(), self.binary.file_name()) else {
            return false;
        };
        let pattern = format!("{}*", file_name.to_string_lossy());

        match container.list_files(dir, &pattern).await {
            Ok(files) => !files.is_empty(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to list files in {}", dir.display());
                false
            }
        }
    }

    /// Version reported by `<binary> --version`, [`UNKNOWN_VERSION`] if it can not be determined.
    pub async fn version(&self, container: &dyn Container) -> String {
        if !self.executable(container).await {
            tracing::warn!("Cannot fetch version without executable");
            return UNKNOWN_VERSION.to_owned();
        }

        let command = [self.binary.display().to_string(), "--version".to_owned()];
        let output = match container.exec(&command).await {
            Ok(output) => output,
            Err(err) => {
                tracing::error!("Failed to get version: {err}");
                return UNKNOWN_VERSION.to_owned();
            }
        };

        match parse_version(&output.stdout) {
            Some(version) => version.to_owned(),
            None => {
                tracing::error!("Failed to parse version: \n{}", output.stdout);
                UNKNOWN_VERSION.to_owned()
            }
        }
    }
}

fn parse_version(output: &str) -> Option<&str> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("Version:"))
        .map(str::trim)
}
