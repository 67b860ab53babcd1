//! Server certificates of the admission webhook.
//!
//! The webhook manager serves TLS with a certificate, key and CA read from fixed paths. Two
//! strategies put them there:
//!
//! - [`SelfSigned`] generates a self-signed bundle inside the workload container with the
//!   `gen-admission-certs.sh` script shipped in the charm templates.
//! - [`RelationCertificates`] copies a bundle issued by a CA charm over the `certificates`
//!   relation.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{
    container::{Container, PebbleError, PushFile},
    unit::UnitIdentity,
};

pub const CERTIFICATES_DIR: &str = "/admission.local.config/certificates";
pub const SELF_SIGNED_SCRIPT: &str = "gen-admission-certs.sh";

#[derive(Debug, Snafu)]
pub enum CertificateError {
    #[snafu(display("server certificates are not available yet"))]
    NotAvailable,

    #[snafu(display("failed to read certificate script {path:?}"))]
    ReadScript {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to push {path:?} into the workload container"))]
    Push { source: PebbleError, path: PathBuf },

    #[snafu(display("failed to create self-signed certificates"))]
    Generate { source: PebbleError },

    #[snafu(display("the certificates relation holds no certificate for {common_name:?}"))]
    MissingCertificate { common_name: String },

    #[snafu(display("the certificates relation holds no CA certificate"))]
    MissingCa,
}

impl CertificateError {
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Push { source, .. } | Self::Generate { source } => source.is_connection(),
            _ => false,
        }
    }

    /// Whether the certificates are not issued yet, as opposed to failing to install them.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::NotAvailable | Self::MissingCertificate { .. } | Self::MissingCa
        )
    }
}

/// Where the webhook manager reads its TLS material from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificatePaths {
    pub cert: PathBuf,
    pub private_key: PathBuf,
    pub ca_cert: PathBuf,
}

impl CertificatePaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cert: dir.join("server.crt"),
            private_key: dir.join("server.key"),
            ca_cert: dir.join("ca.crt"),
        }
    }
}

impl Default for CertificatePaths {
    fn default() -> Self {
        Self::in_dir(CERTIFICATES_DIR)
    }
}

/// A source of the webhook manager's TLS material.
#[async_trait]
pub trait CertificateBundle: Send + Sync {
    fn paths(&self) -> &CertificatePaths;

    /// Whether [`CertificateBundle::prepare`] can install the bundle right now.
    fn available(&self) -> bool;

    /// Installs the bundle into the workload container.
    async fn prepare(&self, container: &dyn Container) -> Result<(), CertificateError>;
}

/// Generates a self-signed bundle inside the workload container.
#[derive(Clone, Debug)]
pub struct SelfSigned {
    paths: CertificatePaths,
    script: PathBuf,
    script_source: PathBuf,
    args: Vec<String>,
}

impl SelfSigned {
    /// The script is read from `templates_dir` and installed at the container's root.
    pub fn new(identity: &UnitIdentity, paths: CertificatePaths, templates_dir: &Path) -> Self {
        Self {
            paths,
            script: Path::new("/").join(SELF_SIGNED_SCRIPT),
            script_source: templates_dir.join(SELF_SIGNED_SCRIPT),
            args: vec![
                "--service".to_owned(),
                identity.app.clone(),
                "--namespace".to_owned(),
                identity.model.clone(),
            ],
        }
    }
}

#[async_trait]
impl CertificateBundle for SelfSigned {
    fn paths(&self) -> &CertificatePaths {
        &self.paths
    }

    fn available(&self) -> bool {
        true
    }

    async fn prepare(&self, container: &dyn Container) -> Result<(), CertificateError> {
        tracing::info!("Generating certs in sidecar.");

        let script = std::fs::read_to_string(&self.script_source).context(ReadScriptSnafu {
            path: &self.script_source,
        })?;
        container
            .push(&PushFile {
                make_dirs: false,
                ..PushFile::root_owned(&self.script, script, 0o755)
            })
            .await
            .context(PushSnafu { path: &self.script })?;

        let mut command = vec![self.script.display().to_string()];
        command.extend(self.args.iter().cloned());

        match container.exec(&command).await {
            Ok(output) => {
                tracing::info!("{}\n-----------\n{}", output.stdout, output.stderr);
                Ok(())
            }
            Err(err) => {
                if let PebbleError::Exec { stdout, stderr, .. } = &err {
                    tracing::error!("Failed to create certificates: {stdout}\n{stderr}");
                }
                Err(err).context(GenerateSnafu)
            }
        }
    }
}

/// A server certificate issued over the relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerCertificate {
    pub cert: String,
    pub key: String,
}

/// How far the `certificates` relation got.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum RelationState {
    /// The relation does not exist or was removed.
    #[default]
    Absent,

    /// The relation exists, the CA has not published what the charm needs yet.
    Waiting(String),

    Ready,
}

/// The data the CA charm published on the `certificates` relation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificatesRelation {
    pub state: RelationState,
    pub ca: Option<String>,

    /// Issued server certificates, keyed by common name.
    pub server_certs: BTreeMap<String, ServerCertificate>,
}

/// A request for a server certificate sent over the relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerCertRequest {
    pub common_name: String,
    pub sans: Vec<String>,
}

/// Copies the bundle issued over the `certificates` relation into the workload container.
#[derive(Clone, Debug)]
pub struct RelationCertificates {
    paths: CertificatePaths,
    identity: UnitIdentity,
    relation: CertificatesRelation,
}

impl RelationCertificates {
    pub fn new(
        identity: &UnitIdentity,
        paths: CertificatePaths,
        relation: CertificatesRelation,
    ) -> Self {
        Self {
            paths,
            identity: identity.clone(),
            relation,
        }
    }

    /// `<app>.<model>`, the key the issued certificate is published under.
    pub fn common_name(&self) -> String {
        format!("{}.{}", self.identity.app, self.identity.model)
    }

    /// The server certificate covering every name the webhook Service is reachable as.
    pub fn request(&self) -> ServerCertRequest {
        let app = &self.identity.app;
        let model = &self.identity.model;

        ServerCertRequest {
            common_name: self.common_name(),
            sans: vec![
                app.clone(),
                format!("{app}.{model}"),
                format!("{app}.{model}.svc"),
            ],
        }
    }
}

#[async_trait]
impl CertificateBundle for RelationCertificates {
    fn paths(&self) -> &CertificatePaths {
        &self.paths
    }

    fn available(&self) -> bool {
        self.relation
            .server_certs
            .contains_key(&self.common_name())
    }

    async fn prepare(&self, container: &dyn Container) -> Result<(), CertificateError> {
        tracing::info!("Copying certs from relation into sidecar.");

        let common_name = self.common_name();
        let server_cert = self
            .relation
            .server_certs
            .get(&common_name)
            .context(MissingCertificateSnafu { common_name })?;
        let ca = self.relation.ca.as_deref().context(MissingCaSnafu)?;

        let files = [
            (&self.paths.ca_cert, ca),
            (&self.paths.cert, server_cert.cert.as_str()),
            (&self.paths.private_key, server_cert.key.as_str()),
        ];
        for (path, content) in files {
            container
                .push(&PushFile::root_owned(path, content, 0o644))
                .await
                .context(PushSnafu { path })?;
        }

        Ok(())
    }
}
