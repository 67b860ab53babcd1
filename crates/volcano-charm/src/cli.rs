//! The `volcano-charm` command line.
//!
//! Besides driving the charms, the binary can render and reconcile the manifests of a workload
//! outside of Juju:
//!
//! ```text
//! volcano-charm render --name volcano --namespace volcano templates/scheduler.yaml
//! volcano-charm manifests scheduler --app volcano-scheduler --namespace volcano
//! volcano-charm delete admission --app volcano-admission --namespace volcano --ignore-not-found
//! ```
use std::{
    io::Write as _,
    path::{Path, PathBuf},
};

use clap::{Args, Parser, Subcommand};
use snafu::{ResultExt, Snafu};
use volcano_shared::yaml::{self, SerializeOptions};

use crate::{
    certs::{CertificatesRelation, ServerCertRequest},
    client::{ApiError, KubeClient},
    manifests::{self, ManifestSet, Protocol},
    reconciler::{self, ResourceReconciler},
    status::UnitStatus,
    templating::{self, Release, TemplateRenderer},
    unit::{OpenPortError, Unit, UnitIdentity},
    workload::WorkloadKind,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read values file {path:?}"))]
    ReadValues {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse values file {path:?}"))]
    ParseValues {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to render template"))]
    Render { source: templating::Error },

    #[snafu(display("failed to build the manifests of the {workload} charm"))]
    BuildManifests {
        source: manifests::Error,
        workload: WorkloadKind,
    },

    #[snafu(display("failed to serialize manifests"))]
    SerializeManifests { source: yaml::Error },

    #[snafu(display("failed to write to stdout"))]
    WriteOutput { source: std::io::Error },

    #[snafu(display("failed to connect to the Kubernetes API"))]
    ConnectCluster { source: ApiError },

    #[snafu(display("failed to reconcile the manifests of the {workload} charm"))]
    Reconcile {
        source: reconciler::Error,
        workload: WorkloadKind,
    },
}

#[derive(Debug, Parser)]
#[command(author, version, about = "Juju charms operating the Volcano batch scheduler")]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Render templates the way the charms do and print them as a YAML stream.
    Render(RenderArguments),

    /// Print the manifests a charm applies.
    Manifests(ManifestArguments),

    /// Apply the manifests of a charm to the cluster of the current kubeconfig.
    Apply(ManifestArguments),

    /// Delete the manifests of a charm from the cluster of the current kubeconfig.
    Delete {
        #[command(flatten)]
        manifests: ManifestArguments,

        /// Skip resources which are already gone.
        #[arg(long)]
        ignore_not_found: bool,

        /// Skip resources the charm is not allowed to delete.
        #[arg(long)]
        ignore_unauthorized: bool,
    },
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct RenderArguments {
    /// Name of the release.
    #[arg(long)]
    pub name: String,

    /// Namespace of the release.
    #[arg(long)]
    pub namespace: String,

    /// YAML file with the `Values` of the templates.
    #[arg(long, value_name = "FILE")]
    pub values: Option<PathBuf>,

    /// Directory `Files.glob` resolves against.
    #[arg(long, default_value = ".")]
    pub basedir: PathBuf,

    #[arg(required = true)]
    pub templates: Vec<PathBuf>,
}

#[derive(Debug, PartialEq, Eq, Args)]
pub struct ManifestArguments {
    #[arg(value_enum)]
    pub workload: WorkloadKind,

    /// Name of the charm application.
    #[arg(long)]
    pub app: String,

    /// Namespace of the Juju model.
    #[arg(long)]
    pub namespace: String,

    /// Directory holding the charm templates.
    #[arg(long, env = "VOLCANO_CHARM_TEMPLATES", default_value = "templates")]
    pub templates: PathBuf,
}

impl ManifestArguments {
    fn identity(&self) -> UnitIdentity {
        UnitIdentity::new(&self.app, &self.namespace, format!("{}/0", self.app))
    }

    fn manifest_set(&self) -> Result<ManifestSet> {
        let workload = self.workload;
        self.workload
            .workload()
            .manifests(&self.identity(), &self.templates)
            .and_then(|source| source.render())
            .context(BuildManifestsSnafu { workload })
    }
}

impl Command {
    pub async fn run(self) -> Result<()> {
        match self {
            Self::Render(args) => render(&args),
            Self::Manifests(args) => print_manifests(&args),
            Self::Apply(args) => apply(&args).await,
            Self::Delete {
                manifests,
                ignore_not_found,
                ignore_unauthorized,
            } => delete(&manifests, ignore_not_found, ignore_unauthorized).await,
        }
    }
}

fn render(args: &RenderArguments) -> Result<()> {
    let values = match &args.values {
        Some(path) => read_values(path)?,
        None => serde_json::Value::Null,
    };
    let release = Release::named(&args.name, &args.namespace);
    let renderer = TemplateRenderer::new(&args.basedir);

    let mut stdout = std::io::stdout().lock();
    for template in &args.templates {
        let rendered = renderer
            .render_file(template, &values, &release)
            .context(RenderSnafu)?;
        writeln!(stdout, "{rendered}\n---").context(WriteOutputSnafu)?;
    }

    Ok(())
}

fn read_values(path: &Path) -> Result<serde_json::Value> {
    let input = std::fs::read_to_string(path).context(ReadValuesSnafu { path })?;
    serde_yaml::from_str(&input).context(ParseValuesSnafu { path })
}

fn print_manifests(args: &ManifestArguments) -> Result<()> {
    let set = args.manifest_set()?;

    let mut stdout = std::io::stdout().lock();
    for resource in &set.resources {
        yaml::serialize(&resource.body, &mut stdout, SerializeOptions::manifest())
            .context(SerializeManifestsSnafu)?;
    }

    Ok(())
}

async fn apply(args: &ManifestArguments) -> Result<()> {
    let workload = args.workload;
    let identity = args.identity();
    let source = workload
        .workload()
        .manifests(&identity, &args.templates)
        .context(BuildManifestsSnafu { workload })?;
    let set = source.render().context(BuildManifestsSnafu { workload })?;

    let cluster = KubeClient::try_default(&args.app)
        .await
        .context(ConnectClusterSnafu)?;
    let mut unit = DetachedUnit {
        identity: identity.clone(),
    };

    ResourceReconciler::new(&cluster, &identity)
        .apply(&set, source.service_port.as_ref(), &mut unit)
        .await
        .context(ReconcileSnafu { workload })
}

async fn delete(
    args: &ManifestArguments,
    ignore_not_found: bool,
    ignore_unauthorized: bool,
) -> Result<()> {
    let workload = args.workload;
    let identity = args.identity();
    let set = args.manifest_set()?;

    let cluster = KubeClient::try_default(&args.app)
        .await
        .context(ConnectClusterSnafu)?;

    ResourceReconciler::new(&cluster, &identity)
        .delete(&set, ignore_not_found, ignore_unauthorized)
        .await
        .context(ReconcileSnafu { workload })
}

/// A unit reconciling from outside of Juju.
///
/// It acts as leader, cannot open ports (so Services are patched directly) and has no relations.
struct DetachedUnit {
    identity: UnitIdentity,
}

impl Unit for DetachedUnit {
    fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    fn is_leader(&self) -> bool {
        true
    }

    fn set_status(&mut self, status: UnitStatus) {
        tracing::info!(status = status.name(), detail = status.message(), "unit status");
    }

    fn set_workload_version(&mut self, version: &str) {
        tracing::info!(version, "workload version");
    }

    fn open_port(&mut self, _protocol: Protocol, _port: u16) -> Result<(), OpenPortError> {
        Err(OpenPortError::NotSupported)
    }

    fn certificates_relation(&self) -> CertificatesRelation {
        CertificatesRelation::default()
    }

    fn request_server_cert(&mut self, request: &ServerCertRequest) {
        tracing::warn!(
            common_name = %request.common_name,
            "no certificates relation, dropping server certificate request"
        );
    }

    fn publish_scrape_jobs(&mut self, jobs: &[serde_json::Value]) {
        tracing::debug!(jobs = jobs.len(), "no metrics-endpoint relation, dropping scrape jobs");
    }
}
