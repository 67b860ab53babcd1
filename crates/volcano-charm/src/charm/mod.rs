//! The event driven state machine shared by the three charms.
//!
//! Every Juju hook is delivered as an [`Event`]. [`Charm::handle`] looks the event up in the
//! routing table of the workload, runs the handler to completion and reports whether the event was
//! handled, has to be deferred or was of no interest. The unit status is only ever set from here.
//!
//! A reconciliation pass runs these steps and halts at the first one that can not complete:
//!
//! 1. validate the configuration and build the command line (`Blocked` on invalid options)
//! 2. check the workload container is reachable (`Waiting`)
//! 3. check the image ships the workload binary (`Blocked`)
//! 4. apply the manifests, on the leader only
//! 5. push the service layer, config files and certificates and restart the service
//!    (`Waiting`, deferred when Pebble could not be reached)
//! 6. report `Maintenance` until the next `update-status` finds the container up
use std::path::PathBuf;

use snafu::{ResultExt, Snafu};
use strum::{Display, EnumDiscriminants, EnumString, IntoStaticStr};

use crate::{
    certs::{CertificateBundle, RelationCertificates, RelationState, SelfSigned},
    client::ClusterApi,
    config::CharmConfig,
    container::{self, Container, ContainerLifecycle, Layer, PebbleError, SERVICE_NAME},
    manifests::{self, ManifestSet, ManifestSource},
    prometheus,
    reconciler::{self, ResourceReconciler},
    status::UnitStatus,
    unit::{Unit, UnitIdentity},
    workload::{self, Workload, WorkloadKind},
};


type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to prepare the workload configuration"))]
    PrepareWorkload { source: workload::Error },

    #[snafu(display("failed to build the manifests"))]
    BuildManifests { source: manifests::Error },

    #[snafu(display("failed to reconcile the manifests"))]
    ReconcileManifests { source: reconciler::Error },

    #[snafu(display("failed to restart the workload"))]
    RestartWorkload { source: container::Error },

    #[snafu(display("failed to stop the workload"))]
    StopWorkload { source: PebbleError },
}

impl Error {
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// A Juju hook delivered to the charm.
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq)]
#[strum(serialize_all = "kebab-case")]
pub enum Event {
    Install,
    #[strum(serialize = "upgrade-charm")]
    Upgrade,
    #[strum(serialize = "volcano-pebble-ready")]
    WorkloadReady,
    ConfigChanged,
    UpdateStatus,
    LeaderElected,
    Stop,
    CertificatesRelationCreated,
    CertificatesRelationChanged,
    CertificatesRelationBroken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    Handled,

    /// The event has to be delivered again with the next hook.
    Deferred,

    /// The charm does not observe the event.
    Ignored,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Handler {
    Reconcile,
    UpdateStatus,
    SetVersion,
    UpdateScrapeJobs,
    Cleanup,
    ReadyTls,
}

const COMMON_ROUTES: &[(Event, Handler)] = &[
    (Event::Install, Handler::Reconcile),
    (Event::Upgrade, Handler::Reconcile),
    (Event::WorkloadReady, Handler::Reconcile),
    (Event::UpdateStatus, Handler::UpdateStatus),
    (Event::LeaderElected, Handler::SetVersion),
    (Event::Stop, Handler::Cleanup),
];

const SCHEDULER_ROUTES: &[(Event, Handler)] = &[(Event::ConfigChanged, Handler::UpdateScrapeJobs)];

const ADMISSION_ROUTES: &[(Event, Handler)] = &[
    (Event::CertificatesRelationCreated, Handler::ReadyTls),
    (Event::CertificatesRelationChanged, Handler::ReadyTls),
    (Event::CertificatesRelationBroken, Handler::ReadyTls),
];

fn route(kind: WorkloadKind, event: Event) -> Option<Handler> {
    let specific = match kind {
        WorkloadKind::Scheduler => SCHEDULER_ROUTES,
        WorkloadKind::Controller => &[],
        WorkloadKind::Admission => ADMISSION_ROUTES,
    };

    COMMON_ROUTES
        .iter()
        .chain(specific)
        .find(|(routed, _)| *routed == event)
        .map(|(_, handler)| *handler)
}

fn render_manifests(source: &ManifestSource) -> Result<ManifestSet> {
    source.render().context(BuildManifestsSnafu)
}

/// State kept between hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredState {
    /// Whether the admission webhook serves a self-signed certificate instead of one issued over
    /// the `certificates` relation.
    pub self_signed_cert: bool,

    /// Namespace the published kube-state-metrics scrape job points to, [`None`] until the
    /// scrape jobs are published for the first time.
    pub metrics_namespace: Option<String>,
}

impl Default for StoredState {
    fn default() -> Self {
        Self {
            self_signed_cert: true,
            metrics_namespace: None,
        }
    }
}

/// The collaborators of one hook invocation.
pub struct Context<'a> {
    pub unit: &'a mut dyn Unit,
    pub container: &'a dyn Container,
    pub cluster: &'a dyn ClusterApi,
    pub config: &'a CharmConfig,
}

pub struct Charm {
    workload: Box<dyn Workload>,
    lifecycle: ContainerLifecycle,
    templates_dir: PathBuf,
    pub stored: StoredState,
}

impl Charm {
    pub fn new(workload: Box<dyn Workload>, templates_dir: impl Into<PathBuf>) -> Self {
        let lifecycle = ContainerLifecycle::new(workload.binary());
        Self {
            workload,
            lifecycle,
            templates_dir: templates_dir.into(),
            stored: StoredState::default(),
        }
    }

    pub fn kind(&self) -> WorkloadKind {
        self.workload.kind()
    }

    /// Dispatches `event` to its handler.
    pub async fn handle(&mut self, event: Event, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        let Some(handler) = route(self.kind(), event) else {
            tracing::debug!(%event, "event not observed");
            return Ok(EventOutcome::Ignored);
        };
        tracing::debug!(%event, ?handler, "handling event");

        let result = match handler {
            Handler::Reconcile => self.reconcile(ctx).await,
            Handler::UpdateStatus => self.update_status(ctx).await,
            Handler::SetVersion => self.set_version(ctx).await,
            Handler::UpdateScrapeJobs => self.update_scrape_jobs(ctx),
            Handler::Cleanup => self.cleanup(ctx).await,
            Handler::ReadyTls => self.ready_tls(event, ctx).await,
        };

        if let Err(err) = &result {
            tracing::error!(
                %event,
                category = err.category(),
                error = err as &dyn std::error::Error,
                "failed to handle event"
            );
        }
        result
    }

    /// Renders the manifests of the workload.
    pub fn manifest_source(&self, identity: &UnitIdentity) -> Result<ManifestSource> {
        self.workload
            .manifests(identity, &self.templates_dir)
            .context(BuildManifestsSnafu)
    }

    fn not_ready(&self) -> UnitStatus {
        UnitStatus::waiting(format!("{} Not Ready", self.kind().title()))
    }

    async fn reconcile(&mut self, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        let identity = ctx.unit.identity().clone();
        let name = self.kind().to_string();

        let prepared = match self.workload.prepare(ctx.config, &identity) {
            Ok(prepared) => prepared,
            Err(workload::Error::InvalidConfig { source }) => {
                ctx.unit.set_status(UnitStatus::blocked(source.to_string()));
                return Ok(EventOutcome::Handled);
            }
            Err(err) => return Err(err).context(PrepareWorkloadSnafu),
        };
        let tls = self.certificate_bundle(&identity, &mut *ctx.unit);

        if !ctx.container.can_connect().await {
            ctx.unit.set_status(self.not_ready());
            return Ok(EventOutcome::Handled);
        }

        if !self.lifecycle.executable(ctx.container).await {
            ctx.unit.set_status(UnitStatus::blocked(format!(
                "Image missing executable: {}",
                self.lifecycle.binary.display()
            )));
            return Ok(EventOutcome::Handled);
        }

        if ctx.unit.is_leader() {
            let source = self.manifest_source(&identity)?;
            let set = render_manifests(&source)?;
            ResourceReconciler::new(ctx.cluster, &identity)
                .apply(&set, source.service_port.as_ref(), &mut *ctx.unit)
                .await
                .context(ReconcileManifestsSnafu)?;
        }

        let layer = Layer::volcano(&prepared.command);
        match self
            .lifecycle
            .restart(ctx.container, &layer, &prepared.files, tls.as_deref())
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_connection() => {
                ctx.unit
                    .set_status(UnitStatus::waiting(format!("Failed to connect to {name}")));
                return Ok(EventOutcome::Deferred);
            }
            Err(container::Error::Certificates { source }) if source.is_pending() => {
                tracing::warn!(
                    error = &source as &dyn std::error::Error,
                    "server certificates not ready"
                );
                ctx.unit
                    .set_status(UnitStatus::waiting("Server certificates not yet ready."));
                return Ok(EventOutcome::Handled);
            }
            Err(err) => return Err(err).context(RestartWorkloadSnafu),
        }

        ctx.unit
            .set_status(UnitStatus::maintenance(format!("Waiting for {name} to start")));
        Ok(EventOutcome::Handled)
    }

    /// The certificate source selected by the stored state. Asks the CA for a certificate when the
    /// relation has not issued one yet.
    fn certificate_bundle(
        &self,
        identity: &UnitIdentity,
        unit: &mut dyn Unit,
    ) -> Option<Box<dyn CertificateBundle>> {
        let paths = self.workload.certificate_paths()?.clone();

        if self.stored.self_signed_cert {
            return Some(Box::new(SelfSigned::new(
                identity,
                paths,
                &self.templates_dir,
            )));
        }

        let relation = RelationCertificates::new(identity, paths, unit.certificates_relation());
        if !relation.available() {
            unit.request_server_cert(&relation.request());
        }
        Some(Box::new(relation))
    }

    async fn update_status(&self, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        let status = if ctx.container.can_connect().await {
            UnitStatus::Active
        } else {
            self.not_ready()
        };
        ctx.unit.set_status(status);

        Ok(EventOutcome::Handled)
    }

    async fn set_version(&self, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        if ctx.unit.is_leader() && ctx.container.can_connect().await {
            let version = self.lifecycle.version(ctx.container).await;
            ctx.unit.set_workload_version(&version);
        }

        Ok(EventOutcome::Handled)
    }

    fn update_scrape_jobs(&mut self, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        let namespace = match ctx.config.kube_state_metrics_namespace() {
            Ok(namespace) => namespace,
            Err(err) => {
                ctx.unit.set_status(UnitStatus::blocked(err.to_string()));
                return Ok(EventOutcome::Handled);
            }
        };

        if self.stored.metrics_namespace.as_deref() != Some(namespace.as_str()) {
            tracing::info!(
                %namespace,
                "publishing scrape jobs for kube-state-metrics namespace"
            );
            ctx.unit
                .publish_scrape_jobs(&prometheus::scrape_jobs(&namespace));
            self.stored.metrics_namespace = Some(namespace);
        }

        Ok(EventOutcome::Handled)
    }

    async fn cleanup(&self, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        if ctx.container.can_connect().await {
            let services = ctx
                .container
                .get_services(&[SERVICE_NAME])
                .await
                .context(StopWorkloadSnafu)?;
            if !services.is_empty() {
                ctx.container
                    .stop(SERVICE_NAME)
                    .await
                    .context(StopWorkloadSnafu)?;
            }
        }

        ctx.unit.set_status(UnitStatus::waiting("Shutting down"));

        if ctx.unit.is_leader() {
            let identity = ctx.unit.identity().clone();
            let set = render_manifests(&self.manifest_source(&identity)?)?;
            ResourceReconciler::new(ctx.cluster, &identity)
                .delete(&set, true, true)
                .await
                .context(ReconcileManifestsSnafu)?;
        }

        Ok(EventOutcome::Handled)
    }

    /// Selects the certificate source from the state of the `certificates` relation.
    async fn ready_tls(&mut self, event: Event, ctx: &mut Context<'_>) -> Result<EventOutcome> {
        let state = if event == Event::CertificatesRelationBroken {
            RelationState::Absent
        } else {
            ctx.unit.certificates_relation().state
        };

        match state {
            RelationState::Waiting(message) => {
                ctx.unit.set_status(UnitStatus::waiting(message));
                self.stored.self_signed_cert = false;
                return Ok(EventOutcome::Handled);
            }
            RelationState::Ready => self.stored.self_signed_cert = false,
            RelationState::Absent => self.stored.self_signed_cert = true,
        }

        self.reconcile(ctx).await
    }
}
