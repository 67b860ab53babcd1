//! In-memory stand-ins for Pebble, the Kubernetes API and the Juju unit.
use std::{
    collections::{BTreeSet, VecDeque},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{Level, field::Field, subscriber::DefaultGuard};
use tracing_subscriber::{Layer, layer::SubscriberExt};

use crate::{
    certs::{CertificatesRelation, ServerCertRequest},
    client::{ApiError, ClusterApi, ListSelectors},
    container::{Container, ExecOutput, Layer as PebbleLayer, PebbleError, PushFile},
    manifests::{ManifestPatch, ManifestResource, Protocol, ResourceType},
    status::UnitStatus,
    unit::{OpenPortError, Unit, UnitIdentity},
};

#[derive(Debug)]
pub struct ContainerState {
    pub reachable: bool,
    pub files: BTreeSet<PathBuf>,
    pub services: BTreeSet<String>,
    pub calls: Vec<String>,
    pub layers: Vec<PebbleLayer>,
    pub pushed: Vec<PushFile>,
    pub listed: Vec<(PathBuf, String)>,
    pub executed: Vec<Vec<String>>,
    pub exec_results: VecDeque<Result<ExecOutput, PebbleError>>,
    pub restart_error: Option<PebbleError>,
}

/// A workload container. Reachable and empty by default.
#[derive(Debug)]
pub struct FakeContainer {
    state: Mutex<ContainerState>,
}

impl Default for FakeContainer {
    fn default() -> Self {
        Self {
            state: Mutex::new(ContainerState {
                reachable: true,
                files: BTreeSet::new(),
                services: BTreeSet::new(),
                calls: Vec::new(),
                layers: Vec::new(),
                pushed: Vec::new(),
                listed: Vec::new(),
                executed: Vec::new(),
                exec_results: VecDeque::new(),
                restart_error: None,
            }),
        }
    }
}

impl FakeContainer {
    pub fn with_files<'a>(files: impl IntoIterator<Item = &'a str>) -> Self {
        let container = Self::default();
        container
            .state()
            .files
            .extend(files.into_iter().map(PathBuf::from));
        container
    }

    pub fn unreachable() -> Self {
        let container = Self::default();
        container.state().reachable = false;
        container
    }

    /// Queues the result of the next `exec`. Without a queued result `exec` succeeds silently.
    pub fn respond_to_exec(&self, result: Result<ExecOutput, PebbleError>) {
        self.state().exec_results.push_back(result);
    }

    pub fn state(&self) -> MutexGuard<'_, ContainerState> {
        self.state.lock().unwrap()
    }

    fn connected(&self) -> Result<MutexGuard<'_, ContainerState>, PebbleError> {
        let state = self.state();
        if state.reachable {
            Ok(state)
        } else {
            Err(PebbleError::Connection {
                message: "cannot connect to Pebble".to_owned(),
            })
        }
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn name(&self) -> &str {
        "volcano"
    }

    async fn can_connect(&self) -> bool {
        self.state().reachable
    }

    async fn add_layer(
        &self,
        label: &str,
        layer: &PebbleLayer,
        _combine: bool,
    ) -> Result<(), PebbleError> {
        let mut state = self.connected()?;
        state.calls.push(format!("add_layer {label}"));
        state.services.extend(layer.services.keys().cloned());
        state.layers.push(layer.clone());
        Ok(())
    }

    async fn push(&self, file: &PushFile) -> Result<(), PebbleError> {
        let mut state = self.connected()?;
        state.calls.push(format!("push {}", file.path.display()));
        state.files.insert(file.path.clone());
        state.pushed.push(file.clone());
        Ok(())
    }

    async fn list_files(&self, path: &Path, pattern: &str) -> Result<Vec<PathBuf>, PebbleError> {
        let mut state = self.connected()?;
        state.listed.push((path.to_owned(), pattern.to_owned()));

        let prefix = pattern.trim_end_matches('*');
        Ok(state
            .files
            .iter()
            .filter(|file| file.parent() == Some(path))
            .filter(|file| {
                file.file_name()
                    .is_some_and(|name| name.to_string_lossy().starts_with(prefix))
            })
            .cloned()
            .collect())
    }

    async fn exec(&self, command: &[String]) -> Result<ExecOutput, PebbleError> {
        let mut state = self.connected()?;
        state.executed.push(command.to_vec());
        state
            .exec_results
            .pop_front()
            .unwrap_or_else(|| Ok(ExecOutput::default()))
    }

    async fn autostart(&self) -> Result<(), PebbleError> {
        let mut state = self.connected()?;
        state.calls.push("autostart".to_owned());
        Ok(())
    }

    async fn restart(&self, service: &str) -> Result<(), PebbleError> {
        let mut state = self.connected()?;
        state.calls.push(format!("restart {service}"));
        match state.restart_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn stop(&self, service: &str) -> Result<(), PebbleError> {
        let mut state = self.connected()?;
        state.calls.push(format!("stop {service}"));
        Ok(())
    }

    async fn get_services(&self, names: &[&str]) -> Result<Vec<String>, PebbleError> {
        let state = self.connected()?;
        Ok(names
            .iter()
            .filter(|name| state.services.contains(**name))
            .map(|name| (*name).to_owned())
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct ClusterState {
    pub objects: Vec<Value>,
    pub applied: Vec<ManifestResource>,
    pub patched: Vec<ManifestPatch>,
    /// Every delete attempt, failed or not.
    pub deleted: Vec<(ResourceType, String, Option<String>)>,
    pub listed: Vec<ListSelectors>,
    pub apply_error: Option<ApiError>,
    pub delete_error: Option<ApiError>,
}

#[derive(Debug, Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    /// Adds an object that `list` can return.
    pub fn with_object(self, object: Value) -> Self {
        self.state().objects.push(object);
        self
    }

    pub fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(&self, resource: &ManifestResource) -> Result<(), ApiError> {
        let mut state = self.state();
        if let Some(err) = state.apply_error.clone() {
            return Err(err);
        }
        state.applied.push(resource.clone());
        Ok(())
    }

    async fn patch(&self, patch: &ManifestPatch) -> Result<(), ApiError> {
        self.state().patched.push(patch.clone());
        Ok(())
    }

    async fn delete(
        &self,
        type_: &ResourceType,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        state.deleted.push((
            type_.clone(),
            name.to_owned(),
            namespace.map(ToOwned::to_owned),
        ));
        match state.delete_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list(
        &self,
        type_: &ResourceType,
        namespace: Option<&str>,
        selectors: &ListSelectors,
    ) -> Result<Vec<Value>, ApiError> {
        let mut state = self.state();
        state.listed.push(selectors.clone());

        let name = selectors
            .field
            .as_deref()
            .and_then(|field| field.strip_prefix("metadata.name="));
        Ok(state
            .objects
            .iter()
            .filter(|object| object["kind"] == type_.kind.as_str())
            .filter(|object| {
                namespace.is_none_or(|namespace| object["metadata"]["namespace"] == namespace)
            })
            .filter(|object| name.is_none_or(|name| object["metadata"]["name"] == name))
            .cloned()
            .collect())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpenPortBehavior {
    #[default]
    Succeed,
    NotSupported,
    Fail,
}

/// A Juju unit recording everything the charm tells it.
#[derive(Debug)]
pub struct FakeUnit {
    pub identity: UnitIdentity,
    pub leader: bool,
    pub statuses: Vec<UnitStatus>,
    pub workload_version: Option<String>,
    pub open_port: OpenPortBehavior,
    /// Every `open-port` attempt.
    pub opened_ports: Vec<(Protocol, u16)>,
    pub relation: CertificatesRelation,
    pub cert_requests: Vec<ServerCertRequest>,
    pub scrape_jobs: Vec<Vec<Value>>,
}

impl FakeUnit {
    pub fn leader(identity: UnitIdentity) -> Self {
        Self {
            identity,
            leader: true,
            statuses: Vec::new(),
            workload_version: None,
            open_port: OpenPortBehavior::default(),
            opened_ports: Vec::new(),
            relation: CertificatesRelation::default(),
            cert_requests: Vec::new(),
            scrape_jobs: Vec::new(),
        }
    }

    pub fn follower(identity: UnitIdentity) -> Self {
        Self {
            leader: false,
            ..Self::leader(identity)
        }
    }

    /// The status set last, [`UnitStatus::default`] if none was set.
    pub fn status(&self) -> UnitStatus {
        self.statuses.last().cloned().unwrap_or_default()
    }
}

impl Unit for FakeUnit {
    fn identity(&self) -> &UnitIdentity {
        &self.identity
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    fn set_status(&mut self, status: UnitStatus) {
        self.statuses.push(status);
    }

    fn set_workload_version(&mut self, version: &str) {
        self.workload_version = Some(version.to_owned());
    }

    fn open_port(&mut self, protocol: Protocol, port: u16) -> Result<(), OpenPortError> {
        self.opened_ports.push((protocol, port));
        match self.open_port {
            OpenPortBehavior::Succeed => Ok(()),
            OpenPortBehavior::NotSupported => Err(OpenPortError::NotSupported),
            OpenPortBehavior::Fail => Err(OpenPortError::Failed {
                protocol,
                port,
                message: "ERROR permission denied".to_owned(),
            }),
        }
    }

    fn certificates_relation(&self) -> CertificatesRelation {
        self.relation.clone()
    }

    fn request_server_cert(&mut self, request: &ServerCertRequest) {
        self.cert_requests.push(request.clone());
    }

    fn publish_scrape_jobs(&mut self, jobs: &[Value]) {
        self.scrape_jobs.push(jobs.to_vec());
    }
}

/// Records the level and message of every event emitted while installed.
#[derive(Clone, Debug, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl LogCapture {
    /// Installs the capture as the default subscriber of the current thread.
    pub fn set_default(&self) -> DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    pub fn messages(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(event_level, _)| *event_level == level)
            .map(|(_, message)| message.clone())
            .collect()
    }
}

impl<S: tracing::Subscriber> Layer<S> for LogCapture {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}
