//! The Juju unit the charm runs as.
use snafu::Snafu;

use crate::{
    certs::{CertificatesRelation, ServerCertRequest},
    manifests::Protocol,
    status::UnitStatus,
};

/// Application, model and unit name of the running charm.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitIdentity {
    /// Name of the application, which is also the name of its StatefulSet and Service.
    pub app: String,

    /// Name of the model, which is also the Kubernetes namespace.
    pub model: String,

    pub unit: String,
}

impl UnitIdentity {
    pub fn new(app: impl Into<String>, model: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            model: model.into(),
            unit: unit.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
pub enum OpenPortError {
    /// The controller predates `open-port` support for Kubernetes models.
    #[snafu(display("opening ports is not supported by this Juju controller"))]
    NotSupported,

    #[snafu(display("failed to open port {port}/{protocol}: {message}"))]
    Failed {
        protocol: Protocol,
        port: u16,
        message: String,
    },
}

/// The Juju model as seen from one unit.
pub trait Unit: Send {
    fn identity(&self) -> &UnitIdentity;

    fn is_leader(&self) -> bool;

    fn set_status(&mut self, status: UnitStatus);

    fn set_workload_version(&mut self, version: &str);

    fn open_port(&mut self, protocol: Protocol, port: u16) -> Result<(), OpenPortError>;

    /// Current data of the `certificates` relation.
    fn certificates_relation(&self) -> CertificatesRelation;

    fn request_server_cert(&mut self, request: &ServerCertRequest);

    /// Replaces the scrape jobs published on the `metrics-endpoint` relation.
    fn publish_scrape_jobs(&mut self, jobs: &[serde_json::Value]);
}
