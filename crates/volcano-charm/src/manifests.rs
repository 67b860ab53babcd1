//! The set of cluster objects a charm owns.
//!
//! A [`ManifestSource`] describes where the objects come from (templates, values and release),
//! [`ManifestSource::render`] turns it into a [`ManifestSet`]. Rendering is deterministic: the
//! same templates and values always produce the same resources in the same order.
use std::{
    fmt,
    path::{Path, PathBuf},
};

use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;
use volcano_shared::yaml;

use crate::templating::{self, Release, TemplateRenderer};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to list templates in {dir:?}"))]
    ListTemplates {
        source: std::io::Error,
        dir: PathBuf,
    },

    #[snafu(display("failed to render manifest template"))]
    RenderTemplate { source: templating::Error },

    #[snafu(display("failed to parse rendered template {template:?}"))]
    ParseRendered {
        source: yaml::Error,
        template: PathBuf,
    },

    #[snafu(display("document #{index} of template {template:?} is missing {field:?}"))]
    MissingField {
        template: PathBuf,
        index: usize,
        field: &'static str,
    },
}

/// `apiVersion` and `kind` of a cluster object.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceType {
    pub api_version: String,
    pub kind: String,
}

impl ResourceType {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    pub fn stateful_set() -> Self {
        Self::new("apps/v1", "StatefulSet")
    }

    pub fn service() -> Self {
        Self::new("v1", "Service")
    }

    /// API group, empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map_or("", |(group, _)| group)
    }

    pub fn version(&self) -> &str {
        self.api_version
            .rsplit_once('/')
            .map_or(self.api_version.as_str(), |(_, version)| version)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// A complete object, applied server side.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestResource {
    pub type_: ResourceType,
    pub name: String,
    pub namespace: Option<String>,
    pub body: serde_json::Value,
}

impl ManifestResource {
    fn from_document(body: serde_json::Value, template: &Path, index: usize) -> Result<Self> {
        let required = |pointer: &str, field: &'static str| {
            body.pointer(pointer)
                .and_then(serde_json::Value::as_str)
                .map(ToOwned::to_owned)
                .context(MissingFieldSnafu {
                    template,
                    index,
                    field,
                })
        };

        let api_version = required("/apiVersion", "apiVersion")?;
        let kind = required("/kind", "kind")?;
        let name = required("/metadata/name", "metadata.name")?;
        let namespace = body
            .pointer("/metadata/namespace")
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned);

        Ok(Self {
            type_: ResourceType::new(api_version, kind),
            name,
            namespace,
            body,
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PatchStrategy {
    #[default]
    Strategic,
    Merge,
}

/// A partial update of an object the charm does not own.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestPatch {
    pub type_: ResourceType,
    pub name: String,
    pub namespace: Option<String>,
    pub strategy: PatchStrategy,
    pub body: serde_json::Value,
}

impl ManifestPatch {
    /// Moves the pods of the charm's own StatefulSet into the `system-cluster-critical` priority
    /// class.
    pub fn system_critical(app: &str, namespace: &str) -> Self {
        Self {
            type_: ResourceType::stateful_set(),
            name: app.to_owned(),
            namespace: Some(namespace.to_owned()),
            strategy: PatchStrategy::Strategic,
            body: json!({
                "spec": {"template": {"spec": {"priorityClassName": "system-cluster-critical"}}}
            }),
        }
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

/// A port the application's Service has to expose.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    pub name: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl ServicePort {
    pub fn tcp(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            protocol: Protocol::Tcp,
        }
    }

    /// Whether `service` (a Service object) already lists this port.
    pub fn exposed_by(&self, service: &serde_json::Value) -> bool {
        service
            .pointer("/spec/ports")
            .and_then(serde_json::Value::as_array)
            .is_some_and(|ports| {
                ports.iter().any(|port| {
                    port.get("port").and_then(serde_json::Value::as_u64)
                        == Some(u64::from(self.port))
                        && port
                            .get("protocol")
                            .and_then(serde_json::Value::as_str)
                            .unwrap_or("TCP")
                            == self.protocol.to_string()
                })
            })
    }

    /// Merge patch adding this port to the Service `service_name`.
    pub fn service_patch(&self, service_name: &str, namespace: &str) -> ManifestPatch {
        let port = k8s_openapi::api::core::v1::ServicePort {
            name: Some(self.name.clone()),
            port: i32::from(self.port),
            protocol: Some(self.protocol.to_string()),
            ..Default::default()
        };

        ManifestPatch {
            type_: ResourceType::service(),
            name: service_name.to_owned(),
            namespace: Some(namespace.to_owned()),
            strategy: PatchStrategy::Merge,
            body: json!({"spec": {"ports": [port]}}),
        }
    }
}

/// Resources and patches, each sorted by name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ManifestSet {
    pub resources: Vec<ManifestResource>,
    pub patches: Vec<ManifestPatch>,
}

/// Everything needed to compute the [`ManifestSet`] of a charm.
#[derive(Clone, Debug)]
pub struct ManifestSource {
    pub templates: Vec<PathBuf>,
    /// Directory `Files.glob` resolves against.
    pub basedir: PathBuf,
    pub values: serde_json::Value,
    pub release: Release,
    pub patches: Vec<ManifestPatch>,
    pub service_port: Option<ServicePort>,
}

impl ManifestSource {
    /// Renders every template and collects the documents.
    ///
    /// Empty documents are skipped, so a template may render nothing at all. Any template failing
    /// to render or parse fails the whole set.
    pub fn render(&self) -> Result<ManifestSet> {
        let renderer = TemplateRenderer::new(&self.basedir);

        let mut resources = Vec::new();
        for template in &self.templates {
            let rendered = renderer
                .render_file(template, &self.values, &self.release)
                .context(RenderTemplateSnafu)?;
            let documents =
                yaml::parse_documents(&rendered).context(ParseRenderedSnafu { template })?;

            for (index, document) in documents.into_iter().enumerate() {
                resources.push(ManifestResource::from_document(document, template, index)?);
            }
        }
        resources.sort_by(|a, b| a.name.cmp(&b.name));

        let mut patches = self.patches.clone();
        patches.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(ManifestSet { resources, patches })
    }
}

/// Every `*.yaml` file directly inside `dir`, sorted by path.
pub fn yaml_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).context(ListTemplatesSnafu { dir })? {
        let path = entry.context(ListTemplatesSnafu { dir })?.path();
        if path.is_file() && path.extension().is_some_and(|extension| extension == "yaml") {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}
