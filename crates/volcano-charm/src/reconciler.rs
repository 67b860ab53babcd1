//! Applies and removes a [`ManifestSet`] on the cluster.
use snafu::{ResultExt, Snafu};

use crate::{
    client::{ApiError, ClusterApi, ListSelectors},
    manifests::{ManifestSet, ResourceType, ServicePort},
    unit::{OpenPortError, Unit, UnitIdentity},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to apply {kind} {name:?}"))]
    ApplyResource {
        source: ApiError,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to patch {kind} {name:?}"))]
    PatchResource {
        source: ApiError,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to delete {kind} {name:?}"))]
    DeleteResource {
        source: ApiError,
        kind: String,
        name: String,
    },

    #[snafu(display("failed to look up Service {name:?}"))]
    GetService { source: ApiError, name: String },

    #[snafu(display("failed to open port {port}"))]
    OpenPort { source: OpenPortError, port: u16 },
}

/// Reconciles the objects of one charm application.
pub struct ResourceReconciler<'a> {
    cluster: &'a dyn ClusterApi,
    identity: &'a UnitIdentity,
}

impl<'a> ResourceReconciler<'a> {
    pub fn new(cluster: &'a dyn ClusterApi, identity: &'a UnitIdentity) -> Self {
        Self { cluster, identity }
    }

    /// Applies every resource, then every patch, then makes sure the application's Service
    /// exposes `service_port`.
    ///
    /// The first failure aborts the pass.
    pub async fn apply(
        &self,
        set: &ManifestSet,
        service_port: Option<&ServicePort>,
        unit: &mut dyn Unit,
    ) -> Result<()> {
        for resource in &set.resources {
            self.cluster
                .apply(resource)
                .await
                .with_context(|_| ApplyResourceSnafu {
                    kind: &resource.type_.kind,
                    name: &resource.name,
                })?;
        }

        for patch in &set.patches {
            self.cluster
                .patch(patch)
                .await
                .with_context(|_| PatchResourceSnafu {
                    kind: &patch.type_.kind,
                    name: &patch.name,
                })?;
        }

        if let Some(service_port) = service_port {
            self.expose_port(service_port, unit).await?;
        }

        Ok(())
    }

    /// Opens `port` through Juju. Controllers without `open-port` support for Kubernetes get the
    /// port merged into the Service directly.
    async fn expose_port(&self, port: &ServicePort, unit: &mut dyn Unit) -> Result<()> {
        let app = &self.identity.app;
        let model = &self.identity.model;

        let services = self
            .cluster
            .list(
                &ResourceType::service(),
                Some(model),
                &ListSelectors::name(app),
            )
            .await
            .context(GetServiceSnafu { name: app })?;
        if services.iter().any(|service| port.exposed_by(service)) {
            tracing::debug!(port = port.port, "service port already exposed");
            return Ok(());
        }

        match unit.open_port(port.protocol, port.port) {
            Ok(()) => Ok(()),
            Err(OpenPortError::NotSupported) => {
                tracing::info!(
                    port = port.port,
                    "open-port is not supported, patching the Service"
                );
                let patch = port.service_patch(app, model);
                self.cluster
                    .patch(&patch)
                    .await
                    .context(PatchResourceSnafu {
                        kind: "Service",
                        name: app,
                    })
            }
            Err(source) => Err(source).context(OpenPortSnafu { port: port.port }),
        }
    }

    /// Deletes every resource of `set`.
    ///
    /// Errors whose message contains "not found" or "(unauthorized)" are logged and skipped when
    /// the respective flag is set. Any other error aborts the remaining deletes.
    pub async fn delete(
        &self,
        set: &ManifestSet,
        ignore_not_found: bool,
        ignore_unauthorized: bool,
    ) -> Result<()> {
        for resource in &set.resources {
            let kind = &resource.type_.kind;
            let name = &resource.name;
            let namespace = resource.namespace.as_deref();

            let Err(err) = self.cluster.delete(&resource.type_, name, namespace).await else {
                tracing::info!(
                    "Deleted {kind}({name}, namespace={namespace})",
                    namespace = namespace.unwrap_or("None")
                );
                continue;
            };

            let Some(message) = err.message.as_deref() else {
                tracing::error!("ApiError encountered while attempting to delete resource.");
                return Err(err).context(DeleteResourceSnafu { kind, name });
            };

            let lower = message.to_lowercase();
            if lower.contains("not found") && ignore_not_found {
                tracing::warn!("Ignoring not found error: {message}");
            } else if lower.contains("(unauthorized)") && ignore_unauthorized {
                tracing::warn!("Ignoring unauthorized error: {message}");
            } else {
                tracing::error!(
                    "ApiError encountered while attempting to delete resource: {message}"
                );
                return Err(err).context(DeleteResourceSnafu { kind, name });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;
    use tracing::Level;

    use super::*;
    use crate::{
        manifests::{ManifestPatch, ManifestResource, PatchStrategy},
        testing::{FakeCluster, FakeUnit, LogCapture, OpenPortBehavior},
    };

    fn identity() -> UnitIdentity {
        UnitIdentity::new("volcano-admission", "volcano", "volcano-admission/0")
    }

    fn webhook(name: &str) -> ManifestResource {
        ManifestResource {
            type_: ResourceType::new(
                "admissionregistration.k8s.io/v1",
                "MutatingWebhookConfiguration",
            ),
            name: name.to_owned(),
            namespace: None,
            body: json!({"metadata": {"name": name}}),
        }
    }

    fn set() -> ManifestSet {
        ManifestSet {
            resources: vec![webhook("a-mutate"), webhook("b-mutate"), webhook("c-mutate")],
            patches: vec![ManifestPatch::system_critical("volcano-admission", "volcano")],
        }
    }

    #[tokio::test]
    async fn apply_resources_then_patches() {
        let cluster = FakeCluster::default();
        let identity = identity();
        let mut unit = FakeUnit::leader(identity.clone());

        ResourceReconciler::new(&cluster, &identity)
            .apply(&set(), None, &mut unit)
            .await
            .unwrap();

        let state = cluster.state();
        let applied: Vec<_> = state.applied.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(applied, ["a-mutate", "b-mutate", "c-mutate"]);
        assert_eq!(state.patched, [ManifestPatch::system_critical(
            "volcano-admission",
            "volcano"
        )]);
        assert!(state.listed.is_empty());
        assert!(unit.opened_ports.is_empty());
    }

    #[tokio::test]
    async fn apply_failure_aborts() {
        let cluster = FakeCluster::default();
        cluster.state().apply_error = Some(ApiError::new("Mock Apply Failure"));
        let identity = identity();
        let mut unit = FakeUnit::leader(identity.clone());

        let error = ResourceReconciler::new(&cluster, &identity)
            .apply(&set(), None, &mut unit)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::ApplyResource { ref name, .. } if name == "a-mutate"));
        assert!(cluster.state().patched.is_empty());
    }

    #[rstest]
    #[case::open_port_supported(OpenPortBehavior::Succeed, 0)]
    #[case::open_port_unsupported(OpenPortBehavior::NotSupported, 1)]
    #[tokio::test]
    async fn apply_exposes_service_port(
        #[case] behavior: OpenPortBehavior,
        #[case] service_patches: usize,
    ) {
        let cluster = FakeCluster::default().with_object(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "volcano-admission", "namespace": "volcano"},
            "spec": {"ports": [{"port": 65535, "protocol": "TCP"}]},
        }));
        let identity = identity();
        let mut unit = FakeUnit::leader(identity.clone());
        unit.open_port = behavior;
        let port = ServicePort::tcp("volcano-admission", 443);

        ResourceReconciler::new(&cluster, &identity)
            .apply(&set(), Some(&port), &mut unit)
            .await
            .unwrap();

        assert_eq!(unit.opened_ports, [(crate::manifests::Protocol::Tcp, 443)]);

        let state = cluster.state();
        assert_eq!(state.listed, [ListSelectors::name("volcano-admission")]);
        let merges: Vec<_> = state
            .patched
            .iter()
            .filter(|patch| patch.strategy == PatchStrategy::Merge)
            .collect();
        assert_eq!(merges.len(), service_patches);
        if let Some(merge) = merges.first() {
            assert_eq!(merge.name, "volcano-admission");
            assert_eq!(merge.type_, ResourceType::service());
        }
    }

    #[tokio::test]
    async fn apply_skips_exposed_port() {
        let cluster = FakeCluster::default().with_object(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {"name": "volcano-admission", "namespace": "volcano"},
            "spec": {"ports": [{"name": "volcano-admission", "port": 443, "protocol": "TCP"}]},
        }));
        let identity = identity();
        let mut unit = FakeUnit::leader(identity.clone());

        let port = ServicePort::tcp("volcano-admission", 443);

        ResourceReconciler::new(&cluster, &identity)
            .apply(&set(), Some(&port), &mut unit)
            .await
            .unwrap();

        assert!(unit.opened_ports.is_empty());
        assert_eq!(cluster.state().patched.len(), 1);
    }

    #[tokio::test]
    async fn apply_open_port_failure() {
        let cluster = FakeCluster::default();
        let identity = identity();
        let mut unit = FakeUnit::leader(identity.clone());
        unit.open_port = OpenPortBehavior::Fail;

        let port = ServicePort::tcp("volcano-admission", 443);

        let error = ResourceReconciler::new(&cluster, &identity)
            .apply(&set(), Some(&port), &mut unit)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::OpenPort { port: 443, .. }));
    }

    #[tokio::test]
    async fn delete_logs_each_resource() {
        let logs = LogCapture::default();
        let _guard = logs.set_default();
        let cluster = FakeCluster::default();
        let identity = identity();

        ResourceReconciler::new(&cluster, &identity)
            .delete(&set(), true, false)
            .await
            .unwrap();

        assert_eq!(logs.messages(Level::INFO), [
            "Deleted MutatingWebhookConfiguration(a-mutate, namespace=None)",
            "Deleted MutatingWebhookConfiguration(b-mutate, namespace=None)",
            "Deleted MutatingWebhookConfiguration(c-mutate, namespace=None)",
        ]);
        assert_eq!(cluster.state().deleted.len(), 3);
    }

    #[tokio::test]
    async fn delete_logs_namespace() {
        let logs = LogCapture::default();
        let _guard = logs.set_default();
        let cluster = FakeCluster::default();
        let identity = identity();
        let set = ManifestSet {
            resources: vec![ManifestResource {
                type_: ResourceType::new("v1", "ConfigMap"),
                name: "volcano-scheduler-configmap".to_owned(),
                namespace: Some("volcano".to_owned()),
                body: json!({}),
            }],
            patches: Vec::new(),
        };

        ResourceReconciler::new(&cluster, &identity)
            .delete(&set, false, false)
            .await
            .unwrap();

        assert_eq!(logs.messages(Level::INFO), [
            "Deleted ConfigMap(volcano-scheduler-configmap, namespace=volcano)"
        ]);
    }

    #[rstest]
    #[case::not_found("Mock Not Found", true, false, "Ignoring not found error: Mock Not Found")]
    #[case::unauthorized(
        "Mock (unauthorized)",
        false,
        true,
        "Ignoring unauthorized error: Mock (unauthorized)"
    )]
    #[case::both_flags(
        "Mock (Unauthorized)",
        true,
        true,
        "Ignoring unauthorized error: Mock (Unauthorized)"
    )]
    #[tokio::test]
    async fn delete_ignores_suppressed_errors(
        #[case] message: &str,
        #[case] ignore_not_found: bool,
        #[case] ignore_unauthorized: bool,
        #[case] expected: &str,
    ) {
        let logs = LogCapture::default();
        let _guard = logs.set_default();
        let cluster = FakeCluster::default();
        cluster.state().delete_error = Some(ApiError::new(message).with_code(404));
        let identity = identity();

        ResourceReconciler::new(&cluster, &identity)
            .delete(&set(), ignore_not_found, ignore_unauthorized)
            .await
            .unwrap();

        let warnings = logs.messages(Level::WARN);
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().all(|warning| warning == expected));
        assert_eq!(cluster.state().deleted.len(), 3);
    }

    #[rstest]
    #[case::unexpected("Mock Simple Failure", true, true)]
    #[case::not_found_not_ignored("Mock Not Found", false, true)]
    #[case::unauthorized_not_ignored("Mock (unauthorized)", true, false)]
    #[tokio::test]
    async fn delete_propagates_other_errors(
        #[case] message: &str,
        #[case] ignore_not_found: bool,
        #[case] ignore_unauthorized: bool,
    ) {
        let logs = LogCapture::default();
        let _guard = logs.set_default();
        let cluster = FakeCluster::default();
        cluster.state().delete_error = Some(ApiError::new(message));
        let identity = identity();

        let error = ResourceReconciler::new(&cluster, &identity)
            .delete(&set(), ignore_not_found, ignore_unauthorized)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::DeleteResource { ref name, .. } if name == "a-mutate"));
        assert_eq!(logs.messages(Level::ERROR), [format!(
            "ApiError encountered while attempting to delete resource: {message}"
        )]);
        assert_eq!(cluster.state().deleted.len(), 1);
    }

    #[tokio::test]
    async fn delete_without_message_always_propagates() {
        let logs = LogCapture::default();
        let _guard = logs.set_default();
        let cluster = FakeCluster::default();
        cluster.state().delete_error = Some(ApiError::without_message());
        let identity = identity();

        let error = ResourceReconciler::new(&cluster, &identity)
            .delete(&set(), true, true)
            .await
            .unwrap_err();

        assert!(matches!(error, Error::DeleteResource { .. }));
        assert_eq!(logs.messages(Level::ERROR), [
            "ApiError encountered while attempting to delete resource."
        ]);
    }
}
