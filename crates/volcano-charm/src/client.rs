//! Access to the Kubernetes API.
//!
//! The reconciler only talks to the cluster through [`ClusterApi`]. [`KubeClient`] implements it
//! on top of [`kube`] with untyped objects, so any resource a template renders can be applied
//! without a compiled-in type.
use async_trait::async_trait;
use kube::{
    Api,
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams},
    core::GroupVersionKind,
};
use snafu::Snafu;

use crate::manifests::{ManifestPatch, ManifestResource, PatchStrategy, ResourceType};

/// A failed cluster request.
///
/// `message` is the message of the API status response. It is what deletes are classified on, and
/// is absent when the API server did not send one.
#[derive(Clone, Debug, PartialEq, Eq, Snafu)]
#[snafu(display("{}", message.as_deref().unwrap_or("API request failed without a message")))]
pub struct ApiError {
    pub message: Option<String>,
    pub code: Option<u16>,
}

impl ApiError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    /// An error response without a message.
    pub fn without_message() -> Self {
        Self {
            message: None,
            code: None,
        }
    }
}

impl From<kube::Error> for ApiError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(response) => Self {
                message: Some(response.message).filter(|message| !message.is_empty()),
                code: Some(response.code),
            },
            other => Self::new(other.to_string()),
        }
    }
}

/// Field and label selectors of a list request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListSelectors {
    pub field: Option<String>,
    pub label: Option<String>,
}

impl ListSelectors {
    /// Selects the object named `name`.
    pub fn name(name: &str) -> Self {
        Self {
            field: Some(format!("metadata.name={name}")),
            label: None,
        }
    }
}

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server side apply of the complete object.
    async fn apply(&self, resource: &ManifestResource) -> Result<(), ApiError>;

    async fn patch(&self, patch: &ManifestPatch) -> Result<(), ApiError>;

    async fn delete(
        &self,
        type_: &ResourceType,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), ApiError>;

    async fn list(
        &self,
        type_: &ResourceType,
        namespace: Option<&str>,
        selectors: &ListSelectors,
    ) -> Result<Vec<serde_json::Value>, ApiError>;
}

/// [`ClusterApi`] backed by a [`kube::Client`].
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
    apply_params: PatchParams,
    patch_params: PatchParams,
    delete_params: DeleteParams,
}

impl KubeClient {
    /// Writes are attributed to `field_manager`, the name of the charm application.
    pub fn new(client: kube::Client, field_manager: &str) -> Self {
        Self {
            client,
            apply_params: PatchParams::apply(field_manager).force(),
            patch_params: PatchParams {
                field_manager: Some(field_manager.to_owned()),
                ..PatchParams::default()
            },
            delete_params: DeleteParams::default(),
        }
    }

    /// Connects with the in-cluster or local kubeconfig configuration.
    pub async fn try_default(field_manager: &str) -> Result<Self, ApiError> {
        let client = kube::Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    fn api(&self, type_: &ResourceType, namespace: Option<&str>) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(type_.group(), type_.version(), &type_.kind);
        let resource = ApiResource::from_gvk(&gvk);

        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClient {
    async fn apply(&self, resource: &ManifestResource) -> Result<(), ApiError> {
        tracing::debug!(
            resource.kind = resource.type_.kind,
            resource.name = resource.name,
            "applying resource"
        );
        self.api(&resource.type_, resource.namespace.as_deref())
            .patch(
                &resource.name,
                &self.apply_params,
                &Patch::Apply(&resource.body),
            )
            .await?;

        Ok(())
    }

    async fn patch(&self, patch: &ManifestPatch) -> Result<(), ApiError> {
        tracing::debug!(
            resource.kind = patch.type_.kind,
            resource.name = patch.name,
            strategy = ?patch.strategy,
            "patching resource"
        );
        let body = match patch.strategy {
            PatchStrategy::Strategic => Patch::Strategic(&patch.body),
            PatchStrategy::Merge => Patch::Merge(&patch.body),
        };
        self.api(&patch.type_, patch.namespace.as_deref())
            .patch(&patch.name, &self.patch_params, &body)
            .await?;

        Ok(())
    }

    async fn delete(
        &self,
        type_: &ResourceType,
        name: &str,
        namespace: Option<&str>,
    ) -> Result<(), ApiError> {
        self.api(type_, namespace)
            .delete(name, &self.delete_params)
            .await?;

        Ok(())
    }

    async fn list(
        &self,
        type_: &ResourceType,
        namespace: Option<&str>,
        selectors: &ListSelectors,
    ) -> Result<Vec<serde_json::Value>, ApiError> {
        let mut params = ListParams::default();
        if let Some(field) = &selectors.field {
            params = params.fields(field);
        }
        if let Some(label) = &selectors.label {
            params = params.labels(label);
        }

        self.api(type_, namespace)
            .list(&params)
            .await?
            .items
            .into_iter()
            .map(|object| {
                serde_json::to_value(object).map_err(|err| {
                    ApiError::new(format!("failed to serialize listed {}: {err}", type_.kind))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(
        "customresourcedefinitions.apiextensions.k8s.io \"a\" not found",
        Some("customresourcedefinitions.apiextensions.k8s.io \"a\" not found")
    )]
    #[case("", None)]
    fn api_errors_keep_the_status_message(#[case] message: &str, #[case] expected: Option<&str>) {
        let error = ApiError::from(kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: message.to_owned(),
            reason: "NotFound".to_owned(),
            code: 404,
        }));

        assert_eq!(error.message.as_deref(), expected);
        assert_eq!(error.code, Some(404));
    }

    #[test]
    fn display_falls_back_without_message() {
        assert_eq!(
            ApiError::without_message().to_string(),
            "API request failed without a message"
        );
        assert_eq!(ApiError::new("Mock Not Found").to_string(), "Mock Not Found");
    }

    #[test]
    fn name_selector() {
        assert_eq!(
            ListSelectors::name("volcano-scheduler").field.as_deref(),
            Some("metadata.name=volcano-scheduler")
        );
    }
}
