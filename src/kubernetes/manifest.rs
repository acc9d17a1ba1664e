use crate::kubernetes::command::CommandRunner;
use crate::kubernetes::KubernetesError;
use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::{pinned_kind, Scope};
use kube::Client;
use serde::Deserialize;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Applies a YAML manifest (one or more documents) to the cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ManifestSync: Send + Sync {
    async fn sync(&self, resource_name: &str, manifest: &[u8]) -> Result<(), KubernetesError>;
}

/// Hands manifests to `kubectl apply -f <path>` through a scratch file.
///
/// The scratch file is unique per call and always removed once the apply returned, whatever its
/// outcome. A failed removal is logged and never hides the apply result.
pub struct ScratchFileManifestSync {
    runner: Arc<dyn CommandRunner>,
    scratch_dir: PathBuf,
}

impl ScratchFileManifestSync {
    pub fn new(runner: Arc<dyn CommandRunner>, scratch_dir: PathBuf) -> Self {
        ScratchFileManifestSync {
            runner,
            scratch_dir,
        }
    }
}

#[async_trait]
impl ManifestSync for ScratchFileManifestSync {
    async fn sync(&self, resource_name: &str, manifest: &[u8]) -> Result<(), KubernetesError> {
        let cannot_write = |e: std::io::Error| {
            error!("error writing manifest `{resource_name}` to file: {e}");
            KubernetesError::CannotWriteScratchFile {
                resource_name: Arc::from(resource_name),
                raw_message: Arc::from(e.to_string()),
            }
        };

        let mut scratch_file = tempfile::Builder::new()
            .prefix(&format!("{resource_name}-"))
            .suffix(".yaml")
            .tempfile_in(&self.scratch_dir)
            .map_err(cannot_write)?;
        scratch_file
            .write_all(manifest)
            .and_then(|_| scratch_file.flush())
            .map_err(cannot_write)?;

        let args = vec![
            "apply".to_string(),
            "-f".to_string(),
            scratch_file.path().display().to_string(),
        ];
        info!("Applying manifest `{resource_name}`");
        let result = self
            .runner
            .run("kubectl", &args, None)
            .await
            .map(|_| ())
            .inspect_err(|e| error!("error applying manifest `{resource_name}`: {e}"));

        if let Err(e) = scratch_file.close() {
            error!("error deleting manifest file for `{resource_name}`: {e}");
        }

        result
    }
}

/// Server side applies manifests straight from memory, no scratch file involved.
pub struct KubeManifestSync {
    client: Client,
    field_manager: String,
}

impl KubeManifestSync {
    pub async fn new(field_manager: &str) -> Result<KubeManifestSync, KubernetesError> {
        let client =
            Client::try_default()
                .await
                .map_err(|e| KubernetesError::ClusterUnreachable {
                    raw_message: Arc::from(e.to_string()),
                })?;

        Ok(KubeManifestSync {
            client,
            field_manager: field_manager.to_string(),
        })
    }

    async fn apply_document(
        &self,
        resource_name: &str,
        document: &DynamicObject,
    ) -> Result<(), KubernetesError> {
        let cannot_apply = |raw_message: String| KubernetesError::CannotApplyManifest {
            resource_name: Arc::from(resource_name),
            raw_message: Arc::from(raw_message),
        };

        let types = document
            .types
            .as_ref()
            .ok_or_else(|| cannot_apply("document has no apiVersion/kind".to_string()))?;
        let gvk = GroupVersionKind::try_from(types).map_err(|e| cannot_apply(e.to_string()))?;
        let name = document
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| cannot_apply(format!("{} has no metadata.name", types.kind)))?;

        let (api_resource, capabilities) = pinned_kind(&self.client, &gvk)
            .await
            .map_err(|e| cannot_apply(e.to_string()))?;
        let api: Api<DynamicObject> = match capabilities.scope {
            Scope::Namespaced => Api::namespaced_with(
                self.client.clone(),
                document.metadata.namespace.as_deref().unwrap_or("default"),
                &api_resource,
            ),
            Scope::Cluster => Api::all_with(self.client.clone(), &api_resource),
        };

        api.patch(
            name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(document),
        )
        .await
        .map(|_| ())
        .map_err(|e| cannot_apply(e.to_string()))
    }
}

#[async_trait]
impl ManifestSync for KubeManifestSync {
    async fn sync(&self, resource_name: &str, manifest: &[u8]) -> Result<(), KubernetesError> {
        info!("Applying manifest `{resource_name}`");
        for document in parse_documents(resource_name, manifest)? {
            self.apply_document(resource_name, &document)
                .await
                .inspect_err(|e| error!("error applying manifest `{resource_name}`: {e}"))?;
        }
        Ok(())
    }
}

/// Splits a multi document YAML stream, skipping empty documents.
fn parse_documents(
    resource_name: &str,
    manifest: &[u8],
) -> Result<Vec<DynamicObject>, KubernetesError> {
    let cannot_parse = |e: serde_yaml::Error| KubernetesError::CannotParseManifest {
        resource_name: Arc::from(resource_name),
        raw_message: Arc::from(e.to_string()),
    };

    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_slice(manifest) {
        let value = serde_yaml::Value::deserialize(document).map_err(cannot_parse)?;
        if value.is_null() {
            continue;
        }
        documents.push(serde_yaml::from_value(value).map_err(cannot_parse)?);
    }

    Ok(documents)
}
