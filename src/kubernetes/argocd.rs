//! Mirror of the Argo CD `Application` resource, kept to the fields this tool reads or writes.
//!
//! Depending on the argo types would pull in most of the Kubernetes API for a handful of fields,
//! so this has to be kept in sync with
//! https://github.com/argoproj/argo-cd/blob/master/pkg/apis/application/v1alpha1/types.go
//!
//! Every optional field is skipped when unset so the rendered manifest never carries `null` or
//! empty values the upstream schema would treat as set.

use crate::config::{non_empty, PlatformApplicationConfig};
use crate::kubernetes::manifest::ManifestSync;
use crate::kubernetes::KubernetesError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

pub const PLATFORM_APPLICATION_TEMPLATE: &[u8] =
    include_bytes!("../../templates/platform-application.yaml");

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArgocdApplication {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_yaml::Value>,
    pub spec: ApplicationSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub source: ApplicationSource,
    pub destination: ApplicationDestination,
    #[serde(default)]
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<ResourceIgnoreDifferences>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub helm: Option<ApplicationSourceHelm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kustomize: Option<ApplicationSourceKustomize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<ApplicationSourceDirectory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<ApplicationSourcePlugin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSourceHelm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub value_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<HelmParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_parameters: Vec<HelmFileParameter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub pass_credentials: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub ignore_missing_value_files: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub skip_crds: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmParameter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_string: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HelmFileParameter {
    pub name: String,
    pub path: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSourceKustomize {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub common_annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_common_labels: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub force_common_annotations: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSourceDirectory {
    #[serde(default, skip_serializing_if = "is_false")]
    pub recurse: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jsonnet: Option<ApplicationSourceJsonnet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSourceJsonnet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ext_vars: Vec<JsonnetVar>,
    #[serde(default, rename = "tlas", skip_serializing_if = "Vec::is_empty")]
    pub tlas: Vec<JsonnetVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libs: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JsonnetVar {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub code: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSourcePlugin {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<SyncPolicyAutomated>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicyAutomated {
    #[serde(default, skip_serializing_if = "is_false")]
    pub prune: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub self_heal: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub allow_empty: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIgnoreDifferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub json_pointers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jq_path_expressions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_fields_managers: Vec<String>,
}

/// Per stack values laid over the template. Unset or empty values leave the template untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApplicationOverrides {
    pub target_revision: Option<String>,
    pub sync_policy: Option<SyncPolicy>,
    pub helm_values: Option<String>,
}

impl From<&PlatformApplicationConfig> for ApplicationOverrides {
    fn from(value: &PlatformApplicationConfig) -> Self {
        ApplicationOverrides {
            target_revision: value.target_revision.clone(),
            sync_policy: value.sync_policy.clone(),
            helm_values: value.values.clone(),
        }
    }
}

impl ArgocdApplication {
    pub fn from_bytes(template: &[u8]) -> Result<ArgocdApplication, KubernetesError> {
        serde_yaml::from_slice(template).map_err(|e| KubernetesError::CannotParseManifest {
            resource_name: Arc::from("argocd application template"),
            raw_message: Arc::from(e.to_string()),
        })
    }

    pub fn materialize(
        template: &[u8],
        overrides: &ApplicationOverrides,
    ) -> Result<ArgocdApplication, KubernetesError> {
        let mut application = Self::from_bytes(template)?;

        if let Some(sync_policy) = &overrides.sync_policy {
            application.spec.sync_policy = Some(sync_policy.clone());
        }
        if let Some(target_revision) = non_empty(&overrides.target_revision) {
            application.spec.source.target_revision = Some(target_revision.to_string());
        }
        if let Some(values) = non_empty(&overrides.helm_values) {
            application
                .spec
                .source
                .helm
                .get_or_insert_with(ApplicationSourceHelm::default)
                .values = Some(values.to_string());
        }

        Ok(application)
    }

    pub fn to_yaml(&self) -> Result<String, KubernetesError> {
        serde_yaml::to_string(self).map_err(|e| KubernetesError::CannotSerialize {
            what: Arc::from("argocd application"),
            raw_message: Arc::from(e.to_string()),
        })
    }
}

pub async fn sync_argocd_application(
    manifest_sync: &dyn ManifestSync,
    resource_name: &str,
    application: &ArgocdApplication,
) -> Result<(), KubernetesError> {
    let manifest = application.to_yaml().inspect_err(|e| {
        error!("error marshalling application `{resource_name}` to yaml: {e}");
    })?;

    info!("Syncing argocd application `{resource_name}`");
    manifest_sync
        .sync(resource_name, manifest.as_bytes())
        .await
}

#[cfg(test)]
mod tests {
    use crate::kubernetes::argocd::{
        sync_argocd_application, ApplicationOverrides, ArgocdApplication, SyncPolicy,
        SyncPolicyAutomated, PLATFORM_APPLICATION_TEMPLATE,
    };
    use crate::kubernetes::manifest::MockManifestSync;

    const TEMPLATE: &str = r#"
apiVersion: argoproj.io/v1alpha1
kind: Application
metadata:
  name: demo
  namespace: argo-cd
spec:
  project: default
  source:
    repoURL: https://example.com/charts
    chart: demo
    targetRevision: 1.0.0
    helm:
      releaseName: demo
      values: |
        replicas: 1
  destination:
    server: https://kubernetes.default.svc
    namespace: demo
  ignoreDifferences:
    - group: apps
      kind: Deployment
      jsonPointers:
        - /spec/replicas
"#;

    #[test]
    fn embedded_platform_template_is_valid_test() {
        // execute:
        let result = ArgocdApplication::from_bytes(PLATFORM_APPLICATION_TEMPLATE);

        // verify:
        assert!(result.is_ok());
        let application = result.unwrap_or_default();
        assert_eq!("Application", application.kind);
        assert_eq!(Some("platform-services".to_string()), application.spec.source.chart);
        assert!(application.spec.sync_policy.is_some());
    }

    #[test]
    fn materialize_overrides_three_fields_test() {
        // setup:
        let overrides = ApplicationOverrides {
            target_revision: Some("2.0.0".to_string()),
            sync_policy: Some(SyncPolicy {
                automated: Some(SyncPolicyAutomated {
                    prune: true,
                    self_heal: false,
                    allow_empty: false,
                }),
                ..Default::default()
            }),
            helm_values: Some("replicas: 3\n".to_string()),
        };
        let template = ArgocdApplication::from_bytes(TEMPLATE.as_bytes()).unwrap_or_default();

        // execute:
        let result = ArgocdApplication::materialize(TEMPLATE.as_bytes(), &overrides);

        // verify:
        assert!(result.is_ok());
        let application = result.unwrap_or_default();
        assert_eq!(Some("2.0.0".to_string()), application.spec.source.target_revision);
        assert_eq!(overrides.sync_policy, application.spec.sync_policy);
        let helm = application.spec.source.helm.clone().unwrap_or_default();
        assert_eq!(Some("replicas: 3\n".to_string()), helm.values);

        // everything else passes through
        assert_eq!(Some("demo".to_string()), helm.release_name);
        assert_eq!(template.metadata, application.metadata);
        assert_eq!(template.spec.destination, application.spec.destination);
        assert_eq!(template.spec.ignore_differences, application.spec.ignore_differences);
        assert_eq!(template.spec.source.repo_url, application.spec.source.repo_url);
    }

    #[test]
    fn materialize_empty_overrides_keep_template_test() {
        // setup:
        let overrides = ApplicationOverrides {
            target_revision: Some("".to_string()),
            sync_policy: None,
            helm_values: Some("".to_string()),
        };

        // execute:
        let result = ArgocdApplication::materialize(TEMPLATE.as_bytes(), &overrides);

        // verify:
        let application = result.unwrap_or_default();
        assert_eq!(Some("1.0.0".to_string()), application.spec.source.target_revision);
        assert_eq!(
            Some("replicas: 1\n".to_string()),
            application.spec.source.helm.unwrap_or_default().values
        );
        assert_eq!(None, application.spec.sync_policy);
    }

    #[test]
    fn materialize_values_without_helm_section_test() {
        // setup:
        let template = r#"
apiVersion: argoproj.io/v1alpha1
kind: Application
spec:
  source:
    repoURL: https://example.com/repo.git
    path: manifests
  destination:
    namespace: demo
"#;
        let overrides = ApplicationOverrides {
            helm_values: Some("a: b".to_string()),
            ..Default::default()
        };

        // execute:
        let application =
            ArgocdApplication::materialize(template.as_bytes(), &overrides).unwrap_or_default();

        // verify:
        assert_eq!(
            Some("a: b".to_string()),
            application.spec.source.helm.unwrap_or_default().values
        );
    }

    #[test]
    fn to_yaml_omits_unset_fields_test() {
        // setup:
        let application =
            ArgocdApplication::materialize(TEMPLATE.as_bytes(), &ApplicationOverrides::default())
                .unwrap_or_default();

        // execute:
        let yaml = application.to_yaml().unwrap_or_default();

        // verify:
        assert!(yaml.contains("apiVersion: argoproj.io/v1alpha1"));
        assert!(yaml.contains("repoURL:"));
        assert!(yaml.contains("example.com/charts"));
        assert!(yaml.contains("targetRevision:"));
        for absent in [
            "null",
            "kustomize",
            "directory",
            "plugin",
            "syncPolicy",
            "path:",
            "passCredentials",
            "valueFiles",
        ] {
            assert!(!yaml.contains(absent), "`{absent}` should be omitted:\n{yaml}");
        }
    }

    #[tokio::test]
    async fn sync_argocd_application_test() {
        // setup:
        let application =
            ArgocdApplication::materialize(TEMPLATE.as_bytes(), &ApplicationOverrides::default())
                .unwrap_or_default();
        let mut manifest_sync = MockManifestSync::new();
        manifest_sync
            .expect_sync()
            .withf(|name, manifest| {
                name.to_string() == "cluster-services"
                    && String::from_utf8_lossy(manifest).contains("kind: Application")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        // execute:
        let result =
            sync_argocd_application(&manifest_sync, "cluster-services", &application).await;

        // verify:
        assert!(result.is_ok());
    }
}
