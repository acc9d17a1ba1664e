use crate::config::{non_empty, HelmReleaseConfigInput};
use crate::kubernetes::command::CommandRunner;
use crate::kubernetes::KubernetesError;
use serde_yaml::{Mapping, Value};
use std::sync::Arc;
use tracing::{error, info};

pub const KUBE_PROMETHEUS_STACK_VERSION: &str = "33.1.0";
pub const KUBE_PROMETHEUS_STACK_VALUES_FILE: &str = "./helm-values/prometheus-values.yaml";
pub const KUBE_PROMETHEUS_STACK_NAMESPACE: &str = "kube-prometheus-stack";
const PROMETHEUS_COMMUNITY_REPO: &str = "https://prometheus-community.github.io/helm-charts";

pub const ARGO_CD_VERSION: &str = "3.33.8";
pub const ARGO_CD_VALUES_FILE: &str = "./helm-values/argo-cd-values.yaml";
const ARGO_HELM_REPO: &str = "https://argoproj.github.io/argo-helm";
const PLATFORM_CHARTS_REPO: &str = "https://raw.githubusercontent.com/catalystsquad/charts/main";

#[derive(Clone, Debug, PartialEq)]
pub struct HelmRelease {
    pub name: String,
    pub chart: String,
    pub namespace: String,
    pub version: String,
    pub repo: String,
    pub values_files: Vec<String>,
    /// passed on stdin, after the values files so it wins over them
    pub values: Option<Value>,
}

impl HelmRelease {
    pub fn kube_prometheus_stack(input: &HelmReleaseConfigInput) -> HelmRelease {
        HelmRelease {
            name: "kube-prometheus-stack".to_string(),
            chart: "kube-prometheus-stack".to_string(),
            namespace: KUBE_PROMETHEUS_STACK_NAMESPACE.to_string(),
            version: non_empty(&input.version)
                .unwrap_or(KUBE_PROMETHEUS_STACK_VERSION)
                .to_string(),
            repo: PROMETHEUS_COMMUNITY_REPO.to_string(),
            values_files: values_files_or(input, KUBE_PROMETHEUS_STACK_VALUES_FILE),
            values: None,
        }
    }

    /// Argo CD, allowed to pull from the private platform chart repository with `helm_repo_pat`.
    pub fn argo_cd(input: &HelmReleaseConfigInput, helm_repo_pat: &str) -> HelmRelease {
        let mut repository = Mapping::new();
        repository.insert("name".into(), "Platform Github Helm Repository".into());
        repository.insert("type".into(), "helm".into());
        repository.insert("url".into(), PLATFORM_CHARTS_REPO.into());
        repository.insert("username".into(), helm_repo_pat.into());
        repository.insert("password".into(), helm_repo_pat.into());

        let mut repositories = Mapping::new();
        repositories.insert("platform-helm".into(), Value::Mapping(repository));
        let mut configs = Mapping::new();
        configs.insert("repositories".into(), Value::Mapping(repositories));
        let mut values = Mapping::new();
        values.insert("configs".into(), Value::Mapping(configs));

        HelmRelease {
            name: "argo-cd".to_string(),
            chart: "argo-cd".to_string(),
            namespace: "argo-cd".to_string(),
            version: non_empty(&input.version)
                .unwrap_or(ARGO_CD_VERSION)
                .to_string(),
            repo: ARGO_HELM_REPO.to_string(),
            values_files: values_files_or(input, ARGO_CD_VALUES_FILE),
            values: Some(Value::Mapping(values)),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "upgrade",
            "--install",
            self.name.as_str(),
            self.chart.as_str(),
            "--repo",
            self.repo.as_str(),
            "--version",
            self.version.as_str(),
            "--namespace",
            self.namespace.as_str(),
            "--create-namespace",
            "--wait",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        for values_file in &self.values_files {
            args.push("-f".to_string());
            args.push(values_file.to_string());
        }
        if self.values.is_some() {
            args.push("-f".to_string());
            args.push("-".to_string());
        }

        args
    }

    pub async fn install(&self, runner: &dyn CommandRunner) -> Result<(), KubernetesError> {
        let stdin = match &self.values {
            Some(values) => Some(
                serde_yaml::to_string(values)
                    .map_err(|e| KubernetesError::CannotSerialize {
                        what: Arc::from(format!("{} helm values", self.name)),
                        raw_message: Arc::from(e.to_string()),
                    })?
                    .into_bytes(),
            ),
            None => None,
        };

        info!(
            "Installing helm release `{}` ({} {}) in namespace `{}`",
            self.name, self.chart, self.version, self.namespace
        );
        runner
            .run("helm", &self.args(), stdin)
            .await
            .map_err(|e| {
                error!("error deploying {}: {e}", self.name);
                KubernetesError::CannotInstallHelmRelease {
                    release_name: Arc::from(self.name.as_str()),
                    raw_message: Arc::from(e.to_string()),
                }
            })?;

        Ok(())
    }
}

fn values_files_or(input: &HelmReleaseConfigInput, default_values_file: &str) -> Vec<String> {
    if input.values_files.is_empty() {
        vec![default_values_file.to_string()]
    } else {
        input.values_files.clone()
    }
}
