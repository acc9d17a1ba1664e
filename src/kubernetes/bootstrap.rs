use crate::config::{non_empty, AuthConfigMapInput, ConfigurationError, StackConfig};
use crate::identity::{IdentityError, IdentityResolver};
use crate::kubernetes::argocd::{
    sync_argocd_application, ApplicationOverrides, ArgocdApplication,
    PLATFORM_APPLICATION_TEMPLATE,
};
use crate::kubernetes::aws_auth::AwsAuth;
use crate::kubernetes::command::CommandRunner;
use crate::kubernetes::helm::{HelmRelease, KUBE_PROMETHEUS_STACK_NAMESPACE};
use crate::kubernetes::manifest::ManifestSync;
use crate::kubernetes::KubernetesError;
use crate::secrets::{SecretError, Secrets};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

pub const AWS_AUTH_RESOURCE_NAME: &str = "aws-auth-configmap";
pub const PLATFORM_APPLICATION_RESOURCE_NAME: &str = "cluster-services";
pub const PROMETHEUS_REMOTE_WRITE_RESOURCE_NAME: &str = "prometheus-remote-write-basic-auth-secret";
pub const CERT_MANAGER_DNS_SOLVER_RESOURCE_NAME: &str = "cert-manager-cloudflare-api-token-secret";

const PROMETHEUS_REMOTE_WRITE_SECRET_NAME: &str = "prometheus-remote-write-basic-auth";
const PROMETHEUS_REMOTE_WRITE_PASSWORD_KEY: &str = "prometheusRemoteWriteBasicAuthPassword";
const HELM_REPO_PAT_KEY: &str = "helmRepoPat";
const CLOUDFLARE_API_TOKEN_KEY: &str = "cloudflareApiToken";

#[derive(Error, Debug, Eq, PartialEq)]
pub enum BootstrapError {
    #[error("Configuration error: {underlying_error}")]
    Configuration { underlying_error: ConfigurationError },
    #[error("Identity error: {underlying_error}")]
    Identity { underlying_error: IdentityError },
    #[error("Kubernetes error: {underlying_error}")]
    Kubernetes { underlying_error: KubernetesError },
    #[error("Secret error: {underlying_error}")]
    Secret { underlying_error: SecretError },
}

impl From<ConfigurationError> for BootstrapError {
    fn from(underlying_error: ConfigurationError) -> Self {
        BootstrapError::Configuration { underlying_error }
    }
}

impl From<IdentityError> for BootstrapError {
    fn from(underlying_error: IdentityError) -> Self {
        BootstrapError::Identity { underlying_error }
    }
}

impl From<KubernetesError> for BootstrapError {
    fn from(underlying_error: KubernetesError) -> Self {
        BootstrapError::Kubernetes { underlying_error }
    }
}

impl From<SecretError> for BootstrapError {
    fn from(underlying_error: SecretError) -> Self {
        BootstrapError::Secret { underlying_error }
    }
}

/// Resolves every identity of `input`, then applies the resulting aws-auth config map.
pub async fn sync_auth_config_map(
    resolver: &IdentityResolver,
    manifest_sync: &dyn ManifestSync,
    input: &AuthConfigMapInput,
) -> Result<(), BootstrapError> {
    let aws_auth = AwsAuth::resolve(input, resolver)
        .await
        .inspect_err(|e| error!("error building aws-auth config map: {e}"))?;
    let manifest = aws_auth.to_manifest()?;

    info!(
        "Syncing aws-auth config map with {} role(s) and {} user(s)",
        aws_auth.roles.len(),
        aws_auth.users.len()
    );
    manifest_sync
        .sync(AWS_AUTH_RESOURCE_NAME, manifest.as_bytes())
        .await?;
    Ok(())
}

fn secret_manifest(
    name: &str,
    namespace: &str,
    string_data: BTreeMap<String, String>,
    type_: Option<&str>,
) -> Result<String, KubernetesError> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some(string_data),
        type_: type_.map(|t| t.to_string()),
        ..Default::default()
    };

    serde_yaml::to_string(&secret).map_err(|e| KubernetesError::CannotSerialize {
        what: Arc::from(name),
        raw_message: Arc::from(e.to_string()),
    })
}

/// Installs the platform on a fresh cluster. Each step only runs once the previous one succeeded.
pub struct ClusterBootstrap<'a> {
    stack_name: &'a str,
    config: &'a StackConfig,
    secrets: &'a Secrets,
    resolver: &'a IdentityResolver,
    manifest_sync: &'a dyn ManifestSync,
    runner: &'a dyn CommandRunner,
}

impl<'a> ClusterBootstrap<'a> {
    pub fn new(
        stack_name: &'a str,
        config: &'a StackConfig,
        secrets: &'a Secrets,
        resolver: &'a IdentityResolver,
        manifest_sync: &'a dyn ManifestSync,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        ClusterBootstrap {
            stack_name,
            config,
            secrets,
            resolver,
            manifest_sync,
            runner,
        }
    }

    pub async fn run(&self) -> Result<(), BootstrapError> {
        let k8s = self.config.k8s.clone().unwrap_or_default();

        if k8s.manage_eks_auth_config_map {
            let eks_auth = self.config.require_eks_auth()?;
            sync_auth_config_map(self.resolver, self.manifest_sync, eks_auth).await?;
        }

        if k8s.manage_prometheus_remote_write_basic_auth_secret {
            self.deploy_prometheus_remote_write_basic_auth_secret(
                non_empty(&k8s.prometheus_remote_write_basic_auth_username),
                non_empty(&k8s.prometheus_remote_write_secret_name),
            )
            .await
            .inspect_err(|e| {
                error!("error deploying kube-prometheus-stack remote-write basic auth secret: {e}")
            })?;
        }

        // argo-cd installs service monitors, so kube-prometheus-stack goes first
        HelmRelease::kube_prometheus_stack(&k8s.kube_prometheus_stack_helm)
            .install(self.runner)
            .await?;

        let helm_repo_pat = self.secrets.require(HELM_REPO_PAT_KEY)?;
        HelmRelease::argo_cd(&k8s.argocd_helm, &helm_repo_pat)
            .install(self.runner)
            .await?;

        self.deploy_platform_application()
            .await
            .inspect_err(|e| error!("error deploying cluster application manifest: {e}"))?;

        self.deploy_cert_manager_dns_solver_secret()
            .await
            .inspect_err(|e| error!("error deploying cert manager dns solver secret: {e}"))?;

        info!("Cluster bootstrap of stack `{}` is done", self.stack_name);
        Ok(())
    }

    async fn deploy_prometheus_remote_write_basic_auth_secret(
        &self,
        username: Option<&str>,
        secret_name: Option<&str>,
    ) -> Result<(), BootstrapError> {
        let password = self.secrets.require(PROMETHEUS_REMOTE_WRITE_PASSWORD_KEY)?;
        let manifest = secret_manifest(
            secret_name.unwrap_or(PROMETHEUS_REMOTE_WRITE_SECRET_NAME),
            KUBE_PROMETHEUS_STACK_NAMESPACE,
            BTreeMap::from_iter(vec![
                (
                    "username".to_string(),
                    username.unwrap_or(self.stack_name).to_string(),
                ),
                ("password".to_string(), password),
            ]),
            None,
        )?;

        self.manifest_sync
            .sync(PROMETHEUS_REMOTE_WRITE_RESOURCE_NAME, manifest.as_bytes())
            .await?;
        Ok(())
    }

    async fn deploy_platform_application(&self) -> Result<(), BootstrapError> {
        let platform_application = match &self.config.platform_application {
            Some(platform_application) if platform_application.enabled => platform_application,
            _ => {
                info!("Platform application disabled, skipping");
                return Ok(());
            }
        };

        let mut overrides = ApplicationOverrides::from(platform_application);
        if let Some(values) = non_empty(&overrides.helm_values) {
            overrides.helm_values = Some(self.secrets.replace_secrets(values)?);
        }
        let application = ArgocdApplication::materialize(PLATFORM_APPLICATION_TEMPLATE, &overrides)?;

        sync_argocd_application(
            self.manifest_sync,
            PLATFORM_APPLICATION_RESOURCE_NAME,
            &application,
        )
        .await?;
        Ok(())
    }

    async fn deploy_cert_manager_dns_solver_secret(&self) -> Result<(), BootstrapError> {
        let api_token = self.secrets.require(CLOUDFLARE_API_TOKEN_KEY)?;
        let manifest = secret_manifest(
            "cloudflare-api-token-secret",
            "cert-manager",
            BTreeMap::from_iter(vec![("api-token".to_string(), api_token)]),
            Some("Opaque"),
        )?;

        self.manifest_sync
            .sync(CERT_MANAGER_DNS_SOLVER_RESOURCE_NAME, manifest.as_bytes())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{ConfigurationError, StackConfig};
    use crate::identity::{IdentityResolver, MockIdentityLookup};
    use crate::kubernetes::bootstrap::{
        sync_auth_config_map, BootstrapError, ClusterBootstrap, AWS_AUTH_RESOURCE_NAME,
        CERT_MANAGER_DNS_SOLVER_RESOURCE_NAME, PLATFORM_APPLICATION_RESOURCE_NAME,
        PROMETHEUS_REMOTE_WRITE_RESOURCE_NAME,
    };
    use crate::kubernetes::command::MockCommandRunner;
    use crate::kubernetes::manifest::MockManifestSync;
    use crate::kubernetes::KubernetesError;
    use crate::secrets::{SecretError, Secrets};
    use k8s_openapi::api::core::v1::Secret;
    use mockall::Sequence;
    use std::sync::Arc;

    const FULL_STACK: &str = r#"
eks-auth:
  nodegroup-iam-role: arn:aws:iam::123:role/eks-nodes
  iam-users:
    - arn: arn:aws:iam::123:user/alice
      permission-groups: [viewers]
k8s:
  manage-eks-auth-configmap: true
  manage-prometheus-remote-write-basic-auth-secret: true
platform-application:
  enabled: true
  target-revision: v1.0.0
  values: |
    token: <<cloudflareApiToken>>
secrets:
  helmRepoPat: pat
  prometheusRemoteWriteBasicAuthPassword: prom-password
  cloudflareApiToken: cf-token
"#;

    const MINIMAL_STACK: &str = r#"
secrets:
  helmRepoPat: pat
  cloudflareApiToken: cf-token
"#;

    fn stack(raw: &str) -> StackConfig {
        StackConfig::from_yaml_str(raw).unwrap_or_default()
    }

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(Arc::new(MockIdentityLookup::new()))
    }

    fn parse_secret(manifest: &[u8]) -> Secret {
        serde_yaml::from_slice(manifest).unwrap_or_default()
    }

    #[tokio::test]
    async fn bootstrap_full_stack_runs_every_step_in_order_test() {
        // setup:
        let config = stack(FULL_STACK);
        let secrets = Secrets::from_stack(&config).unwrap_or_else(|_| unreachable!());
        let resolver = resolver();
        let mut seq = Sequence::new();
        let mut manifest_sync = MockManifestSync::new();
        let mut runner = MockCommandRunner::new();

        manifest_sync
            .expect_sync()
            .withf(|name, manifest| {
                name.to_string() == AWS_AUTH_RESOURCE_NAME
                    && String::from_utf8_lossy(manifest).contains("mapUsers")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        manifest_sync
            .expect_sync()
            .withf(|name, manifest| {
                let secret = parse_secret(manifest);
                let data = secret.string_data.unwrap_or_default();
                name.to_string() == PROMETHEUS_REMOTE_WRITE_RESOURCE_NAME
                    && secret.metadata.name.as_deref() == Some("prometheus-remote-write-basic-auth")
                    && secret.metadata.namespace.as_deref() == Some("kube-prometheus-stack")
                    && data.get("username").map(|s| s.as_str()) == Some("staging")
                    && data.get("password").map(|s| s.as_str()) == Some("prom-password")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        runner
            .expect_run()
            .withf(|program, args, _| {
                program.to_string() == "helm" && args[2] == "kube-prometheus-stack"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(String::new()));
        runner
            .expect_run()
            .withf(|program, args, _| program.to_string() == "helm" && args[2] == "argo-cd")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(String::new()));
        manifest_sync
            .expect_sync()
            .withf(|name, manifest| {
                let manifest = String::from_utf8_lossy(manifest);
                name.to_string() == PLATFORM_APPLICATION_RESOURCE_NAME
                    && manifest.contains("token: cf-token")
                    && manifest.contains("v1.0.0")
                    && !manifest.contains("<<")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        manifest_sync
            .expect_sync()
            .withf(|name, manifest| {
                let secret = parse_secret(manifest);
                name.to_string() == CERT_MANAGER_DNS_SOLVER_RESOURCE_NAME
                    && secret.metadata.name.as_deref() == Some("cloudflare-api-token-secret")
                    && secret.metadata.namespace.as_deref() == Some("cert-manager")
                    && secret.type_.as_deref() == Some("Opaque")
                    && secret
                        .string_data
                        .unwrap_or_default()
                        .get("api-token")
                        .map(|s| s.as_str())
                        == Some("cf-token")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        // execute:
        let result = ClusterBootstrap::new(
            "staging",
            &config,
            &secrets,
            &resolver,
            &manifest_sync,
            &runner,
        )
        .run()
        .await;

        // verify:
        assert_eq!(Ok(()), result);
    }

    #[tokio::test]
    async fn bootstrap_minimal_stack_test() {
        // setup:
        let config = stack(MINIMAL_STACK);
        let secrets = Secrets::from_stack(&config).unwrap_or_else(|_| unreachable!());
        let resolver = resolver();
        let mut manifest_sync = MockManifestSync::new();
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(2)
            .returning(|_, _, _| Ok(String::new()));
        manifest_sync
            .expect_sync()
            .withf(|name, _| name.to_string() == CERT_MANAGER_DNS_SOLVER_RESOURCE_NAME)
            .times(1)
            .returning(|_, _| Ok(()));

        // execute:
        let result = ClusterBootstrap::new(
            "staging",
            &config,
            &secrets,
            &resolver,
            &manifest_sync,
            &runner,
        )
        .run()
        .await;

        // verify:
        assert_eq!(Ok(()), result);
    }

    #[tokio::test]
    async fn bootstrap_stops_at_first_failure_test() {
        // setup:
        let config = stack(MINIMAL_STACK);
        let secrets = Secrets::from_stack(&config).unwrap_or_else(|_| unreachable!());
        let resolver = resolver();
        let mut manifest_sync = MockManifestSync::new();
        manifest_sync.expect_sync().times(0);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(1).returning(|_, _, _| {
            Err(KubernetesError::CommandFailed {
                command: Arc::from("helm"),
                raw_message: Arc::from("boom"),
            })
        });

        // execute:
        let result = ClusterBootstrap::new(
            "staging",
            &config,
            &secrets,
            &resolver,
            &manifest_sync,
            &runner,
        )
        .run()
        .await;

        // verify:
        assert!(matches!(
            result,
            Err(BootstrapError::Kubernetes {
                underlying_error: KubernetesError::CannotInstallHelmRelease { .. }
            })
        ));
    }

    #[tokio::test]
    async fn bootstrap_missing_secret_test() {
        // setup:
        let config = stack("secrets:\n  cloudflareApiToken: cf-token\n");
        let secrets = Secrets::from_stack(&config).unwrap_or_else(|_| unreachable!());
        let resolver = resolver();
        let mut manifest_sync = MockManifestSync::new();
        manifest_sync.expect_sync().times(0);
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .times(1)
            .returning(|_, _, _| Ok(String::new()));

        // execute:
        let result = ClusterBootstrap::new(
            "staging",
            &config,
            &secrets,
            &resolver,
            &manifest_sync,
            &runner,
        )
        .run()
        .await;

        // verify:
        assert_eq!(
            Err(BootstrapError::Secret {
                underlying_error: SecretError::MissingSecret {
                    key: Arc::from("helmRepoPat")
                }
            }),
            result
        );
    }

    #[tokio::test]
    async fn bootstrap_managed_auth_without_eks_auth_group_test() {
        // setup:
        let config = stack("k8s:\n  manage-eks-auth-configmap: true\n");
        let secrets = Secrets::from_stack(&config).unwrap_or_else(|_| unreachable!());
        let resolver = resolver();
        let mut manifest_sync = MockManifestSync::new();
        manifest_sync.expect_sync().times(0);
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(0);

        // execute:
        let result = ClusterBootstrap::new(
            "staging",
            &config,
            &secrets,
            &resolver,
            &manifest_sync,
            &runner,
        )
        .run()
        .await;

        // verify:
        assert_eq!(
            Err(BootstrapError::Configuration {
                underlying_error: ConfigurationError::MissingGroup {
                    group: Arc::from("eks-auth")
                }
            }),
            result
        );
    }

    #[tokio::test]
    async fn sync_auth_config_map_propagates_apply_failure_test() {
        // setup:
        let config = stack(FULL_STACK);
        let resolver = resolver();
        let mut manifest_sync = MockManifestSync::new();
        manifest_sync.expect_sync().times(1).returning(|name, _| {
            Err(KubernetesError::CannotApplyManifest {
                resource_name: Arc::from(name),
                raw_message: Arc::from("forbidden"),
            })
        });

        // execute:
        let result = sync_auth_config_map(
            &resolver,
            &manifest_sync,
            config.eks_auth.as_ref().unwrap_or_else(|| unreachable!()),
        )
        .await;

        // verify:
        assert_eq!(
            Err(BootstrapError::Kubernetes {
                underlying_error: KubernetesError::CannotApplyManifest {
                    resource_name: Arc::from(AWS_AUTH_RESOURCE_NAME),
                    raw_message: Arc::from("forbidden"),
                }
            }),
            result
        );
    }
}
