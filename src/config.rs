use crate::kubernetes::argocd::SyncPolicy;
use crate::kubernetes::IamArn;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum ConfigurationError {
    #[error("Cannot read configuration file `{path}`: {raw_message}")]
    CannotReadFile {
        path: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Cannot parse configuration: {raw_message}")]
    CannotParse { raw_message: Arc<str> },
    #[error("Configuration group `{group}` is required")]
    MissingGroup { group: Arc<str> },
    #[error("Node Group IAM Role auto discover enabled, but EKS cluster name not supplied")]
    NodeGroupRoleAutoDiscoverWithoutClusterName,
    #[error("Node Group IAM Role not supplied, auto discover not enabled")]
    NodeGroupRoleNotSupplied,
    #[error("{kind} entry #{index} has an empty {field}")]
    EmptyIdentityField {
        kind: Arc<str>,
        index: usize,
        field: Arc<str>,
    },
    #[error("Availability zone #{index} is missing `{field}`")]
    IncompleteAvailabilityZone { index: usize, field: Arc<str> },
    #[error("EKS cluster has no subnets: configure the `vpc` group or `eks.subnet-ids`")]
    NoSubnets,
}

/// Where the worker node IAM role comes from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeRoleSource {
    AutoDiscover { cluster_name: String },
    Explicit { role_arn: IamArn },
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuthConfigMapInput {
    /// Disables all extra auth configuration so the existing config map can be imported without a
    /// diff. Set on new clusters, unset once imported.
    pub initial_import: bool,
    #[serde(rename = "nodegroup-iam-role")]
    pub node_group_iam_role: Option<String>,
    #[serde(rename = "nodegroup-iam-role-autodiscover")]
    pub node_group_iam_role_autodiscover: bool,
    pub eks_cluster_name: Option<String>,
    #[serde(rename = "sso-permission-set-roles")]
    pub sso_roles: Vec<SsoRolePermissionSetInput>,
    pub iam_roles: Vec<IamIdentityInput>,
    pub iam_users: Vec<IamIdentityInput>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SsoRolePermissionSetInput {
    pub name: String,
    pub permission_groups: Vec<String>,
    /// defaults to the permission set name
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IamIdentityInput {
    pub arn: String,
    pub permission_groups: Vec<String>,
    /// defaults to the last segment of the ARN
    #[serde(default)]
    pub username: Option<String>,
}

impl AuthConfigMapInput {
    pub fn node_role_source(&self) -> Result<NodeRoleSource, ConfigurationError> {
        if self.node_group_iam_role_autodiscover {
            return match non_empty(&self.eks_cluster_name) {
                Some(cluster_name) => Ok(NodeRoleSource::AutoDiscover {
                    cluster_name: cluster_name.to_string(),
                }),
                None => Err(ConfigurationError::NodeGroupRoleAutoDiscoverWithoutClusterName),
            };
        }

        match non_empty(&self.node_group_iam_role) {
            Some(role_arn) => Ok(NodeRoleSource::Explicit {
                role_arn: IamArn::new(role_arn),
            }),
            None => Err(ConfigurationError::NodeGroupRoleNotSupplied),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.node_role_source()?;

        for (index, sso_role) in self.sso_roles.iter().enumerate() {
            if sso_role.name.trim().is_empty() {
                return Err(ConfigurationError::EmptyIdentityField {
                    kind: Arc::from("sso-permission-set-roles"),
                    index,
                    field: Arc::from("name"),
                });
            }
        }
        for (kind, identities) in [("iam-roles", &self.iam_roles), ("iam-users", &self.iam_users)] {
            for (index, identity) in identities.iter().enumerate() {
                if identity.arn.trim().is_empty() {
                    return Err(ConfigurationError::EmptyIdentityField {
                        kind: Arc::from(kind),
                        index,
                        field: Arc::from("arn"),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HelmReleaseConfigInput {
    pub version: Option<String>,
    pub values_files: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct K8sPlatformConfigInput {
    #[serde(rename = "argocd-helm-release")]
    pub argocd_helm: HelmReleaseConfigInput,
    #[serde(rename = "kube-prometheus-stack-helm-release")]
    pub kube_prometheus_stack_helm: HelmReleaseConfigInput,
    #[serde(rename = "manage-eks-auth-configmap")]
    pub manage_eks_auth_config_map: bool,
    pub manage_prometheus_remote_write_basic_auth_secret: bool,
    /// defaults to the stack name
    pub prometheus_remote_write_basic_auth_username: Option<String>,
    /// defaults to `prometheus-remote-write-basic-auth`
    #[serde(rename = "prometheus-remote-write-basic-auth-secret-name")]
    pub prometheus_remote_write_secret_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PlatformApplicationConfig {
    pub enabled: bool,
    pub target_revision: Option<String>,
    pub sync_policy: Option<SyncPolicy>,
    pub values: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AvailabilityZoneInput {
    pub az_name: String,
    pub private_subnet_cidr: String,
    pub public_subnet_cidr: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VpcConfigInput {
    pub cidr: String,
    #[serde(default)]
    pub availability_zones: Vec<AvailabilityZoneInput>,
}

impl VpcConfigInput {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (index, az) in self.availability_zones.iter().enumerate() {
            for (field, value) in [
                ("az-name", &az.az_name),
                ("public-subnet-cidr", &az.public_subnet_cidr),
                ("private-subnet-cidr", &az.private_subnet_cidr),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigurationError::IncompleteAvailabilityZone {
                        index,
                        field: Arc::from(field),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeGroupConfigInput {
    pub name: String,
    pub desired_size: u32,
    pub max_size: u32,
    pub min_size: u32,
    #[serde(default)]
    pub instance_types: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EksConfigInput {
    pub k8s_version: String,
    /// lets node groups lag behind the control plane during upgrades, defaults to `k8s-version`
    #[serde(default, rename = "nodegroup-version")]
    pub node_group_version: Option<String>,
    #[serde(default)]
    pub node_groups: Vec<NodeGroupConfigInput>,
    #[serde(default, rename = "cluster-autoscaler-serviceaccount")]
    pub cluster_autoscaler_service_account: Option<String>,
    #[serde(default)]
    pub cluster_autoscaler_namespace: Option<String>,
    /// subnets of an existing VPC, used when the `vpc` group is not planned alongside
    #[serde(default)]
    pub subnet_ids: Vec<String>,
}

impl EksConfigInput {
    pub fn node_group_version(&self) -> &str {
        non_empty(&self.node_group_version).unwrap_or(self.k8s_version.as_str())
    }

    pub fn cluster_autoscaler_service_account(&self) -> &str {
        non_empty(&self.cluster_autoscaler_service_account).unwrap_or("cluster-autoscaler")
    }

    pub fn cluster_autoscaler_namespace(&self) -> &str {
        non_empty(&self.cluster_autoscaler_namespace).unwrap_or("cluster-autoscaler")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct StackConfig {
    pub vpc: Option<VpcConfigInput>,
    pub eks: Option<EksConfigInput>,
    pub eks_auth: Option<AuthConfigMapInput>,
    pub k8s: Option<K8sPlatformConfigInput>,
    pub platform_application: Option<PlatformApplicationConfig>,
    pub secret_provider: Option<String>,
    pub secrets: BTreeMap<String, String>,
}

/// Outputs of a previous apply keyed by `resource.property`, e.g.
/// `eks-oidc-provider.url: https://oidc.eks.us-east-2.amazonaws.com/id/ABC`.
pub fn known_outputs_from_file(
    path: &Path,
) -> Result<BTreeMap<String, String>, ConfigurationError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::CannotReadFile {
        path: Arc::from(path.display().to_string()),
        raw_message: Arc::from(e.to_string()),
    })?;
    known_outputs_from_yaml_str(&raw)
}

pub fn known_outputs_from_yaml_str(
    raw: &str,
) -> Result<BTreeMap<String, String>, ConfigurationError> {
    serde_yaml::from_str(raw).map_err(|e| ConfigurationError::CannotParse {
        raw_message: Arc::from(e.to_string()),
    })
}

impl StackConfig {
    pub fn from_file(path: &Path) -> Result<StackConfig, ConfigurationError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigurationError::CannotReadFile {
            path: Arc::from(path.display().to_string()),
            raw_message: Arc::from(e.to_string()),
        })?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(raw: &str) -> Result<StackConfig, ConfigurationError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigurationError::CannotParse {
            raw_message: Arc::from(e.to_string()),
        })
    }

    pub fn require_eks_auth(&self) -> Result<&AuthConfigMapInput, ConfigurationError> {
        self.eks_auth
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingGroup {
                group: Arc::from("eks-auth"),
            })
    }

    pub fn require_vpc(&self) -> Result<&VpcConfigInput, ConfigurationError> {
        self.vpc.as_ref().ok_or_else(|| ConfigurationError::MissingGroup {
            group: Arc::from("vpc"),
        })
    }

    pub fn require_eks(&self) -> Result<&EksConfigInput, ConfigurationError> {
        self.eks.as_ref().ok_or_else(|| ConfigurationError::MissingGroup {
            group: Arc::from("eks"),
        })
    }

    pub fn require_platform_application(
        &self,
    ) -> Result<&PlatformApplicationConfig, ConfigurationError> {
        self.platform_application
            .as_ref()
            .ok_or_else(|| ConfigurationError::MissingGroup {
                group: Arc::from("platform-application"),
            })
    }
}

/// Unset and empty strings are treated alike, the way stack files usually leave optional keys.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}
