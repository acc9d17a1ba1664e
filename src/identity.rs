use crate::aws::eks::EksService;
use crate::aws::iam::IamService;
use crate::aws::AwsError;
use crate::config::{ConfigurationError, NodeRoleSource};
use crate::kubernetes::IamArn;
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Path IAM Identity Center provisions its permission set roles under.
pub const SSO_ROLE_PATH_PREFIX: &str = "/aws-reserved/sso.amazonaws.com/";

#[derive(Error, Debug, Eq, PartialEq)]
pub enum IdentityError {
    #[error("Configuration error: {underlying_error}")]
    Configuration { underlying_error: ConfigurationError },
    #[error("Aws error: {underlying_error}")]
    Aws { underlying_error: AwsError },
    #[error("Node group IAM role auto discovery failed, cluster `{cluster_name}` has no node group")]
    NoNodeGroup { cluster_name: Arc<str> },
    #[error("Invalid SSO role pattern for permission set `{permission_set_name}`: {raw_message}")]
    InvalidSsoRolePattern {
        permission_set_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("SSO role auto discovery failed for permission set `{permission_set_name}`, discovered {discovered}")]
    SsoRoleDiscovery {
        permission_set_name: Arc<str>,
        discovered: usize,
    },
}

impl From<ConfigurationError> for IdentityError {
    fn from(underlying_error: ConfigurationError) -> Self {
        IdentityError::Configuration { underlying_error }
    }
}

impl From<AwsError> for IdentityError {
    fn from(underlying_error: AwsError) -> Self {
        IdentityError::Aws { underlying_error }
    }
}

/// Point in time lookups against the cloud provider.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    async fn node_group_names(&self, cluster_name: &str) -> Result<Vec<String>, AwsError>;

    async fn node_group_role(
        &self,
        cluster_name: &str,
        node_group_name: &str,
    ) -> Result<IamArn, AwsError>;

    async fn role_arns(&self, path_prefix: &str, name_regex: &Regex)
        -> Result<Vec<IamArn>, AwsError>;
}

pub struct AwsIdentityLookup {
    iam: IamService,
    eks: EksService,
}

impl AwsIdentityLookup {
    pub fn new(iam: IamService, eks: EksService) -> Self {
        AwsIdentityLookup { iam, eks }
    }
}

#[async_trait]
impl IdentityLookup for AwsIdentityLookup {
    async fn node_group_names(&self, cluster_name: &str) -> Result<Vec<String>, AwsError> {
        self.eks.list_node_groups(cluster_name).await
    }

    async fn node_group_role(
        &self,
        cluster_name: &str,
        node_group_name: &str,
    ) -> Result<IamArn, AwsError> {
        self.eks
            .get_node_group_role(cluster_name, node_group_name)
            .await
    }

    async fn role_arns(
        &self,
        path_prefix: &str,
        name_regex: &Regex,
    ) -> Result<Vec<IamArn>, AwsError> {
        self.iam.find_roles(path_prefix, name_regex).await
    }
}

pub struct IdentityResolver {
    lookup: Arc<dyn IdentityLookup>,
    sso_role_path_prefix: String,
}

impl IdentityResolver {
    pub fn new(lookup: Arc<dyn IdentityLookup>) -> Self {
        IdentityResolver {
            lookup,
            sso_role_path_prefix: SSO_ROLE_PATH_PREFIX.to_string(),
        }
    }

    pub fn with_sso_role_path_prefix(mut self, sso_role_path_prefix: &str) -> Self {
        self.sso_role_path_prefix = sso_role_path_prefix.to_string();
        self
    }

    pub async fn resolve_node_role(&self, source: &NodeRoleSource) -> Result<IamArn, IdentityError> {
        match source {
            NodeRoleSource::Explicit { role_arn } => Ok(role_arn.clone()),
            NodeRoleSource::AutoDiscover { cluster_name } => {
                self.resolve_node_group_role(cluster_name).await
            }
        }
    }

    /// Role of the first node group EKS lists. Node groups are assumed to share one role; when
    /// they don't, whichever comes first wins.
    pub async fn resolve_node_group_role(
        &self,
        cluster_name: &str,
    ) -> Result<IamArn, IdentityError> {
        let node_groups = self.lookup.node_group_names(cluster_name).await?;
        let first = node_groups
            .first()
            .ok_or_else(|| IdentityError::NoNodeGroup {
                cluster_name: Arc::from(cluster_name),
            })?;
        if node_groups.len() > 1 {
            warn!(
                "Cluster `{cluster_name}` has {} node groups, using the role of `{first}`",
                node_groups.len()
            );
        }

        let role_arn = self.lookup.node_group_role(cluster_name, first).await?;
        info!("Discovered node group IAM role `{role_arn}`");
        Ok(role_arn)
    }

    /// The one role IAM Identity Center created for `permission_set_name`. Zero or several
    /// candidates is an error.
    pub async fn resolve_sso_role(
        &self,
        permission_set_name: &str,
    ) -> Result<IamArn, IdentityError> {
        let name_regex = sso_role_name_regex(permission_set_name)?;
        let mut role_arns = self
            .lookup
            .role_arns(&self.sso_role_path_prefix, &name_regex)
            .await?;

        match role_arns.len() {
            1 => {
                let role_arn = role_arns.remove(0);
                info!("Discovered SSO role `{role_arn}` for permission set `{permission_set_name}`");
                Ok(role_arn)
            }
            discovered => Err(IdentityError::SsoRoleDiscovery {
                permission_set_name: Arc::from(permission_set_name),
                discovered,
            }),
        }
    }
}

fn sso_role_name_regex(permission_set_name: &str) -> Result<Regex, IdentityError> {
    Regex::new(&format!(
        "^AWSReservedSSO_{}_.*",
        regex::escape(permission_set_name)
    ))
    .map_err(|e| IdentityError::InvalidSsoRolePattern {
        permission_set_name: Arc::from(permission_set_name),
        raw_message: Arc::from(e.to_string()),
    })
}
