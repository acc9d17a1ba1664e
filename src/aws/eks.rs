use crate::aws::{AwsError, AwsSdkConfig};
use crate::kubernetes::IamArn;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum EksError {
    #[error("Cannot list node groups of cluster `{cluster_name}`, error: {raw_message}")]
    CannotListNodeGroups {
        cluster_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Cannot describe node group `{node_group_name}` of cluster `{cluster_name}`, error: {raw_message}")]
    CannotDescribeNodeGroup {
        cluster_name: Arc<str>,
        node_group_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Node group `{node_group_name}` of cluster `{cluster_name}` has no node role")]
    NodeGroupWithoutRole {
        cluster_name: Arc<str>,
        node_group_name: Arc<str>,
    },
}

pub struct EksService {
    client: aws_sdk_eks::Client,
}

impl EksService {
    pub fn new(config: &AwsSdkConfig) -> Self {
        EksService {
            client: aws_sdk_eks::Client::new(&config.config),
        }
    }

    /// Node group names, in the order EKS returns them.
    pub async fn list_node_groups(&self, cluster_name: &str) -> Result<Vec<String>, AwsError> {
        let mut names = Vec::new();
        let mut node_groups = self
            .client
            .list_nodegroups()
            .cluster_name(cluster_name)
            .into_paginator()
            .items()
            .send();

        while let Some(name) = node_groups.next().await {
            names.push(name.map_err(|e| AwsError::EksError {
                underlying_error: EksError::CannotListNodeGroups {
                    cluster_name: Arc::from(cluster_name),
                    raw_message: Arc::from(e.to_string()),
                },
            })?);
        }

        Ok(names)
    }

    pub async fn get_node_group_role(
        &self,
        cluster_name: &str,
        node_group_name: &str,
    ) -> Result<IamArn, AwsError> {
        let output = self
            .client
            .describe_nodegroup()
            .cluster_name(cluster_name)
            .nodegroup_name(node_group_name)
            .send()
            .await
            .map_err(|e| AwsError::EksError {
                underlying_error: EksError::CannotDescribeNodeGroup {
                    cluster_name: Arc::from(cluster_name),
                    node_group_name: Arc::from(node_group_name),
                    raw_message: Arc::from(e.to_string()),
                },
            })?;

        output
            .nodegroup()
            .and_then(|n| n.node_role())
            .map(IamArn::new)
            .ok_or_else(|| AwsError::EksError {
                underlying_error: EksError::NodeGroupWithoutRole {
                    cluster_name: Arc::from(cluster_name),
                    node_group_name: Arc::from(node_group_name),
                },
            })
    }
}
