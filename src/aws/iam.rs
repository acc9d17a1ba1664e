use crate::aws::{AwsError, AwsSdkConfig};
use crate::kubernetes::IamArn;
use regex::Regex;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum IamError {
    #[error("Cannot list roles under path `{path_prefix}`, error: {raw_message}")]
    CannotListRoles {
        path_prefix: Arc<str>,
        raw_message: Arc<str>,
    },
}

pub struct IamService {
    client: aws_sdk_iam::Client,
}

impl IamService {
    pub fn new(config: &AwsSdkConfig) -> Self {
        IamService {
            client: aws_sdk_iam::Client::new(&config.config),
        }
    }

    /// ARNs of every role under `path_prefix` whose name matches `name_regex`.
    pub async fn find_roles(
        &self,
        path_prefix: &str,
        name_regex: &Regex,
    ) -> Result<Vec<IamArn>, AwsError> {
        let mut matching_roles = Vec::new();
        let mut roles = self
            .client
            .list_roles()
            .path_prefix(path_prefix)
            .into_paginator()
            .items()
            .send();

        while let Some(role) = roles.next().await {
            let role = role.map_err(|e| AwsError::IamError {
                underlying_error: IamError::CannotListRoles {
                    path_prefix: Arc::from(path_prefix),
                    raw_message: Arc::from(e.to_string()),
                },
            })?;

            if name_regex.is_match(role.role_name()) {
                debug!("Role `{}` matches `{name_regex}`", role.role_name());
                matching_roles.push(IamArn::new(role.arn()));
            }
        }

        Ok(matching_roles)
    }
}
