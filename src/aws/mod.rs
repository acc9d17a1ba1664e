use crate::aws::eks::EksError;
use crate::aws::iam::IamError;
use aws_config::meta::region::RegionProviderChain;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use thiserror::Error;
use tracing::info;

pub mod eks;
pub mod iam;

const ASSUME_ROLE_SESSION_NAME: &str = "eks-platform-bootstrap";

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum AwsError {
    #[error("AWS error: cannot get login configuration")]
    ErrorCannotGetLoginConfiguration,
    #[error("AWS error: error with IAM: {underlying_error}")]
    IamError { underlying_error: IamError },
    #[error("AWS error: error with EKS: {underlying_error}")]
    EksError { underlying_error: EksError },
}

pub struct AwsSdkConfig {
    config: SdkConfig,
}

impl AwsSdkConfig {
    /// Loads credentials from the environment, optionally assuming `role_arn` on top of them.
    pub async fn new(
        region: Option<String>,
        role_arn: Option<&str>,
    ) -> Result<AwsSdkConfig, AwsError> {
        let region_provider =
            RegionProviderChain::first_try(region.map(Region::new)).or_default_provider();
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(region_provider)
            .load()
            .await;

        if config.credentials_provider().is_none() {
            return Err(AwsError::ErrorCannotGetLoginConfiguration);
        }

        match role_arn {
            Some(role_arn) => {
                info!("Assuming role `{role_arn}`");
                let provider = AssumeRoleProvider::builder(role_arn)
                    .session_name(ASSUME_ROLE_SESSION_NAME)
                    .configure(&config)
                    .build()
                    .await;
                let assumed_config = aws_config::defaults(BehaviorVersion::latest())
                    .region(config.region().cloned())
                    .credentials_provider(provider)
                    .load()
                    .await;
                Ok(AwsSdkConfig {
                    config: assumed_config,
                })
            }
            None => Ok(AwsSdkConfig { config }),
        }
    }
}
