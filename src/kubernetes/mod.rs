use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;

pub mod argocd;
pub mod arn;
pub mod aws_auth;
pub mod bootstrap;
pub mod command;
pub mod helm;
pub mod manifest;

#[derive(Error, Debug, Eq, PartialEq)]
pub enum KubernetesError {
    #[error("Cluster not reachable: {raw_message}")]
    ClusterUnreachable { raw_message: Arc<str> },
    #[error("Error while trying to serialize `{what}` to YAML: {raw_message}")]
    CannotSerialize {
        what: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Error while trying to parse manifest `{resource_name}`: {raw_message}")]
    CannotParseManifest {
        resource_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Cannot write manifest `{resource_name}` to scratch file: {raw_message}")]
    CannotWriteScratchFile {
        resource_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Cannot apply manifest `{resource_name}`: {raw_message}")]
    CannotApplyManifest {
        resource_name: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Command `{command}` failed: {raw_message}")]
    CommandFailed {
        command: Arc<str>,
        raw_message: Arc<str>,
    },
    #[error("Cannot install helm release `{release_name}`: {raw_message}")]
    CannotInstallHelmRelease {
        release_name: Arc<str>,
        raw_message: Arc<str>,
    },
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IamArn(String);

impl IamArn {
    pub fn new(arn: &str) -> Self {
        IamArn(arn.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for IamArn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubernetesGroupName(String);

impl KubernetesGroupName {
    pub fn new(group_name: &str) -> Self {
        KubernetesGroupName(group_name.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for KubernetesGroupName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KubernetesUserName(String);

impl KubernetesUserName {
    pub fn new(user_name: &str) -> Self {
        KubernetesUserName(user_name.to_string())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for KubernetesUserName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0.as_str())
    }
}
