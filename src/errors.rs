use crate::aws::AwsError;
use crate::config::ConfigurationError;
use crate::infra::InfraError;
use crate::kubernetes::bootstrap::BootstrapError;
use crate::kubernetes::KubernetesError;
use crate::secrets::SecretError;
use std::sync::Arc;
use thiserror::Error;
use tracing::subscriber::SetGlobalDefaultError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Initialization error, cannot setup tracing: {underlying_error}")]
    InitializationErrorCannotSetupTracing { underlying_error: SetGlobalDefaultError },
    #[error("Configuration error: {underlying_error}")]
    Configuration { underlying_error: ConfigurationError },
    #[error("Aws error: {underlying_error}")]
    Aws { underlying_error: AwsError },
    #[error("Kubernetes error: {underlying_error}")]
    Kubernetes { underlying_error: KubernetesError },
    #[error("Secret error: {underlying_error}")]
    Secret { underlying_error: SecretError },
    #[error("Infrastructure planning error: {underlying_error}")]
    Infra { underlying_error: InfraError },
    #[error("Cluster bootstrap error: {underlying_error}")]
    Bootstrap { underlying_error: BootstrapError },
    #[error("Command panicked: {raw_message}")]
    Panicked { raw_message: Arc<str> },
}
