use crate::config::{non_empty, StackConfig};
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static PLACEHOLDER: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"<<([^<>]+)>>"));

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum SecretError {
    #[error("Unknown secret provider `{provider}`, please use one of ['config', 'aws', 'gcp']")]
    UnknownProvider { provider: Arc<str> },
    #[error("Secret provider `{provider}` is not yet implemented")]
    ProviderNotImplemented { provider: SecretProvider },
    #[error("Missing required secret `{key}`")]
    MissingSecret { key: Arc<str> },
    #[error("Invalid secret placeholder pattern: {raw_message}")]
    InvalidPattern { raw_message: Arc<str> },
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SecretProvider {
    /// `secrets` group of the stack file
    #[default]
    Config,
    Aws,
    Gcp,
}

impl Display for SecretProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SecretProvider::Config => "config",
            SecretProvider::Aws => "aws",
            SecretProvider::Gcp => "gcp",
        })
    }
}

impl FromStr for SecretProvider {
    type Err = SecretError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(SecretProvider::Config),
            "aws" => Ok(SecretProvider::Aws),
            "gcp" => Ok(SecretProvider::Gcp),
            _ => Err(SecretError::UnknownProvider {
                provider: Arc::from(s),
            }),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> Option<String>;
}

/// Secrets held in the stack file.
pub struct ConfigSecretStore {
    secrets: BTreeMap<String, String>,
}

impl ConfigSecretStore {
    pub fn new(secrets: BTreeMap<String, String>) -> Self {
        ConfigSecretStore { secrets }
    }
}

impl SecretStore for ConfigSecretStore {
    fn get_secret(&self, key: &str) -> Option<String> {
        self.secrets.get(key).cloned()
    }
}

/// Secrets resolved through the provider a stack selected.
pub struct Secrets {
    provider: SecretProvider,
    store: Box<dyn SecretStore>,
}

impl Secrets {
    pub fn new(provider: SecretProvider, store: Box<dyn SecretStore>) -> Self {
        Secrets { provider, store }
    }

    /// Provider named by `secret-provider` (default `config`) over the stack `secrets` group.
    pub fn from_stack(config: &StackConfig) -> Result<Secrets, SecretError> {
        let provider = match non_empty(&config.secret_provider) {
            Some(provider) => SecretProvider::from_str(provider)?,
            None => SecretProvider::default(),
        };
        Ok(Secrets::new(
            provider,
            Box::new(ConfigSecretStore::new(config.secrets.clone())),
        ))
    }

    /// Only the stack file backs secrets for now.
    fn active_store(&self) -> Result<&dyn SecretStore, SecretError> {
        match self.provider {
            SecretProvider::Config => Ok(&*self.store),
            provider => Err(SecretError::ProviderNotImplemented { provider }),
        }
    }

    pub fn require(&self, key: &str) -> Result<String, SecretError> {
        self.active_store()?
            .get_secret(key)
            .ok_or_else(|| SecretError::MissingSecret {
                key: Arc::from(key),
            })
    }

    /// Replaces every `<<key>>` in `source` with the secret named `key`. Fails on providers that
    /// are not implemented, even when `source` holds no placeholder.
    pub fn replace_secrets(&self, source: &str) -> Result<String, SecretError> {
        self.active_store()?;
        let placeholder = PLACEHOLDER
            .as_ref()
            .map_err(|e| SecretError::InvalidPattern {
                raw_message: Arc::from(e.to_string()),
            })?;

        let mut missing = None;
        let replaced = placeholder.replace_all(source, |captures: &Captures| {
            match self.require(captures[1].trim()) {
                Ok(value) => value,
                Err(e) => {
                    missing.get_or_insert(e);
                    String::new()
                }
            }
        });

        match missing {
            Some(e) => Err(e),
            None => Ok(replaced.into_owned()),
        }
    }
}
