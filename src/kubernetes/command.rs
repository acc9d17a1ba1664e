use crate::kubernetes::KubernetesError;
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs external tooling (`kubectl`, `helm`) and returns its stdout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, KubernetesError>;
}

#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner {
    kubeconfig: Option<String>,
}

impl ProcessCommandRunner {
    pub fn new(kubeconfig: Option<String>) -> Self {
        ProcessCommandRunner { kubeconfig }
    }
}

#[async_trait]
impl CommandRunner for ProcessCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<String, KubernetesError> {
        let command_line = format!("{program} {}", args.join(" "));
        let command_failed = |raw_message: String| KubernetesError::CommandFailed {
            command: Arc::from(command_line.as_str()),
            raw_message: Arc::from(raw_message),
        };

        debug!("Running `{command_line}`");
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // both kubectl and helm honor KUBECONFIG
        if let Some(kubeconfig) = &self.kubeconfig {
            command.env("KUBECONFIG", kubeconfig);
        }

        let mut child = command.spawn().map_err(|e| command_failed(e.to_string()))?;

        if let (Some(input), Some(mut child_stdin)) = (stdin, child.stdin.take()) {
            child_stdin
                .write_all(&input)
                .await
                .map_err(|e| command_failed(e.to_string()))?;
            // closing stdin so the child sees EOF
            drop(child_stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| command_failed(e.to_string()))?;

        if !output.status.success() {
            return Err(command_failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}
