mod aws;
mod config;
mod errors;
mod identity;
mod infra;
mod kubernetes;
mod secrets;

use crate::aws::eks::EksService;
use crate::aws::iam::IamService;
use crate::aws::AwsSdkConfig;
use crate::config::StackConfig;
use crate::errors::Error;
use crate::identity::{AwsIdentityLookup, IdentityResolver};
use crate::infra::eks::EksPlanner;
use crate::infra::vpc::plan_vpc;
use crate::infra::ResourceGraph;
use crate::kubernetes::argocd::{
    ApplicationOverrides, ArgocdApplication, PLATFORM_APPLICATION_TEMPLATE,
};
use crate::kubernetes::bootstrap::{sync_auth_config_map, ClusterBootstrap};
use crate::kubernetes::command::{CommandRunner, ProcessCommandRunner};
use crate::kubernetes::manifest::{KubeManifestSync, ManifestSync, ScratchFileManifestSync};
use crate::secrets::Secrets;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task;
use tracing::{error, info, span, Instrument, Level};
use tracing_subscriber::{prelude::*, EnvFilter, FmtSubscriber};

const FIELD_MANAGER: &str = "eks-platform-bootstrap";

#[derive(ValueEnum, Clone, Copy, Debug, Default, Eq, PartialEq)]
enum ApplyMode {
    /// `kubectl apply -f` on a scratch file
    #[default]
    Kubectl,
    /// server side apply through the Kubernetes API
    ServerSide,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Builds the aws-auth config map from the `eks-auth` group and applies it
    SyncAuth,
    /// Installs monitoring, Argo CD and the platform application on the cluster
    Bootstrap,
    /// Prints the VPC resource graph
    PlanVpc,
    /// Prints the EKS resource graph, planned on top of the VPC when the `vpc` group is set
    PlanEks,
    /// Prints the platform Argo CD application
    RenderApplication,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    pub command: Command,
    #[arg(short = 'c', long, env = "STACK_CONFIG")]
    pub config: PathBuf,
    #[arg(short = 's', long, env = "STACK_NAME")]
    pub stack: String,
    #[arg(short = 'r', long, env = "AWS_REGION")]
    pub region: Option<String>,
    #[arg(short = 'R', long, env)]
    pub role_arn: Option<String>,
    #[arg(short = 'm', long, env, value_enum, default_value_t = ApplyMode::Kubectl)]
    pub apply_mode: ApplyMode,
    /// where manifests are staged for kubectl, defaults to the system temp directory
    #[arg(long, env)]
    pub scratch_dir: Option<PathBuf>,
    /// YAML map of `resource.property` outputs from a previous apply, substituted into plans
    #[arg(long, env)]
    pub known_outputs: Option<PathBuf>,
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

async fn identity_resolver(args: &Args) -> Result<IdentityResolver, Error> {
    let aws_config = AwsSdkConfig::new(args.region.clone(), args.role_arn.as_deref())
        .await
        .map_err(|e| Error::Aws {
            underlying_error: e,
        })?;

    Ok(IdentityResolver::new(Arc::new(AwsIdentityLookup::new(
        IamService::new(&aws_config),
        EksService::new(&aws_config),
    ))))
}

async fn manifest_sync(
    args: &Args,
    runner: Arc<dyn CommandRunner>,
) -> Result<Box<dyn ManifestSync>, Error> {
    match args.apply_mode {
        ApplyMode::Kubectl => Ok(Box::new(ScratchFileManifestSync::new(
            runner,
            args.scratch_dir.clone().unwrap_or_else(std::env::temp_dir),
        ))),
        ApplyMode::ServerSide => {
            let manifest_sync =
                KubeManifestSync::new(FIELD_MANAGER)
                    .await
                    .map_err(|e| Error::Kubernetes {
                        underlying_error: e,
                    })?;
            Ok(Box::new(manifest_sync))
        }
    }
}

fn render_application(stack_config: &StackConfig) -> Result<String, Error> {
    let platform_application =
        stack_config
            .require_platform_application()
            .map_err(|e| Error::Configuration {
                underlying_error: e,
            })?;
    let secrets = Secrets::from_stack(stack_config).map_err(|e| Error::Secret {
        underlying_error: e,
    })?;

    let mut overrides = ApplicationOverrides::from(platform_application);
    if let Some(values) = config::non_empty(&overrides.helm_values) {
        overrides.helm_values = Some(secrets.replace_secrets(values).map_err(|e| {
            Error::Secret {
                underlying_error: e,
            }
        })?);
    }

    ArgocdApplication::materialize(PLATFORM_APPLICATION_TEMPLATE, &overrides)
        .and_then(|application| application.to_yaml())
        .map_err(|e| Error::Kubernetes {
            underlying_error: e,
        })
}

fn plan(
    stack_name: &str,
    stack_config: &StackConfig,
    known_outputs: Option<&Path>,
    with_eks: bool,
) -> Result<String, Error> {
    let mut graph = ResourceGraph::new();

    // EKS plans on top of the VPC when both are configured
    let vpc_config = if with_eks {
        stack_config.vpc.as_ref()
    } else {
        Some(stack_config.require_vpc().map_err(|e| Error::Configuration {
            underlying_error: e,
        })?)
    };
    let vpc = vpc_config
        .map(|vpc_config| plan_vpc(&mut graph, stack_name, vpc_config))
        .transpose()
        .map_err(|e| Error::Infra {
            underlying_error: e,
        })?;

    if with_eks {
        let eks_config = stack_config.require_eks().map_err(|e| Error::Configuration {
            underlying_error: e,
        })?;
        let subnet_ids = match &vpc {
            Some(vpc) => vpc.private_subnet_ids(),
            None => eks_config.subnet_ids.clone(),
        };
        EksPlanner::new(stack_name)
            .plan(&mut graph, eks_config, &subnet_ids)
            .map_err(|e| Error::Infra {
                underlying_error: e,
            })?;
    }

    if let Some(path) = known_outputs {
        let known = config::known_outputs_from_file(path).map_err(|e| Error::Configuration {
            underlying_error: e,
        })?;
        graph.resolve(&known);
    }

    graph.to_yaml().map_err(|e| Error::Infra {
        underlying_error: e,
    })
}

async fn run(args: Args, stack_config: StackConfig) -> Result<(), Error> {
    let runner: Arc<dyn CommandRunner> =
        Arc::new(ProcessCommandRunner::new(args.kubeconfig.clone()));

    match args.command {
        Command::SyncAuth => {
            let eks_auth = stack_config.require_eks_auth().map_err(|e| Error::Configuration {
                underlying_error: e,
            })?;
            let resolver = identity_resolver(&args).await?;
            let manifest_sync = manifest_sync(&args, runner).await?;

            info!("Syncing aws-auth config map");
            sync_auth_config_map(&resolver, manifest_sync.as_ref(), eks_auth)
                .await
                .map_err(|e| Error::Bootstrap {
                    underlying_error: e,
                })?;
            info!("Syncing of aws-auth config map is done");
        }
        Command::Bootstrap => {
            let secrets = Secrets::from_stack(&stack_config).map_err(|e| Error::Secret {
                underlying_error: e,
            })?;
            let resolver = identity_resolver(&args).await?;
            let manifest_sync = manifest_sync(&args, runner.clone()).await?;

            ClusterBootstrap::new(
                &args.stack,
                &stack_config,
                &secrets,
                &resolver,
                manifest_sync.as_ref(),
                runner.as_ref(),
            )
            .run()
            .await
            .map_err(|e| Error::Bootstrap {
                underlying_error: e,
            })?;
        }
        Command::PlanVpc => print!(
            "{}",
            plan(&args.stack, &stack_config, args.known_outputs.as_deref(), false)?
        ),
        Command::PlanEks => print!(
            "{}",
            plan(&args.stack, &stack_config, args.known_outputs.as_deref(), true)?
        ),
        Command::RenderApplication => print!("{}", render_application(&stack_config)?),
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    // Init tracing subscriber
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .fmt_fields(
            tracing_subscriber::fmt::format::debug_fn(|writer, field, value| {
                write!(writer, "{field}: {value:?}")
            })
            .delimited(", "),
        )
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        Error::InitializationErrorCannotSetupTracing {
            underlying_error: e,
        }
    })?;

    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        error!("Cannot install the default TLS crypto provider: {e:?}");
    }

    let span = span!(Level::INFO, "main_span", stack = args.stack.as_str());
    let _enter = span.enter();

    let stack_config = StackConfig::from_file(&args.config).map_err(|e| Error::Configuration {
        underlying_error: e,
    })?;

    // a panicking command surfaces as an error instead of tearing the process down
    let command = task::spawn(run(args, stack_config).instrument(tracing::Span::current()));
    match command.await {
        Ok(result) => result.inspect_err(|e| error!("{e}")),
        Err(e) => {
            error!("Command panicked: {e}");
            Err(Error::Panicked {
                raw_message: Arc::from(e.to_string()),
            })
        }
    }
}
