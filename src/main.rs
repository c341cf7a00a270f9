//! iam-role-operator - reconciles IamRole resources against AWS IAM

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use iam_role_operator::config::{OperatorArgs, OperatorConfig};
use iam_role_operator::controller::{error_policy, reconcile, Context, CONTROLLER_NAME};
use iam_role_operator::crd::IamRole;
use iam_role_operator::iam::AwsIamGateway;
use iam_role_operator::telemetry::init_logging;

/// iam-role-operator - AWS IAM roles for Kubernetes ServiceAccounts
#[derive(Parser, Debug)]
#[command(name = "iam-role-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    args: OperatorArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&IamRole::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_logging(cli.args.log_format)?;
    run_controller(cli.args).await
}

/// Install or update the IamRole CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(CONTROLLER_NAME).force();

    tracing::info!("Installing IamRole CRD...");
    crds.patch(
        "iamroles.iam.iclinic.com.br",
        &params,
        &Patch::Apply(&IamRole::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install IamRole CRD: {}", e))?;

    Ok(())
}

async fn run_controller(args: OperatorArgs) -> anyhow::Result<()> {
    let config = OperatorConfig::try_from(args)?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let iam = AwsIamGateway::from_env(config.aws_region.clone(), config.iam_call_timeout).await;
    let ctx = Arc::new(Context::builder(client.clone(), Arc::new(iam), config.reconciler).build());

    let roles: Api<IamRole> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    tracing::info!(
        namespace = ?config.watch_namespace,
        concurrency = config.concurrency,
        "Starting IamRole controller"
    );

    Controller::new(roles, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(config.concurrency))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => {
                    tracing::debug!(iam_role = %object.name, ?action, "IamRole reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "IamRole reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("IamRole controller stopped");
    Ok(())
}
