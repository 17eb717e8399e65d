use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use static_egress_operator::configmap::ConfigMapWatcher;
use static_egress_operator::health::{run_health_server, HealthState};
use static_egress_operator::metrics::ControllerMetrics;
use static_egress_operator::provider::{NoopProvider, Provider, ProviderKind};
use static_egress_operator::source::SourceError;
use static_egress_operator::{telemetry, EgressController, OperatorConfig};

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        bail!("Failed to install TLS crypto provider: {:?}", e);
    }

    let config = OperatorConfig::parse();

    telemetry::init(&config.log_level, config.log_format)
        .context("Failed to initialize logging")?;
    config.validate().context("Invalid configuration")?;

    info!(
        provider = %config.provider,
        cluster_id = %config.cluster_id,
        dry_run = config.dry_run,
        "kube-static-egress-controller starting"
    );

    let cancel = CancellationToken::new();

    let kube_client = kube_client(config.kubeconfig.as_deref()).await?;
    let provider = build_provider(&config, cancel.clone()).await?;

    let metrics = Arc::new(ControllerMetrics::new());
    let health = Arc::new(HealthState::new(metrics.clone()));
    let server = tokio::spawn(run_health_server(
        health.clone(),
        config.address,
        cancel.clone(),
    ));

    let source = Arc::new(ConfigMapWatcher::new(
        kube_client,
        config.namespace.as_deref(),
    ));
    let watcher = source.spawn(cancel.clone());

    let controller = EgressController::new(provider, source, config.resync_interval, metrics)
        .with_health(health);
    let mut controller = tokio::spawn(controller.run(cancel.clone()));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    let outcome = select! {
        result = &mut controller => {
            cancel.cancel();
            handle_controller_exit(result, false)
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down gracefully");
            Ok(())
        }
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down gracefully");
            Ok(())
        }
    };

    cancel.cancel();
    if !controller.is_finished() {
        if let Err(e) = handle_controller_exit(controller.await, true) {
            warn!(error = %e, "Controller did not stop cleanly");
        }
    }
    wait_for("ConfigMap watcher", watcher).await;
    match server.await {
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    info!("Shutdown complete");
    outcome
}

/// Build a client from `kubeconfig`, or infer in-cluster / default config.
async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");
    Ok(client)
}

async fn build_provider(
    config: &OperatorConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn Provider>> {
    match config.provider {
        ProviderKind::Noop => Ok(Arc::new(NoopProvider::new())),
        ProviderKind::Aws => aws_provider(config, cancel).await,
    }
}

#[cfg(feature = "aws-sdk")]
async fn aws_provider(
    config: &OperatorConfig,
    cancel: CancellationToken,
) -> Result<Arc<dyn Provider>> {
    use static_egress_operator::provider::aws::sdk::AwsClients;
    use static_egress_operator::provider::AwsProvider;

    let clients = AwsClients::load().await;
    let mut provider = AwsProvider::new(
        config.aws_provider_config(),
        Arc::new(clients.cloudformation),
        Arc::new(clients.ec2),
        cancel,
    );
    if let Some(bucket) = &config.cf_template_bucket {
        info!(bucket = %bucket, "Uploading stack templates to bucket");
        provider = provider.with_template_bucket(bucket.clone(), Arc::new(clients.s3));
    }

    info!(stack = %provider.stack_name(), "Using aws provider");
    Ok(Arc::new(provider))
}

#[cfg(not(feature = "aws-sdk"))]
async fn aws_provider(
    _config: &OperatorConfig,
    _cancel: CancellationToken,
) -> Result<Arc<dyn Provider>> {
    bail!("The aws provider is not available, rebuild with the `aws-sdk` feature")
}

/// Turns the controller task result into the process outcome.
///
/// Returning without a shutdown request is an error so the pod restarts.
fn handle_controller_exit(
    result: std::result::Result<std::result::Result<(), SourceError>, tokio::task::JoinError>,
    shutting_down: bool,
) -> Result<()> {
    match result {
        Ok(Ok(())) if shutting_down => {
            info!("Controller stopped");
            Ok(())
        }
        Ok(Ok(())) => {
            error!("Controller exited unexpectedly");
            bail!("Controller exited unexpectedly")
        }
        Ok(Err(e)) => {
            error!(error = %e, "Controller failed");
            Err(e).context("Controller failure")
        }
        Err(e) if e.is_panic() => {
            error!("Controller panicked");
            bail!("Controller panicked: {:?}", e.into_panic())
        }
        Err(e) => {
            error!(error = ?e, "Controller task failed");
            bail!("Controller task failed: {}", e)
        }
    }
}

async fn wait_for(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        warn!(task = name, error = %e, "Task ended abnormally");
    }
}
