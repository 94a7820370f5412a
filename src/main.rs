//! Helm operator entry point
//!
//! Three modes share one binary: the operator itself, a `post-render`
//! subcommand Helm invokes between rendering and apply, and a `--crd` flag
//! that prints the generated CRD manifest.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use kube::{Client, CustomResourceExt};
use prometheus::TextEncoder;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use helm_operator::chartsync::{AckCipher, ChartSync, GitChartSync};
use helm_operator::crd::{HelmRelease, HelmVersion};
use helm_operator::helm::{Clients, Helm2To3, HelmCli};
use helm_operator::metrics::Metrics;
use helm_operator::operator::{KubeEventPublisher, Operator};
use helm_operator::release::mark::KubectlMarker;
use helm_operator::release::postrender::{self, KubeWorkloadClient, PostRenderSpec};
use helm_operator::release::values::KubeValuesClient;
use helm_operator::release::{self, Release};
use helm_operator::status::KubeStatusClient;
use helm_operator::chartsync;

/// Helm operator - reconciles HelmRelease resources against Helm
#[derive(Parser, Debug)]
#[command(name = "helm-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the HelmRelease CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator (default mode)
    Operator(OperatorArgs),

    /// Transform rendered manifests on stdin (invoked by Helm as the
    /// post-renderer)
    PostRender(PostRenderArgs),
}

/// Operator mode arguments
#[derive(Parser, Debug)]
struct OperatorArgs {
    /// Number of parallel workers
    #[arg(long, default_value_t = 2)]
    threadiness: usize,

    /// Directory for cached chart downloads and git mirrors
    #[arg(long, default_value = "/tmp")]
    chart_cache: PathBuf,

    /// Run `helm dependency update` for git-sourced charts
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    update_deps: bool,

    /// Log the full diff of dry-run comparisons
    #[arg(long)]
    log_diffs: bool,

    /// Helm version for releases that do not pin one (v2 or v3)
    #[arg(long, default_value = "v3")]
    default_helm_version: String,

    /// Helm v3 binary
    #[arg(long, default_value = "helm")]
    helm_bin: String,

    /// Helm v2 binary; v2 releases are rejected when unset
    #[arg(long)]
    helm2_bin: Option<String>,

    /// kubectl binary for out-of-band labeling
    #[arg(long, default_value = "kubectl")]
    kubectl_bin: String,

    /// Listen address of the metrics endpoint
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Override of the credential envelope key (16 bytes)
    #[arg(long, env = "ACK_KEY")]
    ack_key: Option<String>,
}

/// Post-render mode arguments
#[derive(Parser, Debug)]
struct PostRenderArgs {
    /// Path to the serialized inject-spec written by the operator
    #[arg(long)]
    config: PathBuf,
}

fn parse_helm_version(value: &str) -> anyhow::Result<HelmVersion> {
    match value {
        "v2" => Ok(HelmVersion::V2),
        "v3" => Ok(HelmVersion::V3),
        other => anyhow::bail!("unknown Helm version '{other}', expected v2 or v3"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr: in post-render mode stdout carries the manifests.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&HelmRelease::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::PostRender(args)) => run_post_render(args).await,
        Some(Commands::Operator(args)) => run_operator(args).await,
        None => run_operator(OperatorArgs::parse_from(["helm-operator"])).await,
    }
}

/// Run the operator until a shutdown signal arrives
async fn run_operator(args: OperatorArgs) -> anyhow::Result<()> {
    info!("helm operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    let metrics = Arc::new(Metrics::new()?);
    let cipher = Arc::new(match &args.ack_key {
        Some(key) => AckCipher::new(key)?,
        None => AckCipher::with_default_key(),
    });

    let git = Arc::new(GitChartSync::new(args.chart_cache.join("mirrors")));
    let chart_sync = Arc::new(ChartSync::new(
        chartsync::Config {
            chart_cache: args.chart_cache.clone(),
            update_deps: args.update_deps,
        },
        git.clone(),
        cipher,
    ));

    let mut clients = Clients::new();
    clients.insert(Arc::new(HelmCli::new(HelmVersion::V3, &args.helm_bin)));
    if let Some(helm2_bin) = &args.helm2_bin {
        clients.insert(Arc::new(HelmCli::new(HelmVersion::V2, helm2_bin)));
    }

    let status = Arc::new(KubeStatusClient::new(client.clone()));
    let release = Arc::new(Release::new(
        Arc::new(clients),
        chart_sync,
        git.clone(),
        status.clone(),
        Arc::new(KubeValuesClient::new(client.clone())),
        Arc::new(Helm2To3::new(client.clone(), args.helm_bin.clone())),
        Arc::new(KubectlMarker::new(args.kubectl_bin.clone())),
        metrics.clone(),
        release::Config {
            log_diffs: args.log_diffs,
            default_helm_version: parse_helm_version(&args.default_helm_version)?,
        },
    ));

    let events = Arc::new(KubeEventPublisher::new(client.clone(), "helm-operator"));
    let operator = Arc::new(Operator::new(
        client,
        release,
        git,
        status,
        events,
        metrics.clone(),
    ));

    // Metrics endpoint.
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);
    let listener = tokio::net::TcpListener::bind(args.metrics_addr).await?;
    info!(addr = %args.metrics_addr, "metrics endpoint listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics server error");
        }
    });

    // Shutdown on ctrl-c; in-flight reconciliations finish first.
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    operator.run(args.threadiness, shutdown).await;
    info!("helm operator shutting down");
    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Result<String, StatusCode> {
    TextEncoder::new()
        .encode_to_string(&metrics.registry().gather())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Transform rendered manifests from stdin to stdout.
///
/// Helm calls this between rendering and apply. On any internal failure the
/// input passes through unchanged: a broken post-render must not fail the
/// Helm action.
async fn run_post_render(args: PostRenderArgs) -> anyhow::Result<()> {
    let spec_raw = tokio::fs::read_to_string(&args.config).await?;
    let spec: PostRenderSpec = serde_json::from_str(&spec_raw)
        .map_err(|e| anyhow::anyhow!("invalid inject-spec: {e}"))?;

    let mut input = String::new();
    tokio::io::stdin().read_to_string(&mut input).await?;

    let output = match Client::try_default().await {
        Ok(client) => {
            let workloads = KubeWorkloadClient::new(client);
            match postrender::transform(&spec, &workloads, &input).await {
                Ok(output) => output,
                Err(e) => {
                    warn!(error = %e, "post-render transform failed, passing through");
                    input
                }
            }
        }
        Err(e) => {
            warn!(error = %e, "could not build cluster client, passing through");
            input
        }
    };

    let mut stdout = tokio::io::stdout();
    stdout.write_all(output.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
