//! ClusterLink Manager
//!
//! Runs the node CIDR controllers of the configured member clusters, the
//! NodeConfig publishing controller and the diagnostics, health and metrics
//! servers.

use anyhow::Context;
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clusterlink_manager::{
    ApiServer, ApiServerConfig, Error, FileConfig, ManagerConfig, MemberCluster, NetworkManager,
    NodeCidrConfig, NodeCidrController, NodeConfigController, NodeConfigControllerConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// ClusterLink Manager - control plane of the multi-cluster overlay
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Diagnostics REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Kubeconfig of the control-plane cluster (in-cluster config when unset)
    #[arg(long, env = "CONTROL_PLANE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// YAML file listing member clusters
    #[arg(long, env = "CLUSTERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Member cluster reachable with the control-plane credentials (repeatable)
    #[arg(long = "cluster-name", env = "CLUSTER_NAME", value_delimiter = ',')]
    cluster_names: Vec<String>,

    /// Seed of the IPSec pre-shared keys
    #[arg(long, env = "PSK_SEED")]
    psk_seed: Option<String>,

    /// Reconcile workers per node CIDR controller
    #[arg(long, env = "WORKERS", default_value = "2")]
    workers: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting ClusterLink Manager");
    info!("  Version: {}", clusterlink_manager::VERSION);
    info!("  REST API: {}", args.api_addr);

    let file_config = match &args.config {
        Some(path) => FileConfig::from_file(path)
            .with_context(|| format!("loading config file {}", path.display()))?,
        None => FileConfig::default(),
    };
    let members = member_clusters(&args, &file_config);
    info!("  Member clusters: {}", members.len());

    let manager = Arc::new(NetworkManager::new(ManagerConfig {
        psk_seed: args
            .psk_seed
            .clone()
            .or_else(|| file_config.psk_seed.clone())
            .unwrap_or_default(),
    }));
    clusterlink_manager::metrics::metrics();

    let control_plane = client_for(args.kubeconfig.as_deref())
        .await
        .context("connecting to the control-plane cluster")?;
    let cancel = CancellationToken::new();

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let mut tasks = JoinSet::new();

    let node_config = NodeConfigController::new(
        NodeConfigControllerConfig::default(),
        control_plane.clone(),
        Arc::clone(&manager),
    );
    tasks.spawn(node_config.run(cancel.clone()));

    for member in members {
        let member_client = match &member.kubeconfig {
            Some(path) => client_for(Some(path))
                .await
                .with_context(|| format!("connecting to member cluster {}", member.name))?,
            None => control_plane.clone(),
        };
        let config = NodeCidrConfig {
            cluster_name: member.name.clone(),
            workers: args.workers,
            etcd: member.etcd.clone(),
            ..Default::default()
        };
        info!(cluster = %member.name, "Starting node CIDR controller");
        let controller = NodeCidrController::new(config, control_plane.clone(), member_client);
        tasks.spawn(controller.run(cancel.clone()));
    }

    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
    };
    let api_server = ApiServer::new(api_config, Arc::clone(&manager));
    let api_cancel = cancel.clone();
    tasks.spawn(async move { api_server.run(api_cancel).await });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down");
    cancel.cancel();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Task failed: {}", e),
            Err(e) => error!("Task panicked: {}", e),
        }
    }

    info!("Manager shutdown complete");
    Ok(())
}

/// Members from the config file followed by `--cluster-name` entries
fn member_clusters(args: &Args, file_config: &FileConfig) -> Vec<MemberCluster> {
    let mut members = file_config.members.clone();
    for name in &args.cluster_names {
        if !members.iter().any(|m| &m.name == name) {
            members.push(MemberCluster {
                name: name.clone(),
                ..Default::default()
            });
        }
    }
    members
}

async fn client_for(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };
    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        Error::Configuration(format!("Invalid kubeconfig {}: {}", path.display(), e))
    })?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::Configuration(format!("Invalid kubeconfig {}: {}", path.display(), e))
        })?;
    Ok(Client::try_from(config)?)
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(
    status: hyper::StatusCode,
    body: impl Into<hyper::Body>,
) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => text_response(StatusCode::OK, "ok"),
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = text_response(StatusCode::OK, buffer);
                            if let Ok(value) = encoder.format_type().parse() {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                    }
                }
                _ => text_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
