//! Binary entry point for the coordination node.
//!
//! Wires the replicated state-machine driver to its gRPC server, the
//! metrics endpoint, and a TOML configuration file, then runs until a
//! shutdown signal arrives.

use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::mpsc;

use flotilla::config::RuntimeConfig;
use flotilla::metrics;
use flotilla::rpc::{RaftServer, RaftService};
use flotilla::Node;

/// Resolves once the operator asks the process to stop: Ctrl+C anywhere,
/// SIGTERM on unix as well.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(err) => {
                log::warn!("no SIGTERM handler available ({}), stopping on Ctrl+C only", err)
            }
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/config.toml"))]
    config: String,
}

async fn start_metrics_server(addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr = addr.parse()?;
    let make_svc = make_service_fn(move |_| {
        let registry = metrics::REGISTRY_INSTANCE.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |_: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let encoder = TextEncoder::new();
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .unwrap_or_default();
                    Ok::<_, hyper::Error>(Response::new(Body::from(buffer)))
                }
            }))
        }
    });
    let server = hyper::Server::bind(&addr).serve(make_svc);
    tokio::spawn(async move {
        if let Err(err) = server.await {
            log::error!("metrics server exited: {}", err);
        }
    });
    log::info!("metrics server started on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let config = RuntimeConfig::from_toml(&args.config);
    metrics::init_registry();

    let (leadership_tx, mut leadership_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(state) = leadership_rx.recv().await {
            log::info!("leadership changed: {:?}", state);
        }
    });

    let node = Node::new(config.node_options(), Some(leadership_tx))?;
    let mut err_rx = node.start();
    tokio::spawn(async move {
        while let Some(err) = err_rx.recv().await {
            log::error!("raft loop error: {}", err);
        }
    });

    let grpc_addr = config.addr.parse()?;
    let service = RaftService::new(node.clone());
    let grpc_server = tonic::transport::Server::builder()
        .add_service(RaftServer::new(service))
        .serve(grpc_addr);
    tokio::spawn(async move {
        if let Err(err) = grpc_server.await {
            log::error!("grpc server exited: {}", err);
        }
    });
    log::info!("grpc server started on {}", grpc_addr);

    start_metrics_server(&config.metrics_addr).await?;

    if let Some(join_addr) = &config.join_addr {
        node.join_cluster(join_addr).await?;
        log::info!("joined cluster via {}", join_addr);
    }

    shutdown_signal().await;
    log::info!("shutting down");
    node.shutdown().await;
    Ok(())
}
