//! Pod Controller
//!
//! Leader-elected controller that watches Pods (cluster-wide or in
//! `WATCH_NAMESPACE`) and tracks every pod that has been assigned an IP.
//!
//! Only the replica holding the `controller-lock` Lease runs the pipeline.
//! SIGINT/SIGTERM stop the pipeline, release the lease and exit 0. Losing
//! the lease, failing the initial cache sync or being unable to reach the
//! lease at startup exit non-zero so the pod is restarted.

mod config;
mod error;
mod handler;

use anyhow::Context;
use config::Config;
use controller_core::{Controller, KubeLeaseLock, KubeListerWatcher, LeaderElector};
use handler::{PodHandler, has_pod_ip};
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    // kube's rustls client needs a process-wide crypto provider
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!("Starting Pod Controller");
    info!("Configuration:");
    info!("  Namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Lease: {}/{}", config.lease_namespace, config.lease_name);
    info!("  Identity: {}", config.identity);
    info!("  Workers: {}", config.workers);

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    let lock = KubeLeaseLock::new(
        client.clone(),
        &config.lease_namespace,
        &config.lease_name,
        config.identity.clone(),
    );
    let elector = LeaderElector::new(lock, config.leader_election_config())?;
    let mut leaders = elector.subscribe();
    tokio::spawn(async move {
        while leaders.changed().await.is_ok() {
            let leader = leaders.borrow_and_update().clone();
            match leader {
                Some(identity) => info!(leader = %identity, "New leader"),
                None => info!("Lease released, no leader"),
            }
        }
    });

    let pods: Api<Pod> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };
    let controller = Controller::new(KubeListerWatcher::new(pods), PodHandler::new(), config.controller_config())?
        .with_filter(has_pod_ip);

    match elector.run(shutdown, move |scope| controller.run(scope)).await {
        Ok(()) => {
            info!("Pod Controller stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Pod Controller failed");
            Err(e.into())
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Cancels `shutdown` on SIGINT or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let sigint = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let sigterm = async {
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = sigint => info!("SIGINT received, shutting down"),
        () = sigterm => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
