use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::net::TcpListener;
use tracing::*;
use tracing_subscriber::EnvFilter;

use crossplane_irsa_webhook::cert::{self, csr::CsrManager, file::FileWatcher, CertStore};
use crossplane_irsa_webhook::cli::{Args, CertStrategy};
use crossplane_irsa_webhook::handler::{self, Webhook};
use crossplane_irsa_webhook::introspect::{introspect, Eks};
use crossplane_irsa_webhook::metrics::{self, Metrics};
use crossplane_irsa_webhook::placeholder::Modifier;
use crossplane_irsa_webhook::shutdown::{self, ShutdownOutcome, GRACE_PERIOD};
use crossplane_irsa_webhook::{server, version};

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.version {
        println!("{}", version::info());
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(args).await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    info!(version = %version::info(), "starting crossplane-irsa-webhook");
    let cluster_name = args.cluster_name.clone().context("--cluster-name is required")?;

    // Resolve the cluster identity once, nothing is served without it
    let eks = Eks::from_env(&args.aws_region).await;
    let identity = introspect(&eks, &cluster_name)
        .await
        .with_context(|| format!("could not introspect cluster {cluster_name}"))?;
    let modifier = Modifier::builder()
        .account_id(identity.account_id)
        .region(&args.aws_region)
        .cluster_name(&cluster_name)
        .oidc_provider(identity.oidc_provider)
        .build()
        .context("invalid substitution values")?;

    let metrics = Arc::new(Metrics::new().context("could not register metrics")?);
    let store = Arc::new(CertStore::new());
    let (trigger, signal) = shutdown::channel();

    let certificates = match args.cert_strategy() {
        CertStrategy::Files { cert, key } => {
            let watcher = FileWatcher::new(&cert, &key, store.clone())
                .await
                .with_context(|| format!("could not load {} and {}", cert.display(), key.display()))?;
            tokio::spawn(watcher.run(signal.clone()))
        }
        CertStrategy::InCluster(config) => {
            let client = kube_client(&args).await?;
            tokio::spawn(CsrManager::new(client, config, store.clone()).run(signal.clone()))
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("could not listen on {addr}"))?;
    let webhook = Webhook::new(Arc::new(modifier), metrics.clone());
    let server = tokio::spawn(server::serve_tls(
        handler::routes(webhook),
        listener,
        cert::server_config(store),
        signal.clone(),
    ));

    let (metrics_addr, metrics_server) = warp::serve(metrics::routes(metrics))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], args.metrics_port), signal.clone().recv())
        .with_context(|| format!("could not listen on metrics port {}", args.metrics_port))?;
    info!(addr = %metrics_addr, "listening for metrics and healthz");
    let metrics_server = tokio::spawn(metrics_server);

    tokio::spawn(shutdown::listen_for_signals(trigger));

    match shutdown::drain(server, signal, GRACE_PERIOD).await {
        ShutdownOutcome::Exited => bail!("https server stopped unexpectedly"),
        ShutdownOutcome::Forced => warn!("dropping connections still open after {GRACE_PERIOD:?}"),
        ShutdownOutcome::Graceful => info!("https server drained"),
    }

    shutdown::settle("metrics server", metrics_server, GRACE_PERIOD).await;
    shutdown::settle("certificates", certificates, GRACE_PERIOD).await;
    info!("gracefully closed");
    Ok(())
}

async fn kube_client(args: &Args) -> Result<Client> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("could not read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => Config::infer().await.context("could not infer kube config")?,
    };
    if let Some(url) = &args.kube_api {
        config.cluster_url = url
            .parse()
            .with_context(|| format!("invalid API server url {url}"))?;
    }
    Client::try_from(config).context("could not create kube client")
}
