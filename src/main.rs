use crate::crd::ContainerVersion;
use crate::state::{ControllerContext, SharedState};
use anyhow::Context;
use kube::CustomResourceExt;
use std::env;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod controller;
mod crd;
mod deploy;
mod error;
mod events;
mod history;
mod image_reference;
mod registry;
mod retry;
mod secret_string;
mod signoff;
mod state;
mod sync;
mod target;
mod webserver;

#[cfg(target_env = "musl")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

static DEFAULT_CONFIG_PATH: &str = "/etc/kube-autodeploy/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if env::args().nth(1).as_deref() == Some("crd") {
        print!("{}", serde_yaml_ng::to_string(&ContainerVersion::crd())?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting kube-autodeploy {}", env!("CARGO_PKG_VERSION"));

    let config_path =
        env::var("KUBE_AUTODEPLOY_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(config::load_config(&config_path)?);

    let shutdown = CancellationToken::new();
    let shared = SharedState::default();
    let ctx = ControllerContext {
        kube_client: controller::create_client().await?,
        http_client: registry::create_client(&config)?,
        config: config.clone(),
        shared: shared.clone(),
        shutdown: shutdown.clone(),
        pass_lock: Arc::default(),
    };
    let passes = TaskTracker::new();

    info!("Executing job scheduler at cron schedule {}", config.schedule);
    let mut scheduler = JobScheduler::new().await?;

    let tracker = passes.clone();
    let job = Job::new_async(config.schedule.as_str(), move |_uuid, _l| {
        let ctx = ctx.clone();
        let tracker = tracker.clone();
        Box::pin(async move {
            if ctx.shutdown.is_cancelled() {
                return;
            }
            let lock = ctx.pass_lock.clone();
            controller::spawn_pass(&tracker, lock, controller::run(ctx));
        })
    })
    .context("Invalid cron schedule")?;
    scheduler.add(job).await?;
    scheduler.start().await?;

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let app = webserver::create_app(shared);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.webserver.port));
    info!("Starting webserver on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    info!("Shutting down job scheduler");
    scheduler.shutdown().await?;

    passes.close();
    if !passes.is_empty() {
        info!("Waiting for the running reconciliation pass to finish");
    }
    passes.wait().await;

    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            shutdown.cancel();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = terminate.recv() => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
