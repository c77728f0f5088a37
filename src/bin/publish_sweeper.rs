//! Publishes scheduled drafts on a fixed interval until interrupted.
use content_publisher::config::PublisherConfig;
use content_publisher::{Scheduler, VersionStore, scheduler};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "content_publisher=info,publish_sweeper=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PublisherConfig::from_env()?;
    tracing::info!(
        db_path = %config.db_path.display(),
        require_approval = config.approval.required,
        "opening version store"
    );
    let store = VersionStore::open(&config.db_path)?;

    let cancel = CancellationToken::new();
    let sweeper = Arc::new(Scheduler::new(store.clone(), &config)?.with_cancellation(cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(err) => tracing::error!(error = %err, "failed to listen for ctrl-c"),
        }
        shutdown.cancel();
    });

    scheduler::run(sweeper, config.sweep_interval, cancel).await;
    store.flush()?;
    Ok(())
}
