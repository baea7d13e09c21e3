// Start the route announcer.
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "parrot=debug,warn".to_owned());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = parrot::Config::load()?;
    info!(
        "starting kube-parrot on {} ({})",
        config.node_name, config.host_ip
    );

    if config.neighbors.is_empty() {
        config.neighbors = parrot::discovery::discover_neighbors(
            config.host_ip,
            config.traceroute_count,
            config.neighbor_count,
        )
        .await?;
        info!("discovered neighbors: {:?}", config.neighbors);
    }

    let client = Client::try_default().await?;

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            let mut term = signal(SignalKind::terminate()).expect("SIGTERM handler");
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("shutting down");
            stop.cancel();
        }
    });

    parrot::Parrot::new(config, client).run(stop).await;

    info!("shutdown completed, bye");
    Ok(())
}
