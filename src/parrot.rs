//! Composition root: wires the speaker, informers and controllers
//! together and owns the startup/shutdown ordering.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bgp::{RouteStore, Server};
use crate::config::Config;
use crate::controller::{
    ApiServersController, ExternalServicesController, PodSubnetsController,
    ServiceSubnetController,
};
use crate::informer::Informers;
use crate::metrics;

pub struct Parrot {
    config: Config,
    client: Client,
}

impl Parrot {
    #[must_use]
    pub fn new(config: Config, client: Client) -> Self {
        Parrot { config, client }
    }

    /// Runs until `stop` is cancelled, then drains every task it
    /// spawned. Startup order matters: the speaker and the watches
    /// come up first, neighbors are added once the speaker loop is
    /// ready, and reconcilers only start on fully synced caches.
    pub async fn run(&self, stop: CancellationToken) {
        let config = &self.config;
        let server = Server::new(config.host_ip, config.local_as, config.remote_as);

        let informers = Informers::new(&self.client);
        let external_services = ExternalServicesController::new(
            &informers,
            config.node_name.clone(),
            config.host_ip,
            RouteStore::new("externalips", server.clone()),
        );
        let pod_subnets = config.announce_pod_subnet.then(|| {
            PodSubnetsController::new(
                &informers,
                config.host_ip,
                config.pod_cidr,
                RouteStore::new("podsubnets", server.clone()),
            )
        });
        let api_servers = config.master_ip.map(|master_ip| {
            ApiServersController::new(
                &informers,
                config.host_ip,
                master_ip,
                RouteStore::new("apiservers", server.clone()),
            )
        });
        let service_subnet = config.service_subnet.map(|subnet| {
            ServiceSubnetController::new(
                &informers,
                config.host_ip,
                subnet,
                RouteStore::new("servicesubnets", server.clone()),
            )
        });

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn({
            let server = Arc::clone(&server);
            let stop = stop.clone();
            async move { server.run(stop).await }
        }));
        tasks.extend(informers.spawn(&stop));

        // Give the speaker's main loop a moment before neighbors show up.
        sleep(Duration::from_secs(1)).await;
        for neighbor in &config.neighbors {
            server.add_neighbor(*neighbor);
        }

        debug!("waiting for caches to sync");
        tokio::select! {
            () = stop.cancelled() => {}
            () = informers.wait_for_cache_sync() => {
                info!("caches synced, starting reconcilers");
            }
        }

        if !stop.is_cancelled() {
            tasks.push(tokio::spawn({
                let stop = stop.clone();
                async move { external_services.run(stop).await }
            }));
            if let Some(controller) = pod_subnets {
                tasks.push(tokio::spawn({
                    let stop = stop.clone();
                    async move { controller.run(stop).await }
                }));
            }
            if let Some(controller) = api_servers {
                tasks.push(tokio::spawn({
                    let stop = stop.clone();
                    async move { controller.run(stop).await }
                }));
            }
            if let Some(controller) = service_subnet {
                tasks.push(tokio::spawn({
                    let stop = stop.clone();
                    async move { controller.run(stop).await }
                }));
            }

            tasks.push(tokio::spawn(metrics::serve(
                SocketAddr::from((config.host_ip, config.metric_port)),
                Arc::clone(&server),
                config.node_name.clone(),
                config.neighbors.clone(),
                stop.clone(),
            )));
        }

        stop.cancelled().await;
        for task in tasks {
            let _ = task.await;
        }
        debug!("all tasks drained");
    }
}
