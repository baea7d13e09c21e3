//! Prometheus telemetry for the speaker's neighbor sessions.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::Filter;

use crate::bgp::{self, PeerInfo, SessionState};

static SESSION_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kube_parrot_bgp_neighbor_session_status",
        "Session status of BGP neighbors.",
        &["node", "neighbor", "status"]
    )
    .expect("session status metric registers once")
});

static ADVERTISED_ROUTES: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "kube_parrot_bgp_neighbor_advertised_route_count_total",
        "Number of routes advertised to a BGP neighbor.",
        &["node", "neighbor"]
    )
    .expect("advertised route metric registers once")
});

static SERVER_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kube_parrot_bgp_server_errors_total",
        "Failures to retrieve BGP peer status.",
        &["node"]
    )
    .expect("server error metric registers once")
});

/// Where the collector reads session state from; the embedded server
/// in production, a scripted fake in tests.
pub trait PeerStatusSource: Send + Sync {
    fn get_neighbor(&self, neighbor: Ipv4Addr) -> bgp::Result<Vec<PeerInfo>>;
}

impl PeerStatusSource for bgp::Server {
    fn get_neighbor(&self, neighbor: Ipv4Addr) -> bgp::Result<Vec<PeerInfo>> {
        bgp::Server::get_neighbor(self, neighbor)
    }
}

/// Refresh the per-neighbor gauges from the speaker. Called on every
/// scrape so the exposed values are as fresh as the session registry.
pub fn record_neighbor_metrics(
    source: &dyn PeerStatusSource,
    node_name: &str,
    neighbors: &[Ipv4Addr],
) {
    for neighbor in neighbors {
        let peers = match source.get_neighbor(*neighbor) {
            Ok(peers) => peers,
            Err(err) => {
                warn!("failed to get session status for neighbor {neighbor}: {err}");
                SERVER_ERRORS.with_label_values(&[node_name]).inc();
                continue;
            }
        };

        for peer in peers {
            let neighbor = neighbor.to_string();
            for state in SessionState::ALL {
                SESSION_STATUS
                    .with_label_values(&[node_name, &neighbor, state.as_str()])
                    .set(i64::from(peer.state == state));
            }
            #[allow(clippy::cast_possible_wrap)]
            ADVERTISED_ROUTES
                .with_label_values(&[node_name, &neighbor])
                .set(peer.advertised_routes as i64);
        }
    }
}

/// Serve the default registry at `/` until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    server: Arc<bgp::Server>,
    node_name: String,
    neighbors: Vec<Ipv4Addr>,
    stop: CancellationToken,
) {
    let endpoint = warp::get().and(warp::path::end()).map(move || {
        record_neighbor_metrics(server.as_ref(), &node_name, &neighbors);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!("failed to encode metrics: {err}");
        }
        let body = String::from_utf8(buffer).unwrap_or_default();
        warp::reply::with_header(body, "content-type", encoder.format_type().to_owned())
    });

    match warp::serve(endpoint).try_bind_with_graceful_shutdown(addr, async move {
        stop.cancelled().await;
    }) {
        Ok((bound, serving)) => {
            info!("serving metrics on {bound}");
            serving.await;
        }
        Err(err) => warn!("failed to serve metrics on {addr}: {err}"),
    }
}
