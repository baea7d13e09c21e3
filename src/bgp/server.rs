//! The embedded speaker: global configuration, RIB and peer registry.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::message;
use super::route::Path;
use super::session::Session;
use super::{Error, Result, Speaker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connect,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Idle,
        SessionState::Connect,
        SessionState::Active,
        SessionState::OpenSent,
        SessionState::OpenConfirm,
        SessionState::Established,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connect => "connect",
            SessionState::Active => "active",
            SessionState::OpenSent => "opensent",
            SessionState::OpenConfirm => "openconfirm",
            SessionState::Established => "established",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default)]
pub(super) struct PeerStatus {
    pub state: SessionState,
    pub advertised: u64,
}

/// Per-neighbor session snapshot for the metrics collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub neighbor: Ipv4Addr,
    pub state: SessionState,
    pub advertised_routes: u64,
}

struct Peer {
    tx: mpsc::UnboundedSender<Path>,
    status: Arc<Mutex<PeerStatus>>,
}

/// BGP speaker bound to the node's address, router-ID equal to that
/// address. Sessions are initiated outbound only.
pub struct Server {
    local_address: Ipv4Addr,
    local_as: u32,
    remote_as: u32,
    port: u16,
    rib: Arc<Mutex<HashMap<String, Path>>>,
    peers: Mutex<HashMap<Ipv4Addr, Peer>>,
    started: AtomicBool,
    sessions: CancellationToken,
}

impl Server {
    #[must_use]
    pub fn new(local_address: Ipv4Addr, local_as: u32, remote_as: u32) -> Arc<Self> {
        Arc::new(Server {
            local_address,
            local_as,
            remote_as,
            port: message::BGP_PORT,
            rib: Arc::new(Mutex::new(HashMap::new())),
            peers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            sessions: CancellationToken::new(),
        })
    }

    /// Main loop: accept path operations until the token is cancelled,
    /// then tear down every peer session.
    pub async fn run(&self, stop: CancellationToken) {
        info!(
            "bgp speaker started: as {}, router-id {}",
            self.local_as, self.local_address
        );
        self.started.store(true, Ordering::SeqCst);

        stop.cancelled().await;

        self.started.store(false, Ordering::SeqCst);
        self.sessions.cancel();
        debug!("bgp speaker stopped");
    }

    pub fn add_neighbor(&self, neighbor: Ipv4Addr) {
        let mut peers = self.peers.lock();
        if peers.contains_key(&neighbor) {
            return;
        }
        info!("adding neighbor: {neighbor} (as {})", self.remote_as);

        let (tx, rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(PeerStatus::default()));
        let session = Session {
            local: self.local_address,
            peer: neighbor,
            port: self.port,
            local_as: self.local_as,
            peer_as: self.remote_as,
            router_id: self.local_address,
            rib: Arc::clone(&self.rib),
            status: Arc::clone(&status),
            rx,
        };
        tokio::spawn(session.run(self.sessions.child_token()));
        peers.insert(neighbor, Peer { tx, status });
    }

    /// Session state and advertised route count for one neighbor.
    pub fn get_neighbor(&self, neighbor: Ipv4Addr) -> Result<Vec<PeerInfo>> {
        let peers = self.peers.lock();
        let peer = peers
            .get(&neighbor)
            .ok_or(Error::UnknownNeighbor(neighbor))?;
        let status = peer.status.lock();
        Ok(vec![PeerInfo {
            neighbor,
            state: status.state,
            advertised_routes: status.advertised,
        }])
    }

    fn broadcast(&self, path: &Path) {
        for peer in self.peers.lock().values() {
            let _ = peer.tx.send(path.clone());
        }
    }
}

#[async_trait]
impl Speaker for Server {
    async fn add_path(&self, path: Path) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        let path = Path {
            withdraw: false,
            ..path
        };
        debug!("add path: {path}");
        self.rib.lock().insert(path.key(), path.clone());
        self.broadcast(&path);
        Ok(())
    }

    async fn delete_path(&self, path: Path) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(Error::NotStarted);
        }
        let path = Path {
            withdraw: true,
            ..path
        };
        debug!("delete path: {path}");
        self.rib.lock().remove(&path.key());
        self.broadcast(&path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> Path {
        Path {
            prefix: "192.0.2.10/32".parse().unwrap(),
            next_hop: Ipv4Addr::new(10, 0, 0, 1),
            withdraw: false,
        }
    }

    #[tokio::test]
    async fn paths_are_rejected_before_start() {
        let server = Server::new(Ipv4Addr::new(127, 0, 0, 1), 65000, 65000);
        assert!(matches!(
            server.add_path(path()).await,
            Err(Error::NotStarted)
        ));
    }

    #[tokio::test]
    async fn rib_tracks_add_and_delete() {
        let server = Server::new(Ipv4Addr::new(127, 0, 0, 1), 65000, 65000);
        let stop = CancellationToken::new();
        let run = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(stop.clone()).await })
        };
        // run() flips the started flag before parking on the token.
        tokio::task::yield_now().await;

        server.add_path(path()).await.unwrap();
        assert_eq!(server.rib.lock().len(), 1);

        server.delete_path(path()).await.unwrap();
        assert!(server.rib.lock().is_empty());

        run.abort();
    }

    #[tokio::test]
    async fn unknown_neighbor_is_an_error() {
        let server = Server::new(Ipv4Addr::new(127, 0, 0, 1), 65000, 65000);
        assert!(matches!(
            server.get_neighbor(Ipv4Addr::new(192, 0, 2, 1)),
            Err(Error::UnknownNeighbor(_))
        ));
    }

    #[tokio::test]
    async fn neighbors_report_session_state() {
        let server = Server::new(Ipv4Addr::new(127, 0, 0, 1), 65000, 65000);
        server.add_neighbor(Ipv4Addr::new(127, 0, 0, 1));

        let peers = server.get_neighbor(Ipv4Addr::new(127, 0, 0, 1)).unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].advertised_routes, 0);
    }
}
