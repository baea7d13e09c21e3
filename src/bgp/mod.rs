//! BGP speaker, route model and the announce/withdraw ledgers.

use async_trait::async_trait;
use thiserror::Error;

pub mod message;
pub mod route;
pub mod server;
mod session;
pub mod store;

pub use route::{Path, Route};
pub use server::{PeerInfo, Server, SessionState};
pub use store::RouteStore;

#[derive(Debug, Error)]
pub enum Error {
    #[error("speaker is not started")]
    NotStarted,

    #[error("unknown neighbor: {0}")]
    UnknownNeighbor(std::net::Ipv4Addr),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The speaker surface the route stores consume. Implemented by the
/// embedded [`Server`] and by recording mocks in tests.
#[async_trait]
pub trait Speaker: Send + Sync {
    /// Announce a path. An error means the path was not accepted and
    /// must not be considered announced.
    async fn add_path(&self, path: Path) -> Result<()>;

    /// Withdraw a path. An error means the withdrawal was not accepted
    /// and the path must still be considered announced.
    async fn delete_path(&self, path: Path) -> Result<()>;
}
