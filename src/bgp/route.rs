use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

/// A path as handed to the speaker: prefix, next-hop and whether the
/// prefix is announced or withdrawn. Origin is always IGP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Path {
    pub prefix: Ipv4Net,
    pub next_hop: Ipv4Addr,
    pub withdraw: bool,
}

impl Path {
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}->{}", self.prefix, self.next_hop)
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.prefix, self.next_hop)
    }
}

/// Everything this sidecar knows how to announce. Each variant carries
/// the key of the cluster object it was derived from plus the already
/// resolved addresses, so deriving prefix and next-hop cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Host route for a service's first external IP, pointing at this node.
    ExternalIp {
        service: String,
        external_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
    },

    /// The pod subnet owned by this node, pointing at its internal IP.
    NodePodSubnet {
        node: String,
        subnet: Ipv4Net,
        node_ip: Ipv4Addr,
    },

    /// Host route for the API server, pointing at the master pod's host.
    ApiServer {
        pod: String,
        master_ip: Ipv4Addr,
        host_ip: Ipv4Addr,
    },

    /// The cluster service subnet, pointing at the local proxy pod's host.
    NodeServiceSubnet {
        pod: String,
        subnet: Ipv4Net,
        host_ip: Ipv4Addr,
    },
}

impl Route {
    #[must_use]
    pub fn prefix(&self) -> Ipv4Net {
        match self {
            Route::ExternalIp { external_ip, .. } => Ipv4Net::from(*external_ip),
            Route::NodePodSubnet { subnet, .. } | Route::NodeServiceSubnet { subnet, .. } => {
                *subnet
            }
            Route::ApiServer { master_ip, .. } => Ipv4Net::from(*master_ip),
        }
    }

    #[must_use]
    pub fn next_hop(&self) -> Ipv4Addr {
        match self {
            Route::ExternalIp { host_ip, .. }
            | Route::ApiServer { host_ip, .. }
            | Route::NodeServiceSubnet { host_ip, .. } => *host_ip,
            Route::NodePodSubnet { node_ip, .. } => *node_ip,
        }
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Route::ExternalIp { service, .. } => format!("ExternalIP: {service}"),
            Route::NodePodSubnet { node, .. } => format!("NodePodSubnet: {node}"),
            Route::ApiServer { pod, .. } => format!("APIServer: {pod}"),
            Route::NodeServiceSubnet { pod, .. } => format!("NodeServiceSubnet: {pod}"),
        }
    }

    /// Identity key for store membership. Routes with the same prefix and
    /// next-hop are the same announcement regardless of provenance.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}->{}", self.prefix(), self.next_hop())
    }

    #[must_use]
    pub fn path(&self, withdraw: bool) -> Path {
        Path {
            prefix: self.prefix(),
            next_hop: self.next_hop(),
            withdraw,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>18} -> {:<15} ({})",
            self.prefix().to_string(),
            self.next_hop().to_string(),
            self.describe()
        )
    }
}
