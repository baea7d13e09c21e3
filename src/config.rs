//! Runtime configuration: an optional YAML file merged with CLI flags,
//! flags last.

use std::net::Ipv4Addr;
use std::path::Path;

use clap::Parser;
use ipnet::Ipv4Net;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CONFIG_FILE: &str = "/etc/kube-parrot/config";

const DEFAULT_AS: u32 = 65000;
const DEFAULT_METRIC_PORT: u16 = 30039;
const DEFAULT_TRACEROUTE_COUNT: usize = 8;
const DEFAULT_NEIGHBOR_COUNT: usize = 2;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Parser)]
#[command(name = "parrot", about = "BGP route announcer driven by Kubernetes state")]
pub struct Flags {
    /// Local BGP ASN.
    #[arg(long = "as")]
    pub local_as: Option<u32>,

    /// Neighbor ASN, defaults to the local ASN (iBGP).
    #[arg(long)]
    pub remote_as: Option<u32>,

    /// Name of the node this instance runs on.
    #[arg(long)]
    pub nodename: Option<String>,

    /// This node's internal IP, used as route next-hop.
    #[arg(long)]
    pub hostip: Option<Ipv4Addr>,

    /// Manually configured BGP neighbor, repeatable.
    #[arg(long = "neighbor")]
    pub neighbors: Vec<Ipv4Addr>,

    /// Number of TTL-1 probes for neighbor discovery.
    #[arg(long)]
    pub traceroute_count: Option<usize>,

    /// Exact number of neighbors discovery must find.
    #[arg(long)]
    pub neighbor_count: Option<usize>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long)]
    pub metric_port: Option<u16>,

    /// Announce this node's pod subnet.
    #[arg(long)]
    pub podsubnet: bool,

    /// Pod CIDR to announce, overriding the node annotation.
    #[arg(long)]
    pub pod_cidr: Option<Ipv4Net>,

    /// Master IP; enables the API-server route controller.
    #[arg(long)]
    pub master_ip: Option<Ipv4Addr>,

    /// Cluster service subnet; enables the service-subnet controller.
    #[arg(long)]
    pub service_subnet: Option<Ipv4Net>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigFile {
    #[serde(rename = "as")]
    pub local_as: Option<u32>,
    pub remote_as: Option<u32>,
    pub nodename: Option<String>,
    pub hostip: Option<Ipv4Addr>,
    pub neighbors: Option<Vec<Ipv4Addr>>,
    pub traceroute_count: Option<usize>,
    pub neighbor_count: Option<usize>,
    pub metric_port: Option<u16>,
    pub podsubnet: Option<bool>,
    pub pod_cidr: Option<Ipv4Net>,
    pub master_ip: Option<Ipv4Addr>,
    pub service_subnet: Option<Ipv4Net>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub local_as: u32,
    pub remote_as: u32,
    pub node_name: String,
    pub host_ip: Ipv4Addr,
    pub neighbors: Vec<Ipv4Addr>,
    pub traceroute_count: usize,
    pub neighbor_count: usize,
    pub metric_port: u16,
    pub announce_pod_subnet: bool,
    pub pod_cidr: Option<Ipv4Net>,
    pub master_ip: Option<Ipv4Addr>,
    pub service_subnet: Option<Ipv4Net>,
}

impl Config {
    pub fn load() -> Result<Config> {
        Self::resolve(Flags::parse(), read_file(Path::new(CONFIG_FILE))?)
    }

    fn resolve(flags: Flags, file: ConfigFile) -> Result<Config> {
        let local_as = flags.local_as.or(file.local_as).unwrap_or(DEFAULT_AS);
        let config = Config {
            local_as,
            remote_as: flags.remote_as.or(file.remote_as).unwrap_or(local_as),
            node_name: flags
                .nodename
                .or(file.nodename)
                .ok_or_else(|| Error::Invalid("nodename must be set".to_owned()))?,
            host_ip: flags
                .hostip
                .or(file.hostip)
                .ok_or_else(|| Error::Invalid("hostip must be set".to_owned()))?,
            neighbors: if flags.neighbors.is_empty() {
                file.neighbors.unwrap_or_default()
            } else {
                flags.neighbors
            },
            traceroute_count: flags
                .traceroute_count
                .or(file.traceroute_count)
                .unwrap_or(DEFAULT_TRACEROUTE_COUNT),
            neighbor_count: flags
                .neighbor_count
                .or(file.neighbor_count)
                .unwrap_or(DEFAULT_NEIGHBOR_COUNT),
            metric_port: flags
                .metric_port
                .or(file.metric_port)
                .unwrap_or(DEFAULT_METRIC_PORT),
            announce_pod_subnet: flags.podsubnet || file.podsubnet.unwrap_or(false),
            pod_cidr: flags.pod_cidr.or(file.pod_cidr),
            master_ip: flags.master_ip.or(file.master_ip),
            service_subnet: flags.service_subnet.or(file.service_subnet),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if let Some(cidr) = self.pod_cidr {
            validate_cidr("pod CIDR", cidr)?;
        }
        if let Some(cidr) = self.service_subnet {
            validate_cidr("service subnet", cidr)?;
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        debug!("no config file found at {}", path.display());
        return Ok(ConfigFile::default());
    }
    debug!("config file found at {}", path.display());
    let raw = std::fs::read_to_string(path).map_err(Error::Read)?;
    serde_yaml::from_str(&raw).map_err(Error::Parse)
}

fn validate_cidr(what: &str, cidr: Ipv4Net) -> Result<()> {
    if cidr.addr() != cidr.network() {
        return Err(Error::Invalid(format!(
            "{what} {cidr} is not aligned to a CIDR block (network is {})",
            cidr.network()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags(args: &[&str]) -> Flags {
        Flags::parse_from(std::iter::once("parrot").chain(args.iter().copied()))
    }

    #[test]
    fn flags_override_the_file() {
        let file: ConfigFile = serde_yaml::from_str(
            "as: 65100\nnodename: from-file\nhostip: 10.0.0.9\nneighbors: [192.0.2.1]\n",
        )
        .unwrap();
        let config = Config::resolve(
            flags(&["--hostip", "10.0.0.1", "--neighbor", "192.0.2.7"]),
            file,
        )
        .unwrap();

        assert_eq!(config.local_as, 65100);
        assert_eq!(config.remote_as, 65100);
        assert_eq!(config.node_name, "from-file");
        assert_eq!(config.host_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.neighbors, vec![Ipv4Addr::new(192, 0, 2, 7)]);
    }

    #[test]
    fn defaults_apply_after_the_merge() {
        let config = Config::resolve(
            flags(&["--nodename", "n1", "--hostip", "10.0.0.1"]),
            ConfigFile::default(),
        )
        .unwrap();

        assert_eq!(config.local_as, DEFAULT_AS);
        assert_eq!(config.remote_as, DEFAULT_AS);
        assert_eq!(config.metric_port, DEFAULT_METRIC_PORT);
        assert_eq!(config.traceroute_count, DEFAULT_TRACEROUTE_COUNT);
        assert_eq!(config.neighbor_count, DEFAULT_NEIGHBOR_COUNT);
        assert!(!config.announce_pod_subnet);
        assert!(config.neighbors.is_empty());
        assert!(config.master_ip.is_none());
    }

    #[test]
    fn remote_as_defaults_to_local_as() {
        let config = Config::resolve(
            flags(&["--nodename", "n1", "--hostip", "10.0.0.1", "--as", "65010"]),
            ConfigFile::default(),
        )
        .unwrap();
        assert_eq!(config.remote_as, 65010);

        let config = Config::resolve(
            flags(&[
                "--nodename",
                "n1",
                "--hostip",
                "10.0.0.1",
                "--as",
                "65010",
                "--remote-as",
                "65020",
            ]),
            ConfigFile::default(),
        )
        .unwrap();
        assert_eq!(config.remote_as, 65020);
    }

    #[test]
    fn missing_required_fields_are_rejected() {
        assert!(matches!(
            Config::resolve(flags(&["--hostip", "10.0.0.1"]), ConfigFile::default()),
            Err(Error::Invalid(_))
        ));
        assert!(matches!(
            Config::resolve(flags(&["--nodename", "n1"]), ConfigFile::default()),
            Err(Error::Invalid(_))
        ));
    }

    #[test]
    fn misaligned_cidrs_are_rejected() {
        let result = Config::resolve(
            flags(&[
                "--nodename",
                "n1",
                "--hostip",
                "10.0.0.1",
                "--pod-cidr",
                "10.42.1.7/24",
            ]),
            ConfigFile::default(),
        );
        assert!(matches!(result, Err(Error::Invalid(_))));
    }
}
