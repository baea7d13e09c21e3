//! Controllers: each one projects cluster state into a local cache from
//! informer callbacks and reconciles a route store against it.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};

mod api_servers;
mod external_services;
mod pod_subnets;
mod service_subnet;

pub use api_servers::ApiServersController;
pub use external_services::ExternalServicesController;
pub use pod_subnets::PodSubnetsController;
pub use service_subnet::ServiceSubnetController;

/// Node annotation carrying the pod CIDR this node owns.
pub const ANNOTATION_NODE_POD_SUBNET: &str = "parrot.sap.cc/podsubnet";

pub(crate) const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";
pub(crate) const KUBE_APISERVER_PREFIX: &str = "kubernetes-master";
pub(crate) const KUBE_PROXY_PREFIX: &str = "kube-proxy";

pub(crate) fn has_external_ip(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.external_ips.as_ref())
        .map_or(false, |ips| !ips.is_empty())
}

pub(crate) fn first_external_ip(service: &Service) -> Option<Ipv4Addr> {
    service
        .spec
        .as_ref()?
        .external_ips
        .as_ref()?
        .first()?
        .parse()
        .ok()
}

pub(crate) fn traffic_policy_is_local(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.external_traffic_policy.as_ref())
        .map_or(false, |policy| policy == "Local")
}

/// At least one subset has a ready address.
pub(crate) fn has_ready_address(endpoints: &Endpoints) -> bool {
    endpoints.subsets.as_ref().map_or(false, |subsets| {
        subsets
            .iter()
            .any(|subset| subset.addresses.as_ref().map_or(false, |a| !a.is_empty()))
    })
}

/// At least one ready address is backed by the named node.
pub(crate) fn has_ready_address_on(endpoints: &Endpoints, node_name: &str) -> bool {
    endpoints.subsets.as_ref().map_or(false, |subsets| {
        subsets.iter().any(|subset| {
            subset.addresses.as_ref().map_or(false, |addresses| {
                addresses
                    .iter()
                    .any(|address| address.node_name.as_deref() == Some(node_name))
            })
        })
    })
}

pub(crate) fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map_or(false, |conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

pub(crate) fn pod_host_ip(pod: &Pod) -> Option<Ipv4Addr> {
    pod.status.as_ref()?.host_ip.as_ref()?.parse().ok()
}

pub(crate) fn node_internal_ip(node: &Node) -> Option<Ipv4Addr> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|address| address.type_ == "InternalIP")?
        .address
        .parse()
        .ok()
}

pub(crate) fn node_pod_subnet(node: &Node) -> Option<Ipv4Net> {
    node.metadata
        .annotations
        .as_ref()?
        .get(ANNOTATION_NODE_POD_SUBNET)?
        .parse()
        .ok()
}
