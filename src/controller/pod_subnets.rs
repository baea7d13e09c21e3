use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Node;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{node_internal_ip, node_pod_subnet};
use crate::bgp::{self, Route, RouteStore};
use crate::informer::{object_key, EventHandler, Informers};
use crate::reconciler::DirtyReconciler;

/// Announces this node's pod CIDR so the fabric can deliver pod
/// traffic straight to the node. Only the node whose internal IP
/// matches the configured host IP is considered; the CIDR comes from
/// the configured override or the node annotation.
pub struct PodSubnetsController {
    state: Arc<State>,
}

struct State {
    host_ip: Ipv4Addr,
    pod_cidr: Option<Ipv4Net>,
    routes: Arc<RouteStore>,
    reconciler: DirtyReconciler,
    // Derived route per eligible node; node heartbeats that change
    // nothing we announce never reach the reconciler.
    nodes: Mutex<HashMap<String, Route>>,
}

impl PodSubnetsController {
    pub fn new(
        informers: &Informers,
        host_ip: Ipv4Addr,
        pod_cidr: Option<Ipv4Net>,
        routes: Arc<RouteStore>,
    ) -> Self {
        let state = Arc::new(State {
            host_ip,
            pod_cidr,
            routes,
            reconciler: DirtyReconciler::new("podsubnets"),
            nodes: Mutex::new(HashMap::new()),
        });
        informers.nodes.register(state.clone());
        PodSubnetsController { state }
    }

    pub async fn run(&self, stop: CancellationToken) {
        let state = Arc::clone(&self.state);
        self.state
            .reconciler
            .run(
                move || {
                    let state = Arc::clone(&state);
                    async move { state.reconcile().await }
                },
                stop,
            )
            .await;
    }
}

impl State {
    fn node_changed(&self, node: &Node) {
        let key = object_key(node);
        match self.eligible_route(&key, node) {
            Some(route) => {
                let mut nodes = self.nodes.lock();
                if nodes.get(&key) != Some(&route) {
                    debug!("node {key} announces pod subnet {}", route.prefix());
                    nodes.insert(key, route);
                    drop(nodes);
                    self.reconciler.dirty();
                }
            }
            None => {
                if self.nodes.lock().remove(&key).is_some() {
                    debug!("node {key} no longer announces a pod subnet");
                    self.reconciler.dirty();
                }
            }
        }
    }

    fn node_deleted(&self, node: &Node) {
        let key = object_key(node);
        if self.nodes.lock().remove(&key).is_some() {
            self.reconciler.dirty();
        }
    }

    fn eligible_route(&self, key: &str, node: &Node) -> Option<Route> {
        let node_ip = node_internal_ip(node)?;
        if node_ip != self.host_ip {
            return None;
        }
        let subnet = self.pod_cidr.or_else(|| node_pod_subnet(node))?;
        Some(Route::NodePodSubnet {
            node: key.to_owned(),
            subnet,
            node_ip,
        })
    }

    async fn reconcile(&self) -> bgp::Result<()> {
        let desired: BTreeMap<String, Route> = self
            .nodes
            .lock()
            .values()
            .map(|route| (route.key(), route.clone()))
            .collect();

        for route in self.routes.list() {
            if !desired.contains_key(&route.key()) {
                self.routes.delete(&route).await?;
            }
        }
        for route in desired.into_values() {
            self.routes.add(route).await?;
        }
        Ok(())
    }
}

impl EventHandler<Node> for State {
    fn on_add(&self, obj: &Node) {
        self.node_changed(obj);
    }

    fn on_update(&self, _old: &Node, new: &Node) {
        self.node_changed(new);
    }

    fn on_delete(&self, obj: &Node) {
        self.node_deleted(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::node;
    use super::*;
    use crate::bgp::testing::{Call, MockSpeaker};
    use crate::bgp::Path;

    fn state(speaker: &Arc<MockSpeaker>, pod_cidr: Option<&str>) -> State {
        State {
            host_ip: Ipv4Addr::new(10, 0, 0, 1),
            pod_cidr: pod_cidr.map(|cidr| cidr.parse().unwrap()),
            routes: RouteStore::new("podsubnets", speaker.clone()),
            reconciler: DirtyReconciler::new("podsubnets"),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn path(prefix: &str, withdraw: bool) -> Path {
        Path {
            prefix: prefix.parse().unwrap(),
            next_hop: Ipv4Addr::new(10, 0, 0, 1),
            withdraw,
        }
    }

    #[tokio::test]
    async fn annotated_node_announces_and_withdraws() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker, None);

        state.node_changed(&node("n1", Some("10.0.0.1"), Some("10.42.1.0/24")));
        state.reconcile().await.unwrap();
        assert_eq!(speaker.calls(), vec![Call::Add(path("10.42.1.0/24", false))]);

        // The annotation disappears on update.
        state.node_changed(&node("n1", Some("10.0.0.1"), None));
        state.reconcile().await.unwrap();
        assert_eq!(
            speaker.calls(),
            vec![
                Call::Add(path("10.42.1.0/24", false)),
                Call::Delete(path("10.42.1.0/24", true)),
            ]
        );
    }

    #[tokio::test]
    async fn other_nodes_are_ignored() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker, None);

        state.node_changed(&node("n2", Some("10.0.0.2"), Some("10.42.2.0/24")));
        state.node_changed(&node("n3", None, Some("10.42.3.0/24")));
        state.reconcile().await.unwrap();

        assert!(speaker.calls().is_empty());
        assert_eq!(state.reconciler.dirtied(), 0);
    }

    #[tokio::test]
    async fn configured_cidr_overrides_the_annotation() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker, Some("10.99.0.0/24"));

        state.node_changed(&node("n1", Some("10.0.0.1"), Some("10.42.1.0/24")));
        state.reconcile().await.unwrap();
        assert_eq!(speaker.calls(), vec![Call::Add(path("10.99.0.0/24", false))]);
    }

    #[tokio::test]
    async fn node_deletion_withdraws_the_subnet() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker, None);
        let n = node("n1", Some("10.0.0.1"), Some("10.42.1.0/24"));

        state.node_changed(&n);
        state.reconcile().await.unwrap();
        state.node_deleted(&n);
        state.reconcile().await.unwrap();

        assert_eq!(
            speaker.calls(),
            vec![
                Call::Add(path("10.42.1.0/24", false)),
                Call::Delete(path("10.42.1.0/24", true)),
            ]
        );
    }

    #[test]
    fn heartbeat_updates_do_not_mark_dirty() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker, None);
        let n = node("n1", Some("10.0.0.1"), Some("10.42.1.0/24"));

        state.node_changed(&n);
        assert_eq!(state.reconciler.dirtied(), 1);
        state.node_changed(&n);
        assert_eq!(state.reconciler.dirtied(), 1);
    }
}
