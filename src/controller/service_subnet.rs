use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{is_pod_ready, pod_host_ip, KUBE_PROXY_PREFIX, KUBE_SYSTEM_NAMESPACE};
use crate::bgp::{self, Route, RouteStore};
use crate::informer::{object_key, EventHandler, Informers};
use crate::reconciler::DirtyReconciler;

/// Announces the cluster service subnet while this node's kube-proxy
/// pod is ready, next-hop the proxy pod's host.
pub struct ServiceSubnetController {
    state: Arc<State>,
}

struct State {
    host_ip: Ipv4Addr,
    service_subnet: Ipv4Net,
    routes: Arc<RouteStore>,
    reconciler: DirtyReconciler,
    proxies: Mutex<HashMap<String, Route>>,
}

impl ServiceSubnetController {
    pub fn new(
        informers: &Informers,
        host_ip: Ipv4Addr,
        service_subnet: Ipv4Net,
        routes: Arc<RouteStore>,
    ) -> Self {
        let state = Arc::new(State {
            host_ip,
            service_subnet,
            routes,
            reconciler: DirtyReconciler::new("servicesubnets"),
            proxies: Mutex::new(HashMap::new()),
        });
        informers.pods.register(state.clone());
        ServiceSubnetController { state }
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
    fn pod_changed(&self, pod: &Pod) {
        let key = object_key(pod);
        if !key.starts_with(&format!("{KUBE_SYSTEM_NAMESPACE}/{KUBE_PROXY_PREFIX}")) {
            return;
        }

        match self.eligible_route(&key, pod) {
            Some(route) => {
                let mut proxies = self.proxies.lock();
                if proxies.get(&key) != Some(&route) {
                    debug!("proxy pod {key} is ready on this node");
                    proxies.insert(key, route);
                    drop(proxies);
                    self.reconciler.dirty();
                }
            }
            None => {
                if self.proxies.lock().remove(&key).is_some() {
                    debug!("proxy pod {key} is gone or not ready");
                    self.reconciler.dirty();
                }
            }
        }
    }

    fn pod_deleted(&self, pod: &Pod) {
        let key = object_key(pod);
        if self.proxies.lock().remove(&key).is_some() {
            self.reconciler.dirty();
        }
    }

    fn eligible_route(&self, key: &str, pod: &Pod) -> Option<Route> {
        let host_ip = pod_host_ip(pod)?;
        if host_ip != self.host_ip || !is_pod_ready(pod) {
            return None;
        }
        Some(Route::NodeServiceSubnet {
            pod: key.to_owned(),
            subnet: self.service_subnet,
            host_ip,
        })
    }

    async fn reconcile(&self) -> bgp::Result<()> {
        let desired: BTreeMap<String, Route> = self
            .proxies
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

impl EventHandler<Pod> for State {
    fn on_add(&self, obj: &Pod) {
        self.pod_changed(obj);
    }

    fn on_update(&self, _old: &Pod, new: &Pod) {
        self.pod_changed(new);
    }

    fn on_delete(&self, obj: &Pod) {
        self.pod_deleted(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::pod;
    use super::*;
    use crate::bgp::testing::{Call, MockSpeaker};
    use crate::bgp::Path;

    fn state(speaker: &Arc<MockSpeaker>) -> State {
        State {
            host_ip: Ipv4Addr::new(10, 0, 0, 1),
            service_subnet: "10.96.0.0/16".parse().unwrap(),
            routes: RouteStore::new("servicesubnets", speaker.clone()),
            reconciler: DirtyReconciler::new("servicesubnets"),
            proxies: Mutex::new(HashMap::new()),
        }
    }

    fn subnet_path(withdraw: bool) -> Path {
        Path {
            prefix: "10.96.0.0/16".parse().unwrap(),
            next_hop: Ipv4Addr::new(10, 0, 0, 1),
            withdraw,
        }
    }

    #[tokio::test]
    async fn local_proxy_toggles_the_service_subnet_route() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker);

        state.pod_changed(&pod("kube-system", "kube-proxy-a", Some("10.0.0.1"), true));
        state.reconcile().await.unwrap();
        assert_eq!(speaker.calls(), vec![Call::Add(subnet_path(false))]);

        state.pod_deleted(&pod("kube-system", "kube-proxy-a", Some("10.0.0.1"), true));
        state.reconcile().await.unwrap();
        assert_eq!(
            speaker.calls(),
            vec![Call::Add(subnet_path(false)), Call::Delete(subnet_path(true))]
        );
    }

    #[tokio::test]
    async fn remote_or_unready_proxies_are_ignored() {
        let speaker = MockSpeaker::new();
        let state = state(&speaker);

        state.pod_changed(&pod("kube-system", "kube-proxy-b", Some("10.0.0.2"), true));
        state.pod_changed(&pod("kube-system", "kube-proxy-c", Some("10.0.0.1"), false));
        state.reconcile().await.unwrap();

        assert!(speaker.calls().is_empty());
    }
}
