use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{is_pod_ready, pod_host_ip, KUBE_APISERVER_PREFIX, KUBE_SYSTEM_NAMESPACE};
use crate::bgp::{self, Route, RouteStore};
use crate::informer::{object_key, EventHandler, Informers};
use crate::reconciler::DirtyReconciler;

/// Announces a host route for the master IP while a ready API-server
/// pod runs on this node, next-hop the pod's host.
pub struct ApiServersController {
    state: Arc<State>,
}

struct State {
    host_ip: Ipv4Addr,
    master_ip: Ipv4Addr,
    routes: Arc<RouteStore>,
    reconciler: DirtyReconciler,
    apiservers: Mutex<HashMap<String, Route>>,
}

impl ApiServersController {
    pub fn new(
        informers: &Informers,
        host_ip: Ipv4Addr,
        master_ip: Ipv4Addr,
        routes: Arc<RouteStore>,
    ) -> Self {
        let state = Arc::new(State {
            host_ip,
            master_ip,
            routes,
            reconciler: DirtyReconciler::new("apiservers"),
            apiservers: Mutex::new(HashMap::new()),
        });
        informers.pods.register(state.clone());
        ApiServersController { state }
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
        if !key.starts_with(&format!("{KUBE_SYSTEM_NAMESPACE}/{KUBE_APISERVER_PREFIX}")) {
            return;
        }

        match self.eligible_route(&key, pod) {
            Some(route) => {
                let mut apiservers = self.apiservers.lock();
                if apiservers.get(&key) != Some(&route) {
                    debug!("apiserver pod {key} is ready on this node");
                    apiservers.insert(key, route);
                    drop(apiservers);
                    self.reconciler.dirty();
                }
            }
            None => {
                if self.apiservers.lock().remove(&key).is_some() {
                    debug!("apiserver pod {key} is gone or not ready");
                    self.reconciler.dirty();
                }
            }
        }
    }

    fn pod_deleted(&self, pod: &Pod) {
        let key = object_key(pod);
        if self.apiservers.lock().remove(&key).is_some() {
            self.reconciler.dirty();
        }
    }

    fn eligible_route(&self, key: &str, pod: &Pod) -> Option<Route> {
        let host_ip = pod_host_ip(pod)?;
        if host_ip != self.host_ip || !is_pod_ready(pod) {
            return None;
        }
        Some(Route::ApiServer {
            pod: key.to_owned(),
            master_ip: self.master_ip,
            host_ip,
        })
    }

    async fn reconcile(&self) -> bgp::Result<()> {
        let desired: BTreeMap<String, Route> = self
            .apiservers
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
