use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    first_external_ip, has_external_ip, has_ready_address, has_ready_address_on,
    traffic_policy_is_local,
};
use crate::bgp::{self, Route, RouteStore};
use crate::informer::{object_key, EventHandler, Informers};
use crate::reconciler::DirtyReconciler;

/// Announces /32 host routes for the external IPs of services that have
/// ready endpoints, next-hop this node. With `externalTrafficPolicy:
/// Local` the route only exists while this node carries a ready
/// backend, so traffic is never attracted to a node that would
/// black-hole it.
pub struct ExternalServicesController {
    state: Arc<State>,
}

struct State {
    node_name: String,
    host_ip: Ipv4Addr,
    routes: Arc<RouteStore>,
    reconciler: DirtyReconciler,
    services: Mutex<HashMap<String, Service>>,
    endpoints: Mutex<HashMap<String, Endpoints>>,
}

impl ExternalServicesController {
    pub fn new(
        informers: &Informers,
        node_name: String,
        host_ip: Ipv4Addr,
        routes: Arc<RouteStore>,
    ) -> Self {
        let state = Arc::new(State {
            node_name,
            host_ip,
            routes,
            reconciler: DirtyReconciler::new("externalservices"),
            services: Mutex::new(HashMap::new()),
            endpoints: Mutex::new(HashMap::new()),
        });
        informers.services.register(state.clone());
        informers.endpoints.register(state.clone());
        ExternalServicesController { state }
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
    fn service_changed(&self, service: &Service) {
        let key = object_key(service);
        if !has_external_ip(service) {
            if self.services.lock().remove(&key).is_some() {
                debug!("service {key} no longer has an external IP");
                self.reconciler.dirty();
            }
            return;
        }

        self.services.lock().insert(key, service.clone());
        self.reconciler.dirty();
    }

    fn service_deleted(&self, service: &Service) {
        let key = object_key(service);
        if self.services.lock().remove(&key).is_some() {
            debug!("service {key} deleted");
        }
        self.reconciler.dirty();
    }

    fn endpoints_changed(&self, endpoints: &Endpoints) {
        let key = object_key(endpoints);
        if has_ready_address(endpoints) {
            let changed = {
                let mut cache = self.endpoints.lock();
                cache.insert(key.clone(), endpoints.clone()).as_ref() != Some(endpoints)
            };
            if changed {
                if !is_leader_election(&key) {
                    debug!("endpoints {key} have ready addresses");
                }
                self.reconciler.dirty();
            }
        } else if self.endpoints.lock().remove(&key).is_some() {
            if !is_leader_election(&key) {
                debug!("endpoints {key} lost all ready addresses");
            }
            self.reconciler.dirty();
        }
    }

    fn endpoints_deleted(&self, endpoints: &Endpoints) {
        let key = object_key(endpoints);
        self.endpoints.lock().remove(&key);
        self.reconciler.dirty();
    }

    /// Withdraw everything no longer desired, then announce the rest.
    /// The desired set is keyed by route identity, so a changed
    /// external IP retires the stale announcement on the same pass.
    async fn reconcile(&self) -> bgp::Result<()> {
        let desired = self.desired_routes();

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

    fn desired_routes(&self) -> BTreeMap<String, Route> {
        let services = self.services.lock();
        let endpoints = self.endpoints.lock();

        let mut desired = BTreeMap::new();
        for (key, service) in services.iter() {
            let Some(eps) = endpoints.get(key) else {
                continue;
            };
            if traffic_policy_is_local(service) && !has_ready_address_on(eps, &self.node_name) {
                continue;
            }
            let Some(external_ip) = first_external_ip(service) else {
                warn!("service {key} has an unparseable external IP, skipping");
                continue;
            };

            let route = Route::ExternalIp {
                service: key.clone(),
                external_ip,
                host_ip: self.host_ip,
            };
            desired.insert(route.key(), route);
        }
        desired
    }
}

/// The scheduler/controller-manager leader-election endpoints churn on
/// every renewal; keep them out of the logs.
fn is_leader_election(key: &str) -> bool {
    key == "kube-system/kube-scheduler" || key == "kube-system/kube-controller-manager"
}

impl EventHandler<Service> for State {
    fn on_add(&self, obj: &Service) {
        self.service_changed(obj);
    }

    fn on_update(&self, _old: &Service, new: &Service) {
        self.service_changed(new);
    }

    fn on_delete(&self, obj: &Service) {
        self.service_deleted(obj);
    }
}

impl EventHandler<Endpoints> for State {
    fn on_add(&self, obj: &Endpoints) {
        self.endpoints_changed(obj);
    }

    fn on_update(&self, _old: &Endpoints, new: &Endpoints) {
        self.endpoints_changed(new);
    }

    fn on_delete(&self, obj: &Endpoints) {
        self.endpoints_deleted(obj);
    }
}
