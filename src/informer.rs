//! Typed watch facade: one informer per resource, dispatching
//! add/update/delete callbacks to registered handlers and exposing a
//! cache-sync barrier.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Service};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// `namespace/name` cache key, or just the name for cluster-scoped
/// objects.
pub fn object_key<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{}/{}", namespace, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Callbacks for one watched resource. Handlers run on the informer's
/// task and must not block on external I/O.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

pub struct Informer<K> {
    kind: &'static str,
    handlers: Mutex<Vec<Arc<dyn EventHandler<K>>>>,
    store: Mutex<HashMap<String, K>>,
    synced: watch::Sender<bool>,
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(kind: &'static str) -> Arc<Self> {
        Arc::new(Informer {
            kind,
            handlers: Mutex::new(Vec::new()),
            store: Mutex::new(HashMap::new()),
            synced: watch::Sender::new(false),
        })
    }

    /// Register before the watch is started; late handlers would miss
    /// the initial replay.
    pub fn register(&self, handler: Arc<dyn EventHandler<K>>) {
        self.handlers.lock().push(handler);
    }

    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives on self, so this only fails after drop.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Drive the watch until cancelled, feeding every event through
    /// [`handle_event`](Self::handle_event).
    pub async fn run(&self, api: Api<K>, stop: CancellationToken) {
        let mut pending = None;
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();

        loop {
            tokio::select! {
                () = stop.cancelled() => return,
                event = stream.try_next() => match event {
                    Ok(Some(event)) => self.handle_event(event, &mut pending),
                    Ok(None) => return,
                    Err(err) => warn!(kind = self.kind, "watch error: {err}"),
                }
            }
        }
    }

    /// Apply one watch event to the store and dispatch callbacks.
    /// `pending` buffers the relist snapshot between `Init` and
    /// `InitDone`; the snapshot is diffed against the store so missed
    /// deletions surface as `on_delete`.
    fn handle_event(&self, event: watcher::Event<K>, pending: &mut Option<HashMap<String, K>>) {
        match event {
            watcher::Event::Init => {
                *pending = Some(HashMap::new());
            }
            watcher::Event::InitApply(obj) => {
                if let Some(snapshot) = pending.as_mut() {
                    snapshot.insert(object_key(&obj), obj);
                }
            }
            watcher::Event::InitDone => {
                if let Some(snapshot) = pending.take() {
                    self.replace(snapshot);
                }
                if !self.has_synced() {
                    debug!(kind = self.kind, "cache synced");
                }
                self.synced.send_replace(true);
            }
            watcher::Event::Apply(obj) => {
                let old = self
                    .store
                    .lock()
                    .insert(object_key(&obj), obj.clone());
                match old {
                    Some(old) => self.dispatch(|handler| handler.on_update(&old, &obj)),
                    None => self.dispatch(|handler| handler.on_add(&obj)),
                }
            }
            watcher::Event::Delete(obj) => {
                self.store.lock().remove(&object_key(&obj));
                self.dispatch(|handler| handler.on_delete(&obj));
            }
        }
    }

    fn replace(&self, snapshot: HashMap<String, K>) {
        let old = mem::replace(&mut *self.store.lock(), snapshot.clone());

        for (key, obj) in &snapshot {
            match old.get(key) {
                Some(prev) => self.dispatch(|handler| handler.on_update(prev, obj)),
                None => self.dispatch(|handler| handler.on_add(obj)),
            }
        }
        for (key, obj) in &old {
            if !snapshot.contains_key(key) {
                self.dispatch(|handler| handler.on_delete(obj));
            }
        }
    }

    fn dispatch(&self, f: impl Fn(&dyn EventHandler<K>)) {
        for handler in self.handlers.lock().iter() {
            f(handler.as_ref());
        }
    }
}

/// The informers every controller draws from.
pub struct Informers {
    client: Client,
    pub nodes: Arc<Informer<Node>>,
    pub pods: Arc<Informer<Pod>>,
    pub services: Arc<Informer<Service>>,
    pub endpoints: Arc<Informer<Endpoints>>,
}

impl Informers {
    #[must_use]
    pub fn new(client: &Client) -> Self {
        Informers {
            client: client.clone(),
            nodes: Informer::new("node"),
            pods: Informer::new("pod"),
            services: Informer::new("service"),
            endpoints: Informer::new("endpoints"),
        }
    }

    #[must_use]
    pub fn spawn(&self, stop: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            spawn_informer(&self.nodes, Api::all(self.client.clone()), stop),
            spawn_informer(&self.pods, Api::all(self.client.clone()), stop),
            spawn_informer(&self.services, Api::all(self.client.clone()), stop),
            spawn_informer(&self.endpoints, Api::all(self.client.clone()), stop),
        ]
    }

    /// Blocks until every watch replayed its initial list.
    pub async fn wait_for_cache_sync(&self) {
        self.nodes.wait_for_sync().await;
        self.pods.wait_for_sync().await;
        self.services.wait_for_sync().await;
        self.endpoints.wait_for_sync().await;
    }
}

fn spawn_informer<K>(
    informer: &Arc<Informer<K>>,
    api: Api<K>,
    stop: &CancellationToken,
) -> JoinHandle<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static,
{
    let informer = Arc::clone(informer);
    let stop = stop.clone();
    tokio::spawn(async move { informer.run(api, stop).await })
}
