//! Announce/withdraw ledger per route category.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use super::route::Route;
use super::{Result, Speaker};

/// The set of currently announced routes of one category. Membership
/// changes strictly after the speaker accepted the corresponding path
/// operation, so a failed reconcile retries without ghost state and
/// the store is the single answer to "is this route announced?".
pub struct RouteStore {
    name: &'static str,
    speaker: Arc<dyn Speaker>,
    routes: Mutex<HashMap<String, Route>>,
}

impl RouteStore {
    pub fn new(name: &'static str, speaker: Arc<dyn Speaker>) -> Arc<Self> {
        Arc::new(RouteStore {
            name,
            speaker,
            routes: Mutex::new(HashMap::new()),
        })
    }

    /// Announce `route` unless an equal announcement is already live.
    pub async fn add(&self, route: Route) -> Result<()> {
        let key = route.key();
        if self.routes.lock().contains_key(&key) {
            return Ok(());
        }

        info!(store = self.name, "announcing {route}");
        self.speaker.add_path(route.path(false)).await?;
        self.routes.lock().insert(key, route);
        Ok(())
    }

    /// Withdraw `route` if it is currently announced.
    pub async fn delete(&self, route: &Route) -> Result<()> {
        let key = route.key();
        if !self.routes.lock().contains_key(&key) {
            return Ok(());
        }

        info!(store = self.name, "withdrawing {route}");
        self.speaker.delete_path(route.path(true)).await?;
        self.routes.lock().remove(&key);
        Ok(())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Route> {
        self.routes.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn contains(&self, route: &Route) -> bool {
        self.routes.lock().contains_key(&route.key())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::super::testing::{Call, MockSpeaker};
    use super::*;

    fn route() -> Route {
        Route::ExternalIp {
            service: "default/web".to_owned(),
            external_ip: Ipv4Addr::new(192, 0, 2, 10),
            host_ip: Ipv4Addr::new(10, 0, 0, 1),
        }
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let speaker = MockSpeaker::new();
        let store = RouteStore::new("test", speaker.clone());

        store.add(route()).await.unwrap();
        store.add(route()).await.unwrap();

        assert_eq!(speaker.calls(), vec![Call::Add(route().path(false))]);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn add_delete_add_hits_the_speaker_in_order() {
        let speaker = MockSpeaker::new();
        let store = RouteStore::new("test", speaker.clone());

        store.add(route()).await.unwrap();
        store.delete(&route()).await.unwrap();
        store.add(route()).await.unwrap();

        assert_eq!(
            speaker.calls(),
            vec![
                Call::Add(route().path(false)),
                Call::Delete(route().path(true)),
                Call::Add(route().path(false)),
            ]
        );
    }

    #[tokio::test]
    async fn delete_of_unknown_route_is_a_noop() {
        let speaker = MockSpeaker::new();
        let store = RouteStore::new("test", speaker.clone());

        store.delete(&route()).await.unwrap();
        assert!(speaker.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_add_leaves_no_ghost_state() {
        let speaker = MockSpeaker::new();
        let store = RouteStore::new("test", speaker.clone());
        speaker.fail_next(1);

        assert!(store.add(route()).await.is_err());
        assert!(store.is_empty());

        // The retry succeeds and a later add is deduplicated.
        store.add(route()).await.unwrap();
        store.add(route()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(speaker.calls().len(), 2);
    }

    #[tokio::test]
    async fn rejected_delete_keeps_the_route() {
        let speaker = MockSpeaker::new();
        let store = RouteStore::new("test", speaker.clone());

        store.add(route()).await.unwrap();
        speaker.fail_next(1);

        assert!(store.delete(&route()).await.is_err());
        assert!(store.contains(&route()));

        store.delete(&route()).await.unwrap();
        assert!(store.is_empty());
    }
}
