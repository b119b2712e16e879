use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::backoff::BackoffScheduler;
use crate::config::ConnectionConfig;
use crate::connection::{ConnectionManager, Connector, WsConnector};
use crate::envelope::Envelope;
use crate::error::NetError;
use crate::network::NetworkStatus;
use crate::subscription::TopicReceiver;

/// Connection managers keyed by endpoint, sharing one network status.
///
/// Each endpoint has exactly one manager. `disconnect` is last-writer-wins:
/// it closes the endpoint for every caller that connected to it.
pub struct ConnectionHub {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    backoff: BackoffScheduler,
    network: NetworkStatus,
    managers: Mutex<HashMap<String, Arc<ConnectionManager>>>,
}

impl ConnectionHub {
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_connector(config, Arc::new(WsConnector), BackoffScheduler::new())
    }

    pub fn with_connector(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        backoff: BackoffScheduler,
    ) -> Self {
        Self {
            config,
            connector,
            backoff,
            network: NetworkStatus::new(),
            managers: Mutex::new(HashMap::new()),
        }
    }

    fn managers(&self) -> MutexGuard<'_, HashMap<String, Arc<ConnectionManager>>> {
        self.managers.lock().expect("hub managers mutex poisoned")
    }

    /// Manager for `endpoint`, created on first use.
    pub fn manager(&self, endpoint: &str) -> Arc<ConnectionManager> {
        let mut managers = self.managers();
        let manager = managers.entry(endpoint.to_owned()).or_insert_with(|| {
            log::debug!("hub: new manager endpoint={endpoint}");
            Arc::new(ConnectionManager::new(
                endpoint,
                self.config.clone(),
                Arc::clone(&self.connector),
                self.backoff.clone(),
                self.network.subscribe(),
            ))
        });
        Arc::clone(manager)
    }

    fn existing(&self, endpoint: &str) -> Option<Arc<ConnectionManager>> {
        self.managers().get(endpoint).cloned()
    }

    pub async fn connect(&self, endpoint: &str) -> Result<Arc<ConnectionManager>, NetError> {
        let manager = self.manager(endpoint);
        manager.connect().await?;
        Ok(manager)
    }

    pub fn subscribe(&self, endpoint: &str, topic: &str) -> Option<TopicReceiver> {
        self.manager(endpoint).subscribe(topic)
    }

    pub async fn subscribe_remote(
        &self,
        endpoint: &str,
        topic: &str,
        filter: Value,
    ) -> Option<TopicReceiver> {
        self.manager(endpoint).subscribe_remote(topic, filter).await
    }

    pub fn unsubscribe(&self, endpoint: &str, topic: &str) -> bool {
        self.existing(endpoint).is_some_and(|manager| manager.unsubscribe(topic))
    }

    pub async fn send(&self, endpoint: &str, envelope: &Envelope) -> bool {
        match self.existing(endpoint) {
            Some(manager) => manager.send(envelope).await,
            None => false,
        }
    }

    pub fn is_connected(&self, endpoint: &str) -> bool {
        self.existing(endpoint).is_some_and(|manager| manager.is_connected())
    }

    /// Closes `endpoint` and forgets its manager. Returns `false` if unknown.
    pub async fn disconnect(&self, endpoint: &str) -> bool {
        let removed = self.managers().remove(endpoint);
        match removed {
            Some(manager) => {
                manager.disconnect().await;
                log::info!("hub: disconnected endpoint={endpoint}");
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let managers: Vec<Arc<ConnectionManager>> =
            self.managers().drain().map(|(_, manager)| manager).collect();
        for manager in managers {
            manager.disconnect().await;
        }
    }

    /// Forwards a platform online/offline signal to every manager.
    pub fn set_online(&self, online: bool) -> bool {
        self.network.set_online(online)
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.managers().keys().cloned().collect();
        endpoints.sort();
        endpoints
    }
}
