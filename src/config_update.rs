//! Cluster-wide SDK configuration coordinator.
//!
//! The broker pushes configuration changes on a single well-known subject:
//! the cluster notification flag and, per station, whether schema validation
//! failures should be routed to the dead-letter channel. Producer creation
//! responses seed the same state.

use std::collections::HashMap;

use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{MemphisError, Result};
use crate::subjects;

/// Configuration change event pushed on `$memphis_sdk_configurations_updates`.
#[derive(Debug, Deserialize)]
struct ConfigurationsUpdate {
    #[serde(rename = "station_name")]
    station_name: String,
    #[serde(rename = "type")]
    update_type: String,
    update: bool,
}

#[derive(Default)]
struct ConfigState {
    cluster: HashMap<String, bool>,
    station_schemaverse_to_dls: HashMap<String, bool>,
}

/// Mutex-guarded view of the cluster configuration.
pub(crate) struct ConfigUpdateManager {
    state: Mutex<ConfigState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ConfigUpdateManager {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConfigState::default()),
            listener: Mutex::new(None),
        }
    }

    /// Subscribe to the configuration update subject and keep the state
    /// current for the lifetime of the client.
    pub(crate) async fn start(
        self: &std::sync::Arc<Self>,
        client: &async_nats::Client,
    ) -> Result<()> {
        let mut subscription = client
            .subscribe(subjects::SDK_CONFIG_UPDATES)
            .await
            .map_err(|e| MemphisError::Connection(e.to_string()))?;

        let manager = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                match serde_json::from_slice::<ConfigurationsUpdate>(&msg.payload) {
                    Ok(update) => manager.apply(update).await,
                    Err(e) => warn!(error = %e, "failed to decode configuration update"),
                }
            }
        });

        *self.listener.lock().await = Some(handle);
        Ok(())
    }

    async fn apply(&self, update: ConfigurationsUpdate) {
        debug!(update_type = %update.update_type, "received config update");
        let mut state = self.state.lock().await;
        match update.update_type.as_str() {
            "send_notification" => {
                state.cluster.insert(update.update_type, update.update);
            }
            "schemaverse_to_dls" => {
                state.station_schemaverse_to_dls.insert(
                    subjects::internal_name(&update.station_name),
                    update.update,
                );
            }
            other => error!(update_type = %other, "unrecognized configuration update type"),
        }
    }

    pub(crate) async fn set_cluster_config(&self, name: &str, value: bool) {
        self.state.lock().await.cluster.insert(name.to_string(), value);
    }

    pub(crate) async fn set_station_schemaverse_to_dls(&self, station: &str, value: bool) {
        self.state
            .lock()
            .await
            .station_schemaverse_to_dls
            .insert(station.to_string(), value);
    }

    /// Whether schema validation failures on this station go to the
    /// dead-letter channel. A station the SDK never learned about defaults
    /// to false (no dead-letter write).
    pub(crate) async fn send_message_to_dls(&self, station: &str) -> bool {
        self.state
            .lock()
            .await
            .station_schemaverse_to_dls
            .get(station)
            .copied()
            .unwrap_or(false)
    }

    /// Whether the cluster wants a notification event on validation failure.
    pub(crate) async fn send_notification(&self) -> bool {
        self.state
            .lock()
            .await
            .cluster
            .get("send_notification")
            .copied()
            .unwrap_or(false)
    }

    pub(crate) async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flags_default_to_false() {
        let manager = ConfigUpdateManager::new();
        assert!(!manager.send_message_to_dls("orders").await);
        assert!(!manager.send_notification().await);
    }

    #[tokio::test]
    async fn test_creation_response_seeds_flags() {
        let manager = ConfigUpdateManager::new();
        manager.set_cluster_config("send_notification", true).await;
        manager.set_station_schemaverse_to_dls("orders", true).await;

        assert!(manager.send_notification().await);
        assert!(manager.send_message_to_dls("orders").await);
        assert!(!manager.send_message_to_dls("other").await);
    }

    #[tokio::test]
    async fn test_pushed_update_applies() {
        let manager = ConfigUpdateManager::new();
        manager
            .apply(ConfigurationsUpdate {
                station_name: "Orders".to_string(),
                update_type: "schemaverse_to_dls".to_string(),
                update: true,
            })
            .await;

        // Station names in updates are normalized before lookup.
        assert!(manager.send_message_to_dls("orders").await);
    }

    #[tokio::test]
    async fn test_unrecognized_update_type_is_ignored() {
        let manager = ConfigUpdateManager::new();
        manager
            .apply(ConfigurationsUpdate {
                station_name: String::new(),
                update_type: "mystery".to_string(),
                update: true,
            })
            .await;

        assert!(!manager.send_notification().await);
    }

    #[tokio::test]
    async fn test_update_decodes_from_wire_shape() {
        let raw = r#"{"station_name":"orders","type":"send_notification","update":true}"#;
        let update: ConfigurationsUpdate = serde_json::from_str(raw).unwrap();
        assert_eq!(update.update_type, "send_notification");
        assert!(update.update);
    }
}
