//! Shared schema cache: per-station validators, live-updated and
//! reference-counted.
//!
//! Every producer bound to a station shares one cache entry. The first attach
//! subscribes to the station's schema update subject and spawns a listener
//! task; the last detach tears both down. All map and entry mutation happens
//! under one coordinator lock, so a validator swap is never observed torn and
//! updates apply strictly in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MemphisError, Result};
use crate::schema::{SchemaUpdate, SchemaUpdateInit, SchemaUpdateType, SchemaValidator};
use crate::subjects;

/// Outcome of an attach: whether this was the first producer on the station.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AttachOutcome {
    Created,
    Existing,
}

/// Outcome of a detach: whether the entry is gone.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DetachOutcome {
    Removed,
    StillReferenced,
}

struct CacheEntry {
    ref_count: u32,
    validator: SchemaValidator,
    schema_name: String,
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            ref_count: 1,
            validator: SchemaValidator::Empty,
            schema_name: String::new(),
        }
    }
}

/// The cache proper: station name to entry, one lock over the whole map.
///
/// Cross-station operations never need two locks at once.
#[derive(Default)]
pub(crate) struct SchemaCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl SchemaCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Attach one reference to the station's entry, creating it with the
    /// no-op validator when this is the first attach.
    pub(crate) async fn attach(&self, station: &str) -> AttachOutcome {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(station) {
            Some(entry) => {
                entry.ref_count += 1;
                AttachOutcome::Existing
            }
            None => {
                entries.insert(station.to_string(), CacheEntry::new());
                AttachOutcome::Created
            }
        }
    }

    /// Release one reference. Detaching a station that was never attached is
    /// a programming error and fails loudly; the count never goes negative.
    pub(crate) async fn detach(&self, station: &str) -> Result<DetachOutcome> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(station).ok_or_else(|| {
            MemphisError::State(format!(
                "schema update listener for station '{}' does not exist",
                station
            ))
        })?;

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            entries.remove(station);
            return Ok(DetachOutcome::Removed);
        }
        Ok(DetachOutcome::StillReferenced)
    }

    /// Apply a pushed schema update. Events for stations detached in the
    /// meantime are discarded; a failed compile keeps the previous validator.
    pub(crate) async fn apply_update(&self, station: &str, update: SchemaUpdate) {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(station) else {
            debug!(station = %station, "discarding schema update for detached station");
            return;
        };

        match update.update_type {
            SchemaUpdateType::Init => {
                let Some(init) = update.init else {
                    warn!(station = %station, "schema INIT event without payload");
                    return;
                };
                match SchemaValidator::from_init(&init) {
                    Ok(validator) => {
                        debug!(station = %station, schema = %init.schema_name, "schema activated");
                        entry.validator = validator;
                        entry.schema_name = init.schema_name;
                    }
                    Err(e) => {
                        warn!(station = %station, error = %e.message, "failed to compile schema update");
                    }
                }
            }
            SchemaUpdateType::Drop => {
                debug!(station = %station, "schema dropped");
                entry.validator = SchemaValidator::Empty;
                entry.schema_name.clear();
            }
        }
    }

    /// Install a schema directly (from a producer creation response). The
    /// entry must already exist; compile failures propagate.
    pub(crate) async fn apply_init(&self, station: &str, init: &SchemaUpdateInit) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(station).ok_or_else(|| {
            MemphisError::State(format!(
                "station subscription for '{}' does not exist",
                station
            ))
        })?;

        entry.validator = SchemaValidator::from_init(init)?;
        entry.schema_name = init.schema_name.clone();
        Ok(())
    }

    /// Validate a payload against the station's active schema. A station that
    /// was never attached validates as no-op.
    pub(crate) async fn validate(&self, station: &str, payload: &[u8]) -> Result<()> {
        let entries = self.entries.lock().await;
        match entries.get(station) {
            Some(entry) => entry.validator.validate(payload).map_err(Into::into),
            None => Ok(()),
        }
    }

    /// Name of the active schema for a station, if one is bound.
    pub(crate) async fn schema_name(&self, station: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        entries
            .get(station)
            .filter(|e| !e.schema_name.is_empty())
            .map(|e| e.schema_name.clone())
    }

    #[cfg(test)]
    pub(crate) async fn ref_count(&self, station: &str) -> Option<u32> {
        self.entries.lock().await.get(station).map(|e| e.ref_count)
    }
}

/// Wires the cache to the broker: subscribes to each station's schema update
/// subject on first attach and tears the listener down on last detach.
pub(crate) struct StationUpdateManager {
    client: async_nats::Client,
    cache: SchemaCache,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl StationUpdateManager {
    pub(crate) fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            cache: SchemaCache::new(),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Attach to a station's schema updates. Subsequent attaches to the same
    /// station only bump the reference count.
    ///
    /// The listeners lock is held across attach, subscribe, and handle
    /// registration, so a concurrent last-detach cannot observe the entry
    /// before its listener handle is registered. Lock order is always
    /// listeners, then cache.
    pub(crate) async fn listen_to_schema_updates(self: &Arc<Self>, station: &str) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if self.cache.attach(station).await == AttachOutcome::Existing {
            return Ok(());
        }

        let subject = subjects::schema_updates_subject(station);
        let mut subscription = match self.client.subscribe(subject).await {
            Ok(sub) => sub,
            Err(e) => {
                // Roll the attach back so the failed subscribe leaks nothing.
                let _ = self.cache.detach(station).await;
                return Err(MemphisError::Connection(e.to_string()));
            }
        };

        let manager = Arc::clone(self);
        let station_name = station.to_string();
        let handle = tokio::spawn(async move {
            while let Some(msg) = subscription.next().await {
                match serde_json::from_slice::<SchemaUpdate>(&msg.payload) {
                    Ok(update) => manager.cache.apply_update(&station_name, update).await,
                    Err(e) => {
                        warn!(station = %station_name, error = %e, "failed to decode schema update");
                    }
                }
            }
        });

        listeners.insert(station.to_string(), handle);
        Ok(())
    }

    /// Release one attach. The last detach aborts the listener task, which
    /// drops the subscription and discards anything still buffered.
    pub(crate) async fn remove_schema_update_listener(&self, station: &str) -> Result<()> {
        let mut listeners = self.listeners.lock().await;
        if self.cache.detach(station).await? == DetachOutcome::Removed {
            if let Some(handle) = listeners.remove(station) {
                handle.abort();
            }
        }
        Ok(())
    }

    pub(crate) async fn apply_schema(&self, station: &str, init: &SchemaUpdateInit) -> Result<()> {
        self.cache.apply_init(station, init).await
    }

    pub(crate) async fn validate(&self, station: &str, payload: &[u8]) -> Result<()> {
        self.cache.validate(station, payload).await
    }

    pub(crate) async fn schema_name(&self, station: &str) -> Option<String> {
        self.cache.schema_name(station).await
    }

    /// Abort every listener task. Used when the client closes.
    pub(crate) async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, handle) in listeners.drain() {
            handle.abort();
        }
    }
}
