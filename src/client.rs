//! The Memphis client: one broker connection shared by every producer,
//! consumer, and station handle created from it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_nats::jetstream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error};

use crate::config_update::ConfigUpdateManager;
use crate::consumer::{Consumer, ConsumerOptions};
use crate::error::{MemphisError, Result};
use crate::lifecycle::{Creatable, Destroyable};
use crate::producer::{Producer, ProducerOptions};
use crate::schema::cache::StationUpdateManager;
use crate::station::{SchemaAttachment, SchemaDetachment, Station, StationOptions};
use crate::subjects;

/// Connection options.
#[derive(Debug, Clone)]
pub struct Options {
    pub port: u16,
    pub auto_reconnect: bool,
    pub max_reconnects: usize,
    pub reconnect_wait: Duration,
    pub connection_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            port: 6666,
            auto_reconnect: true,
            max_reconnects: 3,
            reconnect_wait: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(15),
        }
    }
}

/// A failure observed in a background task (async produce, liveness probe,
/// update listener). Carries enough context to tell which resource failed.
#[derive(Debug)]
pub struct TaskError {
    /// Resource kind: "producer", "consumer", ...
    pub resource_kind: &'static str,
    /// Resource name the task was running for.
    pub name: String,
    pub error: MemphisError,
}

/// Supervised set of background tasks for one client.
///
/// Failures are logged and funneled into a per-client observation channel;
/// closing the client aborts everything registered here.
pub(crate) struct TaskSet {
    aborts: StdMutex<Vec<AbortHandle>>,
    err_tx: mpsc::UnboundedSender<TaskError>,
    err_rx: StdMutex<Option<mpsc::UnboundedReceiver<TaskError>>>,
}

impl TaskSet {
    fn new() -> Self {
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        Self {
            aborts: StdMutex::new(Vec::new()),
            err_tx,
            err_rx: StdMutex::new(Some(err_rx)),
        }
    }

    /// Spawn a supervised task. The task's error, if any, is logged and sent
    /// to the observation channel; it is never returned to a caller.
    pub(crate) fn spawn<F>(&self, resource_kind: &'static str, name: String, fut: F) -> AbortHandle
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let err_tx = self.err_tx.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = fut.await {
                error!(resource_kind, name = %name, error = %err, "background task failed");
                let _ = err_tx.send(TaskError {
                    resource_kind,
                    name,
                    error: err,
                });
            }
        });
        let abort = handle.abort_handle();
        self.track(abort.clone());
        abort
    }

    /// Register an externally spawned task for abort-on-close.
    pub(crate) fn track(&self, handle: AbortHandle) {
        self.aborts.lock().expect("task set lock poisoned").push(handle);
    }

    fn abort_all(&self) {
        let mut aborts = self.aborts.lock().expect("task set lock poisoned");
        for handle in aborts.drain(..) {
            handle.abort();
        }
    }

    fn take_error_receiver(&self) -> Option<mpsc::UnboundedReceiver<TaskError>> {
        self.err_rx.lock().expect("task set lock poisoned").take()
    }
}

/// A connection to a Memphis broker.
///
/// Cheap to clone; all clones share the connection, the schema cache, and the
/// background task set.
#[derive(Clone)]
pub struct Memphis {
    pub(crate) client: async_nats::Client,
    pub(crate) jetstream: jetstream::Context,
    pub(crate) connection_id: String,
    pub(crate) station_updates: Arc<StationUpdateManager>,
    pub(crate) config_updates: Arc<ConfigUpdateManager>,
    pub(crate) tasks: Arc<TaskSet>,
}

impl Memphis {
    /// Connect to a broker with token authentication.
    pub async fn connect(
        host: &str,
        username: &str,
        connection_token: &str,
        options: Options,
    ) -> Result<Self> {
        let connection_id = subjects::random_hex(12);
        let url = format!("nats://{}:{}", host, options.port);
        let reconnect_wait = options.reconnect_wait;
        let max_reconnects = if options.auto_reconnect {
            Some(options.max_reconnects)
        } else {
            Some(0)
        };

        let client = async_nats::ConnectOptions::with_token(connection_token.to_string())
            .name(format!("{}::{}", connection_id, username))
            .connection_timeout(options.connection_timeout)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .max_reconnects(max_reconnects)
            .connect(url.as_str())
            .await
            .map_err(|e| MemphisError::Connection(e.to_string()))?;

        let jetstream = jetstream::new(client.clone());
        let station_updates = Arc::new(StationUpdateManager::new(client.clone()));
        let config_updates = Arc::new(ConfigUpdateManager::new());
        config_updates.start(&client).await?;

        debug!(connection_id = %connection_id, url = %url, "connected to broker");

        Ok(Self {
            client,
            jetstream,
            connection_id,
            station_updates,
            config_updates,
            tasks: Arc::new(TaskSet::new()),
        })
    }

    /// Connect with default options.
    pub async fn connect_default(
        host: &str,
        username: &str,
        connection_token: &str,
    ) -> Result<Self> {
        Self::connect(host, username, connection_token, Options::default()).await
    }

    /// Random per-connection identifier stamped on every produced message.
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    /// Abort every background task and flush the connection. Safe to call
    /// while tasks are mid-await; the connection itself closes when the last
    /// client clone is dropped.
    pub async fn close(&self) {
        self.tasks.abort_all();
        self.station_updates.shutdown().await;
        self.config_updates.shutdown().await;
        let _ = self.client.flush().await;
    }

    /// Take the background-task error channel. Yields one entry per failed
    /// async produce, liveness probe, or update listener. Can be taken once.
    pub fn task_errors(&self) -> Option<mpsc::UnboundedReceiver<TaskError>> {
        self.tasks.take_error_receiver()
    }

    // ========================================================================
    // Factories
    // ========================================================================

    /// Create a station. A station that already exists is returned as-is.
    pub async fn create_station(&self, name: &str, options: StationOptions) -> Result<Station> {
        let station = Station::new(self.clone(), subjects::internal_name(name), options);

        match self.create_resource(&station).await {
            Ok(()) => Ok(station),
            Err(MemphisError::Broker(msg)) if msg.contains("already exist") => Ok(station),
            Err(e) => Err(e),
        }
    }

    /// Create a producer bound to a station.
    ///
    /// Attaches to the station's schema cache before the creation request and
    /// rolls the attachment back if the request fails.
    pub async fn producer(
        &self,
        station_name: &str,
        producer_name: &str,
        options: ProducerOptions,
    ) -> Result<Producer> {
        let name = if options.gen_unique_suffix {
            subjects::extend_name_with_rand_suffix(producer_name)
        } else {
            producer_name.to_string()
        };
        let name = subjects::internal_name(&name);
        let station = subjects::internal_name(station_name);

        self.station_updates.listen_to_schema_updates(&station).await?;

        let producer = Producer::new(self.clone(), name, station.clone());
        if let Err(e) = self.create_resource(&producer).await {
            if let Err(detach_err) = self
                .station_updates
                .remove_schema_update_listener(&station)
                .await
            {
                error!(station = %station, error = %detach_err, "failed to roll back schema attach");
            }
            return Err(e);
        }

        Ok(producer)
    }

    /// Create a consumer bound to a station, with a durable pull subscription
    /// for its group, and start its liveness ping loop.
    pub async fn consumer(
        &self,
        station_name: &str,
        consumer_name: &str,
        options: ConsumerOptions,
    ) -> Result<Consumer> {
        let name = if options.gen_unique_suffix {
            subjects::extend_name_with_rand_suffix(consumer_name)
        } else {
            consumer_name.to_string()
        };
        let name = subjects::internal_name(&name);
        let station = subjects::internal_name(station_name);
        let group = subjects::internal_name(
            options.consumer_group.as_deref().unwrap_or(consumer_name),
        );

        let stream = self
            .jetstream
            .get_stream(&station)
            .await
            .map_err(|e| MemphisError::broker(e.to_string()))?;

        let pull = stream
            .get_or_create_consumer(
                &group,
                jetstream::consumer::pull::Config {
                    durable_name: Some(group.clone()),
                    filter_subject: subjects::station_subject(&station),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: options.max_ack_time,
                    max_deliver: options.max_msg_deliveries,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MemphisError::broker(e.to_string()))?;

        let consumer = Consumer::new(self.clone(), name, station, group, &options, pull);
        self.create_resource(&consumer).await?;
        consumer.start_ping_loop();

        Ok(consumer)
    }

    /// Attach a named schema to a station.
    pub async fn attach_schema(&self, schema_name: &str, station_name: &str) -> Result<()> {
        self.create_resource(&SchemaAttachment {
            schema_name: schema_name.to_string(),
            station_name: subjects::internal_name(station_name),
        })
        .await
    }

    /// Detach the active schema from a station.
    pub async fn detach_schema(&self, station_name: &str) -> Result<()> {
        self.destroy_resource(&SchemaDetachment {
            station_name: subjects::internal_name(station_name),
        })
        .await
    }

    // ========================================================================
    // Lifecycle protocol
    // ========================================================================

    pub(crate) async fn request(&self, subject: String, payload: Vec<u8>) -> Result<Vec<u8>> {
        let reply = self
            .client
            .request(subject, payload.into())
            .await
            .map_err(|e| MemphisError::Connection(e.to_string()))?;
        Ok(reply.payload.to_vec())
    }

    pub(crate) async fn create_resource<R: Creatable + ?Sized>(&self, resource: &R) -> Result<()> {
        let subject = resource.creation_subject();
        debug!(subject = %subject, "creating resource");

        let payload = resource.creation_payload().to_string().into_bytes();
        let reply = self.request(subject, payload).await?;
        resource.handle_creation_response(self, &reply).await
    }

    pub(crate) async fn destroy_resource<R: Destroyable + ?Sized>(
        &self,
        resource: &R,
    ) -> Result<()> {
        let subject = resource.destruction_subject();
        debug!(subject = %subject, "destroying resource");

        let payload = resource.destruction_payload().to_string().into_bytes();
        let reply = self.request(subject, payload).await?;

        let text = String::from_utf8_lossy(&reply);
        if !reply.is_empty() && !text.contains("not exist") {
            return Err(MemphisError::broker(text));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let options = Options::default();
        assert_eq!(options.port, 6666);
        assert!(options.auto_reconnect);
        assert_eq!(options.max_reconnects, 3);
        assert_eq!(options.reconnect_wait, Duration::from_secs(5));
        assert_eq!(options.connection_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_task_set_funnels_errors() {
        let tasks = TaskSet::new();
        let mut errors = tasks.take_error_receiver().unwrap();

        tasks.spawn("producer", "p1".to_string(), async {
            Err(MemphisError::Broker("boom".to_string()))
        });

        let err = errors.recv().await.unwrap();
        assert_eq!(err.resource_kind, "producer");
        assert_eq!(err.name, "p1");
        assert!(matches!(err.error, MemphisError::Broker(_)));
    }

    #[tokio::test]
    async fn test_task_set_success_is_silent() {
        let tasks = TaskSet::new();
        let mut errors = tasks.take_error_receiver().unwrap();

        tasks.spawn("producer", "p1".to_string(), async { Ok(()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(errors.try_recv().is_err());
    }

    #[test]
    fn test_error_receiver_taken_once() {
        let tasks = TaskSet::new();
        assert!(tasks.take_error_receiver().is_some());
        assert!(tasks.take_error_receiver().is_none());
    }
}
