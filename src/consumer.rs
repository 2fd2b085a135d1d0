//! Consumers: durable pull subscriptions on a station.
//!
//! A consumer belongs to a group; the group shares one durable pull consumer
//! on the station's stream. Consuming merges two sources into a single
//! stream: batched fetches from the durable consumer and the group's
//! dead-letter resend subject. A liveness loop probes the broker and marks
//! the consumer inactive when the station stops answering.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_nats::jetstream;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::client::Memphis;
use crate::error::{MemphisError, Result};
use crate::lifecycle::{Creatable, Destroyable};
use crate::subjects;

const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Consumer creation options.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Group the consumer joins. Defaults to the consumer's own name.
    pub consumer_group: Option<String>,
    /// Sleep between fetch batches.
    pub pull_interval: Duration,
    /// Maximum messages per fetch.
    pub batch_size: usize,
    /// How long a fetch waits for a partial batch.
    pub batch_max_time_to_wait: Duration,
    /// Broker-side redelivery window for unacknowledged messages.
    pub max_ack_time: Duration,
    pub max_msg_deliveries: i64,
    /// Append a random hex suffix to the consumer name.
    pub gen_unique_suffix: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            consumer_group: None,
            pull_interval: Duration::from_secs(1),
            batch_size: 10,
            batch_max_time_to_wait: Duration::from_secs(5),
            max_ack_time: Duration::from_secs(30),
            max_msg_deliveries: 10,
            gen_unique_suffix: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsumingStatus {
    Inactive,
    Active,
}

/// Handle to a provisioned consumer.
pub struct Consumer {
    memphis: Memphis,
    name: String,
    station_name: String,
    consumer_group: String,
    pull_interval: Duration,
    batch_size: usize,
    batch_max_time_to_wait: Duration,
    max_ack_time: Duration,
    max_msg_deliveries: i64,
    pull: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
    status: Arc<StdMutex<ConsumingStatus>>,
    fetch_abort: Arc<StdMutex<Option<AbortHandle>>>,
    dls_abort: Arc<StdMutex<Option<AbortHandle>>>,
    ping_abort: Arc<StdMutex<Option<AbortHandle>>>,
}

impl Consumer {
    pub(crate) fn new(
        memphis: Memphis,
        name: String,
        station_name: String,
        consumer_group: String,
        options: &ConsumerOptions,
        pull: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
    ) -> Self {
        Self {
            memphis,
            name,
            station_name,
            consumer_group,
            pull_interval: options.pull_interval,
            batch_size: options.batch_size,
            batch_max_time_to_wait: options.batch_max_time_to_wait,
            max_ack_time: options.max_ack_time,
            max_msg_deliveries: options.max_msg_deliveries,
            pull,
            status: Arc::new(StdMutex::new(ConsumingStatus::Inactive)),
            fetch_abort: Arc::new(StdMutex::new(None)),
            dls_abort: Arc::new(StdMutex::new(None)),
            ping_abort: Arc::new(StdMutex::new(None)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    /// Start consuming. Yields both station messages and dead-letter resends
    /// for this group, merged into one stream.
    ///
    /// Fails with a state error if the consumer is already consuming.
    pub fn consume(&self) -> Result<ReceiverStream<MemphisMessage>> {
        self.transition_to_active()?;

        let (tx, rx) = mpsc::channel(self.batch_size.max(1) * 2);
        self.start_fetch_loop(tx.clone());
        self.start_dls_loop(tx);
        Ok(ReceiverStream::new(rx))
    }

    /// Start consuming station messages only, skipping dead-letter resends.
    pub fn subscribe_messages(&self) -> Result<ReceiverStream<MemphisMessage>> {
        self.transition_to_active()?;

        let (tx, rx) = mpsc::channel(self.batch_size.max(1) * 2);
        self.start_fetch_loop(tx);
        Ok(ReceiverStream::new(rx))
    }

    /// Start consuming dead-letter resends for this group only.
    pub fn subscribe_dls(&self) -> Result<ReceiverStream<MemphisMessage>> {
        self.transition_to_active()?;

        let (tx, rx) = mpsc::channel(self.batch_size.max(1) * 2);
        self.start_dls_loop(tx);
        Ok(ReceiverStream::new(rx))
    }

    /// Stop consuming. The consumer stays provisioned and can consume again.
    ///
    /// Only the fetch loop stops; the dead-letter listener keeps forwarding
    /// resends until the consumer is destroyed.
    pub fn stop_consuming(&self) -> Result<()> {
        {
            let mut status = self.status.lock().expect("consumer status lock poisoned");
            if *status == ConsumingStatus::Inactive {
                return Err(MemphisError::State("consumer is inactive".to_string()));
            }
            *status = ConsumingStatus::Inactive;
        }

        abort_slot(&self.fetch_abort);
        Ok(())
    }

    /// Stop consuming if active, stop the dead-letter and liveness loops, and
    /// destroy the consumer on the broker.
    pub async fn destroy(&self) -> Result<()> {
        let _ = self.stop_consuming();
        abort_slot(&self.dls_abort);
        abort_slot(&self.ping_abort);
        self.memphis.destroy_resource(self).await
    }

    fn transition_to_active(&self) -> Result<()> {
        let mut status = self.status.lock().expect("consumer status lock poisoned");
        if *status == ConsumingStatus::Active {
            return Err(MemphisError::State("already consuming".to_string()));
        }
        *status = ConsumingStatus::Active;
        Ok(())
    }

    fn is_active(&self) -> bool {
        *self.status.lock().expect("consumer status lock poisoned") == ConsumingStatus::Active
    }

    fn start_fetch_loop(&self, tx: mpsc::Sender<MemphisMessage>) {
        let pull = self.pull.clone();
        let status = Arc::clone(&self.status);
        let memphis = self.memphis.clone();
        let consumer_group = self.consumer_group.clone();
        let station = self.station_name.clone();
        let batch_size = self.batch_size;
        let expires = self.batch_max_time_to_wait;
        let pull_interval = self.pull_interval;
        let max_ack_time = self.max_ack_time;

        let abort = self
            .memphis
            .tasks
            .spawn("consumer", self.name.clone(), async move {
                loop {
                    if *status.lock().expect("consumer status lock poisoned")
                        != ConsumingStatus::Active
                    {
                        return Ok(());
                    }

                    let batch = pull
                        .fetch()
                        .max_messages(batch_size)
                        .expires(expires)
                        .messages()
                        .await;

                    match batch {
                        Ok(mut messages) => {
                            while let Some(msg) = messages.next().await {
                                match msg {
                                    Ok(msg) => {
                                        let message = MemphisMessage {
                                            kind: MessageKind::Stream(msg),
                                            memphis: memphis.clone(),
                                            consumer_group: consumer_group.clone(),
                                            ack_wait: max_ack_time,
                                        };
                                        if tx.send(message).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                    Err(e) => {
                                        warn!(station = %station, error = %e, "fetch yielded an errored message")
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(station = %station, error = %e, "message fetch failed")
                        }
                    }

                    tokio::time::sleep(pull_interval).await;
                }
            });
        *self.fetch_abort.lock().expect("consumer abort lock poisoned") = Some(abort);
    }

    fn start_dls_loop(&self, tx: mpsc::Sender<MemphisMessage>) {
        // A listener from an earlier consume session feeds a dropped channel;
        // replace it.
        abort_slot(&self.dls_abort);

        let client = self.memphis.client.clone();
        let memphis = self.memphis.clone();
        let consumer_group = self.consumer_group.clone();
        let subject = subjects::dls_consumer_subject(&self.station_name, &self.consumer_group);
        let max_ack_time = self.max_ack_time;

        let abort = self
            .memphis
            .tasks
            .spawn("consumer", self.name.clone(), async move {
                // Queue group so only one group member gets each resend.
                let mut subscription = client
                    .queue_subscribe(subject, consumer_group.clone())
                    .await
                    .map_err(|e| MemphisError::Connection(e.to_string()))?;

                while let Some(msg) = subscription.next().await {
                    let message = MemphisMessage {
                        kind: MessageKind::Core(msg),
                        memphis: memphis.clone(),
                        consumer_group: consumer_group.clone(),
                        ack_wait: max_ack_time,
                    };
                    if tx.send(message).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(())
            });
        *self.dls_abort.lock().expect("consumer abort lock poisoned") = Some(abort);
    }

    /// Probe the durable consumer every 30 seconds. If the broker stops
    /// answering, consuming stops and the failure surfaces on the client's
    /// task error channel.
    pub(crate) fn start_ping_loop(&self) {
        let mut pull = self.pull.clone();
        let status = Arc::clone(&self.status);
        let fetch_abort = Arc::clone(&self.fetch_abort);
        let station = self.station_name.clone();
        let group = self.consumer_group.clone();

        let abort = self
            .memphis
            .tasks
            .spawn("consumer", self.name.clone(), async move {
                loop {
                    tokio::time::sleep(PING_INTERVAL).await;
                    if let Err(e) = pull.info().await {
                        debug!(station = %station, group = %group, error = %e, "liveness probe failed");
                        *status.lock().expect("consumer status lock poisoned") =
                            ConsumingStatus::Inactive;
                        abort_slot(&fetch_abort);
                        return Err(MemphisError::Broker(format!(
                            "station unreachable for consumer group {}",
                            group
                        )));
                    }
                }
            });
        *self.ping_abort.lock().expect("consumer abort lock poisoned") = Some(abort);
    }
}

fn abort_slot(slot: &StdMutex<Option<AbortHandle>>) {
    if let Some(handle) = slot.lock().expect("consumer abort lock poisoned").take() {
        handle.abort();
    }
}

enum MessageKind {
    Stream(jetstream::Message),
    Core(async_nats::Message),
}

/// A message delivered to a consumer, either from the station's stream or
/// from the group's dead-letter resend subject.
pub struct MemphisMessage {
    kind: MessageKind,
    memphis: Memphis,
    consumer_group: String,
    ack_wait: Duration,
}

impl MemphisMessage {
    pub fn data(&self) -> &[u8] {
        match &self.kind {
            MessageKind::Stream(msg) => &msg.payload,
            MessageKind::Core(msg) => &msg.payload,
        }
    }

    pub fn headers(&self) -> Option<&async_nats::HeaderMap> {
        match &self.kind {
            MessageKind::Stream(msg) => msg.headers.as_ref(),
            MessageKind::Core(msg) => msg.headers.as_ref(),
        }
    }

    /// Acknowledge the message. Stream messages are acknowledged to the
    /// durable consumer; dead-letter resends are acknowledged back to the
    /// broker by id so it stops redelivering them.
    pub async fn ack(self) -> Result<()> {
        match self.kind {
            MessageKind::Stream(msg) => tokio::time::timeout(self.ack_wait, msg.double_ack())
                .await
                .map_err(|_| MemphisError::Broker("acknowledgement timed out".to_string()))?
                .map_err(|e| MemphisError::broker(e.to_string())),
            MessageKind::Core(msg) => {
                let id = msg
                    .headers
                    .as_ref()
                    .and_then(|headers| headers.get(subjects::PM_ID_HEADER))
                    .map(|value| value.as_str().to_string())
                    .ok_or_else(|| {
                        MemphisError::Broker(
                            "dead-letter message is missing its id header".to_string(),
                        )
                    })?;

                let payload = pm_ack_payload(&id, &self.consumer_group);
                self.memphis
                    .client
                    .publish(subjects::PM_ACKS, serde_json::to_vec(&payload)?.into())
                    .await
                    .map_err(|e| MemphisError::Connection(e.to_string()))
            }
        }
    }
}

fn pm_ack_payload(id: &str, consumer_group: &str) -> Value {
    // The broker assigns numeric ids; keep the raw string if it ever is not.
    let id_value = id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::from(id));
    json!({
        "id": id_value,
        "cg_name": consumer_group,
    })
}

fn creation_payload_for(
    name: &str,
    station_name: &str,
    connection_id: &str,
    consumer_group: &str,
    max_ack_time: Duration,
    max_msg_deliveries: i64,
) -> Value {
    json!({
        "name": name,
        "station_name": station_name,
        "connection_id": connection_id,
        "consumer_type": "application",
        "consumers_group": consumer_group,
        "max_ack_time_ms": max_ack_time.as_millis() as u64,
        "max_msg_deliveries": max_msg_deliveries,
    })
}

impl Creatable for Consumer {
    fn creation_subject(&self) -> String {
        subjects::CONSUMER_CREATIONS.to_string()
    }

    fn creation_payload(&self) -> Value {
        creation_payload_for(
            &self.name,
            &self.station_name,
            &self.memphis.connection_id,
            &self.consumer_group,
            self.max_ack_time,
            self.max_msg_deliveries,
        )
    }
}

impl Destroyable for Consumer {
    fn destruction_subject(&self) -> String {
        subjects::CONSUMER_DESTRUCTIONS.to_string()
    }

    fn destruction_payload(&self) -> Value {
        json!({
            "name": self.name,
            "station_name": self.station_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================================
    // Option Tests
    // ============================================================================

    #[test]
    fn test_options_defaults() {
        let options = ConsumerOptions::default();
        assert!(options.consumer_group.is_none());
        assert_eq!(options.pull_interval, Duration::from_secs(1));
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.batch_max_time_to_wait, Duration::from_secs(5));
        assert_eq!(options.max_ack_time, Duration::from_secs(30));
        assert_eq!(options.max_msg_deliveries, 10);
        assert!(!options.gen_unique_suffix);
    }

    // ============================================================================
    // Wire Payload Tests
    // ============================================================================

    #[test]
    fn test_creation_payload_shape() {
        let payload = creation_payload_for(
            "c1",
            "orders",
            "deadbeef",
            "cg1",
            Duration::from_secs(30),
            10,
        );
        assert_eq!(payload["name"], "c1");
        assert_eq!(payload["station_name"], "orders");
        assert_eq!(payload["connection_id"], "deadbeef");
        assert_eq!(payload["consumer_type"], "application");
        assert_eq!(payload["consumers_group"], "cg1");
        assert_eq!(payload["max_ack_time_ms"], 30_000);
        assert_eq!(payload["max_msg_deliveries"], 10);
        // Only producer creation carries a request version.
        assert!(payload.get("req_version").is_none());
    }

    #[test]
    fn test_pm_ack_payload_numeric_id() {
        let payload = pm_ack_payload("42", "cg1");
        assert_eq!(payload, json!({"id": 42, "cg_name": "cg1"}));
    }

    #[test]
    fn test_pm_ack_payload_opaque_id() {
        let payload = pm_ack_payload("abc~def", "cg1");
        assert_eq!(payload, json!({"id": "abc~def", "cg_name": "cg1"}));
    }
}
