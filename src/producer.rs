//! Producers: validated publishing to a station.
//!
//! Every outgoing payload runs through the station's active schema before it
//! is published. A rejected payload is routed to the station's dead-letter
//! subject (when the cluster says so), optionally raises a notification
//! event, and the validation error propagates to the caller; the original
//! publish never happens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::client::Memphis;
use crate::error::{MemphisError, Result};
use crate::lifecycle::{Creatable, Destroyable};
use crate::schema::SchemaUpdateInit;
use crate::subjects;

const SCHEMA_FAIL_ALERT_TYPE: &str = "schema_validation_fail_alert";

/// User-supplied message headers.
///
/// Keys starting with the reserved `$memphis` prefix are stamped by the SDK
/// and cannot be set by callers.
#[derive(Debug, Default, Clone)]
pub struct Headers {
    inner: async_nats::HeaderMap,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header. Fails on reserved keys.
    pub fn put(&mut self, key: &str, value: &str) -> Result<()> {
        if key.starts_with(subjects::RESERVED_HEADER_PREFIX) {
            return Err(MemphisError::State(format!(
                "keys in headers should not start with {}",
                subjects::RESERVED_HEADER_PREFIX
            )));
        }
        self.inner.insert(key, value);
        Ok(())
    }

    fn into_inner(self) -> async_nats::HeaderMap {
        self.inner
    }
}

/// Producer creation options.
#[derive(Debug, Clone, Default)]
pub struct ProducerOptions {
    /// Append a random hex suffix to the producer name.
    pub gen_unique_suffix: bool,
}

/// Per-publish options.
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    /// How long to wait for the broker's publish acknowledgement.
    pub ack_wait: Duration,
    pub headers: Headers,
    /// Idempotency key for broker-side deduplication.
    pub message_id: Option<String>,
}

impl Default for ProduceOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(15),
            headers: Headers::new(),
            message_id: None,
        }
    }
}

/// Dead-letter record written when a payload fails schema validation.
#[derive(Debug, Serialize)]
struct DlsMessage {
    #[serde(rename = "_id")]
    id: String,
    station_name: String,
    producer: ProducerDetails,
    message: MessagePayloadDls,
    creation_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ProducerDetails {
    name: String,
    connection_id: String,
}

#[derive(Debug, Serialize)]
struct MessagePayloadDls {
    time_sent: DateTime<Utc>,
    size: usize,
    data: String,
    headers: HashMap<String, String>,
}

/// Notification event raised alongside a dead-letter write.
#[derive(Debug, Serialize)]
struct Notification {
    title: String,
    msg: String,
    code: String,
    #[serde(rename = "type")]
    alert_type: String,
}

/// Handle to a provisioned producer.
#[derive(Clone)]
pub struct Producer {
    memphis: Memphis,
    name: String,
    station_name: String,
    /// The create-time schema cache attach is released at most once, shared
    /// across clones.
    detached: Arc<AtomicBool>,
}

impl Producer {
    pub(crate) fn new(memphis: Memphis, name: String, station_name: String) -> Self {
        Self {
            memphis,
            name,
            station_name,
            detached: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn station_name(&self) -> &str {
        &self.station_name
    }

    /// Validate and publish a payload, waiting for the broker's
    /// acknowledgement.
    pub async fn produce(&self, payload: &[u8], options: ProduceOptions) -> Result<()> {
        let mut headers = options.headers.into_inner();
        headers.insert(
            subjects::CONNECTION_ID_HEADER,
            self.memphis.connection_id.as_str(),
        );
        headers.insert(subjects::PRODUCED_BY_HEADER, self.name.as_str());
        if let Some(message_id) = &options.message_id {
            headers.insert("msg-id", message_id.as_str());
        }

        if let Err(err) = self
            .memphis
            .station_updates
            .validate(&self.station_name, payload)
            .await
        {
            self.handle_validation_failure(payload, &headers, &err).await;
            return Err(err);
        }

        let subject = subjects::station_subject(&self.station_name);
        let ack = self
            .memphis
            .jetstream
            .publish_with_headers(subject, headers, payload.to_vec().into())
            .await
            .map_err(|e| MemphisError::broker(e.to_string()))?;

        let ack = tokio::time::timeout(options.ack_wait, ack)
            .await
            .map_err(|_| {
                MemphisError::Broker("publish acknowledgement timed out".to_string())
            })?
            .map_err(|e| MemphisError::broker(e.to_string()))?;

        debug!(
            station = %self.station_name,
            producer = %self.name,
            sequence = ack.sequence,
            "published message"
        );
        Ok(())
    }

    /// Fire-and-forget variant of [`produce`](Self::produce).
    ///
    /// Runs the same pipeline on a background task. Errors are not returned
    /// to the caller: they are logged and funneled to the client's
    /// [`task_errors`](Memphis::task_errors) channel. Use `produce` when
    /// error visibility matters.
    pub fn produce_async(&self, payload: Vec<u8>, options: ProduceOptions) {
        let producer = self.clone();
        self.memphis
            .tasks
            .spawn("producer", self.name.clone(), async move {
                producer.produce(&payload, options).await
            });
    }

    /// Destroy the producer and release its schema cache attachment.
    /// Destroying a producer that is already gone is not an error.
    pub async fn destroy(&self) -> Result<()> {
        self.memphis.destroy_resource(self).await?;
        if self.detached.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.memphis
            .station_updates
            .remove_schema_update_listener(&self.station_name)
            .await
    }

    /// Best-effort dead-letter + notification side effects. Failures here are
    /// logged and never mask the validation error.
    async fn handle_validation_failure(
        &self,
        payload: &[u8],
        headers: &async_nats::HeaderMap,
        err: &MemphisError,
    ) {
        if !self
            .memphis
            .config_updates
            .send_message_to_dls(&self.station_name)
            .await
        {
            return;
        }

        if let Err(publish_err) = self.publish_dls_record(payload, headers).await {
            warn!(
                station = %self.station_name,
                producer = %self.name,
                error = %publish_err,
                "failed to write dead-letter record"
            );
        }

        if self.memphis.config_updates.send_notification().await {
            if let Err(publish_err) = self.publish_notification(payload, err).await {
                warn!(
                    station = %self.station_name,
                    producer = %self.name,
                    error = %publish_err,
                    "failed to publish schema failure notification"
                );
            }
        }
    }

    async fn publish_dls_record(
        &self,
        payload: &[u8],
        headers: &async_nats::HeaderMap,
    ) -> Result<()> {
        let time_sent = Utc::now();
        let id = dls_message_id(&self.station_name, &self.name, time_sent);

        let mut dls_headers = HashMap::new();
        for (name, values) in headers.iter() {
            let joined = values
                .iter()
                .map(|v| v.as_str().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            dls_headers.insert(name.to_string(), joined);
        }

        let record = DlsMessage {
            id: id.clone(),
            station_name: self.station_name.clone(),
            producer: ProducerDetails {
                name: self.name.clone(),
                connection_id: self.memphis.connection_id.clone(),
            },
            message: MessagePayloadDls {
                time_sent,
                size: payload.len(),
                data: String::from_utf8_lossy(payload).into_owned(),
                headers: dls_headers,
            },
            creation_date: time_sent,
        };

        self.memphis
            .client
            .publish(
                subjects::dls_subject("schema", &self.station_name, &id),
                serde_json::to_vec(&record)?.into(),
            )
            .await
            .map_err(|e| MemphisError::Connection(e.to_string()))
    }

    async fn publish_notification(&self, payload: &[u8], err: &MemphisError) -> Result<()> {
        let notification = Notification {
            title: "Schema validation has failed".to_string(),
            msg: format!(
                "Station: {}\nProducer: {}\nError: {}",
                self.station_name, self.name, err
            ),
            code: String::from_utf8_lossy(payload).into_owned(),
            alert_type: SCHEMA_FAIL_ALERT_TYPE.to_string(),
        };

        self.memphis
            .client
            .publish(
                subjects::NOTIFICATIONS,
                serde_json::to_vec(&notification)?.into(),
            )
            .await
            .map_err(|e| MemphisError::Connection(e.to_string()))
    }
}

/// Dead-letter record id: `{station}~{producer}~0~{timestamp}` with spaces
/// stripped and commas replaced by `+`.
fn dls_message_id(station: &str, producer: &str, time_sent: DateTime<Utc>) -> String {
    format!(
        "{}~{}~0~{}",
        station,
        producer,
        time_sent.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
    .replace(' ', "")
    .replace(',', "+")
}

/// Producer creation response; also carries the station's initial schema and
/// the cluster config flags.
#[derive(Debug, serde::Deserialize)]
struct CreateProducerResponse {
    error: String,
    schema_update: SchemaUpdateInit,
    schemaverse_to_dls: bool,
    send_notification: bool,
}

fn creation_payload_for(name: &str, station_name: &str, connection_id: &str) -> Value {
    json!({
        "name": name,
        "station_name": station_name,
        "connection_id": connection_id,
        "producer_type": "application",
        "req_version": 1,
    })
}

#[async_trait::async_trait]
impl Creatable for Producer {
    fn creation_subject(&self) -> String {
        subjects::PRODUCER_CREATIONS.to_string()
    }

    fn creation_payload(&self) -> Value {
        creation_payload_for(&self.name, &self.station_name, &self.memphis.connection_id)
    }

    async fn handle_creation_response(&self, client: &Memphis, reply: &[u8]) -> Result<()> {
        let response: CreateProducerResponse = match serde_json::from_slice(reply) {
            Ok(response) => response,
            // Older brokers reply with plain text; fall back to the default
            // empty/non-empty contract.
            Err(_) => {
                if reply.is_empty() {
                    return Ok(());
                }
                return Err(MemphisError::broker(String::from_utf8_lossy(reply)));
            }
        };

        if !response.error.is_empty() {
            return Err(MemphisError::broker(&response.error));
        }

        client
            .station_updates
            .apply_schema(&self.station_name, &response.schema_update)
            .await?;
        client
            .config_updates
            .set_cluster_config("send_notification", response.send_notification)
            .await;
        client
            .config_updates
            .set_station_schemaverse_to_dls(&self.station_name, response.schemaverse_to_dls)
            .await;
        Ok(())
    }
}

impl Destroyable for Producer {
    fn destruction_subject(&self) -> String {
        subjects::PRODUCER_DESTRUCTIONS.to_string()
    }

    fn destruction_payload(&self) -> Value {
        json!({
            "name": self.name,
            "station_name": self.station_name,
        })
    }
}
