//! Stations: named durable streams with retention, storage, and replication
//! policy, plus dead-letter routing flags.

use std::time::Duration;

use serde_json::{json, Value};

use crate::client::Memphis;
use crate::error::Result;
use crate::lifecycle::{Creatable, Destroyable};
use crate::subjects;

/// Retention policy kind for a station.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionType {
    MaxAgeSeconds,
    Messages,
    Bytes,
}

impl RetentionType {
    fn wire_value(self) -> &'static str {
        match self {
            Self::MaxAgeSeconds => "message_age_sec",
            Self::Messages => "messages",
            Self::Bytes => "bytes",
        }
    }
}

/// Backing storage for a station's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageType {
    Disk,
    Memory,
}

impl StorageType {
    fn wire_value(self) -> &'static str {
        match self {
            Self::Disk => "file",
            Self::Memory => "memory",
        }
    }
}

/// Station creation options.
#[derive(Debug, Clone)]
pub struct StationOptions {
    pub retention_type: RetentionType,
    pub retention_value: i32,
    pub storage_type: StorageType,
    pub replicas: i32,
    pub idempotency_window: Duration,
    /// Schema to bind at creation time, if any.
    pub schema_name: Option<String>,
    /// Route undeliverable ("poison") messages to the dead-letter channel.
    pub send_poison_msg_to_dls: bool,
    /// Route schema validation failures to the dead-letter channel.
    pub send_schema_failed_msg_to_dls: bool,
}

impl Default for StationOptions {
    fn default() -> Self {
        Self {
            retention_type: RetentionType::MaxAgeSeconds,
            retention_value: 604_800,
            storage_type: StorageType::Disk,
            replicas: 1,
            idempotency_window: Duration::from_secs(120),
            schema_name: None,
            send_poison_msg_to_dls: true,
            send_schema_failed_msg_to_dls: true,
        }
    }
}

/// Handle to a provisioned station.
pub struct Station {
    memphis: Memphis,
    name: String,
    options: StationOptions,
}

impl Station {
    pub(crate) fn new(memphis: Memphis, name: String, options: StationOptions) -> Self {
        Self {
            memphis,
            name,
            options,
        }
    }

    /// Normalized station name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &StationOptions {
        &self.options
    }

    /// Name of the schema currently active on this station, if the client
    /// has a producer attached and a schema is bound.
    pub async fn schema_name(&self) -> Option<String> {
        self.memphis.station_updates.schema_name(&self.name).await
    }

    /// Attach a named schema to this station.
    pub async fn attach_schema(&self, schema_name: &str) -> Result<()> {
        self.memphis.attach_schema(schema_name, &self.name).await
    }

    /// Detach the active schema from this station.
    pub async fn detach_schema(&self) -> Result<()> {
        self.memphis.detach_schema(&self.name).await
    }

    /// Destroy the station. Destroying a station that is already gone is not
    /// an error.
    pub async fn destroy(&self) -> Result<()> {
        self.memphis.destroy_resource(self).await
    }
}

fn creation_payload_for(name: &str, options: &StationOptions) -> Value {
    json!({
        "name": name,
        "retention_type": options.retention_type.wire_value(),
        "retention_value": options.retention_value,
        "storage_type": options.storage_type.wire_value(),
        "replicas": options.replicas,
        "idempotency_window_in_ms": options.idempotency_window.as_millis() as u64,
        "schema_name": options.schema_name.as_deref().unwrap_or(""),
        "dls_configuration": {
            "poison": options.send_poison_msg_to_dls,
            "schemaverse": options.send_schema_failed_msg_to_dls,
        },
    })
}

impl Creatable for Station {
    fn creation_subject(&self) -> String {
        subjects::STATION_CREATIONS.to_string()
    }

    fn creation_payload(&self) -> Value {
        creation_payload_for(&self.name, &self.options)
    }
}

impl Destroyable for Station {
    fn destruction_subject(&self) -> String {
        subjects::STATION_DESTRUCTIONS.to_string()
    }

    fn destruction_payload(&self) -> Value {
        json!({ "station_name": self.name })
    }
}

/// Lifecycle request binding a named schema to a station.
pub(crate) struct SchemaAttachment {
    pub schema_name: String,
    pub station_name: String,
}

impl Creatable for SchemaAttachment {
    fn creation_subject(&self) -> String {
        subjects::SCHEMA_ATTACHMENTS.to_string()
    }

    fn creation_payload(&self) -> Value {
        json!({
            "name": self.schema_name,
            "station_name": self.station_name,
        })
    }
}

/// Lifecycle request unbinding the active schema from a station.
pub(crate) struct SchemaDetachment {
    pub station_name: String,
}

impl Destroyable for SchemaDetachment {
    fn destruction_subject(&self) -> String {
        subjects::SCHEMA_DETACHMENTS.to_string()
    }

    fn destruction_payload(&self) -> Value {
        json!({ "station_name": self.station_name })
    }
}
