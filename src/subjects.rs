//! Broker subject naming and name normalization.
//!
//! Every subject here is part of the broker's RPC surface and must match the
//! broker byte for byte.

/// Producer provisioning subjects.
pub(crate) const PRODUCER_CREATIONS: &str = "$memphis_producer_creations";
pub(crate) const PRODUCER_DESTRUCTIONS: &str = "$memphis_producer_destructions";

/// Consumer provisioning subjects.
pub(crate) const CONSUMER_CREATIONS: &str = "$memphis_consumer_creations";
pub(crate) const CONSUMER_DESTRUCTIONS: &str = "$memphis_consumer_destructions";

/// Station provisioning subjects.
pub(crate) const STATION_CREATIONS: &str = "$memphis_station_creations";
pub(crate) const STATION_DESTRUCTIONS: &str = "$memphis_station_destructions";

/// Schema attachment subjects.
pub(crate) const SCHEMA_ATTACHMENTS: &str = "$memphis_schema_attachments";
pub(crate) const SCHEMA_DETACHMENTS: &str = "$memphis_schema_detachments";

/// Cluster-wide SDK configuration updates.
pub(crate) const SDK_CONFIG_UPDATES: &str = "$memphis_sdk_configurations_updates";

/// Notification events (schema validation failure alerts).
pub(crate) const NOTIFICATIONS: &str = "$memphis_notifications";

/// Acknowledgement subject for non-stream (dead-letter) messages.
pub(crate) const PM_ACKS: &str = "$memphis_pm_acks";

/// Header carrying the broker-assigned id of a dead-letter message.
pub(crate) const PM_ID_HEADER: &str = "$memphis_pm_id";

/// Headers stamped on every produced message.
pub(crate) const CONNECTION_ID_HEADER: &str = "$memphis_connectionId";
pub(crate) const PRODUCED_BY_HEADER: &str = "$memphis_producedBy";

/// Reserved header prefix; user-supplied keys must not use it.
pub(crate) const RESERVED_HEADER_PREFIX: &str = "$memphis";

/// Normalize a user-facing name into its protocol identifier: case-folded,
/// with `.` replaced by `#`.
pub(crate) fn internal_name(name: &str) -> String {
    name.to_lowercase().replace('.', "#")
}

/// Append a random hex suffix, used when callers ask for unique names.
pub(crate) fn extend_name_with_rand_suffix(name: &str) -> String {
    format!("{}_{}", name, random_hex(4))
}

/// Generate `len` random bytes, hex encoded (2 * `len` characters).
pub(crate) fn random_hex(len: usize) -> String {
    let bytes: Vec<u8> = (0..len).map(|_| rand::random::<u8>()).collect();
    hex::encode(bytes)
}

/// Canonical publish subject for a station.
pub(crate) fn station_subject(station: &str) -> String {
    format!("{}.final", station)
}

/// Per-station schema update subject.
pub(crate) fn schema_updates_subject(station: &str) -> String {
    format!("$memphis_schema_updates_{}", station)
}

/// Dead-letter subject a producer writes rejected records to.
pub(crate) fn dls_subject(kind: &str, station: &str, id: &str) -> String {
    format!("$memphis-{}-dls.{}.{}", station, kind, id)
}

/// Dead-letter subject a consumer group listens on.
pub(crate) fn dls_consumer_subject(station: &str, group: &str) -> String {
    format!("$memphis_dls_{}_{}", station, group)
}
