//! Memphis broker client.
//!
//! Connects to a Memphis broker, provisions stations, producers, and
//! consumers over the broker's request/reply surface, and moves messages
//! through durable streams. Producers validate payloads against the
//! station's live schema before publishing; consumers pull in batches and
//! also receive dead-letter resends for their group.
//!
//! ```no_run
//! use memphis_client::{ConsumerOptions, Memphis, ProduceOptions, ProducerOptions, StationOptions};
//!
//! # async fn example() -> memphis_client::Result<()> {
//! let memphis = Memphis::connect_default("localhost", "app-user", "token").await?;
//!
//! let station = memphis.create_station("orders", StationOptions::default()).await?;
//! let producer = memphis
//!     .producer(station.name(), "order-writer", ProducerOptions::default())
//!     .await?;
//! producer.produce(br#"{"id":"o-1"}"#, ProduceOptions::default()).await?;
//!
//! let consumer = memphis
//!     .consumer(station.name(), "order-reader", ConsumerOptions::default())
//!     .await?;
//! let _messages = consumer.consume()?;
//! # Ok(())
//! # }
//! ```

mod client;
mod config_update;
mod consumer;
mod error;
mod lifecycle;
mod producer;
mod schema;
mod station;
mod subjects;

pub use client::{Memphis, Options, TaskError};
pub use consumer::{Consumer, ConsumerOptions, MemphisMessage};
pub use error::{MemphisError, Result};
pub use producer::{Headers, ProduceOptions, Producer, ProducerOptions};
pub use station::{RetentionType, Station, StationOptions, StorageType};
