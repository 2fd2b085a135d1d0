//! Resource lifecycle protocol.
//!
//! Stations, producers, consumers, and schema attachments are all provisioned
//! through the same request/reply convention: a creation subject + JSON
//! payload, and a destruction subject + JSON payload. The broker replies with
//! an empty body on success and error text on failure.
//!
//! No retries happen at this layer.

use async_trait::async_trait;
use serde_json::Value;

use crate::client::Memphis;
use crate::error::{MemphisError, Result};

/// A resource provisioned through a broker creation request.
#[async_trait]
pub(crate) trait Creatable: Sync {
    fn creation_subject(&self) -> String;

    fn creation_payload(&self) -> Value;

    /// Interpret the broker's reply. Default contract: empty reply is
    /// success, anything else is an error carrying the reply text.
    async fn handle_creation_response(&self, _client: &Memphis, reply: &[u8]) -> Result<()> {
        if reply.is_empty() {
            return Ok(());
        }
        Err(MemphisError::broker(String::from_utf8_lossy(reply)))
    }
}

/// A resource torn down through a broker destruction request.
///
/// Destruction is idempotent: a reply containing "not exist" is success.
pub(crate) trait Destroyable: Sync {
    fn destruction_subject(&self) -> String;

    fn destruction_payload(&self) -> Value;
}
