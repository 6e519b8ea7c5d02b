//! Client connection handles
//!
//! The dispatch engine never touches sockets directly. A transport hands it
//! an `Arc<dyn Connection>` per client; a failed `send` means the connection
//! is gone.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::{self, Envelope, EnvelopeError};

/// How long a send may wait for room in a client's outbound buffer
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// A transport-provided, persistent client connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Unique key, stable for the lifetime of the connection
    fn key(&self) -> &str;

    /// Deliver one envelope to the client
    async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError>;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("key", &self.key()).finish()
    }
}

/// Connection backed by a bounded channel drained by a socket writer task
#[derive(Debug)]
pub struct ChannelConnection {
    key: String,
    tx: mpsc::Sender<String>,
}

impl ChannelConnection {
    pub fn new(key: String, tx: mpsc::Sender<String>) -> Self {
        Self { key, tx }
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn key(&self) -> &str {
        &self.key
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), ConnectionError> {
        let text = envelope::encode(envelope)?;
        self.tx
            .send_timeout(text, SEND_TIMEOUT)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => ConnectionError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => ConnectionError::Closed,
            })
    }
}

/// Connection send errors
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for the client to drain its buffer")]
    Timeout,
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
