//! Inbound message routing
//!
//! Decodes raw client frames, enforces `init`-first, pins the identity the
//! server knows for the connection and routes each envelope to the identity
//! registry or one of the dispatch queues.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::Connection;
use crate::dispatch::{DispatchError, DispatchRequest};
use crate::envelope::{self, Command, Envelope, EnvelopeKind, NOT_INITIALIZED};
use crate::hub::Hub;

/// Where an envelope goes once the connection is initialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Init,
    Control,
    Publish,
    MissingCommand,
    UnroutedCommand,
}

fn classify(envelope: &Envelope) -> Route {
    match envelope.kind {
        EnvelopeKind::Message => Route::Publish,
        EnvelopeKind::Command => match envelope.command() {
            Command::Init => Route::Init,
            Command::Subscribe | Command::Unsubscribe => Route::Control,
            Command::Missing => Route::MissingCommand,
            Command::Forward(_) if envelope.topic.is_empty() => Route::UnroutedCommand,
            Command::Forward(_) => Route::Publish,
        },
    }
}

#[derive(Debug, Clone)]
pub struct Handler {
    hub: Arc<Hub>,
}

impl Handler {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    /// Handle one raw frame from a client
    pub async fn on_message(&self, connection: &Arc<dyn Connection>, raw: &[u8]) {
        let key = connection.key();
        if self.hub.is_quitting() {
            debug!(conn = %key, "shutting down, message refused");
            return;
        }

        let mut envelope = match envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(conn = %key, error = %e, "malformed message dropped");
                return;
            }
        };
        debug!(conn = %key, kind = ?envelope.kind, topic = %envelope.topic, "message received");

        let route = classify(&envelope);
        match self.hub.identity_of(key).filter(|record| record.is_initialized()) {
            Some(record) => envelope.identity = record.name().to_string(),
            None if route == Route::Init => {}
            None => {
                debug!(conn = %key, "message before init rejected");
                if let Err(e) = connection.send(&Envelope::error_reply(NOT_INITIALIZED)).await {
                    debug!(conn = %key, error = %e, "failed to send init error");
                }
                return;
            }
        }

        if let Err(e) = self.dispatch(connection, route, envelope).await {
            debug!(conn = %key, error = %e, "message not handled");
        }
    }

    async fn dispatch(
        &self,
        connection: &Arc<dyn Connection>,
        route: Route,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        match route {
            Route::Init => {
                self.hub.init(connection, &envelope.identity);
                Ok(())
            }
            Route::Control => {
                let request = DispatchRequest::new(envelope, Some(connection.clone()));
                self.hub.enqueue_control(request).await
            }
            Route::Publish => self.hub.publish(Some(connection.clone()), envelope).await,
            Route::MissingCommand => Err(DispatchError::MissingCommand),
            Route::UnroutedCommand => Err(DispatchError::UnroutedCommand),
        }
    }

    /// Connection closed by the transport
    pub async fn on_disconnect(&self, connection: &Arc<dyn Connection>) {
        self.hub.disconnect(connection).await;
    }
}
