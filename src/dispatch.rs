//! Dispatch workers
//!
//! Two serialized request queues, each drained by exactly one task:
//!
//! - the control queue carries `subscribe` / `unsubscribe` and is the only
//!   writer of topic membership
//! - the data queue carries publishes and membership replies and performs
//!   the fan-out sends
//!
//! A subscribe's `onSubscribe` reply goes through the data queue, so it is
//! ordered with the topic's regular messages.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::envelope::{Command, Envelope, ON_SUBSCRIBE, ON_UNSUBSCRIBE};
use crate::identity::{IdentityRecord, IdentityRegistry};
use crate::topics::TopicRegistry;

/// One unit of work for a dispatch worker
#[derive(Debug)]
pub struct DispatchRequest {
    pub envelope: Envelope,
    /// Connection the envelope arrived on; `None` for server-side publishes
    pub origin: Option<Arc<dyn Connection>>,
    done: Option<oneshot::Sender<()>>,
}

impl DispatchRequest {
    pub fn new(envelope: Envelope, origin: Option<Arc<dyn Connection>>) -> Self {
        Self {
            envelope,
            origin,
            done: None,
        }
    }

    /// Request whose caller waits for it to be fully processed.
    ///
    /// The receiver resolves once a worker has handled (or dropped) the
    /// request. It also resolves with an error if the request never reaches
    /// a worker.
    pub fn awaited(
        envelope: Envelope,
        origin: Option<Arc<dyn Connection>>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            envelope,
            origin,
            done: Some(tx),
        };
        (request, rx)
    }

    pub fn is_awaited(&self) -> bool {
        self.done.is_some()
    }

    fn finish(self) {
        if let Some(done) = self.done {
            let _ = done.send(());
        }
    }
}

/// Reject publishes that cannot be delivered
pub fn validate_publish(envelope: &Envelope) -> Result<(), DispatchError> {
    if envelope.topic.is_empty() {
        return Err(DispatchError::EmptyTopic);
    }
    if envelope.payload.is_empty() {
        return Err(DispatchError::EmptyPayload);
    }
    Ok(())
}

/// Drains the control queue
pub(crate) struct ControlWorker {
    pub topics: Arc<TopicRegistry>,
    pub identities: Arc<IdentityRegistry>,
    pub replies: mpsc::Sender<DispatchRequest>,
}

impl ControlWorker {
    pub async fn run(self, mut requests: mpsc::Receiver<DispatchRequest>) {
        debug!("control worker started");
        while let Some(request) = requests.recv().await {
            self.process(&request).await;
            request.finish();
        }
        debug!("control worker stopped");
    }

    async fn process(&self, request: &DispatchRequest) {
        let envelope = &request.envelope;
        if envelope.topic.is_empty() {
            debug!("control request without channel dropped");
            return;
        }

        let Some(origin) = request.origin.as_ref() else {
            warn!(topic = %envelope.topic, "control request without connection dropped");
            return;
        };

        let Some(record) = self.identities.lookup(origin.key()) else {
            warn!(conn = %origin.key(), topic = %envelope.topic, "no identity for connection");
            return;
        };

        match envelope.command() {
            Command::Subscribe => self.subscribe(origin.key(), &record, envelope).await,
            Command::Unsubscribe => self.unsubscribe(origin.key(), &record, envelope).await,
            other => warn!(command = ?other, "unexpected command on control queue"),
        }
    }

    async fn subscribe(&self, key: &str, record: &Arc<IdentityRecord>, envelope: &Envelope) {
        let topic = envelope.topic.as_str();
        // Join the record first; a retired record must never enter a topic
        if !record.join_topic(topic) {
            debug!(conn = %key, identity = %record.name(), topic, "identity retired, subscribe dropped");
            return;
        }
        let Some(count) = self.topics.subscribe(topic, record) else {
            debug!(conn = %key, identity = %record.name(), topic, "already subscribed");
            return;
        };
        debug!(conn = %key, identity = %record.name(), topic, count, "subscribed");

        let reply = Envelope::membership_reply(
            ON_SUBSCRIBE,
            topic,
            record.name(),
            envelope.options(),
            count,
        );
        self.reply(reply).await;
    }

    async fn unsubscribe(&self, key: &str, record: &Arc<IdentityRecord>, envelope: &Envelope) {
        let topic = envelope.topic.as_str();
        let Some(count) = self.topics.unsubscribe(topic, record) else {
            debug!(conn = %key, identity = %record.name(), topic, "not subscribed");
            return;
        };
        record.remove_topic(topic);
        debug!(conn = %key, identity = %record.name(), topic, count, "unsubscribed");

        let reply = Envelope::membership_reply(
            ON_UNSUBSCRIBE,
            topic,
            record.name(),
            envelope.options(),
            count,
        );
        self.reply(reply).await;
    }

    async fn reply(&self, reply: Envelope) {
        if self
            .replies
            .send(DispatchRequest::new(reply, None))
            .await
            .is_err()
        {
            warn!("data queue closed, membership reply dropped");
        }
    }
}

/// Drains the data queue
pub(crate) struct DataWorker {
    pub topics: Arc<TopicRegistry>,
}

impl DataWorker {
    pub async fn run(self, mut requests: mpsc::Receiver<DispatchRequest>) {
        debug!("data worker started");
        while let Some(request) = requests.recv().await {
            self.fan_out(&request.envelope).await;
            request.finish();
        }
        debug!("data worker stopped");
    }

    /// Send an envelope to every connection of every subscriber.
    ///
    /// Connections whose send fails are removed from their record once the
    /// record's pass is over. Records stay subscribed.
    async fn fan_out(&self, envelope: &Envelope) -> usize {
        if let Err(e) = validate_publish(envelope) {
            debug!(topic = %envelope.topic, error = %e, "publish dropped");
            return 0;
        }

        let topic = envelope.topic.as_str();
        let members = self.topics.subscribers(topic);
        if members.is_empty() {
            debug!(topic, "no subscribers");
            return 0;
        }

        let mut delivered = 0;
        for record in &members {
            let mut dead = Vec::new();
            for connection in record.connections() {
                match connection.send(envelope).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(
                            conn = %connection.key(),
                            identity = %record.name(),
                            topic,
                            error = %e,
                            "send failed, dropping connection from delivery"
                        );
                        dead.push(connection.key().to_string());
                    }
                }
            }
            if !dead.is_empty() {
                record.prune(&dead);
            }
        }

        debug!(topic, subscribers = members.len(), delivered, "fan-out complete");
        delivered
    }
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("message has no channel")]
    EmptyTopic,
    #[error("message has no data")]
    EmptyPayload,
    #[error("malformed command message")]
    MissingCommand,
    #[error("generic command message has no channel")]
    UnroutedCommand,
    #[error("dispatch engine is shutting down")]
    Closed,
}
