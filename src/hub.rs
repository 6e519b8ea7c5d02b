//! Dispatch engine
//!
//! The `Hub` owns the identity and topic registries, the two dispatch
//! queues and their workers. It is constructed once and shared by `Arc`
//! between the transport, the handler and connection lifecycle callbacks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::Connection;
use crate::dispatch::{ControlWorker, DataWorker, DispatchError, DispatchRequest, validate_publish};
use crate::envelope::{Envelope, UNSUBSCRIBE};
use crate::identity::{IdentityRecord, IdentityRegistry};
use crate::topics::TopicRegistry;

/// Default control queue capacity (subscribe / unsubscribe)
pub const DEFAULT_CONTROL_CAPACITY: usize = 500;

/// Default data queue capacity (publishes and replies)
pub const DEFAULT_DATA_CAPACITY: usize = 5000;

pub struct Hub {
    identities: Arc<IdentityRegistry>,
    topics: Arc<TopicRegistry>,

    /// Queue senders; taken on shutdown to close the queues
    control_tx: RwLock<Option<mpsc::Sender<DispatchRequest>>>,
    data_tx: RwLock<Option<mpsc::Sender<DispatchRequest>>>,

    /// Worker join handles, control worker first
    workers: Mutex<Vec<JoinHandle<()>>>,

    quitting: AtomicBool,
}

impl Hub {
    /// Create the engine and spawn its two workers on the current runtime
    pub fn new(control_capacity: usize, data_capacity: usize) -> Self {
        let identities = Arc::new(IdentityRegistry::new());
        let topics = Arc::new(TopicRegistry::new());

        let (control_tx, control_rx) = mpsc::channel(control_capacity.max(1));
        let (data_tx, data_rx) = mpsc::channel(data_capacity.max(1));

        // The control worker owns a data sender for its replies, so the data
        // queue only closes after the control queue has drained.
        let control = ControlWorker {
            topics: topics.clone(),
            identities: identities.clone(),
            replies: data_tx.clone(),
        };
        let data = DataWorker {
            topics: topics.clone(),
        };
        let workers = vec![
            tokio::spawn(control.run(control_rx)),
            tokio::spawn(data.run(data_rx)),
        ];

        debug!(control_capacity, data_capacity, "dispatch engine started");

        Self {
            identities,
            topics,
            control_tx: RwLock::new(Some(control_tx)),
            data_tx: RwLock::new(Some(data_tx)),
            workers: Mutex::new(workers),
            quitting: AtomicBool::new(false),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CONTROL_CAPACITY, DEFAULT_DATA_CAPACITY)
    }

    /// Whether `shutdown` has begun; inbound messages are refused from then on
    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    /// Establish the identity of a connection
    pub fn init(&self, connection: &Arc<dyn Connection>, name: &str) -> Arc<IdentityRecord> {
        self.identities.init(connection, name)
    }

    pub fn identity_of(&self, key: &str) -> Option<Arc<IdentityRecord>> {
        self.identities.lookup(key)
    }

    pub fn is_initialized(&self, key: &str) -> bool {
        self.identities.is_initialized(key)
    }

    /// Queue a subscribe / unsubscribe request
    pub async fn enqueue_control(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        let tx = self.control_tx.read().clone().ok_or(DispatchError::Closed)?;
        tx.send(request).await.map_err(|_| DispatchError::Closed)
    }

    /// Queue a fan-out request
    pub async fn enqueue_data(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        let tx = self.data_tx.read().clone().ok_or(DispatchError::Closed)?;
        tx.send(request).await.map_err(|_| DispatchError::Closed)
    }

    /// Validate and queue a publish to the envelope's channel
    pub async fn publish(
        &self,
        origin: Option<Arc<dyn Connection>>,
        envelope: Envelope,
    ) -> Result<(), DispatchError> {
        validate_publish(&envelope)?;
        self.enqueue_data(DispatchRequest::new(envelope, origin)).await
    }

    /// Clean up after a connection went away.
    ///
    /// When it was the identity's last connection, every topic of the
    /// identity is unsubscribed (waiting for each) before the identity leaves
    /// the name index. Safe to call more than once.
    pub async fn disconnect(&self, connection: &Arc<dyn Connection>) {
        let key = connection.key();
        let Some(record) = self.identities.lookup(key) else {
            debug!(conn = %key, "disconnect for unknown connection");
            return;
        };

        if record.release(key) == 0 {
            let topics = record.topics();
            debug!(conn = %key, identity = %record.name(), ?topics, "last connection, vacating topics");

            for topic in topics {
                let envelope = Envelope::control(UNSUBSCRIBE, &topic, record.name());
                let (request, done) = DispatchRequest::awaited(envelope, Some(connection.clone()));
                match self.enqueue_control(request).await {
                    Ok(()) => {
                        let _ = done.await;
                    }
                    Err(e) => {
                        warn!(conn = %key, topic = %topic, error = %e, "unsubscribe on disconnect not queued");
                    }
                }
            }

            self.identities.forget_name(&record);
        }

        self.identities.forget_connection(key);
        debug!(conn = %key, "connection cleaned up");
    }

    /// Stop accepting work, drain both queues and wait for the workers.
    ///
    /// Concurrent or repeated calls wait for the same drain.
    pub async fn shutdown(&self) {
        if !self.quitting.swap(true, Ordering::SeqCst) {
            info!("dispatch engine shutting down");
        }

        self.control_tx.write().take();
        self.data_tx.write().take();

        let mut workers = self.workers.lock().await;
        for worker in workers.drain(..) {
            if let Err(e) = worker.await {
                error!(error = %e, "dispatch worker failed");
            }
        }
        debug!("dispatch workers stopped");
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.subscriber_count(topic)
    }

    pub fn is_subscribed(&self, topic: &str, record: &Arc<IdentityRecord>) -> bool {
        self.topics.is_subscribed(topic, record)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.topic_count()
    }

    pub fn connection_count(&self) -> usize {
        self.identities.connection_count()
    }

    pub fn identity_count(&self) -> usize {
        self.identities.identity_count()
    }

    pub fn identity_by_name(&self, name: &str) -> Option<Arc<IdentityRecord>> {
        self.identities.by_name(name)
    }

    /// Wait until every request queued so far has been processed
    #[cfg(test)]
    pub(crate) async fn settle(&self) {
        let (request, done) = DispatchRequest::awaited(Envelope::new_command(), None);
        if self.enqueue_control(request).await.is_ok() {
            let _ = done.await;
        }
        let (request, done) = DispatchRequest::awaited(Envelope::new_message(), None);
        if self.enqueue_data(request).await.is_ok() {
            let _ = done.await;
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("connections", &self.identities.connection_count())
            .field("identities", &self.identities.identity_count())
            .field("topics", &self.topics.topic_count())
            .field("quitting", &self.is_quitting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::testing::{RecordingConnection, handle};
    use crate::envelope::{ON_SUBSCRIBE, ON_UNSUBSCRIBE, SUBSCRIBE};
    use serde_json::Value;

    async fn subscribe(hub: &Hub, conn: &Arc<RecordingConnection>, topic: &str) {
        let envelope = Envelope::control(SUBSCRIBE, topic, "");
        hub.enqueue_control(DispatchRequest::new(envelope, Some(handle(conn))))
            .await
            .unwrap();
    }

    async fn unsubscribe(hub: &Hub, conn: &Arc<RecordingConnection>, topic: &str) {
        let envelope = Envelope::control(UNSUBSCRIBE, topic, "");
        hub.enqueue_control(DispatchRequest::new(envelope, Some(handle(conn))))
            .await
            .unwrap();
    }

    fn message(topic: &str, text: &str) -> Envelope {
        let mut envelope = Envelope::new_message();
        envelope.topic = topic.to_string();
        envelope
            .payload
            .insert("msg".to_string(), Value::from(text));
        envelope
    }

    fn commands(received: &[Envelope]) -> Vec<(String, u64)> {
        received
            .iter()
            .filter_map(|e| {
                let command = e.payload.get("command")?.as_str()?.to_string();
                let count = e.payload.get("count")?.as_u64()?;
                Some((command, count))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_subscribe_replies_carry_counts() {
        let hub = Hub::with_default_capacity();
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        hub.init(&handle(&a), "U1");
        hub.init(&handle(&b), "U2");

        subscribe(&hub, &a, "chat").await;
        hub.settle().await;
        subscribe(&hub, &b, "chat").await;
        hub.settle().await;

        assert_eq!(
            commands(&a.received()),
            vec![(ON_SUBSCRIBE.to_string(), 1), (ON_SUBSCRIBE.to_string(), 2)]
        );
        assert_eq!(commands(&b.received()), vec![(ON_SUBSCRIBE.to_string(), 2)]);
        assert_eq!(a.received()[0].identity, "U1");
        assert_eq!(b.received()[0].identity, "U2");
        assert_eq!(hub.subscriber_count("chat"), 2);
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_is_silent() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "");

        subscribe(&hub, &c, "chat").await;
        subscribe(&hub, &c, "chat").await;
        hub.settle().await;

        assert_eq!(hub.subscriber_count("chat"), 1);
        assert_eq!(commands(&c.received()), vec![(ON_SUBSCRIBE.to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_merged_identity_receives_on_every_connection() {
        let hub = Hub::with_default_capacity();
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        hub.init(&handle(&a), "U1");
        hub.init(&handle(&b), "U1");

        subscribe(&hub, &a, "chat").await;
        subscribe(&hub, &b, "chat").await;
        hub.settle().await;
        let mut hi = message("chat", "hi");
        hi.identity = "U1".to_string();
        hub.publish(Some(handle(&b)), hi).await.unwrap();
        hub.settle().await;

        // One identity, one membership: the second subscribe is a no-op
        assert_eq!(hub.subscriber_count("chat"), 1);
        for conn in [&a, &b] {
            let received = conn.received();
            assert_eq!(commands(&received), vec![(ON_SUBSCRIBE.to_string(), 1)]);
            let last = received.last().unwrap();
            assert_eq!(last.payload["msg"], "hi");
            assert_eq!(last.identity, "U1");
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "");

        assert!(hub.publish(Some(handle(&c)), message("empty", "hi")).await.is_ok());
        hub.settle().await;

        assert_eq!(c.attempts(), 0);
    }

    #[tokio::test]
    async fn test_publish_validation() {
        let hub = Hub::with_default_capacity();
        assert!(matches!(
            hub.publish(None, message("", "hi")).await,
            Err(DispatchError::EmptyTopic)
        ));
        let mut empty = Envelope::new_message();
        empty.topic = "chat".to_string();
        assert!(matches!(
            hub.publish(None, empty).await,
            Err(DispatchError::EmptyPayload)
        ));
    }

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "");
        subscribe(&hub, &c, "chat").await;
        hub.settle().await;

        for i in 0..50 {
            hub.publish(None, message("chat", &i.to_string())).await.unwrap();
        }

        let received = c.wait_for(51).await;
        let order: Vec<String> = received[1..]
            .iter()
            .map(|e| e.payload["msg"].as_str().unwrap().to_string())
            .collect();
        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(order, expected);
    }

    #[tokio::test]
    async fn test_unsubscribe_replies_and_ignores_absent() {
        let hub = Hub::with_default_capacity();
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        hub.init(&handle(&a), "U1");
        hub.init(&handle(&b), "U2");
        subscribe(&hub, &a, "chat").await;
        hub.settle().await;
        subscribe(&hub, &b, "chat").await;
        hub.settle().await;

        unsubscribe(&hub, &a, "chat").await;
        unsubscribe(&hub, &a, "chat").await;
        hub.settle().await;

        assert_eq!(hub.subscriber_count("chat"), 1);
        assert_eq!(
            commands(&b.received()),
            vec![(ON_SUBSCRIBE.to_string(), 2), (ON_UNSUBSCRIBE.to_string(), 1)]
        );
        // `a` left before the reply was fanned out
        assert_eq!(
            commands(&a.received()),
            vec![(ON_SUBSCRIBE.to_string(), 1), (ON_SUBSCRIBE.to_string(), 2)]
        );
    }

    #[tokio::test]
    async fn test_count_tracks_successful_operations() {
        let hub = Hub::with_default_capacity();
        let conns: Vec<_> = (0..6)
            .map(|i| RecordingConnection::new(&format!("c{i}")))
            .collect();
        for (i, conn) in conns.iter().enumerate() {
            hub.init(&handle(conn), &format!("user-{i}"));
            subscribe(&hub, conn, "chat").await;
            subscribe(&hub, conn, "chat").await;
        }
        for conn in &conns[..2] {
            unsubscribe(&hub, conn, "chat").await;
            unsubscribe(&hub, conn, "chat").await;
        }
        hub.settle().await;

        assert_eq!(hub.subscriber_count("chat"), 4);
    }

    #[tokio::test]
    async fn test_disconnect_vacates_topics() {
        let hub = Hub::with_default_capacity();
        let gone = RecordingConnection::new("gone");
        let stays = RecordingConnection::new("stays");
        let record = hub.init(&handle(&gone), "U1");
        hub.init(&handle(&stays), "U2");
        subscribe(&hub, &gone, "chat").await;
        subscribe(&hub, &gone, "news").await;
        subscribe(&hub, &stays, "chat").await;
        hub.settle().await;

        hub.disconnect(&handle(&gone)).await;
        hub.publish(None, message("chat", "after")).await.unwrap();
        hub.publish(None, message("news", "after")).await.unwrap();
        hub.settle().await;

        assert!(!hub.is_subscribed("chat", &record));
        assert_eq!(hub.subscriber_count("news"), 0);
        assert!(record.topics().is_empty());
        assert!(hub.identity_by_name("U1").is_none());
        assert!(hub.identity_of("gone").is_none());
        assert!(
            gone.received()
                .iter()
                .all(|e| e.payload.get("msg").is_none())
        );

        let seen = stays.received();
        assert!(commands(&seen).contains(&(ON_UNSUBSCRIBE.to_string(), 1)));
        assert_eq!(seen.last().unwrap().payload["msg"], "after");
    }

    #[tokio::test]
    async fn test_disconnect_keeps_membership_for_remaining_connections() {
        let hub = Hub::with_default_capacity();
        let a = RecordingConnection::new("a");
        let b = RecordingConnection::new("b");
        let record = hub.init(&handle(&a), "U1");
        hub.init(&handle(&b), "U1");
        subscribe(&hub, &a, "chat").await;
        hub.settle().await;

        hub.disconnect(&handle(&a)).await;
        hub.publish(None, message("chat", "still here")).await.unwrap();
        hub.settle().await;

        assert!(hub.is_subscribed("chat", &record));
        assert!(hub.identity_by_name("U1").is_some());
        assert_eq!(b.received().last().unwrap().payload["msg"], "still here");
        assert_ne!(a.received().last().unwrap().payload.get("msg"), Some(&Value::from("still here")));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "U1");
        subscribe(&hub, &c, "chat").await;
        hub.settle().await;

        hub.disconnect(&handle(&c)).await;
        hub.disconnect(&handle(&c)).await;

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.identity_count(), 0);
        assert_eq!(hub.topic_count(), 0);

        let stranger = RecordingConnection::new("never-init");
        hub.disconnect(&handle(&stranger)).await;
    }

    #[tokio::test]
    async fn test_reinit_after_disconnect_gets_fresh_identity() {
        let hub = Hub::with_default_capacity();
        let first = RecordingConnection::new("first");
        let old = hub.init(&handle(&first), "U1");
        subscribe(&hub, &first, "chat").await;
        hub.settle().await;
        hub.disconnect(&handle(&first)).await;

        let second = RecordingConnection::new("second");
        let fresh = hub.init(&handle(&second), "U1");

        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(fresh.topics().is_empty());
        assert_eq!(hub.subscriber_count("chat"), 0);
    }

    #[tokio::test]
    async fn test_failed_connection_is_pruned() {
        let hub = Hub::with_default_capacity();
        let healthy = RecordingConnection::new("healthy");
        let broken = RecordingConnection::new("broken");
        let record = hub.init(&handle(&healthy), "U1");
        hub.init(&handle(&broken), "U2");
        subscribe(&hub, &healthy, "chat").await;
        subscribe(&hub, &broken, "chat").await;
        hub.settle().await;

        broken.fail();
        let attempts = broken.attempts();
        for text in ["one", "two", "three"] {
            hub.publish(None, message("chat", text)).await.unwrap();
        }
        hub.settle().await;

        assert_eq!(broken.attempts(), attempts + 1);
        assert_eq!(hub.subscriber_count("chat"), 2);
        assert_eq!(record.connection_count(), 1);
        let texts: Vec<_> = healthy
            .received()
            .iter()
            .filter_map(|e| e.payload.get("msg").and_then(Value::as_str).map(str::to_string))
            .collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_subscribe_queued_before_disconnect_is_dropped() {
        let hub = Hub::with_default_capacity();
        let gone = RecordingConnection::new("gone");
        let record = hub.init(&handle(&gone), "U1");
        subscribe(&hub, &gone, "news").await;
        hub.settle().await;

        // Still queued when the last connection goes away
        subscribe(&hub, &gone, "chat").await;
        hub.disconnect(&handle(&gone)).await;
        hub.settle().await;

        assert!(record.is_retired());
        assert!(!hub.is_subscribed("chat", &record));
        assert!(record.topics().is_empty());

        let other = RecordingConnection::new("other");
        hub.init(&handle(&other), "U2");
        subscribe(&hub, &other, "chat").await;
        hub.settle().await;

        assert_eq!(hub.subscriber_count("chat"), 1);
        assert_eq!(commands(&other.received()), vec![(ON_SUBSCRIBE.to_string(), 1)]);
        assert_eq!(hub.topic_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_racing_disconnect_never_leaks() {
        let hub = Arc::new(Hub::with_default_capacity());
        let mut records = Vec::new();
        let mut tasks = Vec::new();
        for i in 0..50 {
            let conn = RecordingConnection::new(&format!("c{i}"));
            records.push(hub.init(&handle(&conn), &format!("user-{i}")));

            let joiner = {
                let hub = hub.clone();
                let conn = conn.clone();
                tokio::spawn(async move { subscribe(&hub, &conn, "chat").await })
            };
            let leaver = {
                let hub = hub.clone();
                tokio::spawn(async move { hub.disconnect(&handle(&conn)).await })
            };
            tasks.push(joiner);
            tasks.push(leaver);
        }
        for task in tasks {
            task.await.unwrap();
        }
        hub.settle().await;

        assert_eq!(hub.subscriber_count("chat"), 0);
        assert_eq!(hub.topic_count(), 0);
        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.identity_count(), 0);
        for record in &records {
            assert!(record.is_retired());
            assert!(record.topics().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers_keep_membership_consistent() {
        let hub = Arc::new(Hub::with_default_capacity());
        let topics = ["a", "b", "c"];

        // 16 connections over 8 identities; even identities leave entirely
        let mut producers = Vec::new();
        for i in 0..16 {
            let hub = hub.clone();
            producers.push(tokio::spawn(async move {
                let conn = RecordingConnection::new(&format!("c{i}"));
                hub.init(&handle(&conn), &format!("user-{}", i % 8));
                for topic in topics {
                    subscribe(&hub, &conn, topic).await;
                    subscribe(&hub, &conn, topic).await;
                }
                hub.publish(Some(handle(&conn)), message("a", &i.to_string()))
                    .await
                    .unwrap();
                if i % 2 == 0 {
                    hub.disconnect(&handle(&conn)).await;
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }
        hub.settle().await;

        for topic in topics {
            assert_eq!(hub.subscriber_count(topic), 4, "topic {topic}");
        }
        assert_eq!(hub.identity_count(), 4);
        assert_eq!(hub.connection_count(), 8);
        for k in [1, 3, 5, 7] {
            let record = hub.identity_by_name(&format!("user-{k}")).unwrap();
            let mut joined = record.topics();
            joined.sort();
            assert_eq!(joined, vec!["a", "b", "c"]);
            assert_eq!(record.connection_count(), 2);
            for topic in topics {
                assert!(hub.is_subscribed(topic, &record));
            }
        }
        for k in [0, 2, 4, 6] {
            assert!(hub.identity_by_name(&format!("user-{k}")).is_none());
        }
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_work() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "");
        subscribe(&hub, &c, "chat").await;
        hub.settle().await;
        for i in 0..20 {
            hub.publish(None, message("chat", &i.to_string())).await.unwrap();
        }

        hub.shutdown().await;

        assert!(hub.is_quitting());
        assert_eq!(c.received().len(), 21);
        assert!(matches!(
            hub.publish(None, message("chat", "late")).await,
            Err(DispatchError::Closed)
        ));
        assert!(matches!(
            hub.enqueue_control(DispatchRequest::new(Envelope::control(SUBSCRIBE, "chat", ""), None))
                .await,
            Err(DispatchError::Closed)
        ));

        hub.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_after_shutdown_still_cleans_indexes() {
        let hub = Hub::with_default_capacity();
        let c = RecordingConnection::new("c");
        hub.init(&handle(&c), "U1");
        subscribe(&hub, &c, "chat").await;
        hub.shutdown().await;

        hub.disconnect(&handle(&c)).await;

        assert_eq!(hub.connection_count(), 0);
        assert_eq!(hub.identity_count(), 0);
    }
}
