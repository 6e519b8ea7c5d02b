//! Topic membership
//!
//! Maps each topic to the identity records subscribed to it, in subscription
//! order. Written only by the control worker; the data worker reads
//! snapshots.

use std::sync::Arc;

use dashmap::DashMap;

use crate::identity::IdentityRecord;

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: DashMap<String, Vec<Arc<IdentityRecord>>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record to a topic. Returns the new subscriber count, or `None`
    /// if the record was already subscribed.
    pub fn subscribe(&self, topic: &str, record: &Arc<IdentityRecord>) -> Option<usize> {
        let mut members = self.topics.entry(topic.to_string()).or_default();
        if members.iter().any(|member| Arc::ptr_eq(member, record)) {
            return None;
        }
        members.push(record.clone());
        Some(members.len())
    }

    /// Remove a record from a topic. Returns the remaining subscriber count,
    /// or `None` if the record was not subscribed.
    pub fn unsubscribe(&self, topic: &str, record: &Arc<IdentityRecord>) -> Option<usize> {
        let remaining = {
            let mut members = self.topics.get_mut(topic)?;
            let index = members
                .iter()
                .position(|member| Arc::ptr_eq(member, record))?;
            members.remove(index);
            members.len()
        };

        if remaining == 0 {
            self.topics.remove_if(topic, |_, members| members.is_empty());
        }
        Some(remaining)
    }

    /// Snapshot of a topic's subscribers
    pub fn subscribers(&self, topic: &str) -> Vec<Arc<IdentityRecord>> {
        self.topics
            .get(topic)
            .map(|members| members.clone())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, topic: &str, record: &Arc<IdentityRecord>) -> bool {
        self.topics
            .get(topic)
            .is_some_and(|members| members.iter().any(|member| Arc::ptr_eq(member, record)))
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|members| members.len()).unwrap_or(0)
    }

    /// Number of topics with at least one subscriber
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }
}
