//! Received scheduling intents, latest per pod

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sched_lib::models::{IntentBatch, IntentPayload};
use serde::Serialize;
use tracing::{debug, warn};

/// An intent as held by the agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedIntent {
    #[serde(flatten)]
    pub intent: IntentPayload,
    pub received_at: DateTime<Utc>,
}

/// Intents keyed by pod ID; a newer intent replaces the older one
#[derive(Debug, Default)]
pub struct IntentInbox {
    intents: DashMap<String, ReceivedIntent>,
}

impl IntentInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store every intent of the batch. Returns how many were stored;
    /// intents without a pod ID are dropped.
    pub fn store_batch(&self, batch: &IntentBatch) -> usize {
        let received_at = Utc::now();
        let mut stored = 0;

        for intent in &batch.intents {
            if intent.pod_id.is_empty() {
                warn!(namespace = %intent.namespace, "Dropping intent without pod ID");
                continue;
            }
            debug!(pod_id = %intent.pod_id, priority = intent.priority, "Storing intent");
            self.intents.insert(
                intent.pod_id.clone(),
                ReceivedIntent {
                    intent: intent.clone(),
                    received_at,
                },
            );
            stored += 1;
        }
        stored
    }

    pub fn get(&self, pod_id: &str) -> Option<ReceivedIntent> {
        self.intents.get(pod_id).map(|r| r.clone())
    }

    /// All held intents, ordered by pod ID
    pub fn list(&self) -> Vec<ReceivedIntent> {
        let mut intents: Vec<ReceivedIntent> =
            self.intents.iter().map(|r| r.value().clone()).collect();
        intents.sort_by(|a, b| a.intent.pod_id.cmp(&b.intent.pod_id));
        intents
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pod_id: &str, priority: i32) -> IntentPayload {
        IntentPayload {
            pod_id: pod_id.to_string(),
            node_id: "node-a".to_string(),
            priority,
            ..Default::default()
        }
    }

    #[test]
    fn test_latest_intent_per_pod_wins() {
        let inbox = IntentInbox::new();
        inbox.store_batch(&IntentBatch {
            intents: vec![payload("uid-2", 1), payload("uid-1", 1)],
        });
        inbox.store_batch(&IntentBatch {
            intents: vec![payload("uid-2", 9)],
        });

        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.get("uid-2").unwrap().intent.priority, 9);
        let order: Vec<String> = inbox.list().into_iter().map(|i| i.intent.pod_id).collect();
        assert_eq!(order, vec!["uid-1", "uid-2"]);
    }

    #[test]
    fn test_intent_without_pod_is_dropped() {
        let inbox = IntentInbox::new();
        let stored = inbox.store_batch(&IntentBatch {
            intents: vec![payload("", 3), payload("uid-1", 3)],
        });

        assert_eq!(stored, 1);
        assert!(inbox.get("").is_none());
    }
}
