//! Topic bookkeeping independent of the channel lifecycle.

use std::collections::{BTreeMap, BTreeSet};

use fleetsync_protocol::envelope::OutboundFrame;
use fleetsync_protocol::messages::SubscriptionRequest;

/// A topic the application wants pushed, with opaque parameters.
///
/// Two subscriptions are the same when topic and parameters match; parameter
/// order is irrelevant.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub params: BTreeMap<String, serde_json::Value>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Identity key: topic plus canonical JSON of the parameters.
    ///
    /// `BTreeMap` and `serde_json::Map` both serialize keys in sorted order,
    /// so nested objects normalize too.
    pub(crate) fn key(&self) -> SubscriptionKey {
        let params = serde_json::to_string(&self.params).unwrap_or_default();
        SubscriptionKey(self.topic.clone(), params)
    }

    pub(crate) fn request(&self) -> SubscriptionRequest {
        SubscriptionRequest {
            topic: self.topic.clone(),
            params: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SubscriptionKey(String, String);

/// The set of wanted topics plus which of them were sent on the current
/// channel.
///
/// Only the `sent` half is runtime state; it is purged whenever a channel
/// closes so the next open replays everything.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionKey, Subscription>,
    sent: BTreeSet<SubscriptionKey>,
}

impl SubscriptionRegistry {
    /// Adds a subscription. Returns `false` if it was already present.
    pub(crate) fn subscribe(&mut self, sub: Subscription) -> bool {
        let key = sub.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, sub);
        true
    }

    /// Removes a subscription. Returns `true` if the server was told about it
    /// on the current channel and therefore needs an unsubscribe frame.
    pub(crate) fn unsubscribe(&mut self, sub: &Subscription) -> bool {
        let key = sub.key();
        self.entries.remove(&key);
        self.sent.remove(&key)
    }

    /// Subscribe frame for an entry not yet sent on this channel. Marks it
    /// sent.
    pub(crate) fn frame_for(&mut self, sub: &Subscription) -> Option<OutboundFrame> {
        let key = sub.key();
        if !self.entries.contains_key(&key) || self.sent.contains(&key) {
            return None;
        }
        let frame = subscribe_frame(sub)?;
        self.sent.insert(key);
        Some(frame)
    }

    /// One subscribe frame per entry, reflecting the registry right now.
    /// Marks every entry sent.
    pub(crate) fn replay(&mut self) -> Vec<OutboundFrame> {
        let mut frames = Vec::with_capacity(self.entries.len());
        for (key, sub) in &self.entries {
            if let Some(frame) = subscribe_frame(sub) {
                frames.push(frame);
                self.sent.insert(key.clone());
            }
        }
        frames
    }

    /// Forgets what was sent; the subscriptions themselves stay.
    pub(crate) fn reset_runtime(&mut self) {
        self.sent.clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<Subscription> {
        self.entries.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn subscribe_frame(sub: &Subscription) -> Option<OutboundFrame> {
    match OutboundFrame::subscribe(&sub.request()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(topic = %sub.topic, error = %e, "cannot encode subscribe frame");
            None
        }
    }
}

/// Unsubscribe frame for a subscription.
pub(crate) fn unsubscribe_frame(sub: &Subscription) -> Option<OutboundFrame> {
    match OutboundFrame::unsubscribe(&sub.request()) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::warn!(topic = %sub.topic, error = %e, "cannot encode unsubscribe frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn positions(device: i64) -> Subscription {
        Subscription::new("positions").with_param("deviceId", device)
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut reg = SubscriptionRegistry::default();
        assert!(reg.subscribe(positions(42)));
        assert!(!reg.subscribe(positions(42)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn identity_ignores_param_order() {
        let a = Subscription::new("events")
            .with_param("userId", 1)
            .with_param("filter", json!({"b": 1, "a": 2}));
        let mut b = Subscription::new("events");
        b.params.insert("filter".into(), json!({"a": 2, "b": 1}));
        b.params.insert("userId".into(), json!(1));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn different_params_are_different_subscriptions() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(1));
        reg.subscribe(positions(2));
        reg.subscribe(Subscription::new("positions"));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn unsubscribe_missing_is_noop() {
        let mut reg = SubscriptionRegistry::default();
        assert!(!reg.unsubscribe(&positions(1)));
        assert!(reg.is_empty());
    }

    #[test]
    fn replay_sends_every_entry_once() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(1));
        reg.subscribe(positions(2));
        reg.subscribe(positions(1));

        let frames = reg.replay();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.frame_type == "subscribe"));

        // Already sent on this channel.
        assert!(reg.frame_for(&positions(1)).is_none());
    }

    #[test]
    fn reset_runtime_keeps_entries_and_allows_replay() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(1));
        reg.replay();
        reg.reset_runtime();

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.replay().len(), 1);
    }

    #[test]
    fn unsubscribe_reports_whether_server_knew() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(1));
        reg.subscribe(positions(2));
        reg.frame_for(&positions(1)).unwrap();

        assert!(reg.unsubscribe(&positions(1)));
        assert!(!reg.unsubscribe(&positions(2)));
        assert!(reg.replay().is_empty());
    }

    #[test]
    fn replay_reflects_state_at_send_time() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(1));
        reg.subscribe(positions(2));
        reg.unsubscribe(&positions(1));

        let frames = reg.replay();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].data,
            Some(json!({"type": "positions", "params": {"deviceId": 2}}))
        );
    }

    #[test]
    fn snapshot_lists_entries() {
        let mut reg = SubscriptionRegistry::default();
        reg.subscribe(positions(3));
        assert_eq!(reg.snapshot(), vec![positions(3)]);
    }
}
