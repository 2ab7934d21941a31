use crate::envelope::{EventEnvelope, Priority};
use std::collections::BTreeSet;

/// Per-connection delivery rules.
///
/// An envelope is delivered when it passes the subscription set (empty means
/// every type), the minimum priority, and the type allow-list. A default
/// filter admits everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientFilter {
    subscriptions: BTreeSet<String>,
    min_priority: Option<Priority>,
    allowed_types: Option<BTreeSet<String>>,
}

impl ClientFilter {
    pub fn subscribe(&mut self, types: &[String]) {
        self.subscriptions.extend(types.iter().cloned());
    }

    pub fn unsubscribe(&mut self, types: &[String]) {
        for t in types {
            self.subscriptions.remove(t);
        }
    }

    /// Replace both filters. An empty type list clears the allow-list.
    pub fn set_filters(&mut self, min_priority: Option<Priority>, types: Option<Vec<String>>) {
        self.min_priority = min_priority;
        self.allowed_types = types
            .filter(|t| !t.is_empty())
            .map(|t| t.into_iter().collect());
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.iter().cloned().collect()
    }

    pub fn min_priority(&self) -> Option<Priority> {
        self.min_priority
    }

    pub fn allowed_types(&self) -> Option<Vec<String>> {
        self.allowed_types
            .as_ref()
            .map(|t| t.iter().cloned().collect())
    }

    pub fn admits(&self, envelope: &EventEnvelope) -> bool {
        let subscribed =
            self.subscriptions.is_empty() || self.subscriptions.contains(&envelope.event_type);
        let priority_ok = self
            .min_priority
            .map_or(true, |min| envelope.priority >= min);
        let type_ok = self
            .allowed_types
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&envelope.event_type));
        subscribed && priority_ok && type_ok
    }
}
