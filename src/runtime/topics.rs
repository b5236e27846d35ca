use std::collections::{BTreeMap, BTreeSet};

use crate::definition::{ProcessTopics, RoutingHint};

/// Topics the orchestrator polls. Never mutated in place; every update
/// builds a new value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicSet {
    dynamic: BTreeSet<String>,
    static_topics: BTreeSet<String>,
    hints: BTreeMap<String, RoutingHint>,
}

impl TopicSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dynamic(&self, dynamic: BTreeSet<String>) -> Self {
        Self {
            dynamic,
            ..self.clone()
        }
    }

    /// Replaces the definition-derived topics and hints.
    pub fn with_static<'a>(&self, definitions: impl IntoIterator<Item = &'a ProcessTopics>) -> Self {
        let mut static_topics = BTreeSet::new();
        let mut hints: BTreeMap<String, RoutingHint> = BTreeMap::new();
        for process in definitions {
            static_topics.extend(process.topics.iter().cloned());
            for (topic, hint) in &process.hints {
                hints.entry(topic.clone()).or_insert_with(|| hint.clone());
            }
        }
        Self {
            dynamic: self.dynamic.clone(),
            static_topics,
            hints,
        }
    }

    pub fn dynamic(&self) -> &BTreeSet<String> {
        &self.dynamic
    }

    pub fn static_topics(&self) -> &BTreeSet<String> {
        &self.static_topics
    }

    pub fn all(&self) -> BTreeSet<String> {
        self.dynamic.union(&self.static_topics).cloned().collect()
    }

    pub fn hint(&self, topic: &str) -> Option<&RoutingHint> {
        self.hints.get(topic)
    }

    pub fn is_empty(&self) -> bool {
        self.dynamic.is_empty() && self.static_topics.is_empty()
    }
}
