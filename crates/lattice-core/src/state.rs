use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mutable state shared by every step in one pipeline run.
///
/// Each step writes only its own findings key, so concurrent branches never
/// collide and the merge in [`RunState::apply`] is a conflict-free union.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    /// Job identifier, used for correlation across events, locks, and the
    /// session store.
    pub job_id: String,
    /// The research task as entered by the user.
    pub task: String,
    /// Optional reference to a target artifact (e.g. a paper URL).
    #[serde(default)]
    pub source_url: Option<String>,
    /// Routing decision produced by the orchestrator step.
    #[serde(default)]
    pub next_step: Option<String>,
    /// Gate flag: no research step proceeds until the topic is locked.
    #[serde(default)]
    pub topic_locked: bool,
    /// The chosen research topic, once locked.
    #[serde(default)]
    pub selected_topic: Option<String>,
    /// Generated topic options awaiting external selection.
    #[serde(default)]
    pub topic_suggestions: Vec<Value>,
    /// Step id → output payload. Disjoint keys by construction.
    #[serde(default)]
    pub findings: HashMap<String, Value>,
    /// Append-only execution log.
    #[serde(default)]
    pub history: Vec<String>,
}

impl RunState {
    pub fn new(job_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            task: task.into(),
            ..Default::default()
        }
    }

    /// Merge a partial update into this state.
    ///
    /// Reducers: findings = key union (each step owns its own key), history =
    /// append, scalar fields = last write wins when present.
    pub fn apply(&mut self, update: StateUpdate) {
        for (key, value) in update.findings {
            self.findings.insert(key, value);
        }
        self.history.extend(update.history);
        if let Some(next) = update.next_step {
            self.next_step = Some(next);
        }
        if let Some(locked) = update.topic_locked {
            self.topic_locked = locked;
        }
        if let Some(topic) = update.selected_topic {
            self.selected_topic = Some(topic);
        }
        if let Some(suggestions) = update.topic_suggestions {
            self.topic_suggestions = suggestions;
        }
    }
}

/// Partial state update returned by a step.
///
/// Only the fields a step actually produced are set; everything else is left
/// untouched by the merge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(default)]
    pub findings: HashMap<String, Value>,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub topic_locked: Option<bool>,
    #[serde(default)]
    pub selected_topic: Option<String>,
    #[serde(default)]
    pub topic_suggestions: Option<Vec<Value>>,
}

impl StateUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_finding(mut self, step: impl Into<String>, value: Value) -> Self {
        self.findings.insert(step.into(), value);
        self
    }

    pub fn with_history(mut self, entry: impl Into<String>) -> Self {
        self.history.push(entry.into());
        self
    }

    pub fn with_next_step(mut self, next: impl Into<String>) -> Self {
        self.next_step = Some(next.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
            && self.history.is_empty()
            && self.next_step.is_none()
            && self.topic_locked.is_none()
            && self.selected_topic.is_none()
            && self.topic_suggestions.is_none()
    }
}
