use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info};

use lattice_core::config::ModelRole;
use lattice_core::error::Result;
use lattice_core::state::{RunState, StateUpdate};
use lattice_core::types::{JobId, PipelineEvent, StepResult};

use crate::context::EngineContext;
use crate::envelope::run_step;
use crate::graph::Step;

pub const TOPIC_DISCOVERY: &str = "topic_discovery";
pub const TOPIC_LOCK: &str = "topic_lock";

const DISCOVERY_PROMPT: &str = "You are a research topic strategist. Decide whether the \
user's input is a specific research topic or a broad domain. If specific, return \
{\"is_specific\": true, \"selected_topic\": \"<refined title>\"}. If broad, return \
{\"is_specific\": false, \"topic_suggestions\": [{\"title\": ..., \"domain\": ..., \
\"novelty_angle\": ...}]} with 5-10 entries.";

/// Entry step: refines the task into a locked topic or a list of options.
///
/// A specific input auto-satisfies the downstream gate; a broad one produces
/// suggestions, publishes them to the session store for out-of-band selection,
/// and leaves the gate waiting. On revisits while waiting, it re-checks the
/// session store instead of generating again.
pub struct TopicDiscoveryStep;

impl TopicDiscoveryStep {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TopicDiscoveryStep {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for TopicDiscoveryStep {
    fn id(&self) -> &str {
        TOPIC_DISCOVERY
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            if state.topic_locked {
                debug!(topic = ?state.selected_topic, "Topic already locked, skipping discovery");
                return Ok(StateUpdate::default());
            }

            // Waiting for an external selection: poll the store, don't regenerate.
            if !state.topic_suggestions.is_empty() {
                let external = ctx.sessions.get(&state.job_id);
                if external["topic_locked"] == json!(true) {
                    let topic = external["selected_topic"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    info!(topic = %topic, "External topic lock observed");
                    return Ok(StateUpdate {
                        topic_locked: Some(true),
                        selected_topic: Some(topic.clone()),
                        history: vec![format!("topic_discovery: topic locked externally ({})", topic)],
                        ..Default::default()
                    });
                }

                // Keep options visible for whoever resolves the gate.
                let _ = ctx.sessions.merge_update(
                    &state.job_id,
                    &json!({
                        "topic_locked": false,
                        "topic_suggestions": &state.topic_suggestions,
                    }),
                );
                return Ok(StateUpdate::default());
            }

            match run_step(ctx, TOPIC_DISCOVERY, ModelRole::Reasoning, DISCOVERY_PROMPT, state)
                .await
            {
                StepResult::Success(output) => {
                    let response = output.response.clone();
                    let mut update = StateUpdate::new()
                        .with_finding(TOPIC_DISCOVERY, output.response);

                    if response["is_specific"] == json!(true) {
                        let topic = response["selected_topic"]
                            .as_str()
                            .unwrap_or(&state.task)
                            .to_string();
                        let _ = ctx.sessions.merge_update(
                            &state.job_id,
                            &json!({"topic_locked": true, "selected_topic": topic}),
                        );
                        update.topic_locked = Some(true);
                        update.selected_topic = Some(topic.clone());
                        update
                            .history
                            .push(format!("topic_discovery: specific input, locked ({})", topic));
                    } else {
                        let suggestions = response["topic_suggestions"]
                            .as_array()
                            .cloned()
                            .unwrap_or_default();
                        let _ = ctx.sessions.merge_update(
                            &state.job_id,
                            &json!({"topic_locked": false, "topic_suggestions": &suggestions}),
                        );
                        update.history.push(format!(
                            "topic_discovery: generated {} suggestions",
                            suggestions.len()
                        ));
                        update.topic_suggestions = Some(suggestions);
                    }
                    Ok(update)
                }
                StepResult::Failure { error } => Ok(StateUpdate::new()
                    .with_finding(TOPIC_DISCOVERY, json!({ "error": error }))
                    .with_history(format!("topic_discovery: failed - {}", error))),
            }
        })
    }
}

/// Progression gate: holds the graph until the topic is locked.
///
/// While unsatisfied it emits its pending options, sleeps a fixed short
/// interval, and the conditional edge routes back to discovery — a deliberate
/// bounded-interval poll with no timeout; only the caller abandoning the run
/// stops it. Once satisfied, later visits are no-ops returning the previously
/// resolved value (already merged into state).
pub struct TopicGate;

impl TopicGate {
    pub fn new() -> Self {
        Self
    }

    /// Route label for the gate's conditional edge.
    pub fn route(state: &RunState) -> String {
        if state.topic_locked {
            "proceed".to_string()
        } else {
            "wait".to_string()
        }
    }
}

impl Default for TopicGate {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for TopicGate {
    fn id(&self) -> &str {
        TOPIC_LOCK
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            if state.topic_locked {
                return Ok(StateUpdate::default());
            }

            let job_id = JobId::from_str(&state.job_id);
            let external = ctx.sessions.get(&state.job_id);
            if external["topic_locked"] == json!(true) {
                let topic = external["selected_topic"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string();
                info!(topic = %topic, "Gate satisfied");
                ctx.events.publish(PipelineEvent::GateSatisfied {
                    job_id,
                    gate: TOPIC_LOCK.to_string(),
                    value: topic.clone(),
                });
                return Ok(StateUpdate {
                    topic_locked: Some(true),
                    selected_topic: Some(topic.clone()),
                    history: vec![format!("topic_lock: satisfied ({})", topic)],
                    ..Default::default()
                });
            }

            ctx.events.publish(PipelineEvent::GateWaiting {
                job_id,
                gate: TOPIC_LOCK.to_string(),
                options: state.topic_suggestions.clone(),
            });
            tokio::time::sleep(Duration::from_millis(ctx.config.gate.poll_interval_ms)).await;
            Ok(StateUpdate::default())
        })
    }
}
