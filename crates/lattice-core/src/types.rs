use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one pipeline run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to an inference backend.
///
/// Content is plain text: pipeline steps always send a system prompt plus the
/// budgeted state snapshot and consume a single textual completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
            timestamp: Some(Utc::now()),
        }
    }
}

/// A complete (non-streaming) response from an inference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Textual completion content.
    pub content: String,
    /// Model that produced the response.
    pub model: String,
}

/// Output of one successful step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    /// Parsed response payload (JSON extracted from the raw completion).
    pub response: serde_json::Value,
    /// Raw completion text as returned by the backend.
    pub raw: String,
    /// Wall-clock execution time. Zero for cache hits.
    pub execution_time_ms: u64,
    /// Hash of the budgeted input (also the cache key).
    pub input_hash: String,
    /// Hash of the raw output.
    pub output_hash: String,
    /// Whether this result was served from the response cache.
    #[serde(default)]
    pub cached: bool,
}

/// Result of one step execution: success payload or a recorded failure.
///
/// Failures are data, not exceptions — they merge into findings/history and
/// the run continues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    Success(StepOutput),
    Failure { error: String },
}

impl StepResult {
    pub fn is_success(&self) -> bool {
        matches!(self, StepResult::Success(_))
    }
}

/// Pipeline event broadcast to all subscribers.
///
/// Emission is best-effort: publishing never fails and never blocks a step.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// A pipeline run started.
    RunStarted { job_id: JobId },
    /// A step began executing.
    StepStarted { job_id: JobId, step: String },
    /// A step completed successfully.
    StepCompleted {
        job_id: JobId,
        step: String,
        elapsed_ms: u64,
        cached: bool,
    },
    /// A step failed; the failure is recorded and the run continues.
    StepFailed {
        job_id: JobId,
        step: String,
        error: String,
    },
    /// A conditional route was selected.
    RouteChosen {
        job_id: JobId,
        source: String,
        label: String,
    },
    /// A gate is holding the run, waiting for external input.
    GateWaiting {
        job_id: JobId,
        gate: String,
        options: Vec<serde_json::Value>,
    },
    /// A gate observed its precondition and released the run.
    GateSatisfied {
        job_id: JobId,
        gate: String,
        value: String,
    },
    /// The run reached the terminal node.
    RunCompleted { job_id: JobId, elapsed_ms: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new().0, JobId::new().0);
    }

    #[test]
    fn step_result_serialization() {
        let result = StepResult::Failure {
            error: "backend down".into(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["error"], "backend down");
    }

    #[test]
    fn message_constructors() {
        let msg = ChatMessage::system("You are a researcher.");
        assert_eq!(msg.role, Role::System);
        assert_eq!(msg.content, "You are a researcher.");
    }
}
