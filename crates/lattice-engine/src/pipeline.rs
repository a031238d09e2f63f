use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{info, warn};

use lattice_core::config::ModelRole;
use lattice_core::error::Result;
use lattice_core::state::{RunState, StateUpdate};
use lattice_core::types::{JobId, StepResult};

use crate::context::EngineContext;
use crate::envelope::run_step;
use crate::gate::{TopicDiscoveryStep, TopicGate, TOPIC_DISCOVERY, TOPIC_LOCK};
use crate::graph::{Graph, GraphBuilder, Step, END};

/// Declaration of one LLM-backed step: id, model role, and its system prompt.
/// Prompt text here is a one-line role statement; the real prompt engineering
/// lives with the callers that own it.
pub struct StepSpec {
    pub id: &'static str,
    pub role: ModelRole,
    pub prompt: &'static str,
}

pub const ORCHESTRATOR: &str = "orchestrator";
pub const REPORT: &str = "report";

/// Owner string the report writer uses for the document lock.
const REPORT_LOCK_OWNER: &str = "report";

/// All plain LLM steps of the canonical research pipeline.
pub const STEP_SPECS: &[StepSpec] = &[
    StepSpec {
        id: "domain_intelligence",
        role: ModelRole::Reasoning,
        prompt: "Map the research domain: subfields, key entities, and active frontiers for the locked topic.",
    },
    StepSpec {
        id: "historical_review",
        role: ModelRole::Reasoning,
        prompt: "Trace the historical evolution of the domain and its landmark results.",
    },
    StepSpec {
        id: "slr",
        role: ModelRole::Reasoning,
        prompt: "Produce a systematic literature review of the most relevant recent work.",
    },
    StepSpec {
        id: "news",
        role: ModelRole::Reasoning,
        prompt: "Summarize current developments and announcements relevant to the topic.",
    },
    StepSpec {
        id: "gap_synthesis",
        role: ModelRole::Reasoning,
        prompt: "Synthesize the historical review, literature review, and news findings into open research gaps.",
    },
    StepSpec {
        id: "innovation",
        role: ModelRole::Reasoning,
        prompt: "Propose novel research directions addressing the synthesized gaps.",
    },
    StepSpec {
        id: "paper_decomposition",
        role: ModelRole::Reasoning,
        prompt: "Decompose the referenced paper into claims, methods, and evidence.",
    },
    StepSpec {
        id: "understanding",
        role: ModelRole::Reasoning,
        prompt: "Explain the decomposed paper's approach and situate it in the field.",
    },
    StepSpec {
        id: "technical_verification",
        role: ModelRole::Critical,
        prompt: "Verify the technical soundness of the paper's claims against its evidence.",
    },
    StepSpec {
        id: "critique",
        role: ModelRole::Critical,
        prompt: "Identify unsupported claims and weaknesses in the analysis so far.",
    },
    StepSpec {
        id: "visualization",
        role: ModelRole::Coding,
        prompt: "Design figures and diagrams that communicate the accumulated findings.",
    },
    StepSpec {
        id: "scoring",
        role: ModelRole::Critical,
        prompt: "Score the accumulated findings for novelty, rigor, and feasibility.",
    },
];

const REPORT_PROMPT: &str =
    "Compose the final multi-stage research report from all accumulated findings.";

const ORCHESTRATOR_PROMPT: &str = "Decide the research strategy. Return \
{\"next_step\": \"paper_analysis\"} when a source paper should drive the run, else \
{\"next_step\": \"domain_research\"}.";

/// A pipeline step that runs one inference inside the step envelope and owns
/// one findings key.
pub struct LlmStep {
    id: String,
    role: ModelRole,
    prompt: String,
}

impl LlmStep {
    pub fn new(id: impl Into<String>, role: ModelRole, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            prompt: prompt.into(),
        }
    }

    pub fn from_spec(spec: &StepSpec) -> Self {
        Self::new(spec.id, spec.role, spec.prompt)
    }

    /// Envelope execution plus findings/history bookkeeping. Failures become
    /// error payloads; this never returns `Err`.
    async fn execute(&self, state: &RunState, ctx: &EngineContext) -> StateUpdate {
        match run_step(ctx, &self.id, self.role, &self.prompt, state).await {
            StepResult::Success(output) => {
                let note = if output.cached { ", cached" } else { "" };
                StateUpdate::new()
                    .with_finding(&self.id, output.response)
                    .with_history(format!(
                        "{}: completed ({} ms{})",
                        self.id, output.execution_time_ms, note
                    ))
            }
            StepResult::Failure { error } => StateUpdate::new()
                .with_finding(&self.id, json!({ "error": error }))
                .with_history(format!("{}: failed - {}", self.id, error)),
        }
    }
}

impl Step for LlmStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move { Ok(self.execute(state, ctx).await) })
    }
}

/// Routing step: picks the research strategy for the run.
///
/// Consults the model, but a malformed answer falls back to the structural
/// heuristic (a source paper present routes to paper analysis).
pub struct OrchestratorStep {
    inner: LlmStep,
}

impl OrchestratorStep {
    pub fn new() -> Self {
        Self {
            inner: LlmStep::new(ORCHESTRATOR, ModelRole::Reasoning, ORCHESTRATOR_PROMPT),
        }
    }

    /// Route label for the orchestrator's conditional edge.
    pub fn route(state: &RunState) -> String {
        state
            .next_step
            .clone()
            .unwrap_or_else(|| "domain_research".to_string())
    }
}

impl Default for OrchestratorStep {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for OrchestratorStep {
    fn id(&self) -> &str {
        ORCHESTRATOR
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let fallback = if state.source_url.is_some() {
                "paper_analysis"
            } else {
                "domain_research"
            };

            let mut update = self.inner.execute(state, ctx).await;
            let next = update
                .findings
                .get(ORCHESTRATOR)
                .and_then(|v| v["next_step"].as_str())
                .filter(|s| *s == "paper_analysis" || *s == "domain_research")
                .unwrap_or(fallback)
                .to_string();

            info!(next_step = %next, "Orchestrator routed");
            update.next_step = Some(next);
            Ok(update)
        })
    }
}

/// Writer step: the only step allowed to mutate the shared report artifact.
///
/// Serializes with the document lock and bumps the document revision after a
/// successful write. A lock timeout surfaces as a failed write attempt in
/// findings/history — never a silent retry past the configured timeout.
pub struct ReportStep {
    inner: LlmStep,
}

impl ReportStep {
    pub fn new() -> Self {
        Self {
            inner: LlmStep::new(REPORT, ModelRole::Writing, REPORT_PROMPT),
        }
    }
}

impl Default for ReportStep {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for ReportStep {
    fn id(&self) -> &str {
        REPORT
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        Box::pin(async move {
            let timeout = Duration::from_secs(ctx.config.lock.acquire_timeout_secs);

            if !ctx
                .lock
                .acquire(&state.job_id, REPORT_LOCK_OWNER, timeout)
                .await
            {
                warn!(job = %state.job_id, "Could not acquire document lock for report");
                return Ok(StateUpdate::new()
                    .with_finding(REPORT, json!({ "error": "could not acquire document lock" }))
                    .with_history(format!(
                        "{}: failed - could not acquire document lock",
                        REPORT
                    )));
            }

            let update = self.inner.execute(state, ctx).await;
            let wrote = update
                .findings
                .get(REPORT)
                .map(|v| v.get("error").is_none())
                .unwrap_or(false);
            if wrote {
                let version = ctx.lock.increment_version(&state.job_id, REPORT_LOCK_OWNER);
                info!(job = %state.job_id, version, "Report written");
            }
            ctx.lock.release(&state.job_id, REPORT_LOCK_OWNER);

            Ok(update)
        })
    }
}

/// Build the canonical research pipeline.
///
/// ```text
/// topic_discovery → topic_lock ─(gate)→ orchestrator
/// orchestrator ─(route)→ domain_intelligence | paper_decomposition
/// A: domain_intelligence → {historical_review, slr, news} → gap_synthesis → innovation
/// B: paper_decomposition → understanding → technical_verification → critique
/// innovation → visualization ← critique
/// visualization → scoring → report → END
/// ```
pub fn research_graph() -> Result<Graph> {
    let mut builder = GraphBuilder::new();

    builder
        .register(Arc::new(TopicDiscoveryStep::new()))
        .register(Arc::new(TopicGate::new()))
        .register(Arc::new(OrchestratorStep::new()))
        .register(Arc::new(ReportStep::new()));
    for spec in STEP_SPECS {
        builder.register(Arc::new(LlmStep::from_spec(spec)));
    }

    builder
        .set_entry(TOPIC_DISCOVERY)
        .add_edge(TOPIC_DISCOVERY, TOPIC_LOCK)
        .add_conditional_edge(
            TOPIC_LOCK,
            TopicGate::route,
            HashMap::from([
                ("proceed".to_string(), ORCHESTRATOR.to_string()),
                ("wait".to_string(), TOPIC_DISCOVERY.to_string()),
            ]),
        )
        .add_conditional_edge(
            ORCHESTRATOR,
            OrchestratorStep::route,
            HashMap::from([
                ("domain_research".to_string(), "domain_intelligence".to_string()),
                ("paper_analysis".to_string(), "paper_decomposition".to_string()),
            ]),
        )
        // Pipeline A: fan out after domain mapping, converge on gap synthesis.
        .add_edge("domain_intelligence", "historical_review")
        .add_edge("domain_intelligence", "slr")
        .add_edge("domain_intelligence", "news")
        .add_edge("historical_review", "gap_synthesis")
        .add_edge("slr", "gap_synthesis")
        .add_edge("news", "gap_synthesis")
        .add_edge("gap_synthesis", "innovation")
        // Pipeline B: sequential paper analysis.
        .add_edge("paper_decomposition", "understanding")
        .add_edge("understanding", "technical_verification")
        .add_edge("technical_verification", "critique")
        // Both pipelines converge on the output stages.
        .add_edge("innovation", "visualization")
        .add_edge("critique", "visualization")
        .add_edge("visualization", "scoring")
        .add_edge("scoring", REPORT)
        .add_edge(REPORT, END);

    builder.compile()
}

/// Run the research pipeline for one task.
pub async fn run_research(
    ctx: &Arc<EngineContext>,
    task: &str,
    source_url: Option<String>,
    job_id: Option<String>,
) -> Result<RunState> {
    let graph = research_graph()?;
    let job_id = job_id.unwrap_or_else(|| JobId::new().to_string());

    let mut state = RunState::new(job_id, task);
    state.source_url = source_url;

    Ok(graph.invoke(state, ctx).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::counting_context;

    fn locked_state(job: &str) -> RunState {
        let mut state = RunState::new(job, "federated learning under constraint");
        state.topic_locked = true;
        state.selected_topic = Some("Federated Learning Under Bandwidth Constraints".into());
        state
    }

    #[test]
    fn research_graph_compiles() {
        let graph = research_graph().unwrap();
        assert_eq!(graph.entry(), TOPIC_DISCOVERY);
        // 4 special steps + the LLM step table.
        assert_eq!(graph.node_count(), 4 + STEP_SPECS.len());
    }

    #[tokio::test]
    async fn domain_path_runs_to_completion() {
        let (ctx, _calls) =
            counting_context(r#"{"next_step": "domain_research", "summary": "findings"}"#);
        let graph = research_graph().unwrap();

        let state = graph.invoke(locked_state("job-a"), &ctx).await;

        for step in [
            "domain_intelligence",
            "historical_review",
            "slr",
            "news",
            "gap_synthesis",
            "innovation",
            "visualization",
            "scoring",
            REPORT,
        ] {
            assert!(state.findings.contains_key(step), "missing finding: {}", step);
        }
        // The unchosen paper branch never ran.
        assert!(!state.findings.contains_key("paper_decomposition"));
        assert!(!state.findings.contains_key("critique"));

        // The writer bumped the document revision and released the lock.
        assert_eq!(ctx.lock.current_version("job-a"), 1);
        assert!(!ctx.lock.is_locked("job-a"));
    }

    #[tokio::test]
    async fn paper_path_runs_to_completion() {
        let (ctx, _calls) =
            counting_context(r#"{"next_step": "paper_analysis", "summary": "findings"}"#);
        let graph = research_graph().unwrap();

        let mut initial = locked_state("job-b");
        initial.source_url = Some("https://arxiv.org/abs/2401.00001".into());

        let state = graph.invoke(initial, &ctx).await;

        for step in [
            "paper_decomposition",
            "understanding",
            "technical_verification",
            "critique",
            "visualization",
            "scoring",
            REPORT,
        ] {
            assert!(state.findings.contains_key(step), "missing finding: {}", step);
        }
        assert!(!state.findings.contains_key("domain_intelligence"));
    }

    #[tokio::test]
    async fn orchestrator_falls_back_on_malformed_route() {
        // The model answers garbage; the structural heuristic routes instead.
        let (ctx, _calls) = counting_context("not json");
        let graph = research_graph().unwrap();

        let state = graph.invoke(locked_state("job-c"), &ctx).await;
        assert_eq!(state.next_step.as_deref(), Some("domain_research"));
        assert!(state.findings.contains_key("domain_intelligence"));
    }
}
