use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use lattice_core::error::{LatticeError, Result};
use lattice_core::state::{RunState, StateUpdate};
use lattice_core::types::{JobId, PipelineEvent};

use super::edge::ConditionalEdge;
use super::node::{Step, END};
use crate::context::EngineContext;

/// Builds a [`Graph`]. All wiring mistakes (unknown nodes, unknown labels,
/// duplicate registrations, missing entry) surface in [`GraphBuilder::compile`]
/// as configuration errors — never at runtime.
#[derive(Default)]
pub struct GraphBuilder {
    steps: HashMap<String, Arc<dyn Step>>,
    duplicates: Vec<String>,
    edges: Vec<(String, String)>,
    conditional: HashMap<String, ConditionalEdge>,
    entry: Option<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step under its own id.
    pub fn register(&mut self, step: Arc<dyn Step>) -> &mut Self {
        let id = step.id().to_string();
        if self.steps.insert(id.clone(), step).is_some() {
            self.duplicates.push(id);
        }
        self
    }

    /// Add an unconditional edge. Multiple edges out of one node fan out in
    /// parallel; multiple edges into one node form a barrier join.
    pub fn add_edge(&mut self, src: impl Into<String>, dst: impl Into<String>) -> &mut Self {
        self.edges.push((src.into(), dst.into()));
        self
    }

    /// Add a conditional route: the predicate picks a label, the map resolves
    /// it to a target node (or [`END`]).
    pub fn add_conditional_edge<F>(
        &mut self,
        src: impl Into<String>,
        predicate: F,
        targets: HashMap<String, String>,
    ) -> &mut Self
    where
        F: Fn(&RunState) -> String + Send + Sync + 'static,
    {
        self.conditional
            .insert(src.into(), ConditionalEdge::new(predicate, targets));
        self
    }

    pub fn set_entry(&mut self, node: impl Into<String>) -> &mut Self {
        self.entry = Some(node.into());
        self
    }

    /// Validate the wiring and produce an executable graph.
    pub fn compile(self) -> Result<Graph> {
        if !self.duplicates.is_empty() {
            return Err(LatticeError::Config(format!(
                "Duplicate step registration: {}",
                self.duplicates.join(", ")
            )));
        }

        let entry = self
            .entry
            .ok_or_else(|| LatticeError::Config("Graph entry node not set".into()))?;
        if !self.steps.contains_key(&entry) {
            return Err(LatticeError::Config(format!(
                "Entry node '{}' is not registered",
                entry
            )));
        }

        let mut nodes: HashMap<String, CompiledNode> = self
            .steps
            .iter()
            .map(|(id, step)| {
                (
                    id.clone(),
                    CompiledNode {
                        step: step.clone(),
                        successors: Vec::new(),
                        predecessors: Vec::new(),
                        conditional: None,
                    },
                )
            })
            .collect();

        for (src, dst) in &self.edges {
            if !self.steps.contains_key(src) {
                return Err(LatticeError::Config(format!(
                    "Edge source '{}' is not registered",
                    src
                )));
            }
            if dst != END && !self.steps.contains_key(dst) {
                return Err(LatticeError::Config(format!(
                    "Edge target '{}' is not registered",
                    dst
                )));
            }
            nodes
                .get_mut(src)
                .expect("validated above")
                .successors
                .push(dst.clone());
            if dst != END {
                nodes
                    .get_mut(dst)
                    .expect("validated above")
                    .predecessors
                    .push(src.clone());
            }
        }

        for (src, edge) in self.conditional {
            if !self.steps.contains_key(&src) {
                return Err(LatticeError::Config(format!(
                    "Conditional edge source '{}' is not registered",
                    src
                )));
            }
            for (label, target) in &edge.targets {
                if target != END && !self.steps.contains_key(target) {
                    return Err(LatticeError::Config(format!(
                        "Conditional target '{}' (label '{}') is not registered",
                        target, label
                    )));
                }
            }
            let node = nodes.get_mut(&src).expect("validated above");
            if !node.successors.is_empty() {
                return Err(LatticeError::Config(format!(
                    "Node '{}' has both conditional and unconditional successors",
                    src
                )));
            }
            node.conditional = Some(edge);
        }

        Ok(Graph { nodes, entry })
    }
}

struct CompiledNode {
    step: Arc<dyn Step>,
    successors: Vec<String>,
    /// Unconditional predecessors; the barrier join waits on the activated
    /// subset of these.
    predecessors: Vec<String>,
    conditional: Option<ConditionalEdge>,
}

/// An executable workflow graph.
pub struct Graph {
    nodes: HashMap<String, CompiledNode>,
    entry: String,
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .finish()
    }
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Execute the graph to completion and return the accumulated state.
    ///
    /// Never fails at runtime: step errors (and panics) are recorded into
    /// findings and history as error payloads and execution continues.
    pub async fn invoke(&self, initial: RunState, ctx: &Arc<EngineContext>) -> RunState {
        let start = Instant::now();
        let mut state = initial;
        let job_id = JobId::from_str(&state.job_id);

        ctx.events.publish(PipelineEvent::RunStarted {
            job_id: job_id.clone(),
        });

        let mut running: JoinSet<Result<StateUpdate>> = JoinSet::new();
        let mut task_ids: HashMap<tokio::task::Id, String> = HashMap::new();
        // Nodes that have ever been activated in this run, and those that have
        // finished their (latest) execution.
        let mut scheduled: HashSet<String> = HashSet::new();
        let mut completed: HashSet<String> = HashSet::new();

        scheduled.insert(self.entry.clone());
        self.spawn_node(&self.entry, &state, ctx, &mut running, &mut task_ids);

        while let Some(joined) = running.join_next_with_id().await {
            let (node_id, result) = match joined {
                Ok((task_id, result)) => {
                    let node_id = task_ids.remove(&task_id).unwrap_or_default();
                    (node_id, result)
                }
                Err(join_err) => {
                    let node_id = task_ids.remove(&join_err.id()).unwrap_or_default();
                    error!(node = %node_id, error = %join_err, "Graph node panicked");
                    let failure = LatticeError::Step {
                        step: node_id.clone(),
                        message: "node task panicked".into(),
                    };
                    (node_id, Err(failure))
                }
            };

            match result {
                Ok(update) => {
                    state.apply(update);
                    debug!(node = %node_id, "Node execution complete");
                }
                Err(e) => {
                    // Caught at the node boundary: record and continue.
                    error!(node = %node_id, error = %e, "Graph node failed");
                    state.findings.insert(
                        node_id.clone(),
                        serde_json::json!({ "error": e.to_string() }),
                    );
                    state
                        .history
                        .push(format!("{}: failed - {}", node_id, e));
                    ctx.events.publish(PipelineEvent::StepFailed {
                        job_id: job_id.clone(),
                        step: node_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
            completed.insert(node_id.clone());

            for target in self.route(&node_id, &state, ctx, &job_id) {
                if target == END {
                    continue;
                }
                self.try_schedule(
                    &target,
                    &state,
                    ctx,
                    &mut running,
                    &mut task_ids,
                    &mut scheduled,
                    &mut completed,
                );
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(job = %state.job_id, elapsed_ms, "Graph run complete");
        ctx.events.publish(PipelineEvent::RunCompleted {
            job_id,
            elapsed_ms,
        });

        state
    }

    /// Successor targets for a finished node: the conditional label route, or
    /// all unconditional successors.
    fn route(
        &self,
        node_id: &str,
        state: &RunState,
        ctx: &Arc<EngineContext>,
        job_id: &JobId,
    ) -> Vec<String> {
        let node = match self.nodes.get(node_id) {
            Some(n) => n,
            None => return Vec::new(),
        };

        if let Some(edge) = &node.conditional {
            let label = (edge.predicate)(state);
            match edge.targets.get(&label) {
                Some(target) => {
                    debug!(node = %node_id, label = %label, target = %target, "Route chosen");
                    ctx.events.publish(PipelineEvent::RouteChosen {
                        job_id: job_id.clone(),
                        source: node_id.to_string(),
                        label,
                    });
                    vec![target.clone()]
                }
                None => {
                    // The label set was fixed at compile time; a predicate
                    // escaping it ends the branch rather than crashing the run.
                    warn!(node = %node_id, label = %label, "No route for label, branch complete");
                    Vec::new()
                }
            }
        } else {
            node.successors.clone()
        }
    }

    /// Schedule a target if its barrier is satisfied.
    ///
    /// A join waits for all *activated* predecessors — branches that were
    /// never chosen by a conditional route are not waited for. The last
    /// finishing predecessor is the one that finally schedules the join.
    /// Routing into an already-completed node re-enters it (the gate loop).
    #[allow(clippy::too_many_arguments)]
    fn try_schedule(
        &self,
        target: &str,
        state: &RunState,
        ctx: &Arc<EngineContext>,
        running: &mut JoinSet<Result<StateUpdate>>,
        task_ids: &mut HashMap<tokio::task::Id, String>,
        scheduled: &mut HashSet<String>,
        completed: &mut HashSet<String>,
    ) {
        if !self.nodes.contains_key(target) {
            return;
        }

        if scheduled.contains(target) && !completed.contains(target) {
            // Already queued or running.
            return;
        }

        if completed.contains(target) {
            // Re-entry via a route-back edge.
            completed.remove(target);
            self.spawn_node(target, state, ctx, running, task_ids);
            return;
        }

        let barrier_open = self.nodes[target]
            .predecessors
            .iter()
            .filter(|p| scheduled.contains(*p))
            .all(|p| completed.contains(p));

        if barrier_open {
            scheduled.insert(target.to_string());
            self.spawn_node(target, state, ctx, running, task_ids);
        }
    }

    fn spawn_node(
        &self,
        node_id: &str,
        state: &RunState,
        ctx: &Arc<EngineContext>,
        running: &mut JoinSet<Result<StateUpdate>>,
        task_ids: &mut HashMap<tokio::task::Id, String>,
    ) {
        let node = &self.nodes[node_id];
        info!(node = %node_id, "Executing graph node");

        let step = node.step.clone();
        let snapshot = state.clone();
        let ctx = Arc::clone(ctx);
        let handle = running.spawn(async move { step.run(&snapshot, &ctx).await });
        task_ids.insert(handle.id(), node_id.to_string());
    }
}
