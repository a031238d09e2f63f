use std::collections::HashMap;
use std::sync::Arc;

use lattice_core::state::RunState;

/// Predicate evaluated against post-merge state; returns a route label.
pub type RoutePredicate = Arc<dyn Fn(&RunState) -> String + Send + Sync>;

/// A conditional route out of a node: the predicate picks one label from a
/// small fixed set, and the label map resolves it to a target node.
///
/// The label set is validated at compile time — an unknown target is a
/// configuration error, never a runtime surprise.
#[derive(Clone)]
pub struct ConditionalEdge {
    pub predicate: RoutePredicate,
    pub targets: HashMap<String, String>,
}

impl ConditionalEdge {
    pub fn new<F>(predicate: F, targets: HashMap<String, String>) -> Self
    where
        F: Fn(&RunState) -> String + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            targets,
        }
    }
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("targets", &self.targets)
            .finish()
    }
}
