use std::sync::Arc;

use futures::future::BoxFuture;

use lattice_core::error::Result;
use lattice_core::state::{RunState, StateUpdate};

use crate::context::EngineContext;

/// Terminal sentinel: an edge pointing here ends the branch, and the run
/// returns its accumulated state once nothing is left running.
pub const END: &str = "__end__";

/// One named unit of work in the graph.
///
/// A step receives the full current state (read-only) and returns a partial
/// update; it writes only its own findings key, which is what makes parallel
/// branch merges conflict-free.
pub trait Step: Send + Sync + 'static {
    /// Step id — also the node name and the findings key this step owns.
    fn id(&self) -> &str;

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>>;
}

type StepFn = dyn Fn(RunState) -> BoxFuture<'static, Result<StateUpdate>> + Send + Sync;

/// A step backed by a plain async function. Used for routing/bookkeeping
/// nodes and throughout the executor tests.
pub struct FnStep {
    id: String,
    f: Arc<StepFn>,
}

impl FnStep {
    pub fn new<F, Fut>(id: impl Into<String>, f: F) -> Self
    where
        F: Fn(RunState) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<StateUpdate>> + Send + 'static,
    {
        Self {
            id: id.into(),
            f: Arc::new(move |state| Box::pin(f(state))),
        }
    }
}

impl Step for FnStep {
    fn id(&self) -> &str {
        &self.id
    }

    fn run<'a>(
        &'a self,
        state: &'a RunState,
        _ctx: &'a EngineContext,
    ) -> BoxFuture<'a, Result<StateUpdate>> {
        (self.f)(state.clone())
    }
}
