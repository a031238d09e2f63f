pub mod budget;
pub mod context;
pub mod envelope;
pub mod extract;
pub mod gate;
pub mod graph;
pub mod lock;
pub mod pipeline;
pub mod run_log;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::EngineContext;
pub use graph::{FnStep, Graph, GraphBuilder, Step, END};
pub use lock::DocumentLock;
pub use pipeline::{research_graph, run_research};
pub use run_log::RunLogger;
