//! Graph execution engine — DAG-based multi-step workflow orchestration.
//!
//! A workflow is a directed graph of [`Step`]s connected by edges. Unconditional
//! fan-out runs successors truly in parallel; a node with several unconditional
//! predecessors is a barrier join and runs once all of its activated
//! predecessors complete. Conditional edges evaluate a predicate against
//! post-merge state and pick one labeled successor, which may route backwards
//! (the gate's poll loop re-enters an already-completed node).
//!
//! Step failures never abort the run: they are recorded into findings and
//! history as error payloads and execution continues to the terminal sentinel.

pub mod edge;
pub mod executor;
pub mod node;

pub use edge::{ConditionalEdge, RoutePredicate};
pub use executor::{Graph, GraphBuilder};
pub use node::{FnStep, Step, END};
