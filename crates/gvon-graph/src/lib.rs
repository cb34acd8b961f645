//! Typed directed multigraph with dense vertex and edge ids, plus the
//! declarative patterns that produce graphs and the mappings that assign
//! vertices to peers.

pub mod mapping;
pub mod pattern;

mod graph;

pub use graph::{Edge, Graph, GraphDescription, GraphError, Vertex};
pub use mapping::Mapping;
pub use pattern::Pattern;
