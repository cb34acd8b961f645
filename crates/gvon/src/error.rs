use gvon_comm::CommError;
use gvon_graph::GraphError;
use gvon_types::{EdgeId, VertexId};
use std::fmt;

#[derive(Clone, Debug)]
pub enum CageError {
    /// Vertex id outside the graph.
    UnknownVertex(VertexId),
    /// Edge id outside the graph, or an edge value that does not belong to
    /// it.
    UnknownEdge(EdgeId),
    /// Payload and buffer sizes disagree.
    SizeMismatch { expected: usize, actual: usize },
    /// The collective bookkeeping received corrupt data.
    Protocol(String),
    /// The graph description was rejected.
    Graph(GraphError),
    /// Failure reported by the transport layer.
    Comm(CommError),
}

impl fmt::Display for CageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownVertex(id) => write!(f, "unknown vertex {id}"),
            Self::UnknownEdge(id) => write!(f, "unknown edge {id}"),
            Self::SizeMismatch { expected, actual } => {
                write!(f, "buffer of {expected} bytes, payload of {actual} bytes")
            }
            Self::Protocol(reason) => write!(f, "protocol error: {reason}"),
            Self::Graph(err) => write!(f, "{err}"),
            Self::Comm(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CageError {}

impl From<CommError> for CageError {
    fn from(value: CommError) -> Self {
        Self::Comm(value)
    }
}

impl From<GraphError> for CageError {
    fn from(value: GraphError) -> Self {
        Self::Graph(value)
    }
}
