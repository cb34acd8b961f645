use gvon_types::{EdgeId, GraphId, VertexId};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(0);

fn next_graph_id() -> GraphId {
    GraphId(NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed))
}

/// A communication endpoint of the virtual overlay. Plain value; all
/// operations on it go through the owning graph or cage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Vertex {
    pub id: VertexId,
}

/// A directed point-to-point channel between two vertices. The edge id is
/// the matching tag on the wire, which keeps parallel edges between the
/// same vertex pair distinguishable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Edge {
    pub id: EdgeId,
    pub source: Vertex,
    pub target: Vertex,
}

/// Declarative description of a graph: the vertex list (ids must be a
/// permutation of `[0, |V|)`) and the edge list in edge-id order.
#[derive(Clone, Debug)]
pub struct GraphDescription<VP = (), EP = ()> {
    pub vertices: Vec<(VertexId, VP)>,
    pub edges: Vec<((VertexId, VertexId), EP)>,
}

impl<VP, EP> Default for GraphDescription<VP, EP> {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GraphError {
    /// The vertex list is not a permutation of `[0, |V|)`.
    InvalidVertexSet { id: VertexId, count: usize },
    /// An edge references a vertex id outside the vertex list.
    DanglingEdge { edge: usize, vertex: VertexId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidVertexSet { id, count } => {
                write!(
                    f,
                    "vertex id {id} does not fit a dense set of {count} vertices"
                )
            }
            Self::DanglingEdge { edge, vertex } => {
                write!(f, "edge {edge} references unknown vertex {vertex}")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Immutable directed multigraph. Vertex and edge ids are dense; adjacency
/// is precomputed at construction.
pub struct Graph<VP = (), EP = ()> {
    id: GraphId,
    vertex_props: Vec<VP>,
    edge_props: Vec<EP>,
    endpoints: Vec<(VertexId, VertexId)>,
    out_edges: Vec<Vec<EdgeId>>,
    in_edges: Vec<Vec<EdgeId>>,
}

impl<VP, EP> Graph<VP, EP> {
    pub fn from_description(description: GraphDescription<VP, EP>) -> Result<Self, GraphError> {
        let vertex_count = description.vertices.len();

        let mut vertex_props: Vec<Option<VP>> = (0..vertex_count).map(|_| None).collect();
        for (id, property) in description.vertices {
            if id.0 >= vertex_count || vertex_props[id.0].is_some() {
                return Err(GraphError::InvalidVertexSet {
                    id,
                    count: vertex_count,
                });
            }
            vertex_props[id.0] = Some(property);
        }
        let vertex_props: Vec<VP> = vertex_props.into_iter().flatten().collect();

        let mut endpoints = Vec::with_capacity(description.edges.len());
        let mut edge_props = Vec::with_capacity(description.edges.len());
        let mut out_edges: Vec<Vec<EdgeId>> = vec![Vec::new(); vertex_count];
        let mut in_edges: Vec<Vec<EdgeId>> = vec![Vec::new(); vertex_count];

        for (index, ((source, target), property)) in description.edges.into_iter().enumerate() {
            for endpoint in [source, target] {
                if endpoint.0 >= vertex_count {
                    return Err(GraphError::DanglingEdge {
                        edge: index,
                        vertex: endpoint,
                    });
                }
            }
            let id = EdgeId(index);
            out_edges[source.0].push(id);
            in_edges[target.0].push(id);
            endpoints.push((source, target));
            edge_props.push(property);
        }

        Ok(Self {
            id: next_graph_id(),
            vertex_props,
            edge_props,
            endpoints,
            out_edges,
            in_edges,
        })
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_props.len()
    }

    pub fn edge_count(&self) -> usize {
        self.endpoints.len()
    }

    pub fn vertex(&self, id: VertexId) -> Option<Vertex> {
        (id.0 < self.vertex_props.len()).then_some(Vertex { id })
    }

    pub fn vertices(&self) -> impl Iterator<Item = Vertex> + '_ {
        (0..self.vertex_props.len()).map(|id| Vertex { id: VertexId(id) })
    }

    pub fn edge(&self, id: EdgeId) -> Option<Edge> {
        let (source, target) = *self.endpoints.get(id.0)?;
        Some(Edge {
            id,
            source: Vertex { id: source },
            target: Vertex { id: target },
        })
    }

    /// First edge from `source` to `target` in edge-id order. With parallel
    /// edges the remaining ones are reachable through [`Graph::out_edges`].
    pub fn edge_between(&self, source: VertexId, target: VertexId) -> Option<Edge> {
        self.out_edges
            .get(source.0)?
            .iter()
            .map(|id| self.edge(*id).expect("adjacency lists hold valid edge ids"))
            .find(|edge| edge.target.id == target)
    }

    pub fn out_edges(&self, vertex: VertexId) -> Vec<Edge> {
        self.edge_list(self.out_edges.get(vertex.0))
    }

    pub fn in_edges(&self, vertex: VertexId) -> Vec<Edge> {
        self.edge_list(self.in_edges.get(vertex.0))
    }

    /// Targets of the vertex's out-edges, one entry per edge.
    pub fn adjacent_vertices(&self, vertex: VertexId) -> Vec<Vertex> {
        self.out_edges(vertex)
            .into_iter()
            .map(|edge| edge.target)
            .collect()
    }

    pub fn vertex_property(&self, vertex: VertexId) -> Option<&VP> {
        self.vertex_props.get(vertex.0)
    }

    pub fn vertex_property_mut(&mut self, vertex: VertexId) -> Option<&mut VP> {
        self.vertex_props.get_mut(vertex.0)
    }

    pub fn edge_property(&self, edge: EdgeId) -> Option<&EP> {
        self.edge_props.get(edge.0)
    }

    fn edge_list(&self, ids: Option<&Vec<EdgeId>>) -> Vec<Edge> {
        ids.map(|ids| {
            ids.iter()
                .map(|id| self.edge(*id).expect("adjacency lists hold valid edge ids"))
                .collect()
        })
        .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triangle() -> Graph {
        Graph::from_description(GraphDescription {
            vertices: vec![(VertexId(0), ()), (VertexId(1), ()), (VertexId(2), ())],
            edges: vec![
                ((VertexId(0), VertexId(1)), ()),
                ((VertexId(1), VertexId(2)), ()),
                ((VertexId(2), VertexId(0)), ()),
            ],
        })
        .expect("triangle should build")
    }

    #[test]
    fn dense_ids_and_adjacency() {
        let graph = triangle();
        assert_eq!(graph.vertex_count(), 3);
        assert_eq!(graph.edge_count(), 3);

        let out = graph.out_edges(VertexId(0));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, EdgeId(0));
        assert_eq!(out[0].target.id, VertexId(1));

        let into = graph.in_edges(VertexId(0));
        assert_eq!(into.len(), 1);
        assert_eq!(into[0].source.id, VertexId(2));

        assert_eq!(graph.adjacent_vertices(VertexId(1)), vec![Vertex { id: VertexId(2) }]);
    }

    #[test]
    fn edge_between_returns_first_match_for_parallel_edges() {
        let graph: Graph = Graph::from_description(GraphDescription {
            vertices: vec![(VertexId(0), ()), (VertexId(1), ())],
            edges: vec![
                ((VertexId(0), VertexId(1)), ()),
                ((VertexId(0), VertexId(1)), ()),
            ],
        })
        .expect("parallel edges should build");

        assert_eq!(graph.edge_count(), 2);
        let first = graph
            .edge_between(VertexId(0), VertexId(1))
            .expect("edge should exist");
        assert_eq!(first.id, EdgeId(0));
        // Both parallel edges stay addressable by id.
        assert_eq!(graph.out_edges(VertexId(0)).len(), 2);
    }

    #[test]
    fn vertex_ids_must_be_dense() {
        let result: Result<Graph, _> = Graph::from_description(GraphDescription {
            vertices: vec![(VertexId(0), ()), (VertexId(2), ())],
            edges: vec![],
        });
        assert!(matches!(result, Err(GraphError::InvalidVertexSet { .. })));
    }

    #[test]
    fn edges_must_reference_known_vertices() {
        let result: Result<Graph, _> = Graph::from_description(GraphDescription {
            vertices: vec![(VertexId(0), ())],
            edges: vec![((VertexId(0), VertexId(3)), ())],
        });
        assert!(matches!(result, Err(GraphError::DanglingEdge { .. })));
    }

    #[test]
    fn graph_ids_are_unique_per_process() {
        let a = triangle();
        let b = triangle();
        assert_ne!(a.id(), b.id());
    }
}
