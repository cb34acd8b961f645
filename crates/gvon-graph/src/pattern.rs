//! Patterns are pure descriptions of communication topologies. Each one is
//! parameterized by integer sizes only and produces the same
//! [`GraphDescription`] on every peer.

use crate::graph::GraphDescription;
use gvon_types::VertexId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A pure callable producing a graph description.
pub trait Pattern<VP = (), EP = ()> {
    fn description(&self) -> GraphDescription<VP, EP>;
}

fn vertices<VP: Default>(count: usize) -> Vec<(VertexId, VP)> {
    (0..count).map(|id| (VertexId(id), VP::default())).collect()
}

fn edge<EP: Default>(source: usize, target: usize) -> ((VertexId, VertexId), EP) {
    ((VertexId(source), VertexId(target)), EP::default())
}

/// Zero vertices, zero edges.
#[derive(Clone, Copy, Debug, Default)]
pub struct Empty;

impl<VP, EP> Pattern<VP, EP> for Empty {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription::default()
    }
}

/// `vertex_count` vertices without any edges.
#[derive(Clone, Copy, Debug)]
pub struct EdgeLess {
    pub vertex_count: usize,
}

impl<VP: Default, EP> Pattern<VP, EP> for EdgeLess {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges: Vec::new(),
        }
    }
}

/// Vertices `0..n-1` with edges `i -> i+1`.
#[derive(Clone, Copy, Debug)]
pub struct Chain {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for Chain {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges: (1..self.vertex_count).map(|i| edge(i - 1, i)).collect(),
        }
    }
}

/// A chain closed by the edge `n-1 -> 0`.
#[derive(Clone, Copy, Debug)]
pub struct Ring {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for Ring {
    fn description(&self) -> GraphDescription<VP, EP> {
        let mut description: GraphDescription<VP, EP> = Chain {
            vertex_count: self.vertex_count,
        }
        .description();
        if self.vertex_count > 1 {
            description.edges.push(edge(self.vertex_count - 1, 0));
        }
        description
    }
}

/// Every ordered pair `(i, j)` with `i != j`.
#[derive(Clone, Copy, Debug)]
pub struct FullyConnected {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for FullyConnected {
    fn description(&self) -> GraphDescription<VP, EP> {
        let mut edges = Vec::new();
        for i in 0..self.vertex_count {
            for j in 0..self.vertex_count {
                if i != j {
                    edges.push(edge(i, j));
                }
            }
        }
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges,
        }
    }
}

/// `width * height` vertices in row-major order; every vertex is connected
/// to its 4-neighborhood with a separate directed edge per direction.
#[derive(Clone, Copy, Debug)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
}

impl Grid {
    fn neighbor_edges<EP: Default>(
        width: usize,
        height: usize,
        diagonals: bool,
    ) -> Vec<((VertexId, VertexId), EP)> {
        let mut offsets: Vec<(isize, isize)> = vec![(-1, 0), (1, 0), (0, -1), (0, 1)];
        if diagonals {
            offsets.extend([(-1, -1), (-1, 1), (1, -1), (1, 1)]);
        }

        let mut edges = Vec::new();
        for row in 0..height as isize {
            for column in 0..width as isize {
                for (dr, dc) in &offsets {
                    let (nr, nc) = (row + dr, column + dc);
                    if nr < 0 || nr >= height as isize || nc < 0 || nc >= width as isize {
                        continue;
                    }
                    edges.push(edge(
                        (row * width as isize + column) as usize,
                        (nr * width as isize + nc) as usize,
                    ));
                }
            }
        }
        edges
    }
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for Grid {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.width * self.height),
            edges: Self::neighbor_edges(self.width, self.height, false),
        }
    }
}

/// [`Grid`] extended by the 4 diagonal neighbors.
#[derive(Clone, Copy, Debug)]
pub struct GridDiagonal {
    pub width: usize,
    pub height: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for GridDiagonal {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.width * self.height),
            edges: Grid::neighbor_edges(self.width, self.height, true),
        }
    }
}

/// `2^dimension` vertices; `i` and `j` are connected in both directions
/// when their ids differ in exactly one bit.
#[derive(Clone, Copy, Debug)]
pub struct HyperCube {
    pub dimension: u32,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for HyperCube {
    fn description(&self) -> GraphDescription<VP, EP> {
        let vertex_count = 1usize << self.dimension;
        let mut edges = Vec::new();
        for i in 0..vertex_count {
            for j in 0..vertex_count {
                if (i ^ j).count_ones() == 1 {
                    edges.push(edge(i, j));
                }
            }
        }
        GraphDescription {
            vertices: vertices(vertex_count),
            edges,
        }
    }
}

/// Star with edges from every leaf towards hub vertex 0.
#[derive(Clone, Copy, Debug)]
pub struct InStar {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for InStar {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges: (1..self.vertex_count).map(|leaf| edge(leaf, 0)).collect(),
        }
    }
}

/// Star with edges from hub vertex 0 towards every leaf.
#[derive(Clone, Copy, Debug)]
pub struct OutStar {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for OutStar {
    fn description(&self) -> GraphDescription<VP, EP> {
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges: (1..self.vertex_count).map(|leaf| edge(0, leaf)).collect(),
        }
    }
}

/// Star with a leaf->hub and a hub->leaf edge per leaf. The leaf->hub edge
/// of a leaf precedes its hub->leaf edge in edge-id order.
#[derive(Clone, Copy, Debug)]
pub struct BiStar {
    pub vertex_count: usize,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for BiStar {
    fn description(&self) -> GraphDescription<VP, EP> {
        let mut edges = Vec::new();
        for leaf in 1..self.vertex_count {
            edges.push(edge(leaf, 0));
            edges.push(edge(0, leaf));
        }
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges,
        }
    }
}

/// The bidirectional star is the default star shape.
pub type Star = BiStar;

/// Each ordered pair `(i, j)`, `i != j`, is included with probability `p`.
/// The same seed yields the same graph on every peer.
#[derive(Clone, Copy, Debug)]
pub struct Random {
    pub vertex_count: usize,
    pub p: f64,
    pub seed: u64,
}

impl<VP: Default, EP: Default> Pattern<VP, EP> for Random {
    fn description(&self) -> GraphDescription<VP, EP> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut edges = Vec::new();
        for i in 0..self.vertex_count {
            for j in 0..self.vertex_count {
                if i != j && rng.gen::<f64>() < self.p {
                    edges.push(edge(i, j));
                }
            }
        }
        GraphDescription {
            vertices: vertices(self.vertex_count),
            edges,
        }
    }
}
