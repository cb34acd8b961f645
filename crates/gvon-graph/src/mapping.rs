//! Mappings assign graph vertices to physical peers. Every peer evaluates
//! the same mapping with the same arguments except its own address, so the
//! per-peer outputs form a disjoint cover of the vertex set.

use crate::graph::Graph;
use gvon_types::{VAddr, VertexId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A pure callable selecting the vertices the given peer will host.
pub trait Mapping<VP = (), EP = ()> {
    fn select(&self, peer: VAddr, peer_count: usize, graph: &Graph<VP, EP>) -> Vec<VertexId>;
}

/// Peer `p` hosts the contiguous slice `[p * ceil(V/P), (p+1) * ceil(V/P))`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Consecutive;

impl<VP, EP> Mapping<VP, EP> for Consecutive {
    fn select(&self, peer: VAddr, peer_count: usize, graph: &Graph<VP, EP>) -> Vec<VertexId> {
        let vertex_count = graph.vertex_count();
        if peer_count == 0 || vertex_count == 0 {
            return Vec::new();
        }
        let per_peer = vertex_count.div_ceil(peer_count);
        let first = (peer.0 as usize).saturating_mul(per_peer);
        let last = (first + per_peer).min(vertex_count);
        (first.min(vertex_count)..last).map(VertexId).collect()
    }
}

/// Peer `p` hosts `{p, p + P, p + 2P, ...}`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Roundrobin;

impl<VP, EP> Mapping<VP, EP> for Roundrobin {
    fn select(&self, peer: VAddr, peer_count: usize, graph: &Graph<VP, EP>) -> Vec<VertexId> {
        if peer_count == 0 {
            return Vec::new();
        }
        (peer.0 as usize..graph.vertex_count())
            .step_by(peer_count)
            .map(VertexId)
            .collect()
    }
}

/// Random distribution with a shared seed. Every peer walks the full vertex
/// set with the same generator, so seeds derived from time or pid must not
/// be used here.
#[derive(Clone, Copy, Debug)]
pub struct Random {
    pub seed: u64,
}

impl<VP, EP> Mapping<VP, EP> for Random {
    fn select(&self, peer: VAddr, peer_count: usize, graph: &Graph<VP, EP>) -> Vec<VertexId> {
        if peer_count == 0 {
            return Vec::new();
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        (0..graph.vertex_count())
            .filter(|_| rng.gen_range(0..peer_count) == peer.0 as usize)
            .map(VertexId)
            .collect()
    }
}

/// Hosts the vertices whose property satisfies the predicate on exactly one
/// peer: matching vertices are dealt round-robin over the peers.
#[derive(Clone, Copy, Debug)]
pub struct Filter<F> {
    pub predicate: F,
}

impl<VP, EP, F> Mapping<VP, EP> for Filter<F>
where
    F: Fn(VertexId, &VP) -> bool,
{
    fn select(&self, peer: VAddr, peer_count: usize, graph: &Graph<VP, EP>) -> Vec<VertexId> {
        if peer_count == 0 {
            return Vec::new();
        }
        (0..graph.vertex_count())
            .map(VertexId)
            .filter(|id| {
                let property = graph
                    .vertex_property(*id)
                    .expect("vertex ids are dense");
                (self.predicate)(*id, property)
            })
            .enumerate()
            .filter(|(index, _)| index % peer_count == peer.0 as usize)
            .map(|(_, id)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::pattern::{EdgeLess, Pattern};

    fn graph(vertex_count: usize) -> Graph {
        Graph::from_description(EdgeLess { vertex_count }.description())
            .expect("graph should build")
    }

    fn cover<M: Mapping>(mapping: &M, peer_count: usize, graph: &Graph) -> Vec<Vec<VertexId>> {
        (0..peer_count)
            .map(|peer| mapping.select(VAddr(peer as u32), peer_count, graph))
            .collect()
    }

    fn assert_disjoint_cover(parts: &[Vec<VertexId>], vertex_count: usize) {
        let mut seen = vec![false; vertex_count];
        for part in parts {
            for id in part {
                assert!(!seen[id.0], "vertex {id} hosted twice");
                seen[id.0] = true;
            }
        }
        assert!(seen.iter().all(|hosted| *hosted), "vertex left unhosted");
    }

    #[test]
    fn consecutive_slices() {
        let graph = graph(10);
        let parts = cover(&Consecutive, 4, &graph);
        assert_eq!(parts[0], vec![VertexId(0), VertexId(1), VertexId(2)]);
        assert_eq!(parts[3], vec![VertexId(9)]);
        assert_disjoint_cover(&parts, 10);
    }

    #[test]
    fn roundrobin_stride() {
        let graph = graph(10);
        let parts = cover(&Roundrobin, 4, &graph);
        assert_eq!(parts[1], vec![VertexId(1), VertexId(5), VertexId(9)]);
        assert_disjoint_cover(&parts, 10);
    }

    #[test]
    fn random_with_shared_seed_is_a_disjoint_cover() {
        let graph = graph(10);
        let parts = cover(&Random { seed: 1234 }, 4, &graph);
        assert_disjoint_cover(&parts, 10);

        let again = cover(&Random { seed: 1234 }, 4, &graph);
        assert_eq!(parts, again);
    }

    #[test]
    fn excess_peers_host_nothing() {
        let graph = graph(2);
        for mapping in [&Consecutive as &dyn Mapping, &Roundrobin] {
            let parts: Vec<Vec<VertexId>> = (0..5)
                .map(|peer| mapping.select(VAddr(peer), 5, &graph))
                .collect();
            assert_disjoint_cover(&parts, 2);
            assert!(parts[3].is_empty());
            assert!(parts[4].is_empty());
        }
    }

    #[test]
    fn filter_splits_matching_vertices() {
        let graph = graph(8);
        let even = Filter {
            predicate: |id: VertexId, _: &()| id.0 % 2 == 0,
        };
        let parts = cover(&even, 2, &graph);
        assert_eq!(parts[0], vec![VertexId(0), VertexId(4)]);
        assert_eq!(parts[1], vec![VertexId(2), VertexId(6)]);
    }
}
