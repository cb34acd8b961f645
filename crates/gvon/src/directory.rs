//! The name service of the overlay: turns each peer's locally computed
//! vertex set into routing tables that are identical on every peer.

use crate::CageError;
use gvon_comm::{Communicator, Context};
use gvon_types::{GraphId, ReduceOp, VAddr, VertexId};
use std::collections::HashMap;

const NO_VERTEX: i64 = -1;

/// Global vertex-to-peer tables plus the context associated with each
/// announced graph. Immutable once the announce completed.
pub struct Directory {
    owners: Vec<Option<VAddr>>,
    hosted: Vec<Vec<VertexId>>,
    contexts: HashMap<GraphId, Context>,
}

impl Directory {
    pub(crate) fn empty() -> Self {
        Self {
            owners: Vec::new(),
            hosted: Vec::new(),
            contexts: HashMap::new(),
        }
    }

    /// Collective announce over `ctx`. Every peer contributes its local
    /// vertex list; afterwards all peers hold the same tables.
    ///
    /// One max-reduction determines the round count; each round is one
    /// fixed-length all-gather in which a peer contributes its next vertex
    /// id or a sentinel. Fixed-length primitives are all a transport has to
    /// offer, and uneven mapping sizes pad out naturally.
    pub(crate) fn announce<C: Communicator>(
        comm: &C,
        ctx: &Context,
        graph_id: GraphId,
        vertex_count: usize,
        local: &[VertexId],
    ) -> Result<Self, CageError> {
        let mine = [local.len() as i64];
        let mut rounds = [0i64];
        comm.all_reduce(ctx, ReduceOp::Max, &mine, &mut rounds)?;

        let mut owners: Vec<Option<VAddr>> = vec![None; vertex_count];
        let mut hosted: Vec<Vec<VertexId>> = vec![Vec::new(); ctx.size()];

        for round in 0..rounds[0] as usize {
            let contribution = [local
                .get(round)
                .map(|vertex| vertex.0 as i64)
                .unwrap_or(NO_VERTEX)];
            let mut gathered = vec![0i64; ctx.size()];
            comm.all_gather(ctx, &contribution, &mut gathered)?;

            for (peer, claim) in gathered.iter().enumerate() {
                if *claim == NO_VERTEX {
                    continue;
                }
                let peer = VAddr(peer as u32);
                if *claim < 0 || *claim as usize >= vertex_count {
                    return Err(CageError::Protocol(format!(
                        "peer {peer} announced vertex {claim} outside [0, {vertex_count})"
                    )));
                }
                let vertex = VertexId(*claim as usize);
                if let Some(owner) = owners[vertex.0] {
                    return Err(CageError::Protocol(format!(
                        "vertex {vertex} claimed by both peer {owner} and peer {peer}"
                    )));
                }
                owners[vertex.0] = Some(peer);
                hosted[peer.0 as usize].push(vertex);
            }
        }

        let mut contexts = HashMap::new();
        contexts.insert(graph_id, ctx.clone());
        Ok(Self {
            owners,
            hosted,
            contexts,
        })
    }

    /// Owning peer of a vertex. `None` for vertices no mapping claimed.
    pub fn vaddr_of(&self, vertex: VertexId) -> Option<VAddr> {
        self.owners.get(vertex.0).copied().flatten()
    }

    /// Vertices hosted by a peer, in announce order.
    pub fn vertices_of(&self, peer: VAddr) -> &[VertexId] {
        self.hosted
            .get(peer.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Context a graph communicates on.
    pub fn context_of(&self, graph: GraphId) -> Option<&Context> {
        self.contexts.get(&graph)
    }

    pub(crate) fn insert_context(&mut self, graph: GraphId, ctx: Context) {
        self.contexts.insert(graph, ctx);
    }
}
