//! The user-facing facade binding a graph, a transport and the directory.

use crate::directory::Directory;
use crate::serialize::{ByteCast, SerializationPolicy};
use crate::CageError;
use bytemuck::{Pod, Zeroable};
use gvon_comm::{CommError, Communicator, Context, Event};
use gvon_graph::mapping::Mapping;
use gvon_graph::pattern::Pattern;
use gvon_graph::{Edge, Graph, Vertex};
use gvon_types::{EdgeId, ReduceOp, Reducible, Tag, VAddr, VertexId};
use std::collections::BTreeSet;
use std::marker::PhantomData;

/// Communication cage: resolves operations expressed in graph coordinates
/// (vertices, edges) into transport operations (addresses, tags, contexts).
///
/// A cage becomes usable for communication after [`Cage::distribute`] has
/// run collectively on every peer of the global context.
pub struct Cage<C, VP = (), EP = (), S = ByteCast>
where
    C: Communicator,
    S: SerializationPolicy,
{
    comm: C,
    graph: Graph<VP, EP>,
    directory: Directory,
    hosted: Vec<Vertex>,
    _serialization: PhantomData<S>,
}

impl<C, VP, EP, S> Cage<C, VP, EP, S>
where
    C: Communicator,
    S: SerializationPolicy,
{
    /// Builds the cage's graph from a pattern.
    pub fn new(comm: C, pattern: &impl Pattern<VP, EP>) -> Result<Self, CageError> {
        let graph = Graph::from_description(pattern.description())?;
        Ok(Self::with_graph(comm, graph))
    }

    /// Wraps an already-built graph.
    pub fn with_graph(comm: C, graph: Graph<VP, EP>) -> Self {
        Self {
            comm,
            graph,
            directory: Directory::empty(),
            hosted: Vec::new(),
            _serialization: PhantomData,
        }
    }

    /// Replaces the graph. All directory state and hosted vertices of the
    /// previous graph are invalidated; `distribute` must run again.
    pub fn set_graph(&mut self, pattern: &impl Pattern<VP, EP>) -> Result<(), CageError> {
        self.graph = Graph::from_description(pattern.description())?;
        self.directory = Directory::empty();
        self.hosted.clear();
        Ok(())
    }

    /// The global context of all peers.
    pub fn peers(&self) -> Context {
        self.comm.global_context()
    }

    /// Vertices this peer hosts, in mapping order.
    pub fn hosted_vertices(&self) -> &[Vertex] {
        &self.hosted
    }

    pub fn graph(&self) -> &Graph<VP, EP> {
        &self.graph
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Applies the mapping locally and announces the result. Collective
    /// over the global context; acts as a barrier.
    pub fn distribute<M: Mapping<VP, EP>>(&mut self, mapping: &M) -> Result<(), CageError> {
        let ctx = self.comm.global_context();
        let local = mapping.select(ctx.vaddr(), ctx.size(), &self.graph);
        self.directory = Directory::announce(
            &self.comm,
            &ctx,
            self.graph.id(),
            self.graph.vertex_count(),
            &local,
        )?;
        self.hosted = local.into_iter().map(|id| Vertex { id }).collect();
        Ok(())
    }

    /// Builds the sub-context of the peers owning any of `subgraph`'s
    /// vertices and records it for graph-scope collectives. Collective
    /// over the parent graph's context; `None` on peers outside the set.
    ///
    /// The subgraph must share vertex ids with the already-distributed
    /// parent graph.
    pub fn announce_subgraph(
        &mut self,
        subgraph: &Graph<VP, EP>,
    ) -> Result<Option<Context>, CageError> {
        let parent_ctx = self.graph_context()?;
        let mut owners = BTreeSet::new();
        for vertex in subgraph.vertices() {
            owners.insert(self.owner_of(vertex.id)?);
        }
        let members: Vec<VAddr> = owners.into_iter().collect();
        let sub_ctx = self.comm.create_context(&members, &parent_ctx)?;
        if let Some(ctx) = &sub_ctx {
            self.directory.insert_context(subgraph.id(), ctx.clone());
        }
        Ok(sub_ctx)
    }

    // Graph accessors

    pub fn vertex(&self, id: VertexId) -> Result<Vertex, CageError> {
        self.graph.vertex(id).ok_or(CageError::UnknownVertex(id))
    }

    /// First edge between the endpoints; parallel edges stay reachable via
    /// [`Cage::out_edges`].
    pub fn edge_between(&self, source: VertexId, target: VertexId) -> Option<Edge> {
        self.graph.edge_between(source, target)
    }

    pub fn in_edges(&self, vertex: VertexId) -> Result<Vec<Edge>, CageError> {
        self.vertex(vertex)?;
        Ok(self.graph.in_edges(vertex))
    }

    pub fn out_edges(&self, vertex: VertexId) -> Result<Vec<Edge>, CageError> {
        self.vertex(vertex)?;
        Ok(self.graph.out_edges(vertex))
    }

    /// The edge running opposite to `edge`, if the pattern declared one.
    pub fn edge_inverse(&self, edge: Edge) -> Option<Edge> {
        self.graph.edge_between(edge.target.id, edge.source.id)
    }

    // Point-to-point communication

    /// Blocking send of `data` over `edge`.
    pub fn send<T: Pod>(&self, edge: Edge, data: &[T]) -> Result<(), CageError> {
        let edge = self.checked_edge(edge)?;
        let ctx = self.graph_context()?;
        let dst = self.owner_of(edge.target.id)?;
        self.comm
            .send(dst, Tag::from(edge.id), &ctx, &S::serialize(data))?;
        Ok(())
    }

    /// Blocking receive over `edge` into `buf`. The payload must fill
    /// `buf` exactly.
    pub fn recv<T: Pod>(&self, edge: Edge, buf: &mut [T]) -> Result<(), CageError> {
        let edge = self.checked_edge(edge)?;
        let ctx = self.graph_context()?;
        let src = self.owner_of(edge.source.id)?;
        let mut bytes = S::prepare(buf);
        let status = self.comm.recv(src, Tag::from(edge.id), &ctx, &mut bytes)?;
        if status.size != bytes.len() {
            return Err(CageError::SizeMismatch {
                expected: bytes.len(),
                actual: status.size,
            });
        }
        S::restore(buf, &bytes)
    }

    /// Non-blocking send; the payload is captured, so `data` is free to go.
    pub fn async_send<T: Pod>(&self, edge: Edge, data: &[T]) -> Result<Event, CageError> {
        let edge = self.checked_edge(edge)?;
        let ctx = self.graph_context()?;
        let dst = self.owner_of(edge.target.id)?;
        Ok(self
            .comm
            .async_send(dst, Tag::from(edge.id), &ctx, S::serialize(data))?)
    }

    /// Non-blocking receive of `len` elements over `edge`.
    pub fn async_recv<T: Pod>(&self, edge: Edge, len: usize) -> Result<Incoming<T, S>, CageError> {
        let edge = self.checked_edge(edge)?;
        let ctx = self.graph_context()?;
        let src = self.owner_of(edge.source.id)?;
        let expected = len * std::mem::size_of::<T>();
        let event = self
            .comm
            .async_recv(src, Tag::from(edge.id), &ctx, expected)?;
        Ok(Incoming {
            event,
            expected,
            _marker: PhantomData,
        })
    }

    /// Receives the next message arriving on any in-edge of any hosted
    /// vertex, returning the edge it arrived on.
    pub fn recv_any<T: Pod>(&self, buf: &mut [T]) -> Result<Edge, CageError> {
        let ctx = self.graph_context()?;
        let (status, bytes) = self.comm.recv_any(&ctx)?;
        let edge = self
            .graph
            .edge(EdgeId(status.tag.0 as usize))
            .ok_or(CageError::UnknownEdge(EdgeId(status.tag.0 as usize)))?;
        // There is exactly one candidate edge per (source peer, tag) pair;
        // check the tables agree with the transport.
        if self.owner_of(edge.source.id)? != status.source {
            return Err(CageError::Protocol(format!(
                "edge {} is not owned by announcing peer {}",
                edge.id, status.source
            )));
        }
        S::restore(buf, &bytes)?;
        Ok(edge)
    }

    /// Sends the same payload on every out-edge of `vertex`.
    pub fn spread<T: Pod>(&self, vertex: Vertex, data: &[T]) -> Result<(), CageError> {
        for edge in self.out_edges(vertex.id)? {
            self.send(edge, data)?;
        }
        Ok(())
    }

    /// Receives one payload per in-edge of `vertex` into `buf`, split into
    /// equal chunks in in-edge order.
    pub fn collect<T: Pod>(&self, vertex: Vertex, buf: &mut [T]) -> Result<(), CageError> {
        let edges = self.in_edges(vertex.id)?;
        if edges.is_empty() {
            return Ok(());
        }
        if buf.len() % edges.len() != 0 {
            return Err(CageError::SizeMismatch {
                expected: buf.len(),
                actual: edges.len(),
            });
        }
        let chunk = buf.len() / edges.len();
        for (index, edge) in edges.into_iter().enumerate() {
            self.recv(edge, &mut buf[index * chunk..(index + 1) * chunk])?;
        }
        Ok(())
    }

    // Collective communication over the graph's context

    pub fn barrier(&self) -> Result<(), CageError> {
        Ok(self.comm.barrier(&self.graph_context()?)?)
    }

    pub fn broadcast<T: Pod>(&self, root: Vertex, data: &mut [T]) -> Result<(), CageError> {
        let ctx = self.graph_context()?;
        let root = self.owner_of(root.id)?;
        Ok(self.comm.broadcast(root, &ctx, data)?)
    }

    pub fn gather<T: Pod>(
        &self,
        root: Vertex,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CageError> {
        let ctx = self.graph_context()?;
        let root = self.owner_of(root.id)?;
        Ok(self.comm.gather(root, &ctx, send, recv)?)
    }

    pub fn all_gather<T: Pod>(&self, send: &[T], recv: &mut [T]) -> Result<(), CageError> {
        Ok(self.comm.all_gather(&self.graph_context()?, send, recv)?)
    }

    pub fn scatter<T: Pod>(
        &self,
        root: Vertex,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CageError> {
        let ctx = self.graph_context()?;
        let root = self.owner_of(root.id)?;
        Ok(self.comm.scatter(root, &ctx, send, recv)?)
    }

    pub fn reduce<T: Pod + Reducible>(
        &self,
        root: Vertex,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CageError> {
        let ctx = self.graph_context()?;
        let root = self.owner_of(root.id)?;
        Ok(self.comm.reduce(root, &ctx, op, send, recv)?)
    }

    pub fn all_reduce<T: Pod + Reducible>(
        &self,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CageError> {
        Ok(self
            .comm
            .all_reduce(&self.graph_context()?, op, send, recv)?)
    }

    // Lowering helpers

    fn graph_context(&self) -> Result<Context, CageError> {
        self.directory
            .context_of(self.graph.id())
            .cloned()
            .ok_or_else(|| {
                CageError::Comm(CommError::InvalidContext(
                    "graph has not been distributed".into(),
                ))
            })
    }

    fn owner_of(&self, vertex: VertexId) -> Result<VAddr, CageError> {
        self.vertex(vertex)?;
        self.directory.vaddr_of(vertex).ok_or_else(|| {
            CageError::Protocol(format!("vertex {vertex} was not claimed by any peer"))
        })
    }

    /// Validates that the edge value belongs to this cage's graph.
    fn checked_edge(&self, edge: Edge) -> Result<Edge, CageError> {
        match self.graph.edge(edge.id) {
            Some(known) if known == edge => Ok(known),
            _ => Err(CageError::UnknownEdge(edge.id)),
        }
    }
}

/// A pending non-blocking receive of `len` elements of `T`.
pub struct Incoming<T, S = ByteCast>
where
    T: Pod,
    S: SerializationPolicy,
{
    event: Event,
    expected: usize,
    _marker: PhantomData<(T, S)>,
}

impl<T, S> Incoming<T, S>
where
    T: Pod,
    S: SerializationPolicy,
{
    /// Non-blocking completion probe.
    pub fn ready(&mut self) -> bool {
        self.event.ready()
    }

    /// Waits for the message and restores it into `buf`.
    pub fn wait_into(mut self, buf: &mut [T]) -> Result<(), CageError> {
        self.event.wait()?;
        let bytes = self
            .event
            .take_bytes()
            .ok_or_else(|| CageError::Protocol("receive completed without payload".into()))?;
        S::restore(buf, &bytes)
    }

    /// Waits for the message and returns it as a fresh vector.
    pub fn wait(mut self) -> Result<Vec<T>, CageError> {
        self.event.wait()?;
        let bytes = self
            .event
            .take_bytes()
            .ok_or_else(|| CageError::Protocol("receive completed without payload".into()))?;
        if bytes.len() != self.expected {
            return Err(CageError::SizeMismatch {
                expected: self.expected,
                actual: bytes.len(),
            });
        }
        let elem = std::mem::size_of::<T>();
        if elem == 0 {
            return Ok(Vec::new());
        }
        let mut data = vec![T::zeroed(); bytes.len() / elem];
        S::restore(&mut data, &bytes)?;
        Ok(data)
    }

    /// Source peer, available after completion.
    pub fn source(&self) -> Option<VAddr> {
        self.event.source()
    }

    /// Transport tag (the edge id), available after completion.
    pub fn tag(&self) -> Option<Tag> {
        self.event.tag()
    }
}
