//! Transport capability layer: the [`Communicator`] trait plus the two
//! backends implementing it with identical semantics, one over threads of a
//! single process ([`shm`]) and one over TCP sockets with an external
//! signaling service ([`socket`]).

pub mod shm;
pub mod socket;

mod collective;
mod error;
mod event;

pub use error::CommError;
pub use event::Event;

use bytemuck::Pod;
use gvon_types::{ContextId, ReduceOp, Reducible, Tag, VAddr};

/// An ordered set of peers that can communicate among themselves. Each
/// peer's copy carries its own address within the set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Context {
    pub(crate) id: ContextId,
    pub(crate) vaddr: VAddr,
    pub(crate) size: usize,
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// Address of the calling peer within this context.
    pub fn vaddr(&self) -> VAddr {
        self.vaddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn vaddrs(&self) -> impl Iterator<Item = VAddr> {
        (0..self.size as u32).map(VAddr)
    }
}

/// Completion information of a receive or probe: who sent, on which tag,
/// and how many payload bytes were delivered (or are waiting).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub source: VAddr,
    pub tag: Tag,
    pub size: usize,
}

/// The capability set every transport backend provides. Point-to-point
/// operations move raw bytes; collectives are typed and elementwise.
///
/// Matching is by (source, tag, context) with FIFO delivery per
/// (source, destination, tag, context) channel. Collectives act as barriers
/// among the members of their context. All blocking operations may suspend
/// indefinitely; `probe` never blocks.
pub trait Communicator {
    /// The context containing every peer of the job.
    fn global_context(&self) -> Context;

    /// Collective over `parent`: builds a sub-context of the listed members
    /// (ordered; addresses are parent-relative). Every member of `parent`
    /// must take part in the call. Peers outside `members` get `None`.
    fn create_context(
        &self,
        members: &[VAddr],
        parent: &Context,
    ) -> Result<Option<Context>, CommError>;

    /// Blocking point-to-point send.
    fn send(&self, dst: VAddr, tag: Tag, ctx: &Context, bytes: &[u8]) -> Result<(), CommError>;

    /// Blocking receive matching (src, tag, ctx). The message is copied
    /// into `buf`; a message longer than `buf` is a
    /// [`CommError::SizeMismatch`].
    fn recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        buf: &mut [u8],
    ) -> Result<Status, CommError>;

    /// Blocking receive of the next user message in arrival order,
    /// regardless of source and tag.
    fn recv_any(&self, ctx: &Context) -> Result<(Status, Vec<u8>), CommError>;

    /// Non-blocking send; the returned event completes once the payload is
    /// handed to the transport.
    fn async_send(
        &self,
        dst: VAddr,
        tag: Tag,
        ctx: &Context,
        bytes: Vec<u8>,
    ) -> Result<Event, CommError>;

    /// Non-blocking receive for a message of at most `len` bytes. The
    /// payload is available from the event after completion.
    fn async_recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        len: usize,
    ) -> Result<Event, CommError>;

    /// Non-consuming, non-blocking match query. `None` source or tag acts
    /// as a wildcard; the earliest arrival wins.
    fn probe(
        &self,
        src: Option<VAddr>,
        tag: Option<Tag>,
        ctx: &Context,
    ) -> Result<Option<Status>, CommError>;

    fn barrier(&self, ctx: &Context) -> Result<(), CommError>;

    /// Root's `data` is copied into every member's `data`.
    fn broadcast<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        data: &mut [T],
    ) -> Result<(), CommError>;

    /// Equal-sized contributions are concatenated in address order into
    /// `recv` at the root (`recv` elsewhere is untouched).
    fn gather<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError>;

    /// [`Communicator::gather`] delivering the concatenation to everyone.
    fn all_gather<T: Pod>(
        &self,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError>;

    /// The root's `send` is cut into `ctx.size()` equal chunks; member `i`
    /// receives chunk `i` in `recv`.
    fn scatter<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError>;

    /// Elementwise reduction of all contributions, delivered to the root.
    fn reduce<T: Pod + Reducible>(
        &self,
        root: VAddr,
        ctx: &Context,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError>;

    /// Elementwise reduction delivered to every member.
    fn all_reduce<T: Pod + Reducible>(
        &self,
        ctx: &Context,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError>;
}
