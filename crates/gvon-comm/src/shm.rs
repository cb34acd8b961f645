//! In-process transport backend. Peers are threads of one process sharing
//! a fabric; it plays the role of a synchronous SPMD runtime, with
//! [`spawn`] standing in for the external launcher.

use crate::collective::{bytes_into_slice, fold_parts};
use crate::event::{Completion, DeferredOp, EventResult};
use crate::{CommError, Communicator, Context, Event, Status};
use bytemuck::Pod;
use gvon_types::{ContextId, ReduceOp, Reducible, Tag, VAddr};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const GLOBAL_CONTEXT_ID: ContextId = ContextId(0);

struct Envelope {
    src: VAddr,
    tag: Tag,
    bytes: Vec<u8>,
}

struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    cond: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, envelope: Envelope) {
        self.queue.lock().push_back(envelope);
        self.cond.notify_all();
    }

    fn pop_match(&self, src: VAddr, tag: Tag) -> Envelope {
        let mut queue = self.queue.lock();
        loop {
            let position = queue
                .iter()
                .position(|envelope| envelope.src == src && envelope.tag == tag);
            if let Some(position) = position {
                return queue
                    .remove(position)
                    .expect("matched position is in bounds");
            }
            self.cond.wait(&mut queue);
        }
    }

    fn try_pop_match(&self, src: VAddr, tag: Tag) -> Option<Envelope> {
        let mut queue = self.queue.lock();
        let position = queue
            .iter()
            .position(|envelope| envelope.src == src && envelope.tag == tag)?;
        queue.remove(position)
    }

    fn pop_any_user(&self) -> Envelope {
        let mut queue = self.queue.lock();
        loop {
            let position = queue.iter().position(|envelope| envelope.tag.is_user());
            if let Some(position) = position {
                return queue
                    .remove(position)
                    .expect("matched position is in bounds");
            }
            self.cond.wait(&mut queue);
        }
    }

    fn probe(&self, src: Option<VAddr>, tag: Option<Tag>) -> Option<Status> {
        let queue = self.queue.lock();
        queue
            .iter()
            .find(|envelope| {
                src.map_or(envelope.tag.is_user(), |src| envelope.src == src)
                    && tag.map_or(envelope.tag.is_user(), |tag| envelope.tag == tag)
            })
            .map(|envelope| Status {
                source: envelope.src,
                tag: envelope.tag,
                size: envelope.bytes.len(),
            })
    }
}

/// One all-to-all exchange slot per context; the backing primitive for the
/// collectives. Reusable across rounds via a generation counter.
struct ExchangeCell {
    state: Mutex<ExchangeState>,
    cond: Condvar,
}

struct ExchangeState {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
}

impl ExchangeCell {
    fn new(size: usize) -> Self {
        Self {
            state: Mutex::new(ExchangeState {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
            }),
            cond: Condvar::new(),
        }
    }

    /// Contributes `bytes` at `vaddr` and returns every member's
    /// contribution once the whole context has arrived.
    fn exchange(&self, vaddr: VAddr, bytes: Vec<u8>) -> Arc<Vec<Vec<u8>>> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.slots[vaddr.0 as usize] = Some(bytes);
        state.arrived += 1;
        if state.arrived == state.slots.len() {
            let gathered: Vec<Vec<u8>> = state
                .slots
                .iter_mut()
                .map(|slot| slot.take().unwrap_or_default())
                .collect();
            state.published = Arc::new(gathered);
            state.arrived = 0;
            state.generation += 1;
            self.cond.notify_all();
        } else {
            while state.generation == generation {
                self.cond.wait(&mut state);
            }
        }
        state.published.clone()
    }
}

struct ShmContext {
    size: usize,
    mailboxes: Vec<Mailbox>,
    exchange: ExchangeCell,
}

impl ShmContext {
    fn new(size: usize) -> Self {
        Self {
            size,
            mailboxes: (0..size).map(|_| Mailbox::new()).collect(),
            exchange: ExchangeCell::new(size),
        }
    }
}

/// Shared state of all peers of one in-process job.
pub struct ShmFabric {
    contexts: Mutex<HashMap<ContextId, Arc<ShmContext>>>,
    next_context_id: AtomicU64,
}

impl ShmFabric {
    /// Builds the fabric of a `peer_count`-wide job and hands out one
    /// communicator per peer.
    pub fn new(peer_count: usize) -> Vec<ShmCommunicator> {
        let mut contexts = HashMap::new();
        contexts.insert(GLOBAL_CONTEXT_ID, Arc::new(ShmContext::new(peer_count)));
        let fabric = Arc::new(ShmFabric {
            contexts: Mutex::new(contexts),
            next_context_id: AtomicU64::new(1),
        });
        (0..peer_count)
            .map(|peer| ShmCommunicator {
                fabric: fabric.clone(),
                global: Context {
                    id: GLOBAL_CONTEXT_ID,
                    vaddr: VAddr(peer as u32),
                    size: peer_count,
                },
            })
            .collect()
    }
}

/// Runs `body` once per peer, each on its own thread, and collects the
/// per-peer results in address order. Panics of peer threads propagate.
pub fn spawn<F, R>(peer_count: usize, body: F) -> Vec<R>
where
    F: Fn(ShmCommunicator) -> R + Send + Sync,
    R: Send,
{
    let communicators = ShmFabric::new(peer_count);
    std::thread::scope(|scope| {
        let handles: Vec<_> = communicators
            .into_iter()
            .map(|communicator| {
                let body = &body;
                scope.spawn(move || body(communicator))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

/// One peer's endpoint of an in-process job.
pub struct ShmCommunicator {
    fabric: Arc<ShmFabric>,
    global: Context,
}

impl ShmCommunicator {
    fn state(&self, ctx: &Context) -> Result<Arc<ShmContext>, CommError> {
        self.fabric
            .contexts
            .lock()
            .get(&ctx.id)
            .cloned()
            .ok_or_else(|| CommError::InvalidContext(format!("unknown context {}", ctx.id)))
    }

    fn checked_state(&self, ctx: &Context, peer: VAddr) -> Result<Arc<ShmContext>, CommError> {
        let state = self.state(ctx)?;
        if peer.0 as usize >= state.size {
            return Err(CommError::InvalidContext(format!(
                "address {peer} outside context {} of size {}",
                ctx.id, state.size
            )));
        }
        Ok(state)
    }

    fn deliver(envelope: Envelope, buf: &mut [u8]) -> Result<Status, CommError> {
        if envelope.bytes.len() > buf.len() {
            return Err(CommError::SizeMismatch {
                expected: buf.len(),
                actual: envelope.bytes.len(),
            });
        }
        buf[..envelope.bytes.len()].copy_from_slice(&envelope.bytes);
        Ok(Status {
            source: envelope.src,
            tag: envelope.tag,
            size: envelope.bytes.len(),
        })
    }

    fn exchange<T: Pod>(&self, ctx: &Context, send: &[T]) -> Result<Arc<Vec<Vec<u8>>>, CommError> {
        let state = self.state(ctx)?;
        Ok(state
            .exchange
            .exchange(ctx.vaddr, bytemuck::cast_slice::<T, u8>(send).to_vec()))
    }
}

impl Communicator for ShmCommunicator {
    fn global_context(&self) -> Context {
        self.global.clone()
    }

    fn create_context(
        &self,
        members: &[VAddr],
        parent: &Context,
    ) -> Result<Option<Context>, CommError> {
        let parent_state = self.state(parent)?;
        for member in members {
            if member.0 as usize >= parent_state.size {
                return Err(CommError::InvalidContext(format!(
                    "address {member} outside parent context of size {}",
                    parent_state.size
                )));
            }
        }

        // The parent's first peer allocates the id and registers the
        // sub-context; the exchange publishes the id to everyone.
        let contribution = if parent.vaddr == VAddr(0) && !members.is_empty() {
            let id = ContextId(self.fabric.next_context_id.fetch_add(1, Ordering::Relaxed));
            self.fabric
                .contexts
                .lock()
                .insert(id, Arc::new(ShmContext::new(members.len())));
            id.0.to_be_bytes().to_vec()
        } else {
            Vec::new()
        };
        let published = parent_state.exchange.exchange(parent.vaddr, contribution);

        let position = members.iter().position(|member| *member == parent.vaddr);
        let Some(position) = position else {
            return Ok(None);
        };
        let id_bytes = published
            .first()
            .filter(|bytes| bytes.len() == 8)
            .ok_or_else(|| {
                CommError::Protocol("sub-context id missing from exchange".into())
            })?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(id_bytes);
        Ok(Some(Context {
            id: ContextId(u64::from_be_bytes(raw)),
            vaddr: VAddr(position as u32),
            size: members.len(),
        }))
    }

    fn send(&self, dst: VAddr, tag: Tag, ctx: &Context, bytes: &[u8]) -> Result<(), CommError> {
        let state = self.checked_state(ctx, dst)?;
        state.mailboxes[dst.0 as usize].push(Envelope {
            src: ctx.vaddr,
            tag,
            bytes: bytes.to_vec(),
        });
        Ok(())
    }

    fn recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        buf: &mut [u8],
    ) -> Result<Status, CommError> {
        let state = self.checked_state(ctx, src)?;
        let envelope = state.mailboxes[ctx.vaddr.0 as usize].pop_match(src, tag);
        Self::deliver(envelope, buf)
    }

    fn recv_any(&self, ctx: &Context) -> Result<(Status, Vec<u8>), CommError> {
        let state = self.state(ctx)?;
        let envelope = state.mailboxes[ctx.vaddr.0 as usize].pop_any_user();
        let status = Status {
            source: envelope.src,
            tag: envelope.tag,
            size: envelope.bytes.len(),
        };
        Ok((status, envelope.bytes))
    }

    fn async_send(
        &self,
        dst: VAddr,
        tag: Tag,
        ctx: &Context,
        bytes: Vec<u8>,
    ) -> Result<Event, CommError> {
        let size = bytes.len();
        self.send(dst, tag, ctx, &bytes)?;
        Ok(Event::immediate(
            Status {
                source: ctx.vaddr,
                tag,
                size,
            },
            None,
        ))
    }

    fn async_recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        len: usize,
    ) -> Result<Event, CommError> {
        let state = self.checked_state(ctx, src)?;
        Ok(Event::deferred(Box::new(ShmRecvOp {
            state,
            own: ctx.vaddr,
            src,
            tag,
            len,
        })))
    }

    fn probe(
        &self,
        src: Option<VAddr>,
        tag: Option<Tag>,
        ctx: &Context,
    ) -> Result<Option<Status>, CommError> {
        let state = self.state(ctx)?;
        Ok(state.mailboxes[ctx.vaddr.0 as usize].probe(src, tag))
    }

    fn barrier(&self, ctx: &Context) -> Result<(), CommError> {
        self.exchange::<u8>(ctx, &[])?;
        Ok(())
    }

    fn broadcast<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        data: &mut [T],
    ) -> Result<(), CommError> {
        let contribution: &[T] = if ctx.vaddr == root { data } else { &[] };
        let parts = self.exchange(ctx, contribution)?;
        if ctx.vaddr != root {
            bytes_into_slice(data, &parts[root.0 as usize])?;
        }
        Ok(())
    }

    fn gather<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let parts = self.exchange(ctx, send)?;
        if ctx.vaddr == root {
            let all: Vec<u8> = parts.iter().flatten().copied().collect();
            bytes_into_slice(recv, &all)?;
        }
        Ok(())
    }

    fn all_gather<T: Pod>(
        &self,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let parts = self.exchange(ctx, send)?;
        let all: Vec<u8> = parts.iter().flatten().copied().collect();
        bytes_into_slice(recv, &all)
    }

    fn scatter<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let chunk = std::mem::size_of_val(recv);
        let contribution: &[T] = if ctx.vaddr == root { send } else { &[] };
        if ctx.vaddr == root && std::mem::size_of_val(send) != chunk * ctx.size {
            return Err(CommError::SizeMismatch {
                expected: chunk * ctx.size,
                actual: std::mem::size_of_val(send),
            });
        }
        let parts = self.exchange(ctx, contribution)?;
        let offset = ctx.vaddr.0 as usize * chunk;
        let full = &parts[root.0 as usize];
        if full.len() < offset + chunk {
            return Err(CommError::SizeMismatch {
                expected: offset + chunk,
                actual: full.len(),
            });
        }
        bytes_into_slice(recv, &full[offset..offset + chunk])
    }

    fn reduce<T: Pod + Reducible>(
        &self,
        root: VAddr,
        ctx: &Context,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let parts = self.exchange(ctx, send)?;
        if ctx.vaddr == root {
            let folded: Vec<T> = fold_parts(&parts, op)?;
            bytes_into_slice(recv, bytemuck::cast_slice(&folded))?;
        }
        Ok(())
    }

    fn all_reduce<T: Pod + Reducible>(
        &self,
        ctx: &Context,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let parts = self.exchange(ctx, send)?;
        let folded: Vec<T> = fold_parts(&parts, op)?;
        bytes_into_slice(recv, bytemuck::cast_slice(&folded))
    }
}

struct ShmRecvOp {
    state: Arc<ShmContext>,
    own: VAddr,
    src: VAddr,
    tag: Tag,
    len: usize,
}

impl ShmRecvOp {
    fn completion(&self, envelope: Envelope) -> EventResult {
        if envelope.bytes.len() > self.len {
            return Err(CommError::SizeMismatch {
                expected: self.len,
                actual: envelope.bytes.len(),
            });
        }
        Ok(Completion {
            status: Status {
                source: envelope.src,
                tag: envelope.tag,
                size: envelope.bytes.len(),
            },
            bytes: Some(envelope.bytes),
        })
    }
}

impl DeferredOp for ShmRecvOp {
    fn try_complete(&mut self) -> Result<Option<Completion>, CommError> {
        match self.state.mailboxes[self.own.0 as usize].try_pop_match(self.src, self.tag) {
            Some(envelope) => self.completion(envelope).map(Some),
            None => Ok(None),
        }
    }

    fn complete(&mut self) -> EventResult {
        let envelope = self.state.mailboxes[self.own.0 as usize].pop_match(self.src, self.tag);
        self.completion(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_per_channel() {
        let results = spawn(2, |comm| {
            let ctx = comm.global_context();
            if ctx.vaddr() == VAddr(0) {
                for value in 0u8..4 {
                    comm.send(VAddr(1), Tag(7), &ctx, &[value])
                        .expect("send should succeed");
                }
                Vec::new()
            } else {
                let mut seen = Vec::new();
                for _ in 0..4 {
                    let mut buf = [0u8; 1];
                    comm.recv(VAddr(0), Tag(7), &ctx, &mut buf)
                        .expect("recv should succeed");
                    seen.push(buf[0]);
                }
                seen
            }
        });
        assert_eq!(results[1], vec![0, 1, 2, 3]);
    }

    #[test]
    fn matching_is_by_source_and_tag() {
        let results = spawn(3, |comm| {
            let ctx = comm.global_context();
            match ctx.vaddr() {
                VAddr(0) => {
                    comm.send(VAddr(2), Tag(1), &ctx, b"a").expect("send");
                    0
                }
                VAddr(1) => {
                    comm.send(VAddr(2), Tag(2), &ctx, b"b").expect("send");
                    0
                }
                _ => {
                    // Receive in the opposite order of the tags' arrival.
                    let mut buf = [0u8; 1];
                    let status = comm
                        .recv(VAddr(1), Tag(2), &ctx, &mut buf)
                        .expect("recv tag 2");
                    assert_eq!(status.source, VAddr(1));
                    assert_eq!(buf[0], b'b');
                    comm.recv(VAddr(0), Tag(1), &ctx, &mut buf)
                        .expect("recv tag 1");
                    assert_eq!(buf[0], b'a');
                    1
                }
            }
        });
        assert_eq!(results[2], 1);
    }

    #[test]
    fn probe_does_not_consume() {
        let results = spawn(2, |comm| {
            let ctx = comm.global_context();
            if ctx.vaddr() == VAddr(0) {
                comm.send(VAddr(1), Tag(3), &ctx, b"xyz").expect("send");
                true
            } else {
                loop {
                    if let Some(status) = comm
                        .probe(None, None, &ctx)
                        .expect("probe should succeed")
                    {
                        assert_eq!(status.source, VAddr(0));
                        assert_eq!(status.tag, Tag(3));
                        assert_eq!(status.size, 3);
                        break;
                    }
                    std::thread::yield_now();
                }
                let mut buf = [0u8; 3];
                comm.recv(VAddr(0), Tag(3), &ctx, &mut buf).expect("recv");
                buf == *b"xyz"
            }
        });
        assert!(results[1]);
    }

    #[test]
    fn oversize_message_is_a_size_mismatch() {
        spawn(2, |comm| {
            let ctx = comm.global_context();
            if ctx.vaddr() == VAddr(0) {
                comm.send(VAddr(1), Tag(0), &ctx, &[0u8; 16]).expect("send");
            } else {
                let mut buf = [0u8; 4];
                let err = comm
                    .recv(VAddr(0), Tag(0), &ctx, &mut buf)
                    .expect_err("oversize message should fail");
                assert!(matches!(
                    err,
                    CommError::SizeMismatch {
                        expected: 4,
                        actual: 16
                    }
                ));
            }
        });
    }

    #[test]
    fn collectives_agree_across_peers() {
        let results = spawn(4, |comm| {
            let ctx = comm.global_context();
            let mine = [ctx.vaddr().0 as u64 + 1];

            let mut max = [0u64];
            comm.all_reduce(&ctx, ReduceOp::Max, &mine, &mut max)
                .expect("all_reduce");

            let mut sum = [0u64];
            comm.all_reduce(&ctx, ReduceOp::Sum, &mine, &mut sum)
                .expect("all_reduce");

            let mut gathered = [0u64; 4];
            comm.all_gather(&ctx, &mine, &mut gathered)
                .expect("all_gather");

            let mut broadcast = [0u64];
            if ctx.vaddr() == VAddr(2) {
                broadcast = [77];
            }
            comm.broadcast(VAddr(2), &ctx, &mut broadcast)
                .expect("broadcast");

            let mut chunk = [0u64];
            let scattered: [u64; 4] = [10, 11, 12, 13];
            comm.scatter(VAddr(0), &ctx, &scattered, &mut chunk)
                .expect("scatter");

            comm.barrier(&ctx).expect("barrier");
            (max[0], sum[0], gathered, broadcast[0], chunk[0])
        });
        for (peer, (max, sum, gathered, broadcast, chunk)) in results.iter().enumerate() {
            assert_eq!(*max, 4);
            assert_eq!(*sum, 10);
            assert_eq!(*gathered, [1, 2, 3, 4]);
            assert_eq!(*broadcast, 77);
            assert_eq!(*chunk, 10 + peer as u64);
        }
    }

    #[test]
    fn rooted_reduce_and_gather() {
        let results = spawn(3, |comm| {
            let ctx = comm.global_context();
            let mine = [(ctx.vaddr().0 as u32 + 1) * 2];

            let mut product = [0u32];
            comm.reduce(VAddr(1), &ctx, ReduceOp::Prod, &mine, &mut product)
                .expect("reduce");

            let mut gathered = [0u32; 3];
            comm.gather(VAddr(1), &ctx, &mine, &mut gathered)
                .expect("gather");
            (product[0], gathered)
        });
        assert_eq!(results[1], (48, [2, 4, 6]));
        // Non-root buffers stay untouched.
        assert_eq!(results[0], (0, [0, 0, 0]));
    }

    #[test]
    fn sub_context_isolates_traffic() {
        let results = spawn(4, |comm| {
            let ctx = comm.global_context();
            let sub = comm
                .create_context(&[VAddr(1), VAddr(3)], &ctx)
                .expect("create_context");
            match (ctx.vaddr(), sub) {
                (VAddr(1), Some(sub)) => {
                    assert_eq!(sub.vaddr(), VAddr(0));
                    assert_eq!(sub.size(), 2);
                    comm.send(VAddr(1), Tag(0), &sub, b"sub").expect("send");
                    let mut total = [0u32];
                    comm.all_reduce(&sub, ReduceOp::Sum, &[1u32], &mut total)
                        .expect("all_reduce");
                    total[0]
                }
                (VAddr(3), Some(sub)) => {
                    assert_eq!(sub.vaddr(), VAddr(1));
                    let mut buf = [0u8; 3];
                    let status = comm.recv(VAddr(0), Tag(0), &sub, &mut buf).expect("recv");
                    assert_eq!(status.source, VAddr(0));
                    assert_eq!(&buf, b"sub");
                    let mut total = [0u32];
                    comm.all_reduce(&sub, ReduceOp::Sum, &[1u32], &mut total)
                        .expect("all_reduce");
                    total[0]
                }
                (_, None) => 0,
                (vaddr, Some(_)) => panic!("peer {vaddr} should not be a member"),
            }
        });
        assert_eq!(results, vec![0, 2, 0, 2]);
    }

    #[test]
    fn async_send_and_recv_events() {
        spawn(2, |comm| {
            let ctx = comm.global_context();
            if ctx.vaddr() == VAddr(0) {
                let mut event = comm
                    .async_send(VAddr(1), Tag(9), &ctx, vec![1, 2, 3, 4])
                    .expect("async_send");
                event.wait().expect("send event should complete");
            } else {
                let mut event = comm
                    .async_recv(VAddr(0), Tag(9), &ctx, 4)
                    .expect("async_recv");
                let status = event.wait().expect("recv event should complete");
                assert_eq!(status.source, VAddr(0));
                assert_eq!(status.tag, Tag(9));
                assert_eq!(event.take_bytes(), Some(vec![1, 2, 3, 4]));
            }
        });
    }

    #[test]
    fn wildcard_recv_follows_arrival_order() {
        spawn(2, |comm| {
            let ctx = comm.global_context();
            if ctx.vaddr() == VAddr(0) {
                comm.send(VAddr(1), Tag(5), &ctx, b"first").expect("send");
                comm.send(VAddr(1), Tag(6), &ctx, b"second").expect("send");
            } else {
                let (status, bytes) = comm.recv_any(&ctx).expect("recv_any");
                assert_eq!(status.tag, Tag(5));
                assert_eq!(bytes, b"first");
                let (status, bytes) = comm.recv_any(&ctx).expect("recv_any");
                assert_eq!(status.tag, Tag(6));
                assert_eq!(bytes, b"second");
            }
        });
    }
}
