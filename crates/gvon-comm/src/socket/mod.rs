//! Socket transport backend. Peers discover one another through an
//! external signaling service, then exchange length-prefixed frames over
//! direct TCP connections, one dialed connection per ordered peer pair so
//! every (source, destination, tag, context) channel stays FIFO.

mod signaling;

use crate::collective::{
    self, all_gather_bytes, broadcast_bytes, bytes_into_slice, fold_parts, gather_parts,
    scatter_bytes, PointToPoint, COLLECTIVE_TAG,
};
use crate::event::{Completion, SharedEvent};
use crate::{CommError, Communicator, Context, Event, Status};
use bytemuck::Pod;
use gvon_types::{ContextId, ReduceOp, Reducible, Tag, VAddr};
use gvon_wire::{decode_frame, encode_frame, Header, MsgType};
use parking_lot::{Condvar, Mutex};
use signaling::SignalingClient;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Options of the socket transport. `master_uri`, `peer_uri` and
/// `context_size` are required; the rest defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address of the signaling service.
    pub master_uri: String,
    /// Address this peer listens on. A zero port is replaced by the bound
    /// port before the URI is published.
    pub peer_uri: String,
    /// Number of peers forming the global context.
    pub context_size: usize,
    /// Name the global context registers under at the signaling service.
    pub context_name: String,
    /// Upper bound on a single message payload.
    pub max_buffer_size: usize,
    /// Worker threads servicing asynchronous operations. Zero runs them on
    /// the caller's thread.
    pub io_threads: usize,
}

impl Config {
    pub fn new(
        master_uri: impl Into<String>,
        peer_uri: impl Into<String>,
        context_size: usize,
    ) -> Self {
        Self {
            master_uri: master_uri.into(),
            peer_uri: peer_uri.into(),
            context_size,
            context_name: "context".into(),
            max_buffer_size: 100_000_000,
            io_threads: 1,
        }
    }

    fn validate(&self) -> Result<(), CommError> {
        if self.master_uri.is_empty() {
            return Err(CommError::Configuration("master_uri is required".into()));
        }
        if self.peer_uri.is_empty() {
            return Err(CommError::Configuration("peer_uri is required".into()));
        }
        if self.context_size == 0 {
            return Err(CommError::Configuration(
                "context_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

type InboxKey = (ContextId, VAddr, Tag);

#[derive(Default)]
struct InboxState {
    queues: HashMap<InboxKey, VecDeque<Vec<u8>>>,
    arrivals: VecDeque<InboxKey>,
}

/// Received messages awaiting a matching receive, in arrival order.
struct Inbox {
    state: Mutex<InboxState>,
    cond: Condvar,
}

impl Inbox {
    fn new() -> Self {
        Self {
            state: Mutex::new(InboxState::default()),
            cond: Condvar::new(),
        }
    }

    fn push(&self, context: ContextId, src: VAddr, tag: Tag, bytes: Vec<u8>) {
        let key = (context, src, tag);
        let mut state = self.state.lock();
        state.queues.entry(key).or_default().push_back(bytes);
        state.arrivals.push_back(key);
        self.cond.notify_all();
    }

    fn pop_match(&self, context: ContextId, src: VAddr, tag: Tag) -> Vec<u8> {
        let key = (context, src, tag);
        let mut state = self.state.lock();
        loop {
            let bytes = state
                .queues
                .get_mut(&key)
                .and_then(|queue| queue.pop_front());
            if let Some(bytes) = bytes {
                let arrival = state
                    .arrivals
                    .iter()
                    .position(|entry| *entry == key)
                    .expect("queued message has an arrival entry");
                state.arrivals.remove(arrival);
                return bytes;
            }
            self.cond.wait(&mut state);
        }
    }

    fn pop_any_user(&self, context: ContextId) -> (VAddr, Tag, Vec<u8>) {
        let mut state = self.state.lock();
        loop {
            let position = state
                .arrivals
                .iter()
                .position(|(ctx, _, tag)| *ctx == context && tag.is_user());
            if let Some(position) = position {
                let key = state
                    .arrivals
                    .remove(position)
                    .expect("matched position is in bounds");
                let bytes = state
                    .queues
                    .get_mut(&key)
                    .and_then(|queue| queue.pop_front())
                    .expect("arrival entry implies a queued message");
                return (key.1, key.2, bytes);
            }
            self.cond.wait(&mut state);
        }
    }

    fn probe(&self, context: ContextId, src: Option<VAddr>, tag: Option<Tag>) -> Option<Status> {
        let state = self.state.lock();
        let key = state.arrivals.iter().find(|(ctx, from, arrived_tag)| {
            *ctx == context
                && src.map_or(arrived_tag.is_user(), |src| *from == src)
                && tag.map_or(arrived_tag.is_user(), |tag| *arrived_tag == tag)
        })?;
        let size = state
            .queues
            .get(key)
            .and_then(|queue| queue.front())
            .map(|bytes| bytes.len())?;
        Some(Status {
            source: key.1,
            tag: key.2,
            size,
        })
    }
}

struct Shared {
    inbox: Inbox,
    max_buffer_size: usize,
}

struct ContextEntry {
    name: String,
    /// Context-local address to global address.
    members: Vec<VAddr>,
    /// Per-parent counter deriving agreed sub-context names.
    child_seq: u64,
}

/// One peer's endpoint of a socket job.
pub struct SocketCommunicator {
    config: Config,
    shared: Arc<Shared>,
    runtime: tokio::runtime::Runtime,
    signaling: Mutex<SignalingClient>,
    peers: Mutex<HashMap<VAddr, mpsc::Sender<Vec<u8>>>>,
    contexts: Mutex<HashMap<ContextId, ContextEntry>>,
    uris: Vec<String>,
    global: Context,
}

impl SocketCommunicator {
    /// Joins the named global context: registers with the signaling
    /// service, publishes the listening URI, and resolves every peer.
    /// Blocks until all `context_size` peers have arrived.
    pub fn connect(config: Config) -> Result<Self, CommError> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.io_threads.max(1))
            .enable_all()
            .build()
            .map_err(|e| CommError::Transport(format!("failed to build runtime: {e}")))?;

        let mut signaling = SignalingClient::connect(runtime.handle().clone(), &config.master_uri)?;
        let (context_id, size) =
            signaling.request_context(&config.context_name, config.context_size as u32)?;

        let listener = runtime
            .block_on(TcpListener::bind(config.peer_uri.as_str()))
            .map_err(|e| {
                CommError::Transport(format!("failed to bind on {}: {e}", config.peer_uri))
            })?;
        let advertised = listener
            .local_addr()
            .map(|addr| addr.to_string())
            .map_err(|e| CommError::Transport(format!("listener has no local address: {e}")))?;

        let vaddr = signaling.request_vaddr(context_id, &advertised)?;
        let mut uris = Vec::with_capacity(size as usize);
        for peer in 0..size {
            uris.push(signaling.lookup_vaddr(context_id, VAddr(peer))?);
        }

        let shared = Arc::new(Shared {
            inbox: Inbox::new(),
            max_buffer_size: config.max_buffer_size,
        });
        runtime.spawn(accept_loop(listener, shared.clone()));

        let global = Context {
            id: context_id,
            vaddr,
            size: size as usize,
        };
        let mut contexts = HashMap::new();
        contexts.insert(
            context_id,
            ContextEntry {
                name: config.context_name.clone(),
                members: global.vaddrs().collect(),
                child_seq: 0,
            },
        );

        info!(%vaddr, size, %advertised, "joined global context");
        Ok(Self {
            config,
            shared,
            runtime,
            signaling: Mutex::new(signaling),
            peers: Mutex::new(HashMap::new()),
            contexts: Mutex::new(contexts),
            uris,
            global,
        })
    }

    fn global_member(&self, ctx: &Context, member: VAddr) -> Result<VAddr, CommError> {
        let contexts = self.contexts.lock();
        let entry = contexts
            .get(&ctx.id)
            .ok_or_else(|| CommError::InvalidContext(format!("unknown context {}", ctx.id)))?;
        entry.members.get(member.0 as usize).copied().ok_or_else(|| {
            CommError::InvalidContext(format!(
                "address {member} outside context {} of size {}",
                ctx.id,
                entry.members.len()
            ))
        })
    }

    /// Outbound frame queue towards a peer, dialing on first use.
    fn channel(&self, global_dst: VAddr) -> Result<mpsc::Sender<Vec<u8>>, CommError> {
        let mut peers = self.peers.lock();
        if let Some(tx) = peers.get(&global_dst) {
            return Ok(tx.clone());
        }
        let uri = self
            .uris
            .get(global_dst.0 as usize)
            .ok_or_else(|| {
                CommError::InvalidContext(format!("no peer registered at address {global_dst}"))
            })?
            .clone();

        let hello = encode_frame(
            &Header {
                msg_type: MsgType::Confirm,
                src: self.global.vaddr,
                dst: global_dst,
                context: self.global.id,
                tag: Tag(0),
            },
            &[],
            self.config.max_buffer_size,
        )?;
        let max = self.config.max_buffer_size;
        let stream = self.runtime.block_on(async {
            let mut stream = TcpStream::connect(uri.as_str())
                .await
                .map_err(|e| CommError::Transport(format!("peer {global_dst} at {uri}: {e}")))?;
            stream
                .write_all(&hello)
                .await
                .map_err(|e| CommError::Transport(format!("hello to peer {global_dst}: {e}")))?;
            let ack = read_frame(&mut stream, max).await?.ok_or_else(|| {
                CommError::Transport(format!("peer {global_dst} closed during handshake"))
            })?;
            let (header, _) = decode_frame(&ack, max)?;
            if header.msg_type != MsgType::Ack {
                return Err(CommError::Protocol(format!(
                    "peer {global_dst} answered handshake with {:?}",
                    header.msg_type
                )));
            }
            Ok(stream)
        })?;
        debug!(%global_dst, %uri, "peer connection established");

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(256);
        self.runtime.spawn(async move {
            let mut stream = stream;
            while let Some(frame) = rx.recv().await {
                if let Err(e) = stream.write_all(&frame).await {
                    warn!(%global_dst, %e, "peer connection lost");
                    break;
                }
            }
        });
        peers.insert(global_dst, tx.clone());
        Ok(tx)
    }

    fn frame(
        &self,
        dst: VAddr,
        tag: Tag,
        ctx: &Context,
        bytes: &[u8],
    ) -> Result<Vec<u8>, CommError> {
        Ok(encode_frame(
            &Header {
                msg_type: MsgType::Peer,
                src: ctx.vaddr,
                dst,
                context: ctx.id,
                tag,
            },
            bytes,
            self.config.max_buffer_size,
        )?)
    }

    fn transmit(&self, dst: VAddr, tag: Tag, ctx: &Context, bytes: &[u8]) -> Result<(), CommError> {
        let global_dst = self.global_member(ctx, dst)?;
        let frame = self.frame(dst, tag, ctx, bytes)?;
        let tx = self.channel(global_dst)?;
        tx.blocking_send(frame)
            .map_err(|_| CommError::Transport(format!("connection to peer {global_dst} closed")))
    }

    fn deliver(bytes: Vec<u8>, src: VAddr, tag: Tag, buf: &mut [u8]) -> Result<Status, CommError> {
        if bytes.len() > buf.len() {
            return Err(CommError::SizeMismatch {
                expected: buf.len(),
                actual: bytes.len(),
            });
        }
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(Status {
            source: src,
            tag,
            size: bytes.len(),
        })
    }
}

impl PointToPoint for SocketCommunicator {
    fn coll_send(&self, dst: VAddr, ctx: &Context, bytes: &[u8]) -> Result<(), CommError> {
        self.transmit(dst, COLLECTIVE_TAG, ctx, bytes)
    }

    fn coll_recv(&self, src: VAddr, ctx: &Context) -> Result<Vec<u8>, CommError> {
        Ok(self.shared.inbox.pop_match(ctx.id, src, COLLECTIVE_TAG))
    }
}

impl Communicator for SocketCommunicator {
    fn global_context(&self) -> Context {
        self.global.clone()
    }

    fn create_context(
        &self,
        members: &[VAddr],
        parent: &Context,
    ) -> Result<Option<Context>, CommError> {
        // Derive a name every parent member agrees on; agreement follows
        // from the call being collective over the parent.
        let (name, parent_members) = {
            let mut contexts = self.contexts.lock();
            let entry = contexts.get_mut(&parent.id).ok_or_else(|| {
                CommError::InvalidContext(format!("unknown parent context {}", parent.id))
            })?;
            let name = format!("{}.{}", entry.name, entry.child_seq);
            entry.child_seq += 1;
            (name, entry.members.clone())
        };
        for member in members {
            if member.0 as usize >= parent_members.len() {
                return Err(CommError::InvalidContext(format!(
                    "address {member} outside parent context of size {}",
                    parent_members.len()
                )));
            }
        }

        let Some(position) = members.iter().position(|member| *member == parent.vaddr) else {
            return Ok(None);
        };

        // The signaling service allocates the id and acts as the barrier:
        // the reply arrives once every member has requested the name.
        let (context_id, _) = self
            .signaling
            .lock()
            .request_context(&name, members.len() as u32)?;
        let members_global: Vec<VAddr> = members
            .iter()
            .map(|member| parent_members[member.0 as usize])
            .collect();
        self.contexts.lock().insert(
            context_id,
            ContextEntry {
                name,
                members: members_global,
                child_seq: 0,
            },
        );
        debug!(%context_id, size = members.len(), "sub-context created");
        Ok(Some(Context {
            id: context_id,
            vaddr: VAddr(position as u32),
            size: members.len(),
        }))
    }

    fn send(&self, dst: VAddr, tag: Tag, ctx: &Context, bytes: &[u8]) -> Result<(), CommError> {
        self.transmit(dst, tag, ctx, bytes)
    }

    fn recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        buf: &mut [u8],
    ) -> Result<Status, CommError> {
        self.global_member(ctx, src)?;
        let bytes = self.shared.inbox.pop_match(ctx.id, src, tag);
        Self::deliver(bytes, src, tag, buf)
    }

    fn recv_any(&self, ctx: &Context) -> Result<(Status, Vec<u8>), CommError> {
        let (src, tag, bytes) = self.shared.inbox.pop_any_user(ctx.id);
        let status = Status {
            source: src,
            tag,
            size: bytes.len(),
        };
        Ok((status, bytes))
    }

    fn async_send(
        &self,
        dst: VAddr,
        tag: Tag,
        ctx: &Context,
        bytes: Vec<u8>,
    ) -> Result<Event, CommError> {
        let status = Status {
            source: ctx.vaddr,
            tag,
            size: bytes.len(),
        };
        if self.config.io_threads == 0 {
            self.transmit(dst, tag, ctx, &bytes)?;
            return Ok(Event::immediate(status, None));
        }
        let global_dst = self.global_member(ctx, dst)?;
        let frame = self.frame(dst, tag, ctx, &bytes)?;
        let tx = self.channel(global_dst)?;
        let shared = SharedEvent::new();
        let completer = shared.clone();
        self.runtime.spawn(async move {
            let result = match tx.send(frame).await {
                Ok(()) => Ok(Completion {
                    status,
                    bytes: None,
                }),
                Err(_) => Err(CommError::Transport(format!(
                    "connection to peer {global_dst} closed"
                ))),
            };
            completer.complete(result);
        });
        Ok(Event::shared(shared))
    }

    fn async_recv(
        &self,
        src: VAddr,
        tag: Tag,
        ctx: &Context,
        len: usize,
    ) -> Result<Event, CommError> {
        self.global_member(ctx, src)?;
        if self.config.io_threads == 0 {
            let bytes = self.shared.inbox.pop_match(ctx.id, src, tag);
            if bytes.len() > len {
                return Err(CommError::SizeMismatch {
                    expected: len,
                    actual: bytes.len(),
                });
            }
            let status = Status {
                source: src,
                tag,
                size: bytes.len(),
            };
            return Ok(Event::immediate(status, Some(bytes)));
        }
        let shared = SharedEvent::new();
        let completer = shared.clone();
        let inner = self.shared.clone();
        let context = ctx.id;
        self.runtime.spawn_blocking(move || {
            let bytes = inner.inbox.pop_match(context, src, tag);
            let result = if bytes.len() > len {
                Err(CommError::SizeMismatch {
                    expected: len,
                    actual: bytes.len(),
                })
            } else {
                Ok(Completion {
                    status: Status {
                        source: src,
                        tag,
                        size: bytes.len(),
                    },
                    bytes: Some(bytes),
                })
            };
            completer.complete(result);
        });
        Ok(Event::shared(shared))
    }

    fn probe(
        &self,
        src: Option<VAddr>,
        tag: Option<Tag>,
        ctx: &Context,
    ) -> Result<Option<Status>, CommError> {
        Ok(self.shared.inbox.probe(ctx.id, src, tag))
    }

    fn barrier(&self, ctx: &Context) -> Result<(), CommError> {
        collective::barrier(self, ctx)
    }

    fn broadcast<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        data: &mut [T],
    ) -> Result<(), CommError> {
        let mut bytes = bytemuck::cast_slice::<T, u8>(data).to_vec();
        broadcast_bytes(self, root, ctx, &mut bytes)?;
        bytes_into_slice(data, &bytes)
    }

    fn gather<T: Pod>(
        &self,
        root: VAddr,
        ctx: &Context,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let part = bytemuck::cast_slice::<T, u8>(send);
        if let Some(parts) = gather_parts(self, root, ctx, part)? {
            let all = collective::concat_equal_parts(parts, part.len())?;
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
        let all = all_gather_bytes(self, ctx, bytemuck::cast_slice::<T, u8>(send))?;
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
        let mine = scatter_bytes(self, root, ctx, bytemuck::cast_slice::<T, u8>(send), chunk)?;
        bytes_into_slice(recv, &mine)
    }

    fn reduce<T: Pod + Reducible>(
        &self,
        root: VAddr,
        ctx: &Context,
        op: ReduceOp,
        send: &[T],
        recv: &mut [T],
    ) -> Result<(), CommError> {
        let part = bytemuck::cast_slice::<T, u8>(send);
        if let Some(parts) = gather_parts(self, root, ctx, part)? {
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
        // Reduce at address 0, then share the folded result.
        let root = VAddr(0);
        let part = bytemuck::cast_slice::<T, u8>(send);
        let mut folded = match gather_parts(self, root, ctx, part)? {
            Some(parts) => {
                let folded: Vec<T> = fold_parts(&parts, op)?;
                bytemuck::cast_slice::<T, u8>(&folded).to_vec()
            }
            None => vec![0u8; part.len()],
        };
        broadcast_bytes(self, root, ctx, &mut folded)?;
        bytes_into_slice(recv, &folded)
    }
}

impl Drop for SocketCommunicator {
    fn drop(&mut self) {
        // Best-effort teardown: tell connected peers and the signaling
        // service that this peer is gone.
        let peers = std::mem::take(&mut *self.peers.lock());
        for (dst, tx) in peers {
            let destruct = encode_frame(
                &Header {
                    msg_type: MsgType::Destruct,
                    src: self.global.vaddr,
                    dst,
                    context: self.global.id,
                    tag: Tag(0),
                },
                &[],
                self.config.max_buffer_size,
            );
            if let Ok(frame) = destruct {
                let _ = tx.try_send(frame);
            }
        }
        let mut signaling = self.signaling.lock();
        if let Err(e) = signaling.leave_context(self.global.id, self.global.vaddr) {
            debug!(%e, "signaling deregistration failed during teardown");
        }
    }
}

/// Reads one length-prefixed frame. `None` on a clean end of stream.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    max_payload_bytes: usize,
) -> Result<Option<Vec<u8>>, CommError>
where
    R: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(CommError::Transport(format!("read frame length: {e}")));
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > max_payload_bytes {
        return Err(CommError::Protocol(format!(
            "frame too large: {payload_len} > {max_payload_bytes}"
        )));
    }
    let mut rest = vec![0u8; gvon_wire::HEADER_BYTES - 4 + payload_len];
    reader
        .read_exact(&mut rest)
        .await
        .map_err(|e| CommError::Transport(format!("read frame payload: {e}")))?;
    let mut frame = Vec::with_capacity(gvon_wire::HEADER_BYTES + payload_len);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&rest);
    Ok(Some(frame))
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "peer connection accepted");
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_peer(stream, shared).await {
                        warn!(%addr, %e, "peer connection error");
                    }
                });
            }
            Err(e) => {
                error!(%e, "accept failed");
                return;
            }
        }
    }
}

async fn serve_peer(mut stream: TcpStream, shared: Arc<Shared>) -> Result<(), CommError> {
    let max = shared.max_buffer_size;
    let Some(hello) = read_frame(&mut stream, max).await? else {
        return Ok(());
    };
    let (header, _) = decode_frame(&hello, max)?;
    if header.msg_type != MsgType::Confirm {
        return Err(CommError::Protocol(format!(
            "expected hello, got {:?}",
            header.msg_type
        )));
    }
    let remote = header.src;
    let ack = encode_frame(
        &Header {
            msg_type: MsgType::Ack,
            src: header.dst,
            dst: remote,
            context: header.context,
            tag: Tag(0),
        },
        &[],
        max,
    )?;
    stream
        .write_all(&ack)
        .await
        .map_err(|e| CommError::Transport(format!("handshake ack: {e}")))?;
    debug!(%remote, "inbound peer registered");

    loop {
        let Some(frame) = read_frame(&mut stream, max).await? else {
            return Ok(());
        };
        let (header, payload) = decode_frame(&frame, max)?;
        match header.msg_type {
            MsgType::Peer => {
                shared
                    .inbox
                    .push(header.context, header.src, header.tag, payload.to_vec());
            }
            MsgType::Destruct => {
                debug!(%remote, "peer departed");
                return Ok(());
            }
            other => {
                warn!(%remote, ?other, "unexpected frame on peer connection");
            }
        }
    }
}
