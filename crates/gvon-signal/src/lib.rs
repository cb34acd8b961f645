//! Signaling service: the rendezvous point of the socket transport. Peers
//! register named contexts, claim dense addresses within them, and resolve
//! other peers' addresses to URIs. State is in-memory only.

use gvon_types::{ContextId, VAddr};
use gvon_wire::{
    decode_signal_request, encode_signal_reply, SignalReply, SignalRequest,
    DEFAULT_MAX_PAYLOAD_BYTES, HEADER_BYTES,
};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

struct ContextEntry {
    id: u64,
    expected: u32,
    requested: u32,
    registered: u32,
    next_vaddr: u32,
    uris: Vec<Option<String>>,
    complete: Arc<Notify>,
}

#[derive(Default)]
struct ServerState {
    next_context_id: u64,
    by_name: HashMap<String, ContextEntry>,
    names_by_id: HashMap<u64, String>,
}

/// A bound signaling server; [`SignalingServer::serve`] runs its accept
/// loop until the process ends.
pub struct SignalingServer {
    listener: TcpListener,
    state: Arc<Mutex<ServerState>>,
}

impl SignalingServer {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: Arc::new(Mutex::new(ServerState::default())),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) -> io::Result<()> {
        info!(addr = %self.local_addr()?, "signaling server listening");
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "signaling connection accepted");
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(stream, state).await {
                            warn!(%addr, %e, "signaling connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(%e, "accept failed");
                    return Err(e);
                }
            }
        }
    }
}

async fn handle_conn(mut stream: TcpStream, state: Arc<Mutex<ServerState>>) -> io::Result<()> {
    loop {
        let Some(frame) = read_frame(&mut stream).await? else {
            return Ok(());
        };
        let request = match decode_signal_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "undecodable signaling request");
                write_reply(
                    &mut stream,
                    &SignalReply::Error {
                        reason: e.to_string(),
                    },
                )
                .await?;
                continue;
            }
        };
        let reply = dispatch(request, &state).await;
        write_reply(&mut stream, &reply).await?;
    }
}

async fn dispatch(request: SignalRequest, state: &Arc<Mutex<ServerState>>) -> SignalReply {
    match request {
        SignalRequest::ContextRequest {
            context_name,
            expected_size,
        } => context_request(context_name, expected_size, state).await,
        SignalRequest::VaddrRequest {
            context_id,
            peer_uri,
        } => {
            let mut guard = state.lock().await;
            let Some(entry) = entry_by_id(&mut guard, context_id.0) else {
                return unknown_context(context_id.0);
            };
            let vaddr = entry.next_vaddr;
            if vaddr >= entry.expected {
                return SignalReply::Error {
                    reason: format!("context {} is full", context_id.0),
                };
            }
            entry.next_vaddr += 1;
            entry.registered += 1;
            entry.uris[vaddr as usize] = Some(peer_uri.clone());
            info!(context_id = context_id.0, vaddr, %peer_uri, "peer registered");
            SignalReply::VaddrAssigned {
                vaddr: VAddr(vaddr),
            }
        }
        SignalRequest::VaddrLookup { context_id, vaddr } => {
            let mut guard = state.lock().await;
            let Some(entry) = entry_by_id(&mut guard, context_id.0) else {
                return unknown_context(context_id.0);
            };
            match entry
                .uris
                .get(vaddr.0 as usize)
                .and_then(|uri| uri.clone())
            {
                Some(uri) => SignalReply::VaddrUri { uri },
                None => SignalReply::Retry,
            }
        }
        SignalRequest::LeaveContext { context_id, vaddr } => {
            let mut guard = state.lock().await;
            let Some(entry) = entry_by_id(&mut guard, context_id.0) else {
                return unknown_context(context_id.0);
            };
            if let Some(slot) = entry.uris.get_mut(vaddr.0 as usize) {
                *slot = None;
            }
            entry.registered = entry.registered.saturating_sub(1);
            let empty = entry.registered == 0 && entry.requested >= entry.expected;
            if empty {
                if let Some(name) = guard.names_by_id.remove(&context_id.0) {
                    guard.by_name.remove(&name);
                    info!(context_id = context_id.0, %name, "context dissolved");
                }
            }
            SignalReply::Left
        }
    }
}

/// Registers under the named context and answers once `expected_size`
/// peers have requested it, making the request a rendezvous barrier.
async fn context_request(
    context_name: String,
    expected_size: u32,
    state: &Arc<Mutex<ServerState>>,
) -> SignalReply {
    let complete = {
        let mut guard = state.lock().await;
        if !guard.by_name.contains_key(&context_name) {
            let id = guard.next_context_id;
            guard.next_context_id += 1;
            guard.names_by_id.insert(id, context_name.clone());
            guard.by_name.insert(
                context_name.clone(),
                ContextEntry {
                    id,
                    expected: expected_size,
                    requested: 0,
                    registered: 0,
                    next_vaddr: 0,
                    uris: vec![None; expected_size as usize],
                    complete: Arc::new(Notify::new()),
                },
            );
            info!(context_id = id, %context_name, expected_size, "context registered");
        }
        let entry = guard
            .by_name
            .get_mut(&context_name)
            .expect("entry was just ensured");
        if entry.expected != expected_size {
            return SignalReply::Error {
                reason: format!(
                    "context '{context_name}' already declared with size {}",
                    entry.expected
                ),
            };
        }
        entry.requested += 1;
        if entry.requested >= entry.expected {
            entry.complete.notify_waiters();
        }
        entry.complete.clone()
    };

    loop {
        let notified = complete.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        {
            let guard = state.lock().await;
            if let Some(entry) = guard.by_name.get(&context_name) {
                if entry.requested >= entry.expected {
                    return SignalReply::ContextInit {
                        context_id: ContextId(entry.id),
                        size: entry.expected,
                    };
                }
            } else {
                return SignalReply::Error {
                    reason: format!("context '{context_name}' dissolved while waiting"),
                };
            }
        }
        notified.await;
    }
}

fn entry_by_id(state: &mut ServerState, context_id: u64) -> Option<&mut ContextEntry> {
    let name = state.names_by_id.get(&context_id)?.clone();
    state.by_name.get_mut(&name)
}

fn unknown_context(context_id: u64) -> SignalReply {
    SignalReply::Error {
        reason: format!("unknown context {context_id}"),
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &SignalReply) -> io::Result<()> {
    let frame = encode_signal_reply(reply)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    stream.write_all(&frame).await
}

async fn read_frame(stream: &mut TcpStream) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = stream.read_exact(&mut len_buf).await {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e);
    }
    let payload_len = u32::from_be_bytes(len_buf) as usize;
    if payload_len > DEFAULT_MAX_PAYLOAD_BYTES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {payload_len}"),
        ));
    }
    let mut rest = vec![0u8; HEADER_BYTES - 4 + payload_len];
    stream.read_exact(&mut rest).await?;
    let mut frame = Vec::with_capacity(HEADER_BYTES + payload_len);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&rest);
    Ok(Some(frame))
}
