//! Client side of the signaling service: a persistent framed TCP
//! connection carrying one JSON request per reply. `Retry` replies are
//! consumed here and never surface to the transport's callers.

use crate::socket::read_frame;
use crate::CommError;
use gvon_types::{ContextId, VAddr};
use gvon_wire::{
    decode_signal_reply, encode_signal_request, SignalReply, SignalRequest,
    DEFAULT_MAX_PAYLOAD_BYTES,
};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tracing::debug;

const RETRY_DELAY_MS: u64 = 50;

pub(crate) struct SignalingClient {
    handle: Handle,
    stream: TcpStream,
}

impl SignalingClient {
    pub(crate) fn connect(handle: Handle, master_uri: &str) -> Result<Self, CommError> {
        let stream = handle
            .block_on(TcpStream::connect(master_uri))
            .map_err(|e| {
                CommError::Transport(format!("signaling service unreachable at {master_uri}: {e}"))
            })?;
        Ok(Self { handle, stream })
    }

    pub(crate) fn request_context(
        &mut self,
        context_name: &str,
        expected_size: u32,
    ) -> Result<(ContextId, u32), CommError> {
        let reply = self.call(&SignalRequest::ContextRequest {
            context_name: context_name.into(),
            expected_size,
        })?;
        match reply {
            SignalReply::ContextInit { context_id, size } => Ok((context_id, size)),
            other => Err(unexpected("context request", &other)),
        }
    }

    pub(crate) fn request_vaddr(
        &mut self,
        context_id: ContextId,
        peer_uri: &str,
    ) -> Result<VAddr, CommError> {
        let reply = self.call(&SignalRequest::VaddrRequest {
            context_id,
            peer_uri: peer_uri.into(),
        })?;
        match reply {
            SignalReply::VaddrAssigned { vaddr } => Ok(vaddr),
            other => Err(unexpected("vaddr request", &other)),
        }
    }

    /// Resolves a peer address to its URI, retrying while the peer has not
    /// registered yet.
    pub(crate) fn lookup_vaddr(
        &mut self,
        context_id: ContextId,
        vaddr: VAddr,
    ) -> Result<String, CommError> {
        loop {
            let reply = self.call(&SignalRequest::VaddrLookup { context_id, vaddr })?;
            match reply {
                SignalReply::VaddrUri { uri } => return Ok(uri),
                SignalReply::Retry => {
                    debug!(%context_id, %vaddr, "peer not registered yet, retrying lookup");
                    std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
                }
                other => return Err(unexpected("vaddr lookup", &other)),
            }
        }
    }

    pub(crate) fn leave_context(
        &mut self,
        context_id: ContextId,
        vaddr: VAddr,
    ) -> Result<(), CommError> {
        let reply = self.call(&SignalRequest::LeaveContext { context_id, vaddr })?;
        match reply {
            SignalReply::Left => Ok(()),
            other => Err(unexpected("leave context", &other)),
        }
    }

    fn call(&mut self, request: &SignalRequest) -> Result<SignalReply, CommError> {
        let frame = encode_signal_request(request)?;
        let stream = &mut self.stream;
        self.handle.block_on(async move {
            stream
                .write_all(&frame)
                .await
                .map_err(|e| CommError::Transport(format!("signaling write: {e}")))?;
            let reply = read_frame(stream, DEFAULT_MAX_PAYLOAD_BYTES)
                .await?
                .ok_or_else(|| {
                    CommError::Transport("signaling service closed the connection".into())
                })?;
            Ok(decode_signal_reply(&reply)?)
        })
    }
}

fn unexpected(operation: &str, reply: &SignalReply) -> CommError {
    match reply {
        SignalReply::Error { reason } => {
            CommError::Protocol(format!("{operation} rejected: {reason}"))
        }
        other => CommError::Protocol(format!("unexpected {operation} reply: {other:?}")),
    }
}
