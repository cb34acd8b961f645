//! Collective algorithms shared by backends that build collectives from
//! their own point-to-point primitives. Traffic flows on a reserved
//! transport-internal tag; successive collectives on one context stay
//! ordered because each pair exchanges at most one message per collective
//! and channels are FIFO.

use crate::{CommError, Context};
use bytemuck::Pod;
use gvon_types::{ReduceOp, Reducible, Tag, VAddr};

pub(crate) const COLLECTIVE_TAG: Tag = Tag(u32::MAX);

/// Minimal point-to-point surface the algorithms need.
pub(crate) trait PointToPoint {
    fn coll_send(&self, dst: VAddr, ctx: &Context, bytes: &[u8]) -> Result<(), CommError>;
    fn coll_recv(&self, src: VAddr, ctx: &Context) -> Result<Vec<u8>, CommError>;
}

/// Gathers one byte part per member at the root, in address order. Returns
/// `None` on non-root members.
pub(crate) fn gather_parts<P: PointToPoint>(
    p2p: &P,
    root: VAddr,
    ctx: &Context,
    part: &[u8],
) -> Result<Option<Vec<Vec<u8>>>, CommError> {
    if ctx.vaddr() == root {
        let mut parts = Vec::with_capacity(ctx.size());
        for src in ctx.vaddrs() {
            if src == root {
                parts.push(part.to_vec());
            } else {
                parts.push(p2p.coll_recv(src, ctx)?);
            }
        }
        Ok(Some(parts))
    } else {
        p2p.coll_send(root, ctx, part)?;
        Ok(None)
    }
}

/// Copies the root's `data` into every member's `data`.
pub(crate) fn broadcast_bytes<P: PointToPoint>(
    p2p: &P,
    root: VAddr,
    ctx: &Context,
    data: &mut [u8],
) -> Result<(), CommError> {
    if ctx.vaddr() == root {
        for dst in ctx.vaddrs() {
            if dst != root {
                p2p.coll_send(dst, ctx, data)?;
            }
        }
    } else {
        let bytes = p2p.coll_recv(root, ctx)?;
        if bytes.len() != data.len() {
            return Err(CommError::SizeMismatch {
                expected: data.len(),
                actual: bytes.len(),
            });
        }
        data.copy_from_slice(&bytes);
    }
    Ok(())
}

pub(crate) fn barrier<P: PointToPoint>(p2p: &P, ctx: &Context) -> Result<(), CommError> {
    let root = VAddr(0);
    gather_parts(p2p, root, ctx, &[])?;
    broadcast_bytes(p2p, root, ctx, &mut [])
}

/// All-gather of equal-sized parts: gather at address 0, then broadcast the
/// concatenation.
pub(crate) fn all_gather_bytes<P: PointToPoint>(
    p2p: &P,
    ctx: &Context,
    part: &[u8],
) -> Result<Vec<u8>, CommError> {
    let root = VAddr(0);
    let mut all = match gather_parts(p2p, root, ctx, part)? {
        Some(parts) => concat_equal_parts(parts, part.len())?,
        None => vec![0u8; part.len() * ctx.size()],
    };
    broadcast_bytes(p2p, root, ctx, &mut all)?;
    Ok(all)
}

/// Scatter of the root's buffer in equal chunks of `chunk` bytes.
pub(crate) fn scatter_bytes<P: PointToPoint>(
    p2p: &P,
    root: VAddr,
    ctx: &Context,
    send: &[u8],
    chunk: usize,
) -> Result<Vec<u8>, CommError> {
    if ctx.vaddr() == root {
        if send.len() != chunk * ctx.size() {
            return Err(CommError::SizeMismatch {
                expected: chunk * ctx.size(),
                actual: send.len(),
            });
        }
        for dst in ctx.vaddrs() {
            if dst != root {
                let offset = dst.0 as usize * chunk;
                p2p.coll_send(dst, ctx, &send[offset..offset + chunk])?;
            }
        }
        let offset = root.0 as usize * chunk;
        Ok(send[offset..offset + chunk].to_vec())
    } else {
        let bytes = p2p.coll_recv(root, ctx)?;
        if bytes.len() != chunk {
            return Err(CommError::SizeMismatch {
                expected: chunk,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }
}

pub(crate) fn concat_equal_parts(
    parts: Vec<Vec<u8>>,
    part_len: usize,
) -> Result<Vec<u8>, CommError> {
    let mut all = Vec::with_capacity(part_len * parts.len());
    for part in &parts {
        if part.len() != part_len {
            return Err(CommError::Protocol(format!(
                "collective contribution of {} bytes, expected {part_len}",
                part.len()
            )));
        }
        all.extend_from_slice(part);
    }
    Ok(all)
}

/// Elementwise fold of byte parts interpreted as `T` slices, in address
/// order, so every member computes the identical result.
pub(crate) fn fold_parts<T: Pod + Reducible>(
    parts: &[Vec<u8>],
    op: ReduceOp,
) -> Result<Vec<T>, CommError> {
    let mut iter = parts.iter();
    let first = iter
        .next()
        .ok_or_else(|| CommError::Protocol("reduction over zero contributions".into()))?;
    let mut acc: Vec<T> = bytes_to_vec(first)?;
    for part in iter {
        let elems: Vec<T> = bytes_to_vec(part)?;
        if elems.len() != acc.len() {
            return Err(CommError::Protocol(format!(
                "reduction contribution of {} elements, expected {}",
                elems.len(),
                acc.len()
            )));
        }
        for (lhs, rhs) in acc.iter_mut().zip(elems) {
            *lhs = lhs.combine(rhs, op);
        }
    }
    Ok(acc)
}

/// Unaligned byte-to-element copy; message buffers carry no alignment
/// guarantee for `T`.
pub(crate) fn bytes_to_vec<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, CommError> {
    let elem = std::mem::size_of::<T>();
    if elem == 0 {
        return Err(CommError::Protocol(
            "zero-sized element type in collective".into(),
        ));
    }
    if bytes.len() % elem != 0 {
        return Err(CommError::Protocol(format!(
            "{} payload bytes are not a whole number of {elem}-byte elements",
            bytes.len()
        )));
    }
    let mut out = vec![T::zeroed(); bytes.len() / elem];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(bytes);
    Ok(out)
}

/// Writes `T` elements into a caller buffer, checking the byte length.
pub(crate) fn bytes_into_slice<T: Pod>(dst: &mut [T], bytes: &[u8]) -> Result<(), CommError> {
    let dst_bytes = bytemuck::cast_slice_mut::<T, u8>(dst);
    if dst_bytes.len() != bytes.len() {
        return Err(CommError::SizeMismatch {
            expected: dst_bytes.len(),
            actual: bytes.len(),
        });
    }
    dst_bytes.copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fold_parts_applies_op_in_address_order() {
        let parts: Vec<Vec<u8>> = [3u64, 9, 5]
            .iter()
            .map(|v| v.to_ne_bytes().to_vec())
            .collect();
        let max: Vec<u64> = fold_parts(&parts, ReduceOp::Max).expect("fold should succeed");
        assert_eq!(max, vec![9]);
        let sum: Vec<u64> = fold_parts(&parts, ReduceOp::Sum).expect("fold should succeed");
        assert_eq!(sum, vec![17]);
    }

    #[test]
    fn bytes_to_vec_rejects_ragged_payloads() {
        let err = bytes_to_vec::<u32>(&[0u8; 6]).expect_err("ragged payload should fail");
        assert!(matches!(err, CommError::Protocol(_)));
    }

    #[test]
    fn bytes_into_slice_checks_length() {
        let mut out = [0u32; 2];
        let err =
            bytes_into_slice(&mut out, &[0u8; 4]).expect_err("short payload should fail");
        assert!(matches!(err, CommError::SizeMismatch { .. }));
        bytes_into_slice(&mut out, &7u32.to_ne_bytes().repeat(2)).expect("exact fit");
        assert_eq!(out, [7, 7]);
    }
}
