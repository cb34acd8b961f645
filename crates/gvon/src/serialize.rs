//! Serialization policies turn typed payloads into the byte containers the
//! transport moves. Selected as a type parameter of the cage.

use crate::CageError;
use bytemuck::Pod;

/// Three-step contract: `serialize` on the sending side, `prepare` to size
/// a receive buffer, `restore` to copy received bytes back into the typed
/// buffer.
pub trait SerializationPolicy {
    fn serialize<T: Pod>(data: &[T]) -> Vec<u8>;
    fn prepare<T: Pod>(data: &[T]) -> Vec<u8>;
    fn restore<T: Pod>(data: &mut [T], bytes: &[u8]) -> Result<(), CageError>;
}

fn checked_restore<T: Pod>(data: &mut [T], bytes: &[u8]) -> Result<(), CageError> {
    let dst = bytemuck::cast_slice_mut::<T, u8>(data);
    if dst.len() != bytes.len() {
        return Err(CageError::SizeMismatch {
            expected: dst.len(),
            actual: bytes.len(),
        });
    }
    dst.copy_from_slice(bytes);
    Ok(())
}

/// Raw byte copy of contiguous buffers of trivially-copyable elements.
pub struct ByteCast;

impl SerializationPolicy for ByteCast {
    fn serialize<T: Pod>(data: &[T]) -> Vec<u8> {
        bytemuck::cast_slice::<T, u8>(data).to_vec()
    }

    fn prepare<T: Pod>(data: &[T]) -> Vec<u8> {
        vec![0u8; std::mem::size_of_val(data)]
    }

    fn restore<T: Pod>(data: &mut [T], bytes: &[u8]) -> Result<(), CageError> {
        checked_restore(data, bytes)
    }
}

/// Identity-shaped policy for transports that move the caller's bytes
/// without reinterpretation.
pub struct Forward;

impl SerializationPolicy for Forward {
    fn serialize<T: Pod>(data: &[T]) -> Vec<u8> {
        bytemuck::cast_slice::<T, u8>(data).to_vec()
    }

    fn prepare<T: Pod>(data: &[T]) -> Vec<u8> {
        vec![0u8; std::mem::size_of_val(data)]
    }

    fn restore<T: Pod>(data: &mut [T], bytes: &[u8]) -> Result<(), CageError> {
        checked_restore(data, bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_cast_roundtrip_preserves_bytes() {
        let sent = [1u64, 2, 3];
        let bytes = ByteCast::serialize(&sent);
        assert_eq!(bytes.len(), 24);

        let mut received = [0u64; 3];
        let prepared = ByteCast::prepare(&received);
        assert_eq!(prepared.len(), bytes.len());
        ByteCast::restore(&mut received, &bytes).expect("sizes match");
        assert_eq!(received, sent);
    }

    #[test]
    fn restore_rejects_size_mismatch() {
        let mut received = [0u32; 2];
        let err = ByteCast::restore(&mut received, &[0u8; 4])
            .expect_err("short payload should be rejected");
        assert!(matches!(
            err,
            CageError::SizeMismatch {
                expected: 8,
                actual: 4
            }
        ));
    }
}
