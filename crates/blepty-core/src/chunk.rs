//! Splitting PTY reads into BLE-sized writes.
//!
//! A characteristic write carries at most one ATT payload, so anything read
//! from the PTY master is cut into MTU-bounded chunks before it goes out.
//! Chunks are produced in order and concatenate back to the input.

/// Payload size used when the link cannot report a negotiated MTU.
///
/// The ATT default MTU is 23 bytes; three of them are the opcode and handle,
/// which leaves 20 bytes of payload. JNHuaMao modules advertise the same limit.
pub const DEFAULT_MTU: usize = 20;

/// Pick the chunk size for a session.
///
/// An explicit override wins over what the link reports, and both fall back to
/// [`DEFAULT_MTU`]. Zero is never returned.
pub fn effective_mtu(configured: Option<usize>, negotiated: Option<usize>) -> usize {
    configured
        .filter(|&m| m > 0)
        .or(negotiated.filter(|&m| m > 0))
        .unwrap_or(DEFAULT_MTU)
}

/// Iterate over `data` in chunks of at most `mtu` bytes.
///
/// # Panics
///
/// Panics if `mtu` is zero. Use [`effective_mtu`] to obtain a valid size.
pub fn chunks(data: &[u8], mtu: usize) -> std::slice::Chunks<'_, u8> {
    assert!(mtu > 0, "mtu must be non-zero");
    data.chunks(mtu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn forty_five_bytes_at_mtu_twenty() {
        let data = [0xAAu8; 45];
        let sizes: Vec<usize> = chunks(&data, 20).map(|c| c.len()).collect();
        assert_eq!(sizes, vec![20, 20, 5]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        let data = [1u8; 40];
        assert_eq!(chunks(&data, 20).count(), 2);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert_eq!(chunks(&[], 20).count(), 0);
    }

    #[test]
    fn override_beats_negotiated() {
        assert_eq!(effective_mtu(Some(64), Some(180)), 64);
        assert_eq!(effective_mtu(None, Some(180)), 180);
        assert_eq!(effective_mtu(None, None), DEFAULT_MTU);
    }

    #[test]
    fn zero_values_fall_through() {
        assert_eq!(effective_mtu(Some(0), Some(0)), DEFAULT_MTU);
        assert_eq!(effective_mtu(Some(0), Some(50)), 50);
    }

    proptest! {
        #[test]
        fn chunks_reassemble_in_order(data in proptest::collection::vec(any::<u8>(), 0..600), mtu in 1usize..256) {
            let pieces: Vec<&[u8]> = chunks(&data, mtu).collect();
            prop_assert!(pieces.iter().all(|c| !c.is_empty() && c.len() <= mtu));
            prop_assert_eq!(pieces.concat(), data);
        }
    }
}
