//! Datagram framing: fixed RTP header removal and 16-bit byte swapping.

use crate::defaults::RTP_HEADER_LEN;
use bytes::{Bytes, BytesMut};

/// Returns the payload after the fixed 12-byte header, or `None` for
/// datagrams too short to carry one.
pub fn strip_header(datagram: &[u8]) -> Option<&[u8]> {
    datagram.get(RTP_HEADER_LEN..)
}

/// Swaps the bytes of every 16-bit sample in place.
///
/// A trailing odd byte is left untouched.
pub fn swap16(buf: &mut [u8]) {
    for pair in buf.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Strips the header and applies the byte swap, copying the payload into
/// an owned chunk.
pub fn extract_payload(datagram: &[u8], swap: bool) -> Option<Bytes> {
    let payload = strip_header(datagram)?;
    if !swap {
        return Some(Bytes::copy_from_slice(payload));
    }
    let mut owned = BytesMut::from(payload);
    swap16(&mut owned);
    Some(owned.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0x80, 0x0b, 0x00, 0x01, 0, 0, 0, 160, 0xde, 0xad, 0xbe, 0xef];
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_strip_header_rejects_short_datagrams() {
        assert!(strip_header(&[]).is_none());
        assert!(strip_header(&[0u8; 11]).is_none());
    }

    #[test]
    fn test_strip_header_exact_length_gives_empty_payload() {
        assert_eq!(strip_header(&[0u8; 12]), Some(&[][..]));
    }

    #[test]
    fn test_strip_header_returns_payload() {
        let data = datagram(&[1, 2, 3, 4]);
        assert_eq!(strip_header(&data), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn test_swap16_swaps_pairs() {
        let mut buf = [0x12, 0x34, 0x56, 0x78];
        swap16(&mut buf);
        assert_eq!(buf, [0x34, 0x12, 0x78, 0x56]);
    }

    #[test]
    fn test_swap16_leaves_trailing_odd_byte() {
        let mut buf = [0x12, 0x34, 0x56];
        swap16(&mut buf);
        assert_eq!(buf, [0x34, 0x12, 0x56]);
    }

    #[test]
    fn test_extract_payload_without_swap() {
        let data = datagram(&[0x12, 0x34]);
        let payload = extract_payload(&data, false).unwrap();
        assert_eq!(&payload[..], &[0x12, 0x34]);
    }

    #[test]
    fn test_extract_payload_with_swap() {
        let data = datagram(&[0x12, 0x34, 0xab, 0xcd]);
        let payload = extract_payload(&data, true).unwrap();
        assert_eq!(&payload[..], &[0x34, 0x12, 0xcd, 0xab]);
    }

    #[test]
    fn test_extract_payload_short_datagram() {
        assert!(extract_payload(&[0u8; 4], true).is_none());
    }
}
