//! Isochronous packet-descriptor page layout.
//!
//! An isochronous request describes its per-packet slicing of the data buffer
//! in a dedicated frontend-owned page: an array of `(offset, length)` u32
//! pairs, one per packet, packed from offset 0. The page is shared through
//! the grant occupying the request's first segment slot; the packet count
//! travels in the request record itself.

/// Packet descriptors that fit in one 4096-byte page.
pub const PACKETS_PER_PAGE: usize = 4096 / 8;

/// One packet's slice of the transfer buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketDescriptor {
    /// Byte offset into the transfer buffer.
    pub offset: u32,
    /// Payload length of this packet.
    pub length: u32,
}

/// Encodes packet descriptors into a page buffer.
pub fn encode_packets(packets: &[PacketDescriptor], page: &mut [u8]) {
    assert!(packets.len() <= PACKETS_PER_PAGE);
    for (i, pkt) in packets.iter().enumerate() {
        let off = i * 8;
        page[off..off + 4].copy_from_slice(&pkt.offset.to_le_bytes());
        page[off + 4..off + 8].copy_from_slice(&pkt.length.to_le_bytes());
    }
}

/// Decodes `count` packet descriptors from a page buffer (backend/test side).
pub fn decode_packets(page: &[u8], count: usize) -> Option<Vec<PacketDescriptor>> {
    if count > PACKETS_PER_PAGE || page.len() < count * 8 {
        return None;
    }
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let off = i * 8;
        out.push(PacketDescriptor {
            offset: u32::from_le_bytes(page[off..off + 4].try_into().ok()?),
            length: u32::from_le_bytes(page[off + 4..off + 8].try_into().ok()?),
        });
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packets_roundtrip_at_fixed_offsets() {
        let packets = vec![
            PacketDescriptor { offset: 0, length: 188 },
            PacketDescriptor { offset: 188, length: 188 },
            PacketDescriptor { offset: 376, length: 64 },
        ];
        let mut page = vec![0u8; 4096];
        encode_packets(&packets, &mut page);
        assert_eq!(&page[0..4], &0u32.to_le_bytes());
        assert_eq!(&page[4..8], &188u32.to_le_bytes());
        assert_eq!(&page[8..12], &188u32.to_le_bytes());
        assert_eq!(decode_packets(&page, 3), Some(packets));
    }

    #[test]
    fn oversized_counts_are_rejected() {
        let page = vec![0u8; 4096];
        assert!(decode_packets(&page, PACKETS_PER_PAGE + 1).is_none());
    }
}
