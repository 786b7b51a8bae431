//! DDP (Distributed Display Protocol) packetizer.
//!
//! One frame of flat RGB bytes becomes a run of UDP datagrams, each
//! carrying a 10-byte header and at most 1440 payload bytes (480 RGB
//! pixels). The final datagram of a frame carries the PUSH bit so the
//! controller latches the whole frame at once.

use bytes::{BufMut, BytesMut};

/// Header length in bytes.
pub const HEADER_LEN: usize = 10;
/// Maximum pixels per datagram.
pub const MAX_PIXELS: usize = 480;
/// Maximum payload bytes per datagram; fits in an ethernet packet.
pub const MAX_DATALEN: usize = MAX_PIXELS * 3;

/// Protocol version 1 flag.
const VER1: u8 = 0x40;
/// Terminal-packet flag: latch the frame.
const PUSH: u8 = 0x01;
/// Payload data type: RGB.
const DATATYPE_RGB: u8 = 0x01;
/// Source identifier.
const SOURCE_DEFAULT: u8 = 0x01;

/// Stateful DDP packetizer. The only state is the frame counter that
/// drives the cycling sequence number; the pixel data is never retained.
#[derive(Debug, Default)]
pub struct DdpPacketizer {
    frame_count: u64,
}

impl DdpPacketizer {
    pub fn new() -> Self {
        Self { frame_count: 0 }
    }

    /// Number of datagrams a payload of `len` bytes will produce.
    pub fn packet_count(len: usize) -> usize {
        if len == 0 {
            1
        } else {
            len.div_ceil(MAX_DATALEN)
        }
    }

    /// Split one RGB frame into wire datagrams.
    ///
    /// The sequence number cycles 1..=15 per frame and is identical on
    /// every datagram of the frame; offsets are byte offsets into the
    /// frame; only the last datagram carries PUSH.
    pub fn packetize(&mut self, pixels: &[u8]) -> Vec<Vec<u8>> {
        self.frame_count += 1;
        let sequence = (self.frame_count % 15 + 1) as u8;

        let chunks: Vec<&[u8]> = if pixels.is_empty() {
            vec![&[][..]]
        } else {
            pixels.chunks(MAX_DATALEN).collect()
        };
        let last = chunks.len() - 1;

        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| encode_packet(sequence, i, chunk, i == last))
            .collect()
    }
}

fn encode_packet(sequence: u8, index: usize, data: &[u8], last: bool) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
    buf.put_u8(VER1 | if last { PUSH } else { 0 });
    buf.put_u8(sequence);
    buf.put_u8(DATATYPE_RGB);
    buf.put_u8(SOURCE_DEFAULT);
    buf.put_u32((index * MAX_DATALEN) as u32);
    buf.put_u16(data.len() as u16);
    buf.put_slice(data);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_header(pkt: &[u8]) -> (u8, u8, u8, u8, u32, u16) {
        let offset = u32::from_be_bytes([pkt[4], pkt[5], pkt[6], pkt[7]]);
        let len = u16::from_be_bytes([pkt[8], pkt[9]]);
        (pkt[0], pkt[1], pkt[2], pkt[3], offset, len)
    }

    #[test]
    fn push_only_on_last_packet() {
        let mut ddp = DdpPacketizer::new();
        // 64x32 RGB frame = 6144 bytes -> 5 packets
        let frame = vec![7u8; 64 * 32 * 3];
        let packets = ddp.packetize(&frame);
        assert_eq!(packets.len(), 5);
        for (i, pkt) in packets.iter().enumerate() {
            let (flags, _, dtype, source, offset, len) = decode_header(pkt);
            assert_eq!(dtype, 0x01);
            assert_eq!(source, 0x01);
            assert_eq!(offset as usize, i * MAX_DATALEN);
            assert_eq!(len as usize, pkt.len() - HEADER_LEN);
            if i == packets.len() - 1 {
                assert_eq!(flags, 0x41);
            } else {
                assert_eq!(flags, 0x40);
            }
        }
    }

    #[test]
    fn sequence_constant_within_frame_and_cycles() {
        let mut ddp = DdpPacketizer::new();
        let frame = vec![0u8; MAX_DATALEN * 3];
        let mut seen = Vec::new();
        for _ in 0..20 {
            let packets = ddp.packetize(&frame);
            let seq = packets[0][1];
            assert!((1..=15).contains(&seq));
            assert!(packets.iter().all(|p| p[1] == seq));
            seen.push(seq);
        }
        // the cycle has period 15 and visits 1
        assert!(seen.iter().any(|&s| s == 1));
        assert_eq!(seen[0], seen[15]);
        assert_ne!(seen[0], seen[1]);
    }

    #[test]
    fn payload_reassembles_exactly() {
        let mut ddp = DdpPacketizer::new();
        let frame: Vec<u8> = (0..6144u32).map(|i| (i % 251) as u8).collect();
        let packets = ddp.packetize(&frame);
        let mut out = Vec::new();
        for pkt in &packets {
            out.extend_from_slice(&pkt[HEADER_LEN..]);
        }
        assert_eq!(out, frame);
        let total: usize = packets.iter().map(|p| p.len() - HEADER_LEN).sum();
        assert_eq!(total, 6144);
    }

    #[test]
    fn exact_multiple_payload_has_no_empty_tail() {
        let mut ddp = DdpPacketizer::new();
        let frame = vec![1u8; MAX_DATALEN * 2];
        let packets = ddp.packetize(&frame);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1][0], 0x41);
        assert_eq!(packets[1].len() - HEADER_LEN, MAX_DATALEN);
        assert_eq!(DdpPacketizer::packet_count(MAX_DATALEN * 2), 2);
        assert_eq!(DdpPacketizer::packet_count(MAX_DATALEN * 2 + 1), 3);
    }
}
