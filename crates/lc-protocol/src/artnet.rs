//! Art-Net (v4) ArtDmx packetizer.
//!
//! Chunks pixel channels at up to 512 per universe, 15-bit port
//! address counted up from the configured base universe.

use bytes::{BufMut, BytesMut};

const ARTNET_ID: [u8; 8] = *b"Art-Net\0";
/// ArtDmx opcode, little-endian on the wire.
const OP_DMX: u16 = 0x5000;
const PROTOCOL_VERSION: u16 = 14;
const HEADER_LEN: usize = 18;
const MAX_CHANNELS: usize = 512;

/// Configuration for an Art-Net sender.
#[derive(Debug, Clone)]
pub struct ArtnetConfig {
    /// Base 15-bit port address.
    pub universe: u16,
    /// Pixel budget; 0 means "whatever the frame carries".
    pub pixel_count: usize,
    /// Channels per universe, at most 512.
    pub universe_size: usize,
    /// Channel offset of the first pixel within the first universe.
    pub channel_offset: usize,
    /// 3 (RGB) or 4 (RGBW, white padded to zero).
    pub channels_per_pixel: usize,
}

impl Default for ArtnetConfig {
    fn default() -> Self {
        Self {
            universe: 0,
            pixel_count: 0,
            universe_size: MAX_CHANNELS,
            channel_offset: 0,
            channels_per_pixel: 3,
        }
    }
}

/// Stateful Art-Net packetizer; only the cycling sequence survives a
/// frame.
#[derive(Debug)]
pub struct ArtnetPacketizer {
    config: ArtnetConfig,
    sequence: u8,
}

impl ArtnetPacketizer {
    pub fn new(config: ArtnetConfig) -> Self {
        Self {
            config,
            sequence: 0,
        }
    }

    pub fn config(&self) -> &ArtnetConfig {
        &self.config
    }

    /// Split one RGB frame into per-universe ArtDmx datagrams.
    pub fn packetize(&mut self, pixels: &[u8]) -> Vec<Vec<u8>> {
        let cpp = self.config.channels_per_pixel;
        let mut px = pixels.len() / 3;
        if self.config.pixel_count > 0 {
            px = px.min(self.config.pixel_count);
        }
        let mut channels = Vec::with_capacity(self.config.channel_offset + px * cpp);
        channels.resize(self.config.channel_offset, 0);
        for p in 0..px {
            channels.extend_from_slice(&pixels[p * 3..p * 3 + 3]);
            if cpp == 4 {
                channels.push(0);
            }
        }

        // Sequence cycles 1..=255; 0 would disable resequencing on the node.
        self.sequence = if self.sequence == u8::MAX {
            1
        } else {
            self.sequence + 1
        };

        let size = self.config.universe_size.clamp(1, MAX_CHANNELS);
        channels
            .chunks(size)
            .enumerate()
            .map(|(i, chunk)| {
                self.encode_packet(self.config.universe.wrapping_add(i as u16), chunk)
            })
            .collect()
    }

    fn encode_packet(&self, port_address: u16, data: &[u8]) -> Vec<u8> {
        // DMX length must be even, 2..=512.
        let padded = data.len() + data.len() % 2;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + padded);
        buf.put_slice(&ARTNET_ID);
        buf.put_u16_le(OP_DMX);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u8(self.sequence);
        buf.put_u8(0); // physical input port
        buf.put_u8((port_address & 0xFF) as u8); // SubUni
        buf.put_u8((port_address >> 8) as u8); // Net
        buf.put_u16(padded as u16);
        buf.put_slice(data);
        if data.len() % 2 == 1 {
            buf.put_u8(0);
        }
        buf.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_chunking() {
        let mut artnet = ArtnetPacketizer::new(ArtnetConfig::default());
        // 200 pixels = 600 channels -> universes 0 (512) and 1 (88)
        let frame = vec![3u8; 200 * 3];
        let packets = artnet.packetize(&frame);
        assert_eq!(packets.len(), 2);
        let pkt = &packets[0];
        assert_eq!(&pkt[0..8], b"Art-Net\0");
        assert_eq!(u16::from_le_bytes([pkt[8], pkt[9]]), 0x5000);
        assert_eq!(u16::from_be_bytes([pkt[10], pkt[11]]), 14);
        assert_eq!(pkt[14], 0); // SubUni of universe 0
        assert_eq!(u16::from_be_bytes([pkt[16], pkt[17]]), 512);
        assert_eq!(packets[1][14], 1);
        assert_eq!(u16::from_be_bytes([packets[1][16], packets[1][17]]), 88);
    }

    #[test]
    fn odd_length_padded_even() {
        let mut artnet = ArtnetPacketizer::new(ArtnetConfig::default());
        let packets = artnet.packetize(&[1, 2, 3]);
        let pkt = &packets[0];
        assert_eq!(u16::from_be_bytes([pkt[16], pkt[17]]), 4);
        assert_eq!(&pkt[HEADER_LEN..], &[1, 2, 3, 0]);
    }

    #[test]
    fn sequence_skips_zero() {
        let mut artnet = ArtnetPacketizer::new(ArtnetConfig::default());
        artnet.sequence = u8::MAX;
        let packets = artnet.packetize(&[0; 3]);
        assert_eq!(packets[0][12], 1);
    }
}
