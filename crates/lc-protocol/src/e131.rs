//! E1.31 (streaming ACN) packetizer.
//!
//! Implements the ANSI E1.31 data packet: ACN root layer, framing layer
//! and DMP layer. Pixel channels are spread over consecutive universes
//! starting at the configured base universe, `universe_size` slots per
//! universe (510 by default, 170 RGB pixels). Deactivation sends a
//! zero-value blackout so fixtures do not hold the last frame.

use bytes::{BufMut, BytesMut};

/// ACN packet identifier, root layer bytes 4..16.
const ACN_PID: [u8; 12] = *b"ASC-E1.17\0\0\0";
/// Root layer vector: E1.31 data.
const VECTOR_ROOT_DATA: u32 = 0x0000_0004;
/// Framing layer vector: DMP wrapper.
const VECTOR_FRAMING_DATA: u32 = 0x0000_0002;
/// DMP layer vector: set property.
const VECTOR_DMP_SET: u8 = 0x02;

const SOURCE_NAME_LEN: usize = 64;
/// Fixed header bytes before the DMX slots (START code included).
const PACKET_OVERHEAD: usize = 126;

/// Configuration for an E1.31 sender, one per destination device.
#[derive(Debug, Clone)]
pub struct E131Config {
    /// Source name advertised in the framing layer (up to 63 chars).
    pub source_name: String,
    /// Base universe; consecutive universes are used for overflow.
    pub universe: u16,
    /// Pixel budget; 0 means "whatever the frame carries".
    pub pixel_count: usize,
    /// sACN priority 0..=200.
    pub priority: u8,
    /// DMX slots per universe, at most 512.
    pub universe_size: usize,
    /// Channel offset of the first pixel within the first universe.
    pub channel_offset: usize,
    /// 3 (RGB) or 4 (RGBW, white padded to zero).
    pub channels_per_pixel: usize,
    /// Send a zero-value frame on deactivation.
    pub blackout: bool,
}

impl Default for E131Config {
    fn default() -> Self {
        Self {
            source_name: "ledcast".to_string(),
            universe: 1,
            pixel_count: 0,
            priority: 100,
            universe_size: 510,
            channel_offset: 0,
            channels_per_pixel: 3,
            blackout: true,
        }
    }
}

/// Stateful E1.31 packetizer; the state is the per-sender CID and the
/// cycling sequence counter.
#[derive(Debug)]
pub struct E131Packetizer {
    config: E131Config,
    cid: [u8; 16],
    sequence: u8,
}

impl E131Packetizer {
    pub fn new(config: E131Config) -> Self {
        // CID derived from the source name so restarts keep a stable id.
        let mut cid = [0u8; 16];
        for (i, b) in config.source_name.bytes().enumerate() {
            cid[i % 16] = cid[i % 16].wrapping_add(b).rotate_left((i % 7) as u32);
        }
        cid[0] |= 1;
        Self {
            config,
            cid,
            sequence: 0,
        }
    }

    pub fn config(&self) -> &E131Config {
        &self.config
    }

    /// Split one RGB frame into per-universe datagrams.
    pub fn packetize(&mut self, pixels: &[u8]) -> Vec<Vec<u8>> {
        let channels = self.channel_data(pixels);
        self.build_packets(&channels)
    }

    /// Zero-value frame covering the same channel span as the last
    /// configuration; used when the sender deactivates.
    pub fn blackout_packets(&mut self, pixel_count: usize) -> Vec<Vec<u8>> {
        let span = self.config.channel_offset + pixel_count * self.config.channels_per_pixel;
        let channels = vec![0u8; span];
        self.build_packets(&channels)
    }

    /// Expand RGB triples into the configured channel layout, honoring
    /// the pixel budget and channel offset.
    fn channel_data(&self, pixels: &[u8]) -> Vec<u8> {
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
        channels
    }

    fn build_packets(&mut self, channels: &[u8]) -> Vec<Vec<u8>> {
        let size = self.config.universe_size.clamp(1, 512);
        self.sequence = self.sequence.wrapping_add(1);
        channels
            .chunks(size)
            .enumerate()
            .map(|(i, slots)| {
                self.encode_packet(self.config.universe.wrapping_add(i as u16), slots)
            })
            .collect()
    }

    fn encode_packet(&self, universe: u16, slots: &[u8]) -> Vec<u8> {
        let total = PACKET_OVERHEAD + slots.len();
        let mut buf = BytesMut::with_capacity(total);

        // Root layer
        buf.put_u16(0x0010); // preamble size
        buf.put_u16(0x0000); // postamble size
        buf.put_slice(&ACN_PID);
        buf.put_u16(flags_and_length(total - 16));
        buf.put_u32(VECTOR_ROOT_DATA);
        buf.put_slice(&self.cid);

        // Framing layer
        buf.put_u16(flags_and_length(total - 38));
        buf.put_u32(VECTOR_FRAMING_DATA);
        let mut name = [0u8; SOURCE_NAME_LEN];
        for (i, b) in self
            .config
            .source_name
            .bytes()
            .take(SOURCE_NAME_LEN - 1)
            .enumerate()
        {
            name[i] = b;
        }
        buf.put_slice(&name);
        buf.put_u8(self.config.priority.min(200));
        buf.put_u16(0x0000); // synchronization address
        buf.put_u8(self.sequence);
        buf.put_u8(0x00); // options
        buf.put_u16(universe);

        // DMP layer
        buf.put_u16(flags_and_length(total - 115));
        buf.put_u8(VECTOR_DMP_SET);
        buf.put_u8(0xA1); // address type & data type
        buf.put_u16(0x0000); // first property address
        buf.put_u16(0x0001); // address increment
        buf.put_u16((slots.len() + 1) as u16); // property value count
        buf.put_u8(0x00); // DMX START code
        buf.put_slice(slots);

        buf.to_vec()
    }
}

/// High nibble 0x7, low 12 bits the PDU length.
fn flags_and_length(len: usize) -> u16 {
    0x7000 | (len as u16 & 0x0FFF)
}
