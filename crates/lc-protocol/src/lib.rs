//! # lc-protocol
//!
//! Wire contracts shared by the ledcast processes: the UDP lighting
//! codecs (DDP, E1.31/sACN, Art-Net), the shared-memory frame slot
//! format used by the preview viewer and the frame bus, and the frame
//! bus TCP request/response protocol.

pub mod artnet;
pub mod bus;
pub mod ddp;
pub mod e131;
pub mod slot;

pub use slot::{FrameSlot, SlotError, SlotFrame};

/// Default UDP port for DDP (WLED default).
pub const DDP_PORT: u16 = 4048;

/// Default UDP port for E1.31/sACN.
pub const E131_PORT: u16 = 5568;

/// Default UDP port for Art-Net.
pub const ARTNET_PORT: u16 = 6454;

/// Default TCP port of the shared frame bus registry.
pub const BUS_PORT: u16 = 50000;

/// Bytes per pixel on the wire (RGB24 internal format).
pub const PIXEL_BYTES: usize = 3;
