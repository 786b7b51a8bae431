//! Named shared-memory frame slots.
//!
//! A slot is a file-backed memory map holding one frame plus metadata:
//! a fixed 128-byte header, the pixel blob, and a trailing sentinel
//! byte. Some shared-memory stacks truncate a byte blob at the first
//! trailing zero, so the writer appends a non-zero sentinel after the
//! payload and the reader validates and strips it.
//!
//! Slots are single-writer / single-reader by convention: the cast
//! writes frames, the viewer (or a cast, for bus slots) reads them and
//! writes control flags back through the `flags` field.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

const MAGIC: u32 = 0x4C43_534C; // "LCSL"
const VERSION: u16 = 1;
const HEADER_LEN: usize = 128;
const SENTINEL: u8 = 0xA5;
const TITLE_LEN: usize = 64;

// Header offsets
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_FLAGS: usize = 6;
const OFF_WIDTH: usize = 8;
const OFF_HEIGHT: usize = 12;
const OFF_CHANNELS: usize = 16;
const OFF_FRAME_LEN: usize = 20;
const OFF_SEQ: usize = 24;
const OFF_TS: usize = 32;
const OFF_FPS: usize = 40;
const OFF_GRID: usize = 44;
const OFF_TILE_X: usize = 45;
const OFF_TILE_Y: usize = 46;
const OFF_TITLE: usize = 48;

/// Reader-set control bits, polled by the writer between frames.
pub const FLAG_STOP: u16 = 0x0001;
pub const FLAG_PREVIEW_OFF: u16 = 0x0002;
pub const FLAG_TEXT_OFF: u16 = 0x0004;

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("slot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a ledcast slot file: {0}")]
    BadMagic(PathBuf),

    #[error("frame of {len} bytes exceeds slot capacity {capacity}")]
    FrameTooLarge { len: usize, capacity: usize },
}

/// One frame read out of a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotFrame {
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    pub ts_millis: u64,
    pub data: Vec<u8>,
}

/// A named inter-process frame cell.
pub struct FrameSlot {
    map: MmapMut,
    capacity: usize,
    path: PathBuf,
}

impl FrameSlot {
    /// Create (or recreate) a slot sized for `width x height` RGB frames.
    pub fn create(path: &Path, width: u32, height: u32) -> Result<Self, SlotError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let capacity = width as usize * height as usize * crate::PIXEL_BYTES;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((HEADER_LEN + capacity + 1) as u64)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut slot = Self {
            map,
            capacity,
            path: path.to_path_buf(),
        };
        slot.put_u32(OFF_MAGIC, MAGIC);
        slot.put_u16(OFF_VERSION, VERSION);
        slot.put_u32(OFF_WIDTH, width);
        slot.put_u32(OFF_HEIGHT, height);
        slot.put_u32(OFF_CHANNELS, crate::PIXEL_BYTES as u32);
        Ok(slot)
    }

    /// Attach to an existing slot.
    pub fn open(path: &Path) -> Result<Self, SlotError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let map = unsafe { MmapMut::map_mut(&file)? };
        if len < HEADER_LEN + 1 || u32::from_le_bytes(map[0..4].try_into().unwrap()) != MAGIC {
            return Err(SlotError::BadMagic(path.to_path_buf()));
        }
        Ok(Self {
            capacity: len - HEADER_LEN - 1,
            map,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn width(&self) -> u32 {
        self.get_u32(OFF_WIDTH)
    }

    pub fn height(&self) -> u32 {
        self.get_u32(OFF_HEIGHT)
    }

    pub fn ts_millis(&self) -> u64 {
        self.get_u64(OFF_TS)
    }

    /// Write one frame. `ts_millis` is the producer's wall clock; the
    /// consumer uses it for staleness detection.
    pub fn put_frame(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        seq: u64,
        ts_millis: u64,
    ) -> Result<(), SlotError> {
        if pixels.len() > self.capacity {
            return Err(SlotError::FrameTooLarge {
                len: pixels.len(),
                capacity: self.capacity,
            });
        }
        self.map[HEADER_LEN..HEADER_LEN + pixels.len()].copy_from_slice(pixels);
        self.map[HEADER_LEN + pixels.len()] = SENTINEL;
        self.put_u32(OFF_WIDTH, width);
        self.put_u32(OFF_HEIGHT, height);
        self.put_u64(OFF_SEQ, seq);
        self.put_u64(OFF_TS, ts_millis);
        // Length last: a reader that sees the new length also sees the data.
        self.put_u32(OFF_FRAME_LEN, pixels.len() as u32);
        Ok(())
    }

    /// Read the current frame, stripping the sentinel. Returns `None`
    /// when no frame has been written yet or the cell looks torn.
    pub fn get_frame(&self) -> Option<SlotFrame> {
        let len = self.get_u32(OFF_FRAME_LEN) as usize;
        if len == 0 || len > self.capacity {
            return None;
        }
        if self.map[HEADER_LEN + len] != SENTINEL {
            return None;
        }
        Some(SlotFrame {
            width: self.get_u32(OFF_WIDTH),
            height: self.get_u32(OFF_HEIGHT),
            seq: self.get_u64(OFF_SEQ),
            ts_millis: self.get_u64(OFF_TS),
            data: self.map[HEADER_LEN..HEADER_LEN + len].to_vec(),
        })
    }

    /// Writer-side metadata shown by the viewer.
    pub fn set_meta(&mut self, title: &str, fps: u32, grid: bool, tile_x: u8, tile_y: u8) {
        let mut buf = [0u8; TITLE_LEN];
        for (i, b) in title.bytes().take(TITLE_LEN - 1).enumerate() {
            buf[i] = b;
        }
        self.map[OFF_TITLE..OFF_TITLE + TITLE_LEN].copy_from_slice(&buf);
        self.put_u32(OFF_FPS, fps);
        self.map[OFF_GRID] = grid as u8;
        self.map[OFF_TILE_X] = tile_x;
        self.map[OFF_TILE_Y] = tile_y;
    }

    pub fn title(&self) -> String {
        let raw = &self.map[OFF_TITLE..OFF_TITLE + TITLE_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(TITLE_LEN);
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    pub fn fps(&self) -> u32 {
        self.get_u32(OFF_FPS)
    }

    pub fn grid(&self) -> (bool, u8, u8) {
        (
            self.map[OFF_GRID] != 0,
            self.map[OFF_TILE_X],
            self.map[OFF_TILE_Y],
        )
    }

    pub fn flags(&self) -> u16 {
        self.get_u16(OFF_FLAGS)
    }

    pub fn set_flag(&mut self, flag: u16) {
        let flags = self.flags() | flag;
        self.put_u16(OFF_FLAGS, flags);
    }

    /// Read-and-clear a flag; returns whether it was set.
    pub fn take_flag(&mut self, flag: u16) -> bool {
        let flags = self.flags();
        if flags & flag != 0 {
            self.put_u16(OFF_FLAGS, flags & !flag);
            true
        } else {
            false
        }
    }

    /// Unlink the backing file.
    pub fn remove(self) -> Result<(), SlotError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }

    fn get_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes(self.map[off..off + 2].try_into().unwrap())
    }

    fn get_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes(self.map[off..off + 4].try_into().unwrap())
    }

    fn get_u64(&self, off: usize) -> u64 {
        u64::from_le_bytes(self.map[off..off + 8].try_into().unwrap())
    }

    fn put_u16(&mut self, off: usize, v: u16) {
        self.map[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        self.map[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        self.map[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }
}

/// Directory holding all slot files for this machine.
pub fn runtime_dir() -> PathBuf {
    match std::env::var_os("LEDCAST_RUNTIME_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => std::env::temp_dir().join("ledcast"),
    }
}

/// Canonical path of a named slot.
pub fn slot_path(name: &str) -> PathBuf {
    runtime_dir().join(format!("{name}.slot"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("lc-slot-test-{}-{}.slot", std::process::id(), name))
    }

    #[test]
    fn roundtrip_strips_sentinel() {
        let path = test_path("roundtrip");
        let mut slot = FrameSlot::create(&path, 4, 2).unwrap();
        let pixels: Vec<u8> = (0..24).collect();
        slot.put_frame(&pixels, 4, 2, 3, 1000).unwrap();

        let reader = FrameSlot::open(&path).unwrap();
        let frame = reader.get_frame().unwrap();
        assert_eq!(frame.data, pixels);
        assert_eq!(frame.width, 4);
        assert_eq!(frame.height, 2);
        assert_eq!(frame.seq, 3);
        assert_eq!(frame.ts_millis, 1000);
        slot.remove().unwrap();
    }

    #[test]
    fn empty_slot_yields_no_frame() {
        let path = test_path("empty");
        let slot = FrameSlot::create(&path, 4, 4).unwrap();
        assert!(slot.get_frame().is_none());
        slot.remove().unwrap();
    }

    #[test]
    fn oversized_frame_rejected() {
        let path = test_path("oversize");
        let mut slot = FrameSlot::create(&path, 2, 2).unwrap();
        let err = slot.put_frame(&[0u8; 13], 2, 2, 0, 0).unwrap_err();
        assert!(matches!(err, SlotError::FrameTooLarge { len: 13, .. }));
        slot.remove().unwrap();
    }

    #[test]
    fn flags_set_and_take_across_handles() {
        let path = test_path("flags");
        let mut writer = FrameSlot::create(&path, 2, 2).unwrap();
        let mut reader = FrameSlot::open(&path).unwrap();
        reader.set_flag(FLAG_STOP);
        assert!(writer.take_flag(FLAG_STOP));
        assert!(!writer.take_flag(FLAG_STOP));
        writer.remove().unwrap();
    }

    #[test]
    fn meta_roundtrip() {
        let path = test_path("meta");
        let mut slot = FrameSlot::create(&path, 8, 8).unwrap();
        slot.set_meta("castA desktop", 25, true, 2, 1);
        let reader = FrameSlot::open(&path).unwrap();
        assert_eq!(reader.title(), "castA desktop");
        assert_eq!(reader.fps(), 25);
        assert_eq!(reader.grid(), (true, 2, 1));
        slot.remove().unwrap();
    }
}
