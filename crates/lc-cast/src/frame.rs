//! The frame value type flowing through the cast pipeline.

use lc_common::{CastError, CastResult};

/// One RGB24 frame. Immutable snapshot after capture; `seq` is the
/// per-cast monotonic sequence assigned by the cast loop.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub seq: u64,
    pub data: Vec<u8>,
}

impl Frame {
    /// Wrap raw RGB bytes, validating the `width*height*3` contract.
    pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> CastResult<Self> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(CastError::Source(format!(
                "frame byte count {} does not match {width}x{height} rgb ({expected})",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            seq: 0,
            data,
        })
    }

    /// A single-color frame.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let mut data = Vec::with_capacity(width as usize * height as usize * 3);
        for _ in 0..width as usize * height as usize {
            data.extend_from_slice(&rgb);
        }
        Self {
            width,
            height,
            seq: 0,
            data,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_contract() {
        assert!(Frame::from_rgb(4, 4, vec![0; 48]).is_ok());
        assert!(Frame::from_rgb(4, 4, vec![0; 47]).is_err());
    }

    #[test]
    fn solid_fill() {
        let frame = Frame::solid(2, 2, [1, 2, 3]);
        assert_eq!(frame.data, vec![1, 2, 3, 1, 2, 3, 1, 2, 3, 1, 2, 3]);
    }
}
