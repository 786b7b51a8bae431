//! Virtual-matrix tile splitter.
//!
//! A frame sized `scale_w*tiles_x x scale_h*tiles_y` is cut into a
//! row-major list of `tiles_x*tiles_y` sub-frames; tile `i` drives
//! `destinations[i]`.

use lc_common::{CastError, CastResult};

use crate::frame::Frame;

/// Split into a row-major grid of equally sized sub-frames. A 1x1 grid
/// is a pass-through.
pub fn split_grid(frame: &Frame, tiles_x: u32, tiles_y: u32) -> CastResult<Vec<Frame>> {
    if tiles_x == 0 || tiles_y == 0 {
        return Err(CastError::BadConfig("tile grid must be at least 1x1".into()));
    }
    if tiles_x == 1 && tiles_y == 1 {
        return Ok(vec![frame.clone()]);
    }
    if frame.width % tiles_x != 0 || frame.height % tiles_y != 0 {
        return Err(CastError::BadConfig(format!(
            "frame {}x{} not divisible into a {tiles_x}x{tiles_y} grid",
            frame.width, frame.height
        )));
    }

    let sub_w = (frame.width / tiles_x) as usize;
    let sub_h = (frame.height / tiles_y) as usize;
    let row_len = frame.width as usize * 3;

    let mut tiles = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y as usize {
        for tx in 0..tiles_x as usize {
            let mut data = Vec::with_capacity(sub_w * sub_h * 3);
            for row in 0..sub_h {
                let y = ty * sub_h + row;
                let start = y * row_len + tx * sub_w * 3;
                data.extend_from_slice(&frame.data[start..start + sub_w * 3]);
            }
            let mut tile = Frame::from_rgb(sub_w as u32, sub_h as u32, data)?;
            tile.seq = frame.seq;
            tiles.push(tile);
        }
    }
    Ok(tiles)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reassemble a row-major tile list; inverse of `split_grid`.
    fn concat_grid(tiles: &[Frame], tiles_x: u32, tiles_y: u32) -> Frame {
        let sub_w = tiles[0].width as usize;
        let sub_h = tiles[0].height as usize;
        let width = sub_w * tiles_x as usize;
        let mut data = Vec::with_capacity(width * sub_h * tiles_y as usize * 3);
        for ty in 0..tiles_y as usize {
            for row in 0..sub_h {
                for tx in 0..tiles_x as usize {
                    let tile = &tiles[ty * tiles_x as usize + tx];
                    data.extend_from_slice(&tile.data[row * sub_w * 3..(row + 1) * sub_w * 3]);
                }
            }
        }
        Frame::from_rgb(width as u32, (sub_h * tiles_y as usize) as u32, data).unwrap()
    }

    fn numbered(w: u32, h: u32) -> Frame {
        let data: Vec<u8> = (0..w * h * 3).map(|i| (i % 251) as u8).collect();
        Frame::from_rgb(w, h, data).unwrap()
    }

    #[test]
    fn split_concat_roundtrip() {
        let frame = numbered(64, 32);
        let tiles = split_grid(&frame, 2, 2).unwrap();
        assert_eq!(tiles.len(), 4);
        assert!(tiles.iter().all(|t| t.width == 32 && t.height == 16));
        let rebuilt = concat_grid(&tiles, 2, 2);
        assert_eq!(rebuilt.data, frame.data);
    }

    #[test]
    fn two_by_one_left_right() {
        // left half red, right half blue
        let mut data = Vec::new();
        for _ in 0..32 {
            for x in 0..64 {
                if x < 32 {
                    data.extend_from_slice(&[255, 0, 0]);
                } else {
                    data.extend_from_slice(&[0, 0, 255]);
                }
            }
        }
        let frame = Frame::from_rgb(64, 32, data).unwrap();
        let tiles = split_grid(&frame, 2, 1).unwrap();
        assert!(tiles[0].data.chunks(3).all(|p| p == [255, 0, 0]));
        assert!(tiles[1].data.chunks(3).all(|p| p == [0, 0, 255]));
    }

    #[test]
    fn single_tile_passes_through() {
        let frame = numbered(8, 8);
        let tiles = split_grid(&frame, 1, 1).unwrap();
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].data, frame.data);
    }

    #[test]
    fn indivisible_grid_rejected() {
        let frame = numbered(10, 10);
        assert!(split_grid(&frame, 3, 1).is_err());
    }
}
