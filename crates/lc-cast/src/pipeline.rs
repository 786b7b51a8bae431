//! The per-frame image processing chain.
//!
//! Fixed order: resize, gamma LUT, optional automatic
//! brightness/contrast, the filter set (each skipped at zero), flip.
//! Every step is pure with respect to the frame; nothing is carried
//! across frames.

use image::imageops::FilterType;
use image::RgbImage;

use lc_common::config::CastSettings;
use lc_common::{CastError, CastResult};

use crate::frame::Frame;

/// Filter knobs lifted out of the cast settings; values of 0 skip a
/// filter entirely.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub gamma: f32,
    pub auto_bright: bool,
    pub clip_hist_percent: f32,
    pub saturation: u32,
    pub brightness: u32,
    pub contrast: u32,
    pub sharpen: u32,
    pub balance_r: u32,
    pub balance_g: u32,
    pub balance_b: u32,
    pub flip: bool,
    pub flip_vh: u32,
}

impl FilterSettings {
    /// An identity chain: resize only.
    pub fn identity() -> Self {
        Self {
            gamma: 1.0,
            auto_bright: false,
            clip_hist_percent: 25.0,
            saturation: 0,
            brightness: 0,
            contrast: 0,
            sharpen: 0,
            balance_r: 0,
            balance_g: 0,
            balance_b: 0,
            flip: false,
            flip_vh: 0,
        }
    }

    fn any_filter(&self) -> bool {
        self.saturation != 0
            || self.brightness != 0
            || self.contrast != 0
            || self.sharpen != 0
            || self.balance_r != 0
            || self.balance_g != 0
            || self.balance_b != 0
    }
}

impl From<&CastSettings> for FilterSettings {
    fn from(s: &CastSettings) -> Self {
        Self {
            gamma: s.gamma,
            auto_bright: s.auto_bright,
            clip_hist_percent: s.clip_hist_percent,
            saturation: s.saturation,
            brightness: s.brightness,
            contrast: s.contrast,
            sharpen: s.sharpen,
            balance_r: s.balance_r,
            balance_g: s.balance_g,
            balance_b: s.balance_b,
            flip: s.flip,
            flip_vh: s.flip_vh,
        }
    }
}

/// Run the whole chain, producing a `width x height` frame.
pub fn process(frame: Frame, width: u32, height: u32, f: &FilterSettings) -> CastResult<Frame> {
    let mut frame = resize(frame, width, height)?;

    if (f.gamma - 1.0).abs() > f32::EPSILON {
        apply_lut(&mut frame.data, &gamma_table(f.gamma));
    }
    if f.auto_bright {
        auto_brightness_contrast(&mut frame.data, f.clip_hist_percent);
    }
    if f.any_filter() {
        // The knob value is the blend weight itself; weights above ~2
        // drive channels into clipping, which is the expected look on
        // an LED matrix.
        if f.saturation != 0 {
            filter_saturation(&mut frame.data, f.saturation as f32);
        }
        if f.brightness != 0 {
            filter_brightness(&mut frame.data, f.brightness as f32);
        }
        if f.contrast != 0 {
            filter_contrast(&mut frame.data, f.contrast as f32);
        }
        if f.sharpen != 0 {
            frame = filter_sharpen(frame, f.sharpen as f32)?;
        }
        if f.balance_r != 0 || f.balance_g != 0 || f.balance_b != 0 {
            filter_balance(&mut frame.data, [f.balance_r, f.balance_g, f.balance_b]);
        }
    }
    if f.flip {
        flip(&mut frame, f.flip_vh);
    }
    Ok(frame)
}

/// Area-style resize to the target dimensions.
pub fn resize(frame: Frame, width: u32, height: u32) -> CastResult<Frame> {
    if frame.width == width && frame.height == height {
        return Ok(frame);
    }
    let seq = frame.seq;
    let img = to_image(frame)?;
    let resized = image::imageops::resize(&img, width, height, FilterType::Triangle);
    let mut out = Frame::from_rgb(width, height, resized.into_raw())?;
    out.seq = seq;
    Ok(out)
}

/// Nearest-neighbor pixelation: downsample to the pixel grid and blow
/// back up, used for the preview's pixel-art rendering.
pub fn pixel_art(frame: &Frame, grid_w: u32, grid_h: u32) -> CastResult<Frame> {
    let img = to_image(frame.clone())?;
    let small = image::imageops::resize(&img, grid_w.max(1), grid_h.max(1), FilterType::Nearest);
    let big = image::imageops::resize(&small, frame.width, frame.height, FilterType::Nearest);
    let mut out = Frame::from_rgb(frame.width, frame.height, big.into_raw())?;
    out.seq = frame.seq;
    Ok(out)
}

fn to_image(frame: Frame) -> CastResult<RgbImage> {
    let (w, h) = (frame.width, frame.height);
    RgbImage::from_raw(w, h, frame.data)
        .ok_or_else(|| CastError::Internal(anyhow::anyhow!("frame buffer mismatch for {w}x{h}")))
}

/// 256-entry inverse-gamma lookup table.
pub fn gamma_table(gamma: f32) -> [u8; 256] {
    let inverse = 1.0 / gamma.clamp(0.01, 4.0);
    let mut table = [0u8; 256];
    for (i, slot) in table.iter_mut().enumerate() {
        *slot = ((i as f32 / 255.0).powf(inverse) * 255.0).round() as u8;
    }
    table
}

fn apply_lut(data: &mut [u8], table: &[u8; 256]) {
    for b in data.iter_mut() {
        *b = table[*b as usize];
    }
}

/// Histogram-clip automatic brightness/contrast: locate the grayscale
/// range that survives clipping `clip_percent` of mass from each tail,
/// then stretch it over 0..255.
pub fn auto_brightness_contrast(data: &mut [u8], clip_percent: f32) {
    let mut hist = [0u64; 256];
    for px in data.chunks_exact(3) {
        let gray = luminance(px[0], px[1], px[2]);
        hist[gray as usize] += 1;
    }
    let total: u64 = hist.iter().sum();
    if total == 0 {
        return;
    }
    let clip = total as f64 * clip_percent as f64 / 100.0 / 2.0;

    let mut acc = 0u64;
    let mut min_gray = 0usize;
    while min_gray < 255 && ((acc + hist[min_gray]) as f64) < clip {
        acc += hist[min_gray];
        min_gray += 1;
    }
    let mut acc = 0u64;
    let mut max_gray = 255usize;
    while max_gray > min_gray && ((acc + hist[max_gray]) as f64) < clip {
        acc += hist[max_gray];
        max_gray -= 1;
    }

    let range = (max_gray - min_gray).max(1) as f32;
    let alpha = 255.0 / range;
    let beta = -(min_gray as f32) * alpha;
    for b in data.iter_mut() {
        *b = (*b as f32 * alpha + beta).clamp(0.0, 255.0) as u8;
    }
}

fn luminance(r: u8, g: u8, b: u8) -> u8 {
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

/// Blend the HSV saturation channel with the pixel's grayscale value.
fn filter_saturation(data: &mut [u8], alpha: f32) {
    for px in data.chunks_exact_mut(3) {
        let gray = luminance(px[0], px[1], px[2]) as f32 / 255.0;
        let (h, s, v) = rgb_to_hsv(px[0], px[1], px[2]);
        let s2 = (s * alpha + gray * (1.0 - alpha)).clamp(0.0, 1.0);
        let (r, g, b) = hsv_to_rgb(h, s2, v);
        px[0] = r;
        px[1] = g;
        px[2] = b;
    }
}

/// Blend with black: scales all channels by the raw weight.
fn filter_brightness(data: &mut [u8], alpha: f32) {
    for b in data.iter_mut() {
        *b = (*b as f32 * alpha).clamp(0.0, 255.0) as u8;
    }
}

/// Blend with the mean-gray plane: pushes values away from the mean.
fn filter_contrast(data: &mut [u8], alpha: f32) {
    let mean = data.iter().map(|&b| b as u64).sum::<u64>() as f32 / data.len().max(1) as f32;
    for b in data.iter_mut() {
        *b = (*b as f32 * alpha + mean * (1.0 - alpha)).clamp(0.0, 255.0) as u8;
    }
}

/// Laplacian sharpen: kernel [[0,-1,0],[-1,4,-1],[0,-1,0]] * amount
/// with the center bumped by one, edges clamped.
fn filter_sharpen(frame: Frame, amount: f32) -> CastResult<Frame> {
    let (w, h) = (frame.width as i64, frame.height as i64);
    let src = frame.data.clone();
    let mut out = frame;
    let sample = |x: i64, y: i64, c: usize| -> f32 {
        let x = x.clamp(0, w - 1);
        let y = y.clamp(0, h - 1);
        src[(y * w + x) as usize * 3 + c] as f32
    };
    for y in 0..h {
        for x in 0..w {
            for c in 0..3 {
                let center = sample(x, y, c);
                let laplacian = 4.0 * center
                    - sample(x - 1, y, c)
                    - sample(x + 1, y, c)
                    - sample(x, y - 1, c)
                    - sample(x, y + 1, c);
                let v = center + amount * laplacian;
                out.data[(y * w + x) as usize * 3 + c] = v.clamp(0.0, 255.0) as u8;
            }
        }
    }
    Ok(out)
}

/// Per-channel gain; 128 is unity, 0 means "leave alone".
fn filter_balance(data: &mut [u8], balance: [u32; 3]) {
    let gain: Vec<f32> = balance
        .iter()
        .map(|&v| if v == 0 { 1.0 } else { v as f32 / 128.0 })
        .collect();
    for px in data.chunks_exact_mut(3) {
        for c in 0..3 {
            px[c] = (px[c] as f32 * gain[c]).clamp(0.0, 255.0) as u8;
        }
    }
}

/// `flip_vh` 0 flips vertically (row order), 1 horizontally.
fn flip(frame: &mut Frame, flip_vh: u32) {
    let row_len = frame.width as usize * 3;
    if flip_vh == 0 {
        let rows: Vec<&[u8]> = frame.data.chunks_exact(row_len).rev().collect();
        frame.data = rows.concat();
    } else {
        for row in frame.data.chunks_exact_mut(row_len) {
            let mut pixels: Vec<[u8; 3]> = row
                .chunks_exact(3)
                .map(|p| [p[0], p[1], p[2]])
                .collect();
            pixels.reverse();
            for (dst, src) in row.chunks_exact_mut(3).zip(pixels) {
                dst.copy_from_slice(&src);
            }
        }
    }
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let (r, g, b) = (r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta) % 6.0)
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}
