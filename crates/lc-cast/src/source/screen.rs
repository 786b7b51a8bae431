//! Desktop, area and window capture via `xcap`.

use xcap::{Monitor, Window};

use lc_common::{CastError, CastResult};

use crate::frame::Frame;

use super::FrameSource;

/// Whole-monitor or cropped-region capture.
pub struct ScreenSource {
    monitor: Monitor,
    region: Option<(u32, u32, u32, u32)>,
    closed: bool,
}

impl ScreenSource {
    pub fn open(index: usize, region: Option<(u32, u32, u32, u32)>) -> CastResult<Self> {
        let monitors = Monitor::all()
            .map_err(|e| CastError::Source(format!("monitor enumeration failed: {e}")))?;
        if monitors.is_empty() {
            return Err(CastError::Source("no monitors found".into()));
        }
        let count = monitors.len();
        let monitor = monitors
            .into_iter()
            .nth(index)
            .ok_or_else(|| CastError::Source(format!("monitor {index} not found ({count} available)")))?;

        if let Some((x, y, w, h)) = region {
            let mw = monitor.width().unwrap_or(0);
            let mh = monitor.height().unwrap_or(0);
            if x + w > mw || y + h > mh {
                return Err(CastError::BadConfig(format!(
                    "area {x},{y} {w}x{h} exceeds monitor {mw}x{mh}"
                )));
            }
        }
        tracing::info!(index, ?region, "screen capture bound");
        Ok(Self {
            monitor,
            region,
            closed: false,
        })
    }
}

impl FrameSource for ScreenSource {
    fn next_frame(&mut self) -> CastResult<Option<Frame>> {
        if self.closed {
            return Ok(None);
        }
        let image = self
            .monitor
            .capture_image()
            .map_err(|e| CastError::Source(format!("screen grab failed: {e}")))?;
        let frame = rgba_to_frame(image.width(), image.height(), image.into_raw())?;
        match self.region {
            Some((x, y, w, h)) => Ok(Some(crop(&frame, x, y, w, h)?)),
            None => Ok(Some(frame)),
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Capture one window's content by title substring.
pub struct WindowSource {
    window: Window,
    title: String,
    closed: bool,
}

impl WindowSource {
    pub fn open(title: &str) -> CastResult<Self> {
        let windows =
            Window::all().map_err(|e| CastError::Source(format!("window enumeration failed: {e}")))?;
        let needle = title.to_lowercase();
        let window = windows
            .into_iter()
            .find(|w| {
                w.title()
                    .map(|t| t.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .ok_or_else(|| CastError::Source(format!("no window matching '{title}'")))?;
        tracing::info!(title, "window capture bound");
        Ok(Self {
            window,
            title: title.to_string(),
            closed: false,
        })
    }
}

impl FrameSource for WindowSource {
    fn next_frame(&mut self) -> CastResult<Option<Frame>> {
        if self.closed {
            return Ok(None);
        }
        let image = self
            .window
            .capture_image()
            .map_err(|e| CastError::Source(format!("window '{}' grab failed: {e}", self.title)))?;
        Ok(Some(rgba_to_frame(
            image.width(),
            image.height(),
            image.into_raw(),
        )?))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Drop the alpha channel from a captured RGBA buffer.
fn rgba_to_frame(width: u32, height: u32, rgba: Vec<u8>) -> CastResult<Frame> {
    let pixel_count = width as usize * height as usize;
    if rgba.len() < pixel_count * 4 {
        return Err(CastError::Source(format!(
            "short capture buffer: {} bytes for {width}x{height}",
            rgba.len()
        )));
    }
    let mut rgb = Vec::with_capacity(pixel_count * 3);
    for px in rgba.chunks_exact(4).take(pixel_count) {
        rgb.extend_from_slice(&px[..3]);
    }
    Frame::from_rgb(width, height, rgb)
}

fn crop(frame: &Frame, x: u32, y: u32, w: u32, h: u32) -> CastResult<Frame> {
    let w = w.min(frame.width.saturating_sub(x));
    let h = h.min(frame.height.saturating_sub(y));
    if w == 0 || h == 0 {
        return Err(CastError::Source("crop region outside frame".into()));
    }
    let row_len = frame.width as usize * 3;
    let mut data = Vec::with_capacity(w as usize * h as usize * 3);
    for row in y..y + h {
        let start = row as usize * row_len + x as usize * 3;
        data.extend_from_slice(&frame.data[start..start + w as usize * 3]);
    }
    Frame::from_rgb(w, h, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_conversion_drops_alpha() {
        let rgba = vec![1, 2, 3, 255, 4, 5, 6, 255];
        let frame = rgba_to_frame(2, 1, rgba).unwrap();
        assert_eq!(frame.data, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn crop_extracts_region() {
        // 4x2 frame with per-pixel markers
        let data: Vec<u8> = (0..4 * 2).flat_map(|i| [i as u8, 0, 0]).collect();
        let frame = Frame::from_rgb(4, 2, data).unwrap();
        let cropped = crop(&frame, 1, 0, 2, 2).unwrap();
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 2);
        let reds: Vec<u8> = cropped.data.chunks(3).map(|p| p[0]).collect();
        assert_eq!(reds, vec![1, 2, 5, 6]);
    }

    #[test]
    fn crop_clamps_to_frame() {
        let frame = Frame::solid(4, 4, [9, 9, 9]);
        let cropped = crop(&frame, 2, 2, 10, 10).unwrap();
        assert_eq!(cropped.width, 2);
        assert_eq!(cropped.height, 2);
        assert!(crop(&frame, 4, 4, 1, 1).is_err());
    }
}
