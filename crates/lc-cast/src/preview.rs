//! Preview mirror: the cast-side writer of a preview slot.
//!
//! Purely observational; publishing never backpressures the sender.
//! The viewer process maps the same slot, renders it in an OS window
//! and writes key-press flags back.

use lc_common::config::CastSettings;
use lc_common::CastResult;
use lc_protocol::slot::{slot_path, FLAG_PREVIEW_OFF, FLAG_STOP, FLAG_TEXT_OFF};
use lc_protocol::FrameSlot;

use crate::frame::Frame;
use crate::pipeline;
use crate::source::queue::now_millis;

/// Viewer requests picked up between frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreviewFlags {
    pub stop: bool,
    pub preview_off: bool,
    pub text_off: bool,
}

pub struct PreviewMirror {
    slot: FrameSlot,
    preview_w: u32,
    preview_h: u32,
    pixel_w: u32,
    pixel_h: u32,
}

impl PreviewMirror {
    /// Allocate the slot for a cast, keyed by the cast name.
    pub fn create(name: &str, settings: &CastSettings, title: &str) -> CastResult<Self> {
        let mut slot = FrameSlot::create(&slot_path(name), settings.preview_w, settings.preview_h)
            .map_err(|e| lc_common::CastError::Internal(e.into()))?;
        slot.set_meta(
            title,
            settings.rate,
            settings.multicast && settings.cast_x * settings.cast_y > 1,
            settings.cast_x as u8,
            settings.cast_y as u8,
        );
        tracing::info!(name, w = settings.preview_w, h = settings.preview_h, "preview slot created");
        Ok(Self {
            slot,
            preview_w: settings.preview_w,
            preview_h: settings.preview_h,
            pixel_w: settings.pixel_w,
            pixel_h: settings.pixel_h,
        })
    }

    /// Publish one processed frame, pixel-art downsampled to the
    /// configured grid and sized for the preview window.
    pub fn publish(&mut self, frame: &Frame) -> CastResult<()> {
        let art = pipeline::pixel_art(frame, self.pixel_w, self.pixel_h)?;
        let sized = pipeline::resize(art, self.preview_w, self.preview_h)?;
        self.slot
            .put_frame(
                &sized.data,
                sized.width,
                sized.height,
                frame.seq,
                now_millis(),
            )
            .map_err(|e| lc_common::CastError::Internal(e.into()))?;
        Ok(())
    }

    /// Collect viewer key-press flags.
    pub fn poll_flags(&mut self) -> PreviewFlags {
        PreviewFlags {
            stop: self.slot.take_flag(FLAG_STOP),
            preview_off: self.slot.take_flag(FLAG_PREVIEW_OFF),
            text_off: self.slot.take_flag(FLAG_TEXT_OFF),
        }
    }

    /// Tear the slot down; the viewer sees the file vanish and exits.
    pub fn destroy(self) {
        if let Err(e) = self.slot.remove() {
            tracing::warn!(error = %e, "preview slot removal failed");
        }
    }
}
