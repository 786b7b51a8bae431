//! Out-of-band cast actions.
//!
//! Actions arrive as `name||verb||params||ts` strings on a shared todo
//! list and are applied between frames, on the cast thread, at most
//! once each. Parsing and the shared-list bookkeeping live here; the
//! verb effects are applied by the cast loop, which owns the state
//! they mutate.

use serde_json::{json, Value};

use base64::Engine;

use crate::frame::Frame;

/// Field separator of the wire form.
pub const SEP: &str = "||";

/// Verbs a cast understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Stop,
    Shot,
    Info,
    Reset,
    Host,
    Multicast,
    OpenPreview,
    ClosePreview,
    StopText,
}

impl std::str::FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "shot" => Ok(Self::Shot),
            "info" => Ok(Self::Info),
            "reset" => Ok(Self::Reset),
            "host" => Ok(Self::Host),
            "multicast" => Ok(Self::Multicast),
            "open-preview" => Ok(Self::OpenPreview),
            "close-preview" => Ok(Self::ClosePreview),
            "stop-text" => Ok(Self::StopText),
            other => Err(format!("unknown action verb '{other}'")),
        }
    }
}

/// One parsed todo entry. The verb is kept as text until application
/// so unknown verbs can be logged with their original spelling.
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    pub cast: String,
    pub verb: String,
    pub params: String,
    pub ts: String,
}

impl Action {
    /// Wire form, the inverse of `parse`.
    pub fn encode(cast: &str, verb: &str, params: &str, ts: &str) -> String {
        format!("{cast}{SEP}{verb}{SEP}{params}{SEP}{ts}")
    }
}

/// Parse `name||verb||params||ts`; params may themselves contain `||`
/// so only the first three separators split.
pub fn parse(entry: &str) -> Option<Action> {
    let mut parts = entry.splitn(4, SEP);
    let cast = parts.next()?.trim();
    let verb = parts.next()?.trim();
    let params = parts.next()?.trim();
    let ts = parts.next()?.trim();
    if cast.is_empty() || verb.is_empty() {
        return None;
    }
    Some(Action {
        cast: cast.to_string(),
        verb: verb.to_string(),
        params: params.to_string(),
        ts: ts.to_string(),
    })
}

/// Take the entries addressed to `me` out of the shared list.
///
/// Malformed entries and entries targeting names not in `live` are
/// removed on sight; entries for other live casts stay queued.
pub fn drain_for(todo: &mut Vec<String>, me: &str, live: &[String]) -> Vec<Action> {
    let mut mine = Vec::new();
    todo.retain(|entry| match parse(entry) {
        Some(action) if action.cast == me => {
            mine.push(action);
            false
        }
        Some(action) if !live.iter().any(|n| n == &action.cast) => {
            tracing::warn!(cast = %action.cast, "dropping action for unknown cast");
            false
        }
        Some(_) => true,
        None => {
            tracing::error!(entry = %entry, "malformed action entry removed");
            false
        }
    });
    mine
}

/// Truthiness of the `info` image parameter: only an explicit yes
/// includes the frame.
pub fn params_truthy(params: &str) -> bool {
    matches!(
        params.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Base64 JPEG of a frame for the `info` reply.
pub fn frame_to_base64_jpeg(frame: &Frame) -> Option<String> {
    let img = image::RgbImage::from_raw(frame.width, frame.height, frame.data.clone())?;
    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg).ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(buf.into_inner()))
}

/// Fields the `info` verb publishes on the reply channel.
pub struct InfoContext<'a> {
    pub name: &'a str,
    pub kind: &'a str,
    pub source: &'a str,
    pub protocol: &'a str,
    pub preview: bool,
    pub multicast: bool,
    pub devices: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub frames: u64,
    pub start_unix: i64,
    pub media_length: Option<u64>,
    pub text: bool,
}

/// Build the JSON status snapshot. The frame image is attached only
/// when `params` is truthy and the source is not a shared-memory
/// queue (queue frames belong to their producer).
pub fn info_snapshot(ctx: &InfoContext<'_>, params: &str, frame: Option<&Frame>) -> Value {
    let img = match frame {
        Some(frame) if params_truthy(params) && !ctx.source.starts_with("queue") => {
            frame_to_base64_jpeg(frame).unwrap_or_else(|| "Error".to_string())
        }
        _ => "None".to_string(),
    };
    json!({
        ctx.name: {
            "type": "info",
            "data": {
                "start": ctx.start_unix,
                "cast_type": ctx.kind,
                "viinput": ctx.source,
                "preview": ctx.preview,
                "protocol": ctx.protocol,
                "multicast": ctx.multicast,
                "devices": ctx.devices,
                "image": { "W": ctx.width, "H": ctx.height },
                "fps": ctx.fps,
                "frames": ctx.frames,
                "length": ctx.media_length,
                "text": ctx.text,
                "img": img,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_first_three_separators() {
        let action = parse("castA||multicast||circular,500||12345").unwrap();
        assert_eq!(action.cast, "castA");
        assert_eq!(action.verb, "multicast");
        assert_eq!(action.params, "circular,500");
        assert_eq!(action.ts, "12345");

        // params containing the separator survive
        let action = parse("castA||info||a||b||c").unwrap();
        assert_eq!(action.params, "a");
        assert_eq!(action.ts, "b||c");
    }

    #[test]
    fn malformed_entries_rejected() {
        assert!(parse("castA||stop").is_none());
        assert!(parse("||stop||x||1").is_none());
    }

    #[test]
    fn drain_takes_mine_keeps_live_drops_dead() {
        let mut todo = vec![
            Action::encode("castA", "stop", "", "1"),
            Action::encode("castB", "shot", "", "2"),
            Action::encode("ghost", "stop", "", "3"),
            "garbage".to_string(),
        ];
        let live = vec!["castA".to_string(), "castB".to_string()];
        let mine = drain_for(&mut todo, "castA", &live);
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].verb, "stop");
        // castB's entry survives; ghost and garbage are gone
        assert_eq!(todo, vec![Action::encode("castB", "shot", "", "2")]);
    }

    #[test]
    fn truthiness_rule() {
        for yes in ["1", "true", "TRUE", "yes", "on"] {
            assert!(params_truthy(yes), "{yes}");
        }
        for no in ["", "0", "false", "2", "none", "image"] {
            assert!(!params_truthy(no), "{no}");
        }
    }

    #[test]
    fn info_snapshot_image_gating() {
        let frame = Frame::solid(4, 4, [10, 20, 30]);
        let ctx = InfoContext {
            name: "castA",
            kind: "Desktop",
            source: "desktop",
            protocol: "ddp",
            preview: false,
            multicast: false,
            devices: vec!["127.0.0.1".into()],
            width: 4,
            height: 4,
            fps: 25,
            frames: 7,
            start_unix: 0,
            media_length: None,
            text: true,
        };
        let with = info_snapshot(&ctx, "1", Some(&frame));
        assert_ne!(with["castA"]["data"]["img"], "None");
        let without = info_snapshot(&ctx, "0", Some(&frame));
        assert_eq!(without["castA"]["data"]["img"], "None");

        // queue sources never attach frames
        let ctx = InfoContext {
            source: "queue=feed1",
            ..ctx
        };
        let queued = info_snapshot(&ctx, "1", Some(&frame));
        assert_eq!(queued["castA"]["data"]["img"], "None");
    }

    #[test]
    fn verb_parsing() {
        assert_eq!("stop".parse::<Verb>(), Ok(Verb::Stop));
        assert_eq!("open-preview".parse::<Verb>(), Ok(Verb::OpenPreview));
        assert!("explode".parse::<Verb>().is_err());
    }
}
