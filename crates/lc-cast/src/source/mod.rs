//! Frame sources.
//!
//! Every cast owns exactly one source adapter behind the
//! `{open, next_frame, close}` capability. The textual spec form
//! (`desktop`, `win=...`, `queue=...`) exists only as the external
//! parse target; internally sources are a tagged variant.

mod media;
pub(crate) mod queue;
mod screen;

use std::path::PathBuf;

use lc_common::{CastError, CastResult};

use crate::frame::Frame;

pub use queue::BusClient;

/// Which engine registry a cast belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastKind {
    Desktop,
    Media,
}

impl std::fmt::Display for CastKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Desktop => write!(f, "Desktop"),
            Self::Media => write!(f, "Media"),
        }
    }
}

/// Parsed source specification.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceSpec {
    /// Whole desktop of a monitor.
    Desktop { monitor: usize },
    /// Rectangular region of a monitor.
    Area {
        monitor: usize,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
    },
    /// A single window matched by title substring.
    Window { title: String },
    /// OS-enumerated camera by index.
    Camera { index: u32 },
    /// Media file (video or still image), optional start frame.
    Media { path: PathBuf, start_frame: u64 },
    /// Frames read from a shared frame slot fed by another process.
    Queue { name: String },
}

impl SourceSpec {
    /// Parse the external string form:
    /// `desktop` | `monitor=N` | `area=[M:]X,Y,W,H` | `win=TITLE` |
    /// `camera=N` | `queue=NAME` | `<path>[@@FRAME]`.
    pub fn parse(spec: &str) -> CastResult<Self> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(CastError::BadConfig("empty source spec".into()));
        }
        if spec == "desktop" {
            return Ok(Self::Desktop { monitor: 0 });
        }
        if let Some(n) = spec.strip_prefix("monitor=") {
            let monitor = n
                .parse()
                .map_err(|_| CastError::BadConfig(format!("bad monitor index '{n}'")))?;
            return Ok(Self::Desktop { monitor });
        }
        if let Some(rest) = spec.strip_prefix("area=") {
            let (monitor, coords) = match rest.split_once(':') {
                Some((m, coords)) => (
                    m.parse()
                        .map_err(|_| CastError::BadConfig(format!("bad monitor index '{m}'")))?,
                    coords,
                ),
                None => (0, rest),
            };
            let parts: Vec<u32> = coords
                .split(',')
                .map(|p| p.trim().parse())
                .collect::<Result<_, _>>()
                .map_err(|_| CastError::BadConfig(format!("bad area spec '{rest}'")))?;
            if parts.len() != 4 || parts[2] == 0 || parts[3] == 0 {
                return Err(CastError::BadConfig(format!(
                    "area spec '{rest}' must be X,Y,W,H with non-zero size"
                )));
            }
            return Ok(Self::Area {
                monitor,
                x: parts[0],
                y: parts[1],
                w: parts[2],
                h: parts[3],
            });
        }
        if let Some(title) = spec.strip_prefix("win=") {
            if title.is_empty() {
                return Err(CastError::BadConfig("empty window title".into()));
            }
            return Ok(Self::Window {
                title: title.to_string(),
            });
        }
        if let Some(n) = spec.strip_prefix("camera=") {
            let index = n
                .parse()
                .map_err(|_| CastError::BadConfig(format!("bad camera index '{n}'")))?;
            return Ok(Self::Camera { index });
        }
        if let Some(name) = spec.strip_prefix("queue=") {
            if name.is_empty() {
                return Err(CastError::BadConfig("empty queue name".into()));
            }
            return Ok(Self::Queue {
                name: name.to_string(),
            });
        }
        // Remaining forms are media paths, optionally `path@@frame`.
        let (path, start_frame) = match spec.rsplit_once("@@") {
            Some((path, frame)) => match frame.parse() {
                Ok(n) => (path, n),
                Err(_) => (spec, 0),
            },
            None => (spec, 0),
        };
        Ok(Self::Media {
            path: PathBuf::from(path),
            start_frame,
        })
    }

    /// Desktop-flavored sources capture the screen; everything else is
    /// a media cast.
    pub fn kind(&self) -> CastKind {
        match self {
            Self::Desktop { .. } | Self::Area { .. } | Self::Window { .. } => CastKind::Desktop,
            Self::Camera { .. } | Self::Media { .. } | Self::Queue { .. } => CastKind::Media,
        }
    }

    /// The external display form used in logs and the info snapshot.
    pub fn label(&self) -> String {
        match self {
            Self::Desktop { monitor } => {
                if *monitor == 0 {
                    "desktop".to_string()
                } else {
                    format!("monitor={monitor}")
                }
            }
            Self::Area { monitor, x, y, w, h } => format!("area={monitor}:{x},{y},{w},{h}"),
            Self::Window { title } => format!("win={title}"),
            Self::Camera { index } => format!("camera={index}"),
            Self::Media { path, .. } => path.display().to_string(),
            Self::Queue { name } => format!("queue={name}"),
        }
    }
}

/// The source capability: produce RGB frames until EOF. A source is
/// created and consumed on its cast's own thread and never migrates,
/// so adapters wrapping thread-affine decoder handles stay valid.
pub trait FrameSource {
    /// Next frame, `Ok(None)` at end of stream.
    fn next_frame(&mut self) -> CastResult<Option<Frame>>;

    /// Release capture resources; called once from Closing.
    fn close(&mut self);

    /// Total length in frames for finite sources.
    fn length(&self) -> Option<u64> {
        None
    }
}

/// Bind the adapter for a spec. `bus_port` is only used by queue
/// sources.
pub fn open(spec: &SourceSpec, bus_port: u16) -> CastResult<Box<dyn FrameSource>> {
    match spec {
        SourceSpec::Desktop { monitor } => Ok(Box::new(screen::ScreenSource::open(*monitor, None)?)),
        SourceSpec::Area { monitor, x, y, w, h } => Ok(Box::new(screen::ScreenSource::open(
            *monitor,
            Some((*x, *y, *w, *h)),
        )?)),
        SourceSpec::Window { title } => Ok(Box::new(screen::WindowSource::open(title)?)),
        SourceSpec::Camera { index } => Ok(Box::new(media::CameraSource::open(*index)?)),
        SourceSpec::Media { path, start_frame } => media::open_media(path, *start_frame),
        SourceSpec::Queue { name } => Ok(Box::new(queue::QueueSource::open(name, bus_port)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(
            SourceSpec::parse("desktop").unwrap(),
            SourceSpec::Desktop { monitor: 0 }
        );
        assert_eq!(
            SourceSpec::parse("monitor=2").unwrap(),
            SourceSpec::Desktop { monitor: 2 }
        );
        assert_eq!(
            SourceSpec::parse("area=1:10,20,300,200").unwrap(),
            SourceSpec::Area {
                monitor: 1,
                x: 10,
                y: 20,
                w: 300,
                h: 200
            }
        );
        assert_eq!(
            SourceSpec::parse("area=0,0,64,32").unwrap(),
            SourceSpec::Area {
                monitor: 0,
                x: 0,
                y: 0,
                w: 64,
                h: 32
            }
        );
        assert_eq!(
            SourceSpec::parse("win=Firefox").unwrap(),
            SourceSpec::Window {
                title: "Firefox".into()
            }
        );
        assert_eq!(
            SourceSpec::parse("camera=1").unwrap(),
            SourceSpec::Camera { index: 1 }
        );
        assert_eq!(
            SourceSpec::parse("queue=feed1").unwrap(),
            SourceSpec::Queue {
                name: "feed1".into()
            }
        );
        assert_eq!(
            SourceSpec::parse("/tmp/clip.mp4@@120").unwrap(),
            SourceSpec::Media {
                path: PathBuf::from("/tmp/clip.mp4"),
                start_frame: 120
            }
        );
        assert_eq!(
            SourceSpec::parse("clip.mp4").unwrap(),
            SourceSpec::Media {
                path: PathBuf::from("clip.mp4"),
                start_frame: 0
            }
        );
    }

    #[test]
    fn bad_specs_rejected() {
        assert!(SourceSpec::parse("").is_err());
        assert!(SourceSpec::parse("area=1,2,3").is_err());
        assert!(SourceSpec::parse("area=0,0,0,10").is_err());
        assert!(SourceSpec::parse("camera=abc").is_err());
        assert!(SourceSpec::parse("win=").is_err());
    }

    #[test]
    fn kinds() {
        assert_eq!(SourceSpec::parse("desktop").unwrap().kind(), CastKind::Desktop);
        assert_eq!(
            SourceSpec::parse("win=editor").unwrap().kind(),
            CastKind::Desktop
        );
        assert_eq!(
            SourceSpec::parse("queue=feed1").unwrap().kind(),
            CastKind::Media
        );
        assert_eq!(
            SourceSpec::parse("clip.mp4").unwrap().kind(),
            CastKind::Media
        );
    }
}
