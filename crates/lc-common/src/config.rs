use std::net::Ipv4Addr;

use serde::Deserialize;

use crate::error::{CastError, CastResult};

/// Top-level application configuration.
/// Loaded from environment variables (prefix `LC`, separator `__`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Process-wide settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Cast defaults applied to new casts
    #[serde(default)]
    pub cast: CastSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Frame bus registry port (default: 50000)
    #[serde(default = "default_bus_port")]
    pub bus_port: u16,
    /// Log level (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bus_port: default_bus_port(),
            log_level: default_log_level(),
        }
    }
}

/// Output protocol of a cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ddp,
    E131,
    Artnet,
    /// No network output; frames still flow to preview/buffer.
    Other,
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Ddp
    }
}

impl std::str::FromStr for Protocol {
    type Err = CastError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ddp" => Ok(Self::Ddp),
            "e131" => Ok(Self::E131),
            "artnet" => Ok(Self::Artnet),
            "other" => Ok(Self::Other),
            other => Err(CastError::BadConfig(format!("unknown protocol '{other}'"))),
        }
    }
}

/// One multicast grid member: tile index and device address.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CastDevice {
    pub index: u32,
    pub ip: String,
}

/// Per-cast settings. Field ranges follow the LED hardware limits; see
/// `validate`.
#[derive(Debug, Clone, Deserialize)]
pub struct CastSettings {
    /// Target frame rate, 1..=60
    #[serde(default = "default_rate")]
    pub rate: u32,
    /// Output matrix width, 1..=1920
    #[serde(default = "default_scale_width")]
    pub scale_width: u32,
    /// Output matrix height, 1..=1080
    #[serde(default = "default_scale_height")]
    pub scale_height: u32,
    /// Primary destination device
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub protocol: Protocol,
    /// Auto-size the matrix from the WLED device at Opening
    #[serde(default)]
    pub wled: bool,
    /// Fan frames out to `cast_devices` as a synchronized grid
    #[serde(default)]
    pub multicast: bool,
    /// Tile grid columns, >= 1
    #[serde(default = "default_one")]
    pub cast_x: u32,
    /// Tile grid rows, >= 1
    #[serde(default = "default_one")]
    pub cast_y: u32,
    /// Multicast destinations; must equal cast_x*cast_y for a real grid
    #[serde(default)]
    pub cast_devices: Vec<CastDevice>,
    /// Extra UDP copies of each datagram, 0..=N
    #[serde(default)]
    pub retry: u32,

    /// Gamma correction, 0.01..=4.0
    #[serde(default = "default_gamma")]
    pub gamma: f32,
    /// Automatic brightness/contrast with histogram clipping
    #[serde(default)]
    pub auto_bright: bool,
    /// Histogram clip percentile for auto_bright
    #[serde(default = "default_clip_hist")]
    pub clip_hist_percent: f32,
    /// Filter knobs 0..=100, 0 = off
    #[serde(default)]
    pub saturation: u32,
    #[serde(default)]
    pub brightness: u32,
    #[serde(default)]
    pub contrast: u32,
    #[serde(default)]
    pub sharpen: u32,
    /// Channel balance 0..=255, 0 = off, 128 = unity
    #[serde(default)]
    pub balance_r: u32,
    #[serde(default)]
    pub balance_g: u32,
    #[serde(default)]
    pub balance_b: u32,
    /// Flip output; `flip_vh` 0 = vertical axis, 1 = horizontal
    #[serde(default)]
    pub flip: bool,
    #[serde(default)]
    pub flip_vh: u32,

    /// Mirror processed frames into a preview slot
    #[serde(default)]
    pub preview: bool,
    #[serde(default = "default_preview_w")]
    pub preview_w: u32,
    #[serde(default = "default_preview_h")]
    pub preview_h: u32,
    /// Pixel-art grid of the preview
    #[serde(default = "default_pixel_dim")]
    pub pixel_w: u32,
    #[serde(default = "default_pixel_dim")]
    pub pixel_h: u32,
    /// Text overlay allowed (disabled by the stop-text action)
    #[serde(default = "default_true")]
    pub text: bool,

    /// Retain processed frames in the snapshot ring
    #[serde(default)]
    pub put_to_buffer: bool,
    /// Snapshot ring size, 1..=30
    #[serde(default = "default_frame_max")]
    pub frame_max: u32,

    /// e131/artnet source name
    #[serde(default = "default_e131_name")]
    pub e131_name: String,
    /// Base universe, 0..=63999
    #[serde(default = "default_one")]
    pub universe: u32,
    /// Pixel budget for e131/artnet, 0 = frame-sized
    #[serde(default)]
    pub pixel_count: u32,
    /// sACN priority, 0..=200
    #[serde(default = "default_priority")]
    pub packet_priority: u32,
    /// Channels per universe, 1..=512
    #[serde(default = "default_universe_size")]
    pub universe_size: u32,
    /// First-pixel channel offset within the base universe
    #[serde(default)]
    pub channel_offset: u32,
    /// 3 (RGB) or 4 (RGBW)
    #[serde(default = "default_cpp")]
    pub channels_per_pixel: u32,

    /// Source spec: desktop | monitor=N | area=X,Y,W,H | win=TITLE |
    /// camera=N | queue=NAME | <media path>
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for CastSettings {
    fn default() -> Self {
        // An all-defaults deserialization never fails.
        serde_json::from_value(serde_json::json!({})).unwrap()
    }
}

impl AppConfig {
    /// Load config from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("LC")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

impl CastSettings {
    /// Clamp soft ranges and reject hard misconfigurations.
    ///
    /// Dimensions and rate are clamped into their ranges; anything that
    /// would produce wrong output (bad IP, grid/device mismatch,
    /// out-of-range gamma) is a `BadConfig` error.
    pub fn validate(&mut self) -> CastResult<()> {
        self.rate = self.rate.clamp(1, 60);
        self.scale_width = self.scale_width.clamp(1, 1920);
        self.scale_height = self.scale_height.clamp(1, 1080);
        self.frame_max = self.frame_max.clamp(1, 30);
        self.universe_size = self.universe_size.clamp(1, 512);

        self.host
            .parse::<Ipv4Addr>()
            .map_err(|_| CastError::BadConfig(format!("invalid host address '{}'", self.host)))?;

        if !(0.01..=4.0).contains(&self.gamma) {
            return Err(CastError::BadConfig(format!(
                "gamma {} outside 0.01..=4",
                self.gamma
            )));
        }
        for (name, value) in [
            ("saturation", self.saturation),
            ("brightness", self.brightness),
            ("contrast", self.contrast),
            ("sharpen", self.sharpen),
        ] {
            if value > 100 {
                return Err(CastError::BadConfig(format!("{name} {value} outside 0..=100")));
            }
        }
        for (name, value) in [
            ("balance_r", self.balance_r),
            ("balance_g", self.balance_g),
            ("balance_b", self.balance_b),
        ] {
            if value > 255 {
                return Err(CastError::BadConfig(format!("{name} {value} outside 0..=255")));
            }
        }
        if self.flip_vh > 1 {
            return Err(CastError::BadConfig(format!(
                "flip_vh {} must be 0 or 1",
                self.flip_vh
            )));
        }

        if self.cast_x == 0 || self.cast_y == 0 {
            return Err(CastError::BadConfig("cast_x/cast_y must be >= 1".into()));
        }
        if self.multicast {
            for dev in &self.cast_devices {
                dev.ip.parse::<Ipv4Addr>().map_err(|_| {
                    CastError::BadConfig(format!("invalid cast device address '{}'", dev.ip))
                })?;
            }
            let tiles = (self.cast_x * self.cast_y) as usize;
            if tiles > 1 && self.cast_devices.len() != tiles {
                return Err(CastError::BadConfig(format!(
                    "multicast grid {}x{} needs {} devices, got {}",
                    self.cast_x,
                    self.cast_y,
                    tiles,
                    self.cast_devices.len()
                )));
            }
            if self.cast_devices.is_empty() {
                return Err(CastError::BadConfig(
                    "multicast requires at least one cast device".into(),
                ));
            }
        }

        if self.universe > 63999 {
            return Err(CastError::BadConfig(format!(
                "universe {} outside 0..=63999",
                self.universe
            )));
        }
        if self.packet_priority > 200 {
            return Err(CastError::BadConfig(format!(
                "packet_priority {} outside 0..=200",
                self.packet_priority
            )));
        }
        if !matches!(self.channels_per_pixel, 3 | 4) {
            return Err(CastError::BadConfig(format!(
                "channels_per_pixel {} must be 3 or 4",
                self.channels_per_pixel
            )));
        }

        Ok(())
    }

    /// Destination list in tile order: the multicast device list when
    /// fanning out, otherwise the single host.
    pub fn destinations(&self) -> Vec<String> {
        if self.multicast {
            let mut devs = self.cast_devices.clone();
            devs.sort_by_key(|d| d.index);
            devs.into_iter().map(|d| d.ip).collect()
        } else {
            vec![self.host.clone()]
        }
    }
}

fn default_bus_port() -> u16 {
    50000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_rate() -> u32 {
    25
}
fn default_scale_width() -> u32 {
    128
}
fn default_scale_height() -> u32 {
    128
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_one() -> u32 {
    1
}
fn default_gamma() -> f32 {
    0.5
}
fn default_clip_hist() -> f32 {
    25.0
}
fn default_preview_w() -> u32 {
    640
}
fn default_preview_h() -> u32 {
    360
}
fn default_pixel_dim() -> u32 {
    32
}
fn default_true() -> bool {
    true
}
fn default_frame_max() -> u32 {
    8
}
fn default_e131_name() -> String {
    "ledcast".to_string()
}
fn default_priority() -> u32 {
    100
}
fn default_universe_size() -> u32 {
    510
}
fn default_cpp() -> u32 {
    3
}
fn default_source() -> String {
    "desktop".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut settings = CastSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.rate, 25);
        assert_eq!(settings.protocol, Protocol::Ddp);
        assert_eq!(settings.destinations(), vec!["127.0.0.1".to_string()]);
    }

    #[test]
    fn dimensions_and_rate_are_clamped() {
        let mut settings = CastSettings {
            rate: 500,
            scale_width: 4000,
            scale_height: 0,
            ..CastSettings::default()
        };
        settings.validate().unwrap();
        assert_eq!(settings.rate, 60);
        assert_eq!(settings.scale_width, 1920);
        assert_eq!(settings.scale_height, 1);
    }

    #[test]
    fn bad_host_rejected() {
        let mut settings = CastSettings {
            host: "not-an-ip".into(),
            ..CastSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(CastError::BadConfig(_))
        ));
    }

    #[test]
    fn grid_device_count_must_match() {
        let mut settings = CastSettings {
            multicast: true,
            cast_x: 2,
            cast_y: 1,
            cast_devices: vec![CastDevice {
                index: 0,
                ip: "10.0.0.1".into(),
            }],
            ..CastSettings::default()
        };
        assert!(settings.validate().is_err());

        settings.cast_devices.push(CastDevice {
            index: 1,
            ip: "10.0.0.2".into(),
        });
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn single_tile_multicast_allows_any_device_count() {
        let mut settings = CastSettings {
            multicast: true,
            cast_x: 1,
            cast_y: 1,
            cast_devices: vec![
                CastDevice {
                    index: 0,
                    ip: "10.0.0.1".into(),
                },
                CastDevice {
                    index: 1,
                    ip: "10.0.0.2".into(),
                },
                CastDevice {
                    index: 2,
                    ip: "10.0.0.3".into(),
                },
            ],
            ..CastSettings::default()
        };
        assert!(settings.validate().is_ok());
        assert_eq!(settings.destinations().len(), 3);
    }

    #[test]
    fn destinations_follow_device_index_order() {
        let settings = CastSettings {
            multicast: true,
            cast_devices: vec![
                CastDevice {
                    index: 1,
                    ip: "10.0.0.2".into(),
                },
                CastDevice {
                    index: 0,
                    ip: "10.0.0.1".into(),
                },
            ],
            ..CastSettings::default()
        };
        assert_eq!(settings.destinations(), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn e131_ranges_enforced() {
        let mut settings = CastSettings {
            universe: 70000,
            ..CastSettings::default()
        };
        assert!(settings.validate().is_err());

        let mut settings = CastSettings {
            channels_per_pixel: 5,
            ..CastSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
