//! # ledcast engine
//!
//! Captures desktop regions, windows, media files, cameras or
//! externally produced frames and streams them as pixel data to LED
//! controllers over DDP, E1.31/sACN or Art-Net.
//!
//! ## Usage
//!
//! ```sh
//! lc-cast                                  # Cast with config from env (LC__CAST__*)
//! lc-cast run --source desktop --ip 192.168.1.50 --wled
//! lc-cast run --source clip.mp4 --width 64 --height 32
//! lc-cast run --source queue=feed1        # Frames from the lc-bus slot "feed1"
//! lc-cast run --run-mobile-server clip.mp4 --source queue=mobile
//! lc-cast upload --ip 192.168.1.50 anim.gif  # Push a file to a WLED device
//! lc-cast version
//! ```

mod action;
mod cast;
mod device;
mod frame;
mod multicast;
mod pipeline;
mod preview;
mod source;
mod tile;
mod wled;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use lc_common::AppConfig;

use cast::{Cast, CastRegistry};
use device::DeviceRegistry;
use source::{CastKind, SourceSpec};

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let subcommand = args.get(1).map(|s| s.as_str()).unwrap_or("run");

    match subcommand {
        "version" => {
            println!(
                "ledcast engine v{} ({} {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH,
            );
            return Ok(());
        }
        "upload" => upload(&args[2..]),
        "run" => run(&args[2..]),
        // bare flags: treat everything as `run` arguments
        _ => run(&args[1..]),
    }
}

/// Push a file (e.g. a GIF) onto a WLED device's filesystem.
fn upload(args: &[String]) -> anyhow::Result<()> {
    let mut ip = None;
    let mut file = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--ip" => {
                i += 1;
                ip = args.get(i).cloned();
            }
            other => file = Some(other.to_string()),
        }
        i += 1;
    }
    let ip = ip.ok_or_else(|| anyhow::anyhow!("upload requires --ip <ipv4>"))?;
    let file = file.ok_or_else(|| anyhow::anyhow!("upload requires a file path"))?;

    let wled = wled::WledClient::new().map_err(|e| anyhow::anyhow!("{e}"))?;
    let name = wled
        .upload_file(&ip, std::path::Path::new(&file))
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    if wled.file_exists(&ip, &name) {
        println!("uploaded /{name} to {ip}");
    } else {
        anyhow::bail!("upload reported success but /{name} is missing on {ip}");
    }
    Ok(())
}

fn run(flags: &[String]) -> anyhow::Result<()> {
    let overrides = parse_flags(flags)?;

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        AppConfig {
            server: Default::default(),
            cast: Default::default(),
        }
    });
    overrides.apply(&mut config.cast);
    config
        .cast
        .validate()
        .map_err(|e| anyhow::anyhow!("configuration rejected: {e}"))?;

    tracing::info!(
        "ledcast engine v{} starting (source: {}, host: {})",
        env!("CARGO_PKG_VERSION"),
        config.cast.source,
        config.cast.host,
    );

    let exit = Arc::new(AtomicBool::new(false));
    let devices = DeviceRegistry::new();
    let (desktop_registry, desktop_replies) =
        CastRegistry::new(CastKind::Desktop, Arc::clone(&exit));
    let (media_registry, media_replies) = CastRegistry::new(CastKind::Media, Arc::clone(&exit));

    // Info snapshots from the casts land on the console.
    for replies in [desktop_replies, media_replies] {
        std::thread::spawn(move || {
            while let Ok(snapshot) = replies.recv() {
                println!("{snapshot}");
            }
        });
    }

    if let Some(file) = overrides.mobile_server.clone() {
        let bus_port = config.server.bus_port;
        let exit = Arc::clone(&exit);
        std::thread::Builder::new()
            .name("frame-producer".into())
            .spawn(move || {
                if let Err(e) = run_frame_producer(&file, bus_port, &exit) {
                    tracing::error!(error = %e, "frame producer stopped");
                }
            })?;
    }

    if let Some(opts) = overrides.sys_charts.clone() {
        let devices = Arc::clone(&devices);
        let exit = Arc::clone(&exit);
        std::thread::Builder::new()
            .name("dev-stats".into())
            .spawn(move || run_stats_logger(&opts, &devices, &exit))?;
    }

    let spec = SourceSpec::parse(&config.cast.source)
        .map_err(|e| anyhow::anyhow!("source rejected: {e}"))?;
    let registry = match spec.kind() {
        CastKind::Desktop => Arc::clone(&desktop_registry),
        CastKind::Media => Arc::clone(&media_registry),
    };
    let name = overrides
        .name
        .clone()
        .unwrap_or_else(|| format!("{}-0", spec.kind().to_string().to_lowercase()));

    let handle = Cast::new(
        name,
        config.cast.clone(),
        registry,
        Arc::clone(&devices),
        config.server.bus_port,
    )
    .spawn();

    let result = handle.join();
    exit.store(true, Ordering::Relaxed);
    if result.is_err() {
        anyhow::bail!("cast thread panicked");
    }
    Ok(())
}

/// Decode a media file into a bus slot forever, so a `queue=` cast (or
/// any other consumer) can pick the frames up. This is the auxiliary
/// producer behind `--run-mobile-server`.
fn run_frame_producer(file: &str, bus_port: u16, exit: &AtomicBool) -> anyhow::Result<()> {
    use lc_protocol::FrameSlot;

    const SLOT_NAME: &str = "mobile";
    const PRODUCER_FPS: u64 = 10;

    let spec = SourceSpec::parse(file).map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut src = source::open(&spec, bus_port).map_err(|e| anyhow::anyhow!("{e}"))?;

    let first = src
        .next_frame()
        .map_err(|e| anyhow::anyhow!("{e}"))?
        .ok_or_else(|| anyhow::anyhow!("producer source is empty"))?;

    let mut bus = source::BusClient::connect(bus_port).map_err(|e| anyhow::anyhow!("{e}"))?;
    let path = bus
        .attach_or_create(SLOT_NAME, first.width, first.height)
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let mut slot = FrameSlot::open(&path)?;

    tracing::info!(file, slot = SLOT_NAME, "frame producer started");
    let mut seq = 0u64;
    let mut frame = Some(first);
    loop {
        if exit.load(Ordering::Relaxed) {
            break;
        }
        let current = match frame.take() {
            Some(f) => f,
            None => match src.next_frame().map_err(|e| anyhow::anyhow!("{e}"))? {
                Some(f) => f,
                None => break,
            },
        };
        seq += 1;
        let sized = pipeline::resize(current, slot.width(), slot.height())
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        slot.put_frame(
            &sized.data,
            sized.width,
            sized.height,
            seq,
            source::queue::now_millis(),
        )?;
        std::thread::sleep(Duration::from_millis(1000 / PRODUCER_FPS));
    }
    src.close();
    tracing::info!(slot = SLOT_NAME, "frame producer ended");
    Ok(())
}

/// Append device statistics as JSON lines; the observability viewer
/// tails this file.
fn run_stats_logger(opts: &SysChartOpts, devices: &DeviceRegistry, exit: &AtomicBool) {
    use std::io::Write;

    let interval = Duration::from_secs(2);
    while !exit.load(Ordering::Relaxed) {
        let mut rows = Vec::new();
        for ip in &opts.dev_list {
            if let Ok(addr) = ip.parse() {
                if let Some(device) = devices.get(addr) {
                    rows.push(serde_json::json!({
                        "ip": ip,
                        "frames": device.frame_count(),
                        "packets": device.packet_count(),
                        "depth": device.queue_depth(),
                        "state": format!("{:?}", device.state()),
                    }));
                }
            }
        }
        let line = serde_json::json!({
            "ts": chrono::Utc::now().timestamp_millis(),
            "devices": rows,
        });
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&opts.file)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = written {
            tracing::warn!(error = %e, "stats log write failed");
            break;
        }
        std::thread::sleep(interval);
    }
}

#[derive(Debug, Clone, Default)]
struct SysChartOpts {
    file: String,
    dark: bool,
    dev_list: Vec<String>,
}

/// CLI overrides layered on top of the environment config.
#[derive(Debug, Default)]
struct Overrides {
    name: Option<String>,
    source: Option<String>,
    ip: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    wled: bool,
    no_text: bool,
    preview: bool,
    protocol: Option<String>,
    mobile_server: Option<String>,
    sys_charts: Option<SysChartOpts>,
}

impl Overrides {
    fn apply(&self, cast: &mut lc_common::CastSettings) {
        if let Some(name) = &self.source {
            cast.source = name.clone();
        }
        if let Some(ip) = &self.ip {
            cast.host = ip.clone();
        }
        if let Some(width) = self.width {
            cast.scale_width = width;
        }
        if let Some(height) = self.height {
            cast.scale_height = height;
        }
        if self.wled {
            cast.wled = true;
        }
        if self.no_text {
            cast.text = false;
        }
        if self.preview {
            cast.preview = true;
        }
        if let Some(protocol) = &self.protocol {
            if let Ok(p) = protocol.parse() {
                cast.protocol = p;
            } else {
                tracing::warn!(protocol = %protocol, "unknown protocol override ignored");
            }
        }
    }
}

/// Parse `run` flags. Space-separated values except the sys-charts
/// family, which uses `--key=value`.
fn parse_flags(args: &[String]) -> anyhow::Result<Overrides> {
    let mut out = Overrides::default();
    let mut charts: Option<SysChartOpts> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--name" => {
                i += 1;
                out.name = args.get(i).cloned();
            }
            "--source" => {
                i += 1;
                out.source = args.get(i).cloned();
            }
            "--ip" => {
                i += 1;
                out.ip = args.get(i).cloned();
            }
            "--width" => {
                i += 1;
                out.width = Some(parse_num(args.get(i), "--width")?);
            }
            "--height" => {
                i += 1;
                out.height = Some(parse_num(args.get(i), "--height")?);
            }
            "--wled" => out.wled = true,
            "--no-text" => out.no_text = true,
            "--preview" => out.preview = true,
            "--protocol" => {
                i += 1;
                out.protocol = args.get(i).cloned();
            }
            "--run-mobile-server" => {
                i += 1;
                out.mobile_server = args.get(i).cloned();
            }
            "--run-sys-charts" => {
                charts = Some(SysChartOpts::default());
            }
            other => {
                if let Some(charts) = charts.as_mut() {
                    if let Some(file) = other.strip_prefix("--file=") {
                        charts.file = file.to_string();
                    } else if let Some(dark) = other.strip_prefix("--dark=") {
                        charts.dark = dark.eq_ignore_ascii_case("true") || dark == "1";
                    } else if let Some(list) = other.strip_prefix("--dev_list=") {
                        charts.dev_list =
                            list.split(',').map(|s| s.trim().to_string()).collect();
                    } else {
                        anyhow::bail!("unknown flag: {other}");
                    }
                } else {
                    anyhow::bail!("unknown flag: {other}");
                }
            }
        }
        i += 1;
    }

    if let Some(charts) = charts {
        if charts.file.is_empty() {
            anyhow::bail!("--run-sys-charts requires --file=<path>");
        }
        out.sys_charts = Some(charts);
    }
    Ok(out)
}

fn parse_num(value: Option<&String>, flag: &str) -> anyhow::Result<u32> {
    value
        .ok_or_else(|| anyhow::anyhow!("{flag} needs a value"))?
        .parse()
        .map_err(|_| anyhow::anyhow!("{flag} needs a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flag_overrides() {
        let overrides = parse_flags(&to_args(&[
            "--source", "desktop", "--ip", "192.168.1.50", "--width", "64", "--height", "32",
            "--wled", "--no-text",
        ]))
        .unwrap();
        let mut cast = lc_common::CastSettings::default();
        overrides.apply(&mut cast);
        assert_eq!(cast.host, "192.168.1.50");
        assert_eq!(cast.scale_width, 64);
        assert_eq!(cast.scale_height, 32);
        assert!(cast.wled);
        assert!(!cast.text);
    }

    #[test]
    fn sys_charts_flags() {
        let overrides = parse_flags(&to_args(&[
            "--run-sys-charts",
            "--file=/tmp/stats.jsonl",
            "--dark=true",
            "--dev_list=10.0.0.1,10.0.0.2",
        ]))
        .unwrap();
        let charts = overrides.sys_charts.unwrap();
        assert_eq!(charts.file, "/tmp/stats.jsonl");
        assert!(charts.dark);
        assert_eq!(charts.dev_list, vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn unknown_flag_rejected() {
        assert!(parse_flags(&to_args(&["--frobnicate"])).is_err());
        assert!(parse_flags(&to_args(&["--run-sys-charts"])).is_err());
    }
}
