//! Cast controller: the per-cast state machine and frame loop.
//!
//! One thread per running cast owns its source, pipeline and action
//! application. State machine:
//!
//! ```text
//! Idle ──start──▶ Opening ──ok──▶ Running ──stop/EOF/error──▶ Closing ──▶ Terminated
//!                     └─error──▶ Terminated
//! ```
//!
//! A failure anywhere aborts only its own cast; device trouble after
//! Opening surfaces as the device's Warned state, never as a cast
//! error.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde_json::Value;

use lc_common::config::{CastSettings, Protocol};
use lc_common::statefile::{self, BootstrapState};
use lc_common::{CastError, CastResult};

use crate::action::{self, Action, InfoContext, Verb};
use crate::device::{packet_estimate, probe_tcp, Device, DeviceRegistry};
use crate::frame::Frame;
use crate::multicast::{FanoutPool, IpSwapper, SwapEffect};
use crate::pipeline::{self, FilterSettings};
use crate::preview::PreviewMirror;
use crate::source::{self, CastKind, FrameSource, SourceSpec};
use crate::tile;
use crate::wled::WledClient;

/// Liveness / negotiation probe timeout.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastState {
    Idle,
    Opening,
    Running,
    Closing,
    Terminated,
}

/// Shared state of all casts of one kind: the live name set, the todo
/// list, the stop flags and the monotonic counters. Mutated only under
/// its own locks; the reply channel carries `info` snapshots back to
/// the controller.
pub struct CastRegistry {
    kind: CastKind,
    names: Mutex<Vec<String>>,
    todo: Mutex<Vec<String>>,
    stop_all: AtomicBool,
    exit: Arc<AtomicBool>,
    reply_tx: Sender<Value>,
    total_frames: AtomicU64,
    total_packets: AtomicU64,
}

impl CastRegistry {
    pub fn new(kind: CastKind, exit: Arc<AtomicBool>) -> (Arc<Self>, Receiver<Value>) {
        let (reply_tx, reply_rx) = unbounded();
        (
            Arc::new(Self {
                kind,
                names: Mutex::new(Vec::new()),
                todo: Mutex::new(Vec::new()),
                stop_all: AtomicBool::new(false),
                exit,
                reply_tx,
                total_frames: AtomicU64::new(0),
                total_packets: AtomicU64::new(0),
            }),
            reply_rx,
        )
    }

    pub fn kind(&self) -> CastKind {
        self.kind
    }

    /// Insert a cast name; names are unique within a kind.
    pub fn register(&self, name: &str) -> bool {
        let mut names = self.names.lock();
        if names.iter().any(|n| n == name) {
            return false;
        }
        names.push(name.to_string());
        true
    }

    pub fn deregister(&self, name: &str) {
        self.names.lock().retain(|n| n != name);
    }

    pub fn live_names(&self) -> Vec<String> {
        self.names.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.names.lock().len()
    }

    /// Append a `name||verb||params||ts` entry.
    pub fn push_action(&self, entry: String) {
        self.todo.lock().push(entry);
    }

    /// Pull the entries addressed to `name`; GCs entries for dead
    /// casts as a side effect.
    pub fn drain_for(&self, name: &str) -> Vec<Action> {
        let live = self.live_names();
        action::drain_for(&mut self.todo.lock(), name, &live)
    }

    /// Stop every cast of this kind at its next tick boundary.
    pub fn stop_all(&self) {
        self.stop_all.store(true, Ordering::Relaxed);
    }

    pub fn clear_stop(&self) {
        self.stop_all.store(false, Ordering::Relaxed);
    }

    fn should_stop(&self) -> bool {
        self.stop_all.load(Ordering::Relaxed) || self.exit.load(Ordering::Relaxed)
    }

    pub fn add_frames(&self, n: u64) {
        self.total_frames.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_packets(&self, n: u64) {
        self.total_packets.fetch_add(n, Ordering::Relaxed);
    }

    pub fn reset_counters(&self) {
        self.total_frames.store(0, Ordering::Relaxed);
        self.total_packets.store(0, Ordering::Relaxed);
    }

    /// (frames, packets) processed across all casts of this kind.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_frames.load(Ordering::Relaxed),
            self.total_packets.load(Ordering::Relaxed),
        )
    }
}

/// Mutable loop state the action handlers operate on.
struct LoopState {
    stop: bool,
    text: bool,
    preview: Option<PreviewMirror>,
    ring: VecDeque<Frame>,
    devices: Vec<Arc<Device>>,
    destinations: Vec<Ipv4Addr>,
    swapper: IpSwapper,
    seq: u64,
    start_unix: i64,
}

/// One capture-to-LED pipeline instance.
pub struct Cast {
    pub name: String,
    settings: CastSettings,
    registry: Arc<CastRegistry>,
    devices: Arc<DeviceRegistry>,
    bus_port: u16,
    state: Mutex<CastState>,
}

impl Cast {
    pub fn new(
        name: impl Into<String>,
        settings: CastSettings,
        registry: Arc<CastRegistry>,
        devices: Arc<DeviceRegistry>,
        bus_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            settings,
            registry,
            devices,
            bus_port,
            state: Mutex::new(CastState::Idle),
        })
    }

    pub fn state(&self) -> CastState {
        *self.state.lock()
    }

    fn set_state(&self, state: CastState) {
        *self.state.lock() = state;
        tracing::debug!(cast = %self.name, ?state, "state transition");
    }

    /// Run the cast on its own thread.
    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        let cast = Arc::clone(&self);
        std::thread::Builder::new()
            .name(format!("cast-{}", self.name))
            .spawn(move || match cast.run() {
                Ok(()) => tracing::info!(cast = %cast.name, "cast closed"),
                Err(e) => tracing::error!(cast = %cast.name, error = %e, "cast aborted"),
            })
            .unwrap_or_else(|e| {
                tracing::error!(cast = %self.name, error = %e, "cast thread failed to start");
                std::thread::spawn(|| {})
            })
    }

    pub fn run(&self) -> CastResult<()> {
        self.set_state(CastState::Opening);
        let result = self.open_and_run();
        self.set_state(CastState::Terminated);
        result
    }

    fn open_and_run(&self) -> CastResult<()> {
        // ── Opening ─────────────────────────────────────────────────
        let mut settings = self.settings.clone();
        settings.validate()?;
        let spec = SourceSpec::parse(&settings.source)?;

        let destinations: Vec<Ipv4Addr> = settings
            .destinations()
            .iter()
            .map(|d| {
                d.parse()
                    .map_err(|_| CastError::BadConfig(format!("invalid destination '{d}'")))
            })
            .collect::<CastResult<_>>()?;

        for dest in &destinations {
            if !dest.is_loopback() && !probe_tcp(*dest, 80, PROBE_TIMEOUT) {
                return Err(CastError::DeviceUnreachable(dest.to_string()));
            }
        }

        if settings.wled {
            let wled = WledClient::new()?;
            for dest in &destinations {
                if !wled.set_live(&dest.to_string(), true, true) {
                    return Err(CastError::DeviceUnreachable(format!(
                        "{dest}: live mode refused"
                    )));
                }
            }
            let primary = destinations[0].to_string();
            let (w, h) = wled.matrix_dimensions(&primary)?;
            settings.scale_width = w.max(1);
            settings.scale_height = h.max(1);
            tracing::info!(cast = %self.name, w, h, "matrix size negotiated from WLED");
        }

        let devices: Vec<Arc<Device>> = destinations
            .iter()
            .map(|d| self.devices.acquire(*d, &settings))
            .collect::<CastResult<_>>()?;

        let mut source = source::open(&spec, self.bus_port)?;
        let media_length = source.length();

        let title = format!("{} {} {}", self.name, self.registry.kind(), spec.label());
        let preview = if settings.preview {
            Some(PreviewMirror::create(&self.name, &settings, &title)?)
        } else {
            None
        };

        if !self.registry.register(&self.name) {
            source.close();
            return Err(CastError::BadConfig(format!(
                "cast name '{}' already running",
                self.name
            )));
        }
        self.publish_hosts(&destinations, true);

        tracing::info!(
            cast = %self.name,
            source = %spec.label(),
            destinations = destinations.len(),
            rate = settings.rate,
            "cast opened"
        );

        // ── Running ─────────────────────────────────────────────────
        self.set_state(CastState::Running);
        let dest_count = destinations.len();
        let mut state = LoopState {
            stop: false,
            text: settings.text,
            preview,
            ring: VecDeque::new(),
            devices,
            destinations,
            swapper: IpSwapper::new(dest_count),
            seq: 0,
            start_unix: chrono::Utc::now().timestamp(),
        };
        let loop_result = self.frame_loop(&settings, &spec, source.as_mut(), &mut state, media_length);

        // ── Closing ─────────────────────────────────────────────────
        self.set_state(CastState::Closing);
        source.close();
        state.swapper.stop();
        if let Some(preview) = state.preview.take() {
            preview.destroy();
        }
        if settings.protocol == Protocol::E131 {
            let px = if settings.pixel_count > 0 {
                settings.pixel_count as usize
            } else {
                (settings.scale_width * settings.scale_height) as usize
            };
            for device in &state.devices {
                device.enqueue_blackout(px);
            }
        }
        if settings.wled {
            if let Ok(wled) = WledClient::new() {
                for dest in &state.destinations {
                    wled.set_live(&dest.to_string(), true, false);
                }
            }
        }
        self.publish_hosts(&state.destinations, false);
        self.registry.deregister(&self.name);
        loop_result
    }

    fn frame_loop(
        &self,
        settings: &CastSettings,
        spec: &SourceSpec,
        source: &mut dyn FrameSource,
        state: &mut LoopState,
        media_length: Option<u64>,
    ) -> CastResult<()> {
        let filters = FilterSettings::from(settings);
        let grid = settings.multicast && settings.cast_x * settings.cast_y > 1;
        let pool = settings
            .multicast
            .then(|| FanoutPool::new(state.devices.len()));
        let (out_w, out_h) = if grid {
            (
                settings.scale_width * settings.cast_x,
                settings.scale_height * settings.cast_y,
            )
        } else {
            (settings.scale_width, settings.scale_height)
        };
        let tile_bytes = (settings.scale_width * settings.scale_height * 3) as usize;
        let start = Instant::now();

        loop {
            if state.stop || self.registry.should_stop() {
                break;
            }

            let Some(mut raw) = source.next_frame()? else {
                tracing::info!(cast = %self.name, "source end of stream");
                break;
            };
            state.seq += 1;
            raw.seq = state.seq;
            self.registry.add_frames(1);

            let frame = pipeline::process(raw, out_w, out_h, &filters)?;

            if grid {
                let tiles = tile::split_grid(&frame, settings.cast_x, settings.cast_y)?;
                let order = state.swapper.order();
                let ordered: Vec<Arc<Device>> = order
                    .iter()
                    .map(|&i| Arc::clone(&state.devices[i]))
                    .collect();
                let payloads: Vec<Vec<u8>> = tiles.into_iter().map(|t| t.data).collect();
                if let Some(pool) = &pool {
                    pool.dispatch(&ordered, payloads, settings.retry);
                }
                self.registry.add_packets(
                    packet_estimate(settings, tile_bytes) * state.devices.len() as u64,
                );
            } else if settings.multicast {
                // Single-tile grid with several destinations: replicate.
                let payloads = vec![frame.data.clone(); state.devices.len()];
                if let Some(pool) = &pool {
                    pool.dispatch(&state.devices, payloads, settings.retry);
                }
                self.registry.add_packets(
                    packet_estimate(settings, frame.data.len()) * state.devices.len() as u64,
                );
            } else if settings.protocol != Protocol::Other {
                state.devices[0].enqueue(frame.data.clone(), settings.retry);
                self.registry
                    .add_packets(packet_estimate(settings, frame.data.len()));
            }

            if settings.put_to_buffer {
                push_ring(&mut state.ring, frame.clone(), settings.frame_max as usize);
            }

            if let Some(preview) = state.preview.as_mut() {
                if let Err(e) = preview.publish(&frame) {
                    tracing::warn!(cast = %self.name, error = %e, "preview publish failed");
                }
                let flags = preview.poll_flags();
                if flags.stop {
                    state.stop = true;
                }
                if flags.text_off {
                    state.text = false;
                }
                if flags.preview_off {
                    if let Some(preview) = state.preview.take() {
                        preview.destroy();
                    }
                }
            }

            for act in self.registry.drain_for(&self.name) {
                apply_action(
                    &self.name,
                    settings,
                    &self.devices,
                    &self.registry,
                    state,
                    &frame,
                    spec,
                    media_length,
                    act,
                );
            }

            if state.seq % 300 == 0 {
                tracing::debug!(cast = %self.name, seq = state.seq, "cast alive");
            }

            let delay = pacing_delay(start.elapsed(), state.seq, settings.rate);
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }

    /// Keep the bootstrap state file in sync with the devices this
    /// cast occupies. Best effort.
    fn publish_hosts(&self, destinations: &[Ipv4Addr], add: bool) {
        let path = statefile::default_path();
        let mut bootstrap = BootstrapState::load(&path);
        bootstrap.server_port = self.bus_port;
        for dest in destinations {
            if add {
                bootstrap.add_host(&dest.to_string());
            } else {
                bootstrap.remove_host(&dest.to_string());
            }
        }
        if let Err(e) = bootstrap.store(&path) {
            tracing::warn!(error = %e, "bootstrap state update failed");
        }
    }
}

/// Apply one action to the running cast. Handler failures are logged
/// and swallowed; the entry was already removed from the todo list.
#[allow(clippy::too_many_arguments)]
fn apply_action(
    name: &str,
    settings: &CastSettings,
    device_registry: &DeviceRegistry,
    registry: &CastRegistry,
    state: &mut LoopState,
    frame: &Frame,
    spec: &SourceSpec,
    media_length: Option<u64>,
    act: Action,
) {
    let verb: Verb = match act.verb.parse() {
        Ok(verb) => verb,
        Err(e) => {
            tracing::error!(cast = %name, error = %e, "action discarded");
            return;
        }
    };
    tracing::debug!(cast = %name, ?verb, params = %act.params, "applying action");
    match verb {
        Verb::Stop => state.stop = true,
        Verb::Shot => {
            push_ring(&mut state.ring, frame.clone(), settings.frame_max as usize);
        }
        Verb::Info => {
            let (frames, _) = registry.totals();
            let snapshot = action::info_snapshot(
                &InfoContext {
                    name,
                    kind: &registry.kind().to_string(),
                    source: &spec.label(),
                    protocol: &format!("{:?}", settings.protocol).to_lowercase(),
                    preview: state.preview.is_some(),
                    multicast: settings.multicast,
                    devices: state.destinations.iter().map(|d| d.to_string()).collect(),
                    width: settings.scale_width,
                    height: settings.scale_height,
                    fps: settings.rate,
                    frames,
                    start_unix: state.start_unix,
                    media_length,
                    text: state.text,
                },
                &act.params,
                Some(frame),
            );
            if registry.reply_tx.send(snapshot).is_err() {
                tracing::error!(cast = %name, "info reply channel closed");
            }
        }
        Verb::Reset => registry.reset_counters(),
        Verb::Host => {
            let new_ip: Ipv4Addr = match act.params.trim().parse() {
                Ok(ip) => ip,
                Err(_) => {
                    tracing::error!(cast = %name, params = %act.params, "host action: invalid address");
                    return;
                }
            };
            match device_registry.acquire(new_ip, settings) {
                Ok(device) => {
                    state.destinations[0] = new_ip;
                    state.devices[0] = device;
                    tracing::info!(cast = %name, host = %new_ip, "primary destination changed");
                }
                Err(e) => {
                    tracing::error!(cast = %name, error = %e, "host action failed");
                }
            }
        }
        Verb::Multicast => {
            if !settings.multicast {
                tracing::warn!(cast = %name, "multicast action ignored, cast is unicast");
                return;
            }
            let params = act.params.trim();
            if params.eq_ignore_ascii_case("stop") {
                state.swapper.stop();
                return;
            }
            let Some((effect, delay)) = params.split_once(',') else {
                tracing::error!(cast = %name, params, "multicast action needs effect,delay_ms");
                return;
            };
            let effect: SwapEffect = match effect.trim().parse() {
                Ok(effect) => effect,
                Err(e) => {
                    tracing::error!(cast = %name, error = %e, "multicast action discarded");
                    return;
                }
            };
            let delay_ms: u64 = match delay.trim().parse() {
                Ok(ms) => ms,
                Err(_) => {
                    tracing::error!(cast = %name, params, "multicast action: bad delay");
                    return;
                }
            };
            if state.swapper.running() {
                tracing::warn!(cast = %name, "swap effect already running, ignoring");
                return;
            }
            state.swapper.start(effect, delay_ms);
        }
        Verb::OpenPreview => {
            if state.preview.is_none() {
                let title = format!("{} {} {}", name, registry.kind(), spec.label());
                match PreviewMirror::create(name, settings, &title) {
                    Ok(preview) => state.preview = Some(preview),
                    Err(e) => tracing::error!(cast = %name, error = %e, "open-preview failed"),
                }
            }
        }
        Verb::ClosePreview => {
            if let Some(preview) = state.preview.take() {
                preview.destroy();
            }
        }
        Verb::StopText => state.text = false,
    }
}

/// Bounded snapshot ring: oldest frames fall out first.
fn push_ring(ring: &mut VecDeque<Frame>, frame: Frame, cap: usize) {
    while ring.len() >= cap.max(1) {
        ring.pop_front();
    }
    ring.push_back(frame);
}

/// How long to sleep so frame `seq` lands at `start + seq/rate`.
/// Never negative: a late frame returns zero and the loop catches up.
pub fn pacing_delay(elapsed: Duration, seq: u64, rate: u32) -> Duration {
    Duration::from_secs_f64(seq as f64 / rate.max(1) as f64).saturating_sub(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action as WireAction;

    fn test_registry() -> (Arc<CastRegistry>, Receiver<Value>) {
        CastRegistry::new(CastKind::Desktop, Arc::new(AtomicBool::new(false)))
    }

    fn test_state(devices: Vec<Arc<Device>>, destinations: Vec<Ipv4Addr>) -> LoopState {
        let len = destinations.len().max(1);
        LoopState {
            stop: false,
            text: true,
            preview: None,
            ring: VecDeque::new(),
            devices,
            destinations,
            swapper: IpSwapper::new(len),
            seq: 0,
            start_unix: 0,
        }
    }

    fn stop_action() -> Action {
        action::parse(&WireAction::encode("castA", "stop", "", "1")).unwrap()
    }

    #[test]
    fn registry_names_unique_per_kind() {
        let (registry, _rx) = test_registry();
        assert!(registry.register("castA"));
        assert!(!registry.register("castA"));
        assert!(registry.register("castB"));
        registry.deregister("castA");
        assert!(registry.register("castA"));
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn counters_reset() {
        let (registry, _rx) = test_registry();
        registry.add_frames(10);
        registry.add_packets(55);
        assert_eq!(registry.totals(), (10, 55));
        registry.reset_counters();
        assert_eq!(registry.totals(), (0, 0));
    }

    #[test]
    fn stop_action_is_idempotent() {
        let (registry, _rx) = test_registry();
        let devices = DeviceRegistry::new();
        let mut state = test_state(vec![], vec![Ipv4Addr::LOCALHOST]);
        let frame = Frame::solid(4, 4, [0, 0, 0]);
        let settings = CastSettings::default();
        let spec = SourceSpec::Desktop { monitor: 0 };

        for _ in 0..2 {
            apply_action(
                "castA",
                &settings,
                &devices,
                &registry,
                &mut state,
                &frame,
                &spec,
                None,
                stop_action(),
            );
        }
        assert!(state.stop);
        assert!(state.ring.is_empty());
    }

    #[test]
    fn host_action_swaps_primary_and_rejects_bad_ip() {
        let (registry, _rx) = test_registry();
        let devices = DeviceRegistry::new();
        let settings = CastSettings::default();
        let first = devices
            .acquire(Ipv4Addr::new(127, 0, 0, 1), &settings)
            .unwrap();
        let mut state = test_state(vec![first], vec![Ipv4Addr::LOCALHOST]);
        let frame = Frame::solid(4, 4, [0, 0, 0]);
        let spec = SourceSpec::Desktop { monitor: 0 };

        let host = action::parse(&WireAction::encode("castA", "host", "127.0.0.2", "1")).unwrap();
        apply_action(
            "castA", &settings, &devices, &registry, &mut state, &frame, &spec, None, host,
        );
        assert_eq!(state.destinations[0], Ipv4Addr::new(127, 0, 0, 2));

        let bad = action::parse(&WireAction::encode("castA", "host", "not-an-ip", "2")).unwrap();
        apply_action(
            "castA", &settings, &devices, &registry, &mut state, &frame, &spec, None, bad,
        );
        assert_eq!(state.destinations[0], Ipv4Addr::new(127, 0, 0, 2));
    }

    #[test]
    fn info_action_replies_on_channel() {
        let (registry, rx) = test_registry();
        let devices = DeviceRegistry::new();
        let settings = CastSettings::default();
        let mut state = test_state(vec![], vec![Ipv4Addr::LOCALHOST]);
        let frame = Frame::solid(4, 4, [1, 2, 3]);
        let spec = SourceSpec::Desktop { monitor: 0 };
        registry.add_frames(3);

        let info = action::parse(&WireAction::encode("castA", "info", "1", "9")).unwrap();
        apply_action(
            "castA", &settings, &devices, &registry, &mut state, &frame, &spec, None, info,
        );
        let snapshot = rx.try_recv().unwrap();
        assert_eq!(snapshot["castA"]["data"]["frames"], 3);
        assert_eq!(snapshot["castA"]["data"]["protocol"], "ddp");
        assert_ne!(snapshot["castA"]["data"]["img"], "None");
    }

    #[test]
    fn ring_is_bounded_fifo() {
        let mut ring = VecDeque::new();
        for i in 0..5u8 {
            push_ring(&mut ring, Frame::solid(1, 1, [i, 0, 0]), 3);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.front().unwrap().data[0], 2);
        assert_eq!(ring.back().unwrap().data[0], 4);
    }

    #[test]
    fn pacing_never_negative() {
        // behind schedule: no sleep
        assert_eq!(
            pacing_delay(Duration::from_secs(10), 5, 10),
            Duration::ZERO
        );
        // ahead of schedule: sleep the remainder
        let delay = pacing_delay(Duration::from_millis(50), 1, 10);
        assert!(delay >= Duration::from_millis(49) && delay <= Duration::from_millis(51));
        // zero rate clamps instead of dividing by zero
        let _ = pacing_delay(Duration::ZERO, 1, 0);
    }

    #[test]
    fn stop_all_and_exit_flags_stop_casts() {
        let exit = Arc::new(AtomicBool::new(false));
        let (registry, _rx) = CastRegistry::new(CastKind::Media, Arc::clone(&exit));
        assert!(!registry.should_stop());
        registry.stop_all();
        assert!(registry.should_stop());
        registry.clear_stop();
        assert!(!registry.should_stop());
        exit.store(true, Ordering::Relaxed);
        assert!(registry.should_stop());
    }
}
