//! Synchronized fan-out to a device group.
//!
//! Tile grids must present one visual instant across controllers, so
//! every tick submits all enqueues in parallel and waits on a barrier:
//! workers hold at a start gate (500 ms) until all jobs of the tick
//! are queued, then the dispatcher waits for every submission to land
//! (1 s). A worker that misses the gate drops that tick for its
//! destination only. Per-device queues absorb per-device latency
//! afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::device::Device;

const START_GATE_WAIT: Duration = Duration::from_millis(500);
const TICK_WAIT: Duration = Duration::from_secs(1);

/// Open/closed latch the tick workers wait on.
struct StartGate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl StartGate {
    fn new() -> Self {
        Self {
            open: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cond.notify_all();
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock();
        while !*open {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_for(&mut open, deadline - now);
        }
        true
    }
}

/// Countdown of submissions still outstanding this tick.
struct TickCounter {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl TickCounter {
    fn new(n: usize) -> Self {
        Self {
            remaining: Mutex::new(n),
            cond: Condvar::new(),
        }
    }

    fn done(&self) {
        let mut remaining = self.remaining.lock();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait for zero; returns how many submissions were still pending
    /// at the deadline.
    fn wait_zero(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut remaining = self.remaining.lock();
        while *remaining > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.cond.wait_for(&mut remaining, deadline - now);
        }
        *remaining
    }
}

struct FanoutJob {
    device: Arc<Device>,
    pixels: Vec<u8>,
    retry: u32,
    gate: Arc<StartGate>,
    counter: Arc<TickCounter>,
}

/// Bounded worker pool for multicast ticks, sized to the destination
/// count at cast Opening.
pub struct FanoutPool {
    tx: Sender<FanoutJob>,
}

impl FanoutPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = unbounded::<FanoutJob>();
        for i in 0..size.max(1) {
            let rx: Receiver<FanoutJob> = rx.clone();
            let _ = std::thread::Builder::new()
                .name(format!("fanout-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        if job.gate.wait(START_GATE_WAIT) {
                            job.device.enqueue(job.pixels, job.retry);
                        } else {
                            tracing::warn!(device = %job.device.addr(), "multicast frame dropped");
                        }
                        job.counter.done();
                    }
                });
        }
        Self { tx }
    }

    /// Dispatch one synchronized tick: `frames[i]` goes to
    /// `devices[i]`. Returns the number of destinations whose
    /// submission missed the barrier window.
    pub fn dispatch(&self, devices: &[Arc<Device>], frames: Vec<Vec<u8>>, retry: u32) -> usize {
        debug_assert_eq!(devices.len(), frames.len());
        let gate = Arc::new(StartGate::new());
        let counter = Arc::new(TickCounter::new(frames.len()));
        for (device, pixels) in devices.iter().zip(frames) {
            let _ = self.tx.send(FanoutJob {
                device: Arc::clone(device),
                pixels,
                retry,
                gate: Arc::clone(&gate),
                counter: Arc::clone(&counter),
            });
        }
        gate.open();
        let late = counter.wait_zero(TICK_WAIT);
        if late > 0 {
            tracing::warn!(late, "multicast tick incomplete within barrier window");
        }
        late
    }
}

/// Multicast destination-order effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapEffect {
    Circular,
    Reverse,
    Random,
    RandomReplace,
}

impl std::str::FromStr for SwapEffect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "circular" => Ok(Self::Circular),
            "reverse" => Ok(Self::Reverse),
            "random" => Ok(Self::Random),
            // legacy verb for random-replace
            "pause" | "random-replace" => Ok(Self::RandomReplace),
            other => Err(format!("unknown swap effect '{other}'")),
        }
    }
}

struct SwapperState {
    /// Maps tile index -> index into the base destination list.
    order: Vec<usize>,
    running: bool,
    epoch: u64,
}

/// Reorders the destination list between ticks to produce visual
/// effects on a tile grid. One timer thread per active effect;
/// starting a new effect or `stop` cancels the previous one via the
/// epoch counter.
pub struct IpSwapper {
    len: usize,
    state: Arc<Mutex<SwapperState>>,
}

impl IpSwapper {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            state: Arc::new(Mutex::new(SwapperState {
                order: (0..len).collect(),
                running: false,
                epoch: 0,
            })),
        }
    }

    /// Current tile-to-destination mapping.
    pub fn order(&self) -> Vec<usize> {
        self.state.lock().order.clone()
    }

    pub fn running(&self) -> bool {
        self.state.lock().running
    }

    /// Start an effect mutating the order every `interval_ms`.
    pub fn start(&self, effect: SwapEffect, interval_ms: u64) {
        let len = self.len;
        if len < 2 {
            return;
        }
        let state = Arc::clone(&self.state);
        let epoch = {
            let mut s = state.lock();
            s.epoch += 1;
            s.running = true;
            s.order = (0..len).collect();
            s.epoch
        };
        let interval = Duration::from_millis(interval_ms.max(1));
        let _ = std::thread::Builder::new()
            .name("ip-swapper".into())
            .spawn(move || {
                let mut rng = rand::thread_rng();
                loop {
                    std::thread::sleep(interval);
                    let mut s = state.lock();
                    if s.epoch != epoch || !s.running {
                        break;
                    }
                    match effect {
                        SwapEffect::Circular => s.order.rotate_left(1),
                        SwapEffect::Reverse => s.order.reverse(),
                        SwapEffect::Random => s.order.shuffle(&mut rng),
                        SwapEffect::RandomReplace => {
                            s.order = (0..len).collect();
                            let dst = rng.gen_range(0..len);
                            let src = rng.gen_range(0..len);
                            s.order[dst] = src;
                        }
                    }
                }
            });
    }

    /// Cancel the running effect and restore the configured order.
    pub fn stop(&self) {
        let mut s = self.state.lock();
        s.epoch += 1;
        s.running = false;
        s.order = (0..self.len).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_protocol::ddp::DdpPacketizer;
    use std::net::{Ipv4Addr, UdpSocket};

    #[test]
    fn dispatch_submits_every_destination() {
        let receivers: Vec<UdpSocket> = (0..2)
            .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        let devices: Vec<Arc<Device>> = receivers
            .iter()
            .map(|r| {
                Device::spawn(
                    Ipv4Addr::LOCALHOST,
                    r.local_addr().unwrap().port(),
                    crate::device::Wire::Ddp(DdpPacketizer::new()),
                )
                .unwrap()
            })
            .collect();

        let pool = FanoutPool::new(2);
        let late = pool.dispatch(&devices, vec![vec![1u8; 30], vec![2u8; 30]], 0);
        assert_eq!(late, 0);

        let mut buf = [0u8; 256];
        for (i, receiver) in receivers.iter().enumerate() {
            receiver
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let (len, _) = receiver.recv_from(&mut buf).unwrap();
            assert_eq!(buf[10], (i + 1) as u8);
            assert_eq!(len, 10 + 30);
        }
    }

    #[test]
    fn swapper_circular_rotates_and_stops() {
        let swapper = IpSwapper::new(3);
        assert_eq!(swapper.order(), vec![0, 1, 2]);
        swapper.start(SwapEffect::Circular, 10);
        assert!(swapper.running());
        std::thread::sleep(Duration::from_millis(100));
        // order is some rotation, still a permutation
        let mut order = swapper.order();
        order.sort_unstable();
        assert_eq!(order, vec![0, 1, 2]);
        swapper.stop();
        assert!(!swapper.running());
        assert_eq!(swapper.order(), vec![0, 1, 2]);
    }

    #[test]
    fn swapper_reverse_toggles() {
        let swapper = IpSwapper::new(4);
        swapper.start(SwapEffect::Reverse, 5);
        std::thread::sleep(Duration::from_millis(60));
        swapper.stop();
        assert_eq!(swapper.order(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn single_destination_swapper_is_inert() {
        let swapper = IpSwapper::new(1);
        swapper.start(SwapEffect::Random, 1);
        assert!(!swapper.running());
        assert_eq!(swapper.order(), vec![0]);
    }
}
