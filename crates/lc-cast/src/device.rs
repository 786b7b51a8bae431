//! LED controller devices and their send queues.
//!
//! Each `Device` owns a UDP socket and a dedicated worker thread
//! draining a frame queue, so the capture loop never waits on network
//! latency. Devices are shared across casts through a process-global
//! registry keyed by address: the first cast to reach a controller
//! fixes its port and wire protocol.

use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;

use lc_common::config::{CastSettings, Protocol};
use lc_common::{CastError, CastResult};
use lc_protocol::artnet::{ArtnetConfig, ArtnetPacketizer};
use lc_protocol::ddp::DdpPacketizer;
use lc_protocol::e131::{E131Config, E131Packetizer};

/// Queue depth above which enqueue warns (soft limit).
pub const QUEUE_WARN_DEPTH: usize = 500;

/// Link state of a device as observed by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unknown,
    Online,
    Warned,
}

/// Wire protocol bound to a device.
pub enum Wire {
    Ddp(DdpPacketizer),
    E131(E131Packetizer),
    Artnet(ArtnetPacketizer),
}

impl Wire {
    fn packetize(&mut self, pixels: &[u8]) -> Vec<Vec<u8>> {
        match self {
            Wire::Ddp(p) => p.packetize(pixels),
            Wire::E131(p) => p.packetize(pixels),
            Wire::Artnet(p) => p.packetize(pixels),
        }
    }
}

/// What a device is asked to send: datagrams per protocol, plus
/// per-datagram duplication. E1.31 blackout runs through the same
/// queue so it cannot overtake in-flight frames.
enum SendJob {
    Frame { pixels: Vec<u8>, retry: u32 },
    Blackout { pixel_count: usize },
}

struct DeviceInner {
    addr: Ipv4Addr,
    port: u16,
    frame_count: AtomicU64,
    packet_count: AtomicU64,
    state: Mutex<LinkState>,
    saturated: AtomicBool,
}

/// One addressable LED controller with its owned send queue.
pub struct Device {
    inner: Arc<DeviceInner>,
    tx: Sender<SendJob>,
}

impl Device {
    /// Bind a socket, start the worker, return the shared handle.
    pub fn spawn(addr: Ipv4Addr, port: u16, wire: Wire) -> CastResult<Arc<Self>> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        let (tx, rx) = unbounded();
        let inner = Arc::new(DeviceInner {
            addr,
            port,
            frame_count: AtomicU64::new(0),
            packet_count: AtomicU64::new(0),
            state: Mutex::new(LinkState::Unknown),
            saturated: AtomicBool::new(false),
        });

        let worker_inner = Arc::clone(&inner);
        std::thread::Builder::new()
            .name(format!("dev-{addr}"))
            .spawn(move || worker_loop(rx, socket, wire, worker_inner))
            .map_err(|e| CastError::Internal(e.into()))?;

        Ok(Arc::new(Self { inner, tx }))
    }

    /// Queue one frame for transmission. Never blocks; depth beyond
    /// the soft limit logs a warning and keeps accepting.
    pub fn enqueue(&self, pixels: Vec<u8>, retry: u32) {
        let depth = self.tx.len();
        if depth > QUEUE_WARN_DEPTH {
            if !self.inner.saturated.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    device = %self.inner.addr,
                    depth,
                    "send queue saturated, frames will be late"
                );
            }
        } else if depth < QUEUE_WARN_DEPTH / 2 {
            self.inner.saturated.store(false, Ordering::Relaxed);
        }
        let _ = self.tx.send(SendJob::Frame { pixels, retry });
    }

    /// Queue an E1.31 blackout; a no-op for other protocols.
    pub fn enqueue_blackout(&self, pixel_count: usize) {
        let _ = self.tx.send(SendJob::Blackout { pixel_count });
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.inner.addr
    }

    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.frame_count.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u64 {
        self.inner.packet_count.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state.lock()
    }
}

fn worker_loop(rx: Receiver<SendJob>, socket: UdpSocket, mut wire: Wire, inner: Arc<DeviceInner>) {
    let dest = SocketAddr::from((inner.addr, inner.port));
    while let Ok(job) = rx.recv() {
        let (packets, copies) = match job {
            SendJob::Frame { pixels, retry } => {
                inner.frame_count.fetch_add(1, Ordering::Relaxed);
                (wire.packetize(&pixels), 1 + retry as u64)
            }
            SendJob::Blackout { pixel_count } => match &mut wire {
                Wire::E131(p) => (p.blackout_packets(pixel_count), 1),
                _ => continue,
            },
        };

        let mut error: Option<std::io::Error> = None;
        'frame: for packet in &packets {
            for _ in 0..copies {
                if let Err(e) = socket.send_to(packet, dest) {
                    error = Some(e);
                    break 'frame;
                }
            }
        }

        let mut state = inner.state.lock();
        match error {
            Some(e) => {
                if *state != LinkState::Warned {
                    tracing::error!(device = %inner.addr, error = %e, "send failed");
                    *state = LinkState::Warned;
                }
            }
            None => {
                inner
                    .packet_count
                    .fetch_add(packets.len() as u64 * copies, Ordering::Relaxed);
                if *state == LinkState::Warned {
                    tracing::info!(device = %inner.addr, "connection reestablished");
                }
                *state = LinkState::Online;
            }
        }
    }
}

/// Process-global device registry; insert-only, deduplicated by address.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<Ipv4Addr, Arc<Device>>,
}

impl DeviceRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetch or create the device for `addr`, binding the wire
    /// protocol from the cast settings on first use.
    pub fn acquire(&self, addr: Ipv4Addr, settings: &CastSettings) -> CastResult<Arc<Device>> {
        if let Some(existing) = self.devices.get(&addr) {
            return Ok(Arc::clone(&existing));
        }
        let device = Device::spawn(addr, default_port(settings.protocol), make_wire(settings))?;
        // A racing insert wins; the loser's worker exits when its
        // queue handle drops.
        let entry = self
            .devices
            .entry(addr)
            .or_insert_with(|| Arc::clone(&device));
        Ok(Arc::clone(&*entry))
    }

    pub fn get(&self, addr: Ipv4Addr) -> Option<Arc<Device>> {
        self.devices.get(&addr).map(|d| Arc::clone(&d))
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Default UDP port per protocol.
pub fn default_port(protocol: Protocol) -> u16 {
    match protocol {
        Protocol::Ddp | Protocol::Other => lc_protocol::DDP_PORT,
        Protocol::E131 => lc_protocol::E131_PORT,
        Protocol::Artnet => lc_protocol::ARTNET_PORT,
    }
}

fn make_wire(settings: &CastSettings) -> Wire {
    match settings.protocol {
        Protocol::Ddp | Protocol::Other => Wire::Ddp(DdpPacketizer::new()),
        Protocol::E131 => Wire::E131(E131Packetizer::new(E131Config {
            source_name: settings.e131_name.clone(),
            universe: settings.universe as u16,
            pixel_count: settings.pixel_count as usize,
            priority: settings.packet_priority as u8,
            universe_size: settings.universe_size as usize,
            channel_offset: settings.channel_offset as usize,
            channels_per_pixel: settings.channels_per_pixel as usize,
            blackout: true,
        })),
        Protocol::Artnet => Wire::Artnet(ArtnetPacketizer::new(ArtnetConfig {
            universe: settings.universe as u16,
            pixel_count: settings.pixel_count as usize,
            universe_size: settings.universe_size.min(512) as usize,
            channel_offset: settings.channel_offset as usize,
            channels_per_pixel: settings.channels_per_pixel as usize,
        })),
    }
}

/// Number of datagrams one frame will produce, for the cast-side
/// packet counters.
pub fn packet_estimate(settings: &CastSettings, pixel_bytes: usize) -> u64 {
    match settings.protocol {
        Protocol::Ddp | Protocol::Other => DdpPacketizer::packet_count(pixel_bytes) as u64,
        Protocol::E131 | Protocol::Artnet => {
            let cpp = settings.channels_per_pixel as usize;
            let channels = settings.channel_offset as usize + (pixel_bytes / 3) * cpp;
            let size = settings.universe_size.clamp(1, 512) as usize;
            channels.div_ceil(size).max(1) as u64
        }
    }
}

/// TCP liveness probe used at cast Opening (WLED keeps port 80 open).
pub fn probe_tcp(addr: Ipv4Addr, port: u16, timeout: Duration) -> bool {
    TcpStream::connect_timeout(&SocketAddr::from((addr, port)), timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use lc_protocol::ddp::{HEADER_LEN, MAX_DATALEN};

    fn recv_packets(socket: &UdpSocket, n: usize) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 2048];
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        while out.len() < n {
            let (len, _) = socket.recv_from(&mut buf).unwrap();
            out.push(buf[..len].to_vec());
        }
        out
    }

    #[test]
    fn frames_arrive_in_order_and_reassemble() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let device = Device::spawn(
            Ipv4Addr::LOCALHOST,
            port,
            Wire::Ddp(DdpPacketizer::new()),
        )
        .unwrap();

        // 64x32 frame -> 5 packets
        let frame_a = vec![1u8; 64 * 32 * 3];
        let frame_b = vec![2u8; 64 * 32 * 3];
        device.enqueue(frame_a.clone(), 0);
        device.enqueue(frame_b.clone(), 0);

        let packets = recv_packets(&receiver, 10);
        // per-frame: PUSH only on the 5th, payload reassembles
        for (i, chunk) in packets.chunks(5).enumerate() {
            let mut payload = Vec::new();
            for (j, pkt) in chunk.iter().enumerate() {
                assert_eq!(pkt[0] & 0x01 != 0, j == 4, "push bit placement");
                payload.extend_from_slice(&pkt[HEADER_LEN..]);
            }
            assert_eq!(payload, if i == 0 { frame_a.clone() } else { frame_b.clone() });
        }
        // frame A's packets all precede frame B's (offsets restart at 0)
        let offsets: Vec<u32> = packets
            .iter()
            .map(|p| u32::from_be_bytes([p[4], p[5], p[6], p[7]]))
            .collect();
        assert_eq!(offsets[0], 0);
        assert_eq!(offsets[5], 0);
        assert!(offsets[..5].windows(2).all(|w| w[1] == w[0] + MAX_DATALEN as u32));
        assert_eq!(device.frame_count(), 2);
    }

    #[test]
    fn retry_duplicates_every_datagram() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = receiver.local_addr().unwrap().port();
        let device = Device::spawn(
            Ipv4Addr::LOCALHOST,
            port,
            Wire::Ddp(DdpPacketizer::new()),
        )
        .unwrap();

        // single-packet frame, retry=2 -> 3 identical datagrams
        device.enqueue(vec![9u8; 30], 2);
        let packets = recv_packets(&receiver, 3);
        assert_eq!(packets[0], packets[1]);
        assert_eq!(packets[1], packets[2]);
        // the duplicated packet is the PUSH packet
        assert_eq!(packets[0][0], 0x41);
    }

    #[test]
    fn registry_deduplicates_by_address() {
        let registry = DeviceRegistry::new();
        let settings = CastSettings::default();
        let a = registry
            .acquire(Ipv4Addr::new(127, 0, 0, 1), &settings)
            .unwrap();
        let b = registry
            .acquire(Ipv4Addr::new(127, 0, 0, 1), &settings)
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn packet_estimates() {
        let settings = CastSettings::default();
        assert_eq!(packet_estimate(&settings, 64 * 32 * 3), 5);
        let e131 = CastSettings {
            protocol: Protocol::E131,
            ..CastSettings::default()
        };
        // 200 pixels = 600 channels over 510-slot universes
        assert_eq!(packet_estimate(&e131, 200 * 3), 2);
    }
}
