//! `pktfab run` — the capture service loop.
//!
//! Wires the configured UDP sources into per-engine frame channels, spawns
//! one receive-engine thread per configured engine (optionally pinned), one
//! drain thread per tap, and appends a JSONL metrics snapshot every N
//! seconds. `pktfab monitor` tails that log. Ctrl-C stops everything.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use pktfab_core::{Delivery, Egress, Fabric, FabricSnapshot, Frame, HookVerdict, RxEngine, Socket};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{AppConfig, TapEntry};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Ethernet header prepended to UDP payloads entering the fabric: zeroed
/// MACs, EtherType IPv4.
const SYNTH_ETH_HDR: [u8; 14] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x08, 0x00];

const PKT_CAP: usize = 2048;

// ---------------------------------------------------------------------------
// Taps
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TapStats {
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
}

pub struct TapHandle {
    pub name: String,
    pub sock_id: usize,
    pub stats: Arc<TapStats>,
}

/// Open one socket per tap, join its group, and spawn a drain thread.
pub fn setup_taps(
    fabric: &Arc<Fabric>,
    taps: &[TapEntry],
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<Vec<TapHandle>> {
    let pid = std::process::id();
    let mut out = Vec::with_capacity(taps.len());
    for tap in taps {
        let caplen = tap.caplen.unwrap_or(fabric.params.cap_len);
        let (so, rx): (Arc<Socket>, Receiver<Delivery>) = fabric
            .open_socket_with(caplen, fabric.params.max_queue_slots, Egress::Socket)
            .map_err(|e| anyhow::anyhow!("tap '{}': socket open failed: {e}", tap.name))?;
        fabric
            .groups
            .join(tap.group, so.id, tap.class_mask(), tap.policy, pid)
            .map_err(|e| anyhow::anyhow!("tap '{}': join group {} failed: {e}", tap.name, tap.group))?;

        let stats = Arc::new(TapStats::default());
        let drain_stats = stats.clone();
        let name = tap.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tap-{}", name))
            .spawn(move || {
                for d in &rx {
                    drain_stats.frames.fetch_add(1, Ordering::Relaxed);
                    drain_stats
                        .bytes
                        .fetch_add(d.header.caplen as u64, Ordering::Relaxed);
                }
            })
            .expect("failed to spawn tap thread");
        handles.push(handle);

        tracing::info!(tap = %tap.name, group = tap.group, sock = so.id, "tap ready");
        out.push(TapHandle {
            name: tap.name.clone(),
            sock_id: so.id,
            stats,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Engines and sources
// ---------------------------------------------------------------------------

pub fn engine_count(config: &AppConfig) -> usize {
    if config.engines > 0 {
        config.engines
    } else {
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

fn intake(eng: &mut RxEngine, frame: Frame, direct: bool) {
    if direct {
        if let HookVerdict::Pass(f) = eng.netif_receive(frame) {
            // No group listening on this device: release the frame.
            eng.free_frame(f);
        }
    } else {
        eng.packet_rcv(frame);
    }
}

/// Spawn one engine thread per engine; each owns its RxEngine and drains its
/// frame channel, flushing stalled batches on a 100 ms idle timer.
fn spawn_engines(
    fabric: &Arc<Fabric>,
    config: &AppConfig,
    ncpu: usize,
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<Vec<Sender<Frame>>> {
    let direct = config.fabric.direct_capture;
    let mut senders = Vec::with_capacity(ncpu);
    for cpu in 0..ncpu {
        let (tx, rx) = bounded::<Frame>(4096);
        senders.push(tx);
        let mut eng = fabric
            .engine(cpu)
            .map_err(|e| anyhow::anyhow!("engine {cpu}: {e}"))?;
        let pin = config.pin_cores.get(cpu).copied();
        let handle = std::thread::Builder::new()
            .name(format!("engine-{cpu}"))
            .spawn(move || {
                if let Some(core) = pin {
                    pin_to_core(core);
                }
                loop {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(frame) => intake(&mut eng, frame, direct),
                        Err(crossbeam_channel::RecvTimeoutError::Timeout) => eng.flush(),
                        Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                            eng.flush();
                            break;
                        }
                    }
                }
            })
            .expect("failed to spawn engine thread");
        handles.push(handle);
    }
    Ok(senders)
}

/// Bind one UDP listener per source and pump datagrams into the fabric as
/// synthetic Ethernet frames on the source's `(ifindex, queue)`.
fn spawn_sources(
    config: &AppConfig,
    engine_tx: &[Sender<Frame>],
    handles: &mut Vec<JoinHandle<()>>,
) -> Result<()> {
    for src in &config.sources {
        let addr: SocketAddr = src
            .listen
            .parse()
            .with_context(|| format!("source '{}': bad listen address", src.name))?;
        let sock = udp_listener(addr)
            .with_context(|| format!("source '{}': bind {addr} failed", src.name))?;
        let tx = engine_tx[(src.queue as usize) % engine_tx.len()].clone();
        let (name, ifindex, queue) = (src.name.clone(), src.ifindex, src.queue);
        let handle = std::thread::Builder::new()
            .name(format!("src-{}", name))
            .spawn(move || {
                let mut buf = [0u8; PKT_CAP];
                let mut bytes = Vec::with_capacity(PKT_CAP + SYNTH_ETH_HDR.len());
                while RUNNING.load(Ordering::SeqCst) {
                    let n = match sock.recv_from(&mut buf) {
                        Ok((n, _)) => n,
                        Err(ref e)
                            if e.kind() == std::io::ErrorKind::WouldBlock
                                || e.kind() == std::io::ErrorKind::TimedOut =>
                        {
                            continue
                        }
                        Err(e) => {
                            tracing::warn!(source = %name, err = %e, "recv failed");
                            continue;
                        }
                    };
                    bytes.clear();
                    bytes.extend_from_slice(&SYNTH_ETH_HDR);
                    bytes.extend_from_slice(&buf[..n]);
                    let frame = Frame::from_ethernet(ifindex, queue, bytes.clone());
                    // Engine backpressure: drop on a full channel.
                    let _ = tx.try_send(frame);
                }
            })
            .expect("failed to spawn source thread");
        handles.push(handle);
        tracing::info!(source = %src.name, listen = %src.listen, ifindex = src.ifindex, "source ready");
    }
    Ok(())
}

/// socket2-configured UDP listener: reuse-address, busy-poll on Linux, and a
/// receive timeout so source threads notice shutdown.
fn udp_listener(addr: SocketAddr) -> Result<UdpSocket> {
    let sock = RawSocket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;

    #[cfg(target_os = "linux")]
    {
        use std::mem::size_of;
        use std::os::unix::io::AsRawFd;
        unsafe {
            // SO_BUSY_POLL: spin briefly before blocking.
            let val: libc::c_int = 50;
            libc::setsockopt(
                sock.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BUSY_POLL,
                &val as *const _ as _,
                size_of::<libc::c_int>() as _,
            );
        }
    }

    sock.bind(&addr.into())?;
    let sock: UdpSocket = sock.into();
    sock.set_read_timeout(Some(Duration::from_millis(500)))?;
    Ok(sock)
}

pub fn pin_to_core(core_id: usize) {
    #[cfg(target_os = "linux")]
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    #[cfg(not(target_os = "linux"))]
    let _ = core_id;
}

// ---------------------------------------------------------------------------
// Service loop
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct LogEntry<'a> {
    ts: u64,
    started_at: u64,
    fabric: FabricSnapshot,
    taps: Vec<TapSnap<'a>>,
}

#[derive(Serialize)]
struct TapSnap<'a> {
    name: &'a str,
    frames: u64,
    bytes: u64,
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn run(config: &AppConfig, interval_secs: u64) -> Result<()> {
    if config.sources.is_empty() {
        anyhow::bail!("no sources configured — run `pktfab init > fabric.toml` to create a config");
    }

    let ncpu = engine_count(config);
    let fabric = Fabric::new_detached(config.fabric.clone(), ncpu)
        .map_err(|e| anyhow::anyhow!("fabric init failed: {e}"))?;

    for b in &config.bindings {
        fabric.devmap.attach(b.ifindex, b.queue, b.group);
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let taps = setup_taps(&fabric, &config.taps, &mut handles)?;
    let engine_tx = spawn_engines(&fabric, config, ncpu, &mut handles)?;
    spawn_sources(config, &engine_tx, &mut handles)?;

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    eprintln!(
        "pktfab run — {} engine(s), {} source(s), {} tap(s); logging to {} every {}s",
        ncpu,
        config.sources.len(),
        taps.len(),
        config.metrics_log,
        interval_secs
    );
    eprintln!("Run `pktfab monitor` in another terminal to watch.");

    let started_at = epoch_secs();
    while RUNNING.load(Ordering::SeqCst) {
        let mut waited = 0u64;
        while waited < interval_secs && RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_secs(1));
            waited += 1;
        }

        let entry = LogEntry {
            ts: epoch_secs(),
            started_at,
            fabric: fabric.snapshot(),
            taps: taps
                .iter()
                .map(|t| TapSnap {
                    name: &t.name,
                    frames: t.stats.frames.load(Ordering::Relaxed),
                    bytes: t.stats.bytes.load(Ordering::Relaxed),
                })
                .collect(),
        };
        if let Err(e) = append_log(&config.metrics_log, &entry) {
            tracing::warn!(err = %e, path = %config.metrics_log, "metrics log write failed");
        }
    }

    eprintln!();
    eprintln!("pktfab stopping.");
    let snap = fabric.snapshot();
    eprintln!(
        "  recv={}  lost={}  kern={}  frwd={}  disc={}",
        snap.global.recv, snap.global.lost, snap.global.kern, snap.global.frwd, snap.global.disc
    );
    // Engine and source threads exit when their channels close or RUNNING
    // flips; taps end with the process.
    drop(engine_tx);
    Ok(())
}

fn append_log(path: &str, entry: &LogEntry<'_>) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")?;
    Ok(())
}
