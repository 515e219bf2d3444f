//! `pktfab bench` — timed synthetic benchmark with structured JSON output.
//!
//! Skips the UDP sources entirely: one generator thread per engine drives
//! synthetic frames straight into its engine for a fixed duration, then the
//! report captures fabric counters and per-tap delivery rates.

use anyhow::Result;
use chrono::Utc;
use pktfab_core::{Fabric, FabricSnapshot, Frame};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::AppConfig;
use crate::runtime::{engine_count, setup_taps};

#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub generated_at: String,
    pub duration_secs: u64,
    pub engines: usize,
    pub frames_generated: u64,
    pub frames_per_sec: f64,
    pub fabric: FabricSnapshot,
    pub taps: Vec<TapReport>,
}

#[derive(Debug, Serialize)]
pub struct TapReport {
    pub name: String,
    pub frames: u64,
    pub bytes: u64,
    pub frames_per_sec: f64,
}

/// A plausible capture payload: synthetic Ethernet + varying filler.
fn synth_frame(ifindex: i32, queue: u16, seq: u64) -> Frame {
    let mut bytes = vec![0u8; 14 + 128];
    bytes[12] = 0x08; // ETH_P_IP
    bytes[14..22].copy_from_slice(&seq.to_le_bytes());
    Frame::from_ethernet(ifindex, queue, bytes)
}

pub fn run(config: &AppConfig, duration_secs: u64, output: Option<PathBuf>) -> Result<()> {
    if config.taps.is_empty() {
        anyhow::bail!("no taps configured — run `pktfab init > fabric.toml` to create a config");
    }
    if config.bindings.is_empty() {
        anyhow::bail!("no bindings configured — bench needs at least one group/device binding");
    }

    let ncpu = engine_count(config);
    let fabric = Fabric::new_detached(config.fabric.clone(), ncpu)
        .map_err(|e| anyhow::anyhow!("fabric init failed: {e}"))?;
    for b in &config.bindings {
        fabric.devmap.attach(b.ifindex, b.queue, b.group);
    }

    let mut handles: Vec<JoinHandle<()>> = Vec::new();
    let taps = setup_taps(&fabric, &config.taps, &mut handles)?;

    eprintln!(
        "pktfab bench — {} engine(s), {} tap(s), running for {}s...",
        ncpu,
        taps.len(),
        duration_secs
    );

    let target = Duration::from_secs(duration_secs);
    let ifindex = config.bindings[0].ifindex;
    let mut generators: Vec<JoinHandle<u64>> = Vec::new();
    let start = Instant::now();
    for cpu in 0..ncpu {
        let fabric: Arc<Fabric> = fabric.clone();
        let gen = std::thread::Builder::new()
            .name(format!("bench-gen-{cpu}"))
            .spawn(move || {
                let mut eng = fabric.engine(cpu).expect("engine construction");
                let mut seq = 0u64;
                while start.elapsed() < target {
                    eng.receive(synth_frame(ifindex, cpu as u16, seq), 0);
                    seq += 1;
                }
                eng.flush();
                seq
            })
            .expect("failed to spawn generator thread");
        generators.push(gen);
    }

    let mut generated = 0u64;
    for g in generators {
        generated += g.join().expect("generator thread panicked");
    }
    let elapsed = start.elapsed().as_secs_f64();

    // Give tap threads a beat to drain what the queues still hold.
    std::thread::sleep(Duration::from_millis(200));

    let report = BenchReport {
        generated_at: Utc::now().to_rfc3339(),
        duration_secs,
        engines: ncpu,
        frames_generated: generated,
        frames_per_sec: generated as f64 / elapsed,
        fabric: fabric.snapshot(),
        taps: taps
            .iter()
            .map(|t| {
                let frames = t.stats.frames.load(std::sync::atomic::Ordering::Relaxed);
                TapReport {
                    name: t.name.clone(),
                    frames,
                    bytes: t.stats.bytes.load(std::sync::atomic::Ordering::Relaxed),
                    frames_per_sec: frames as f64 / elapsed,
                }
            })
            .collect(),
    };

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            eprintln!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    eprintln!();
    eprintln!("=== BENCH SUMMARY ({elapsed:.1}s) ===");
    eprintln!(
        "  generated={}  rate={:.0}/s  recv={}  lost={}",
        report.frames_generated,
        report.frames_per_sec,
        report.fabric.global.recv,
        report.fabric.global.lost
    );
    for t in &report.taps {
        eprintln!("  tap {}  frames={}  rate={:.0}/s", t.name, t.frames, t.frames_per_sec);
    }

    Ok(())
}
