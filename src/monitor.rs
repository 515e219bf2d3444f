//! `pktfab monitor` — live dashboard reading from the run metrics log.
//!
//! A read-only view: it tails the JSONL log written by `pktfab run` and
//! redraws every N seconds. Ctrl-C closes the view; the fabric keeps running.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::color;
use crate::config::AppConfig;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

pub fn run(config: &AppConfig, interval_secs: u64) -> Result<()> {
    if std::fs::metadata(&config.metrics_log).is_err() {
        eprintln!("No metrics log found at {}.", config.metrics_log);
        eprintln!();
        eprintln!("Start the fabric first:");
        eprintln!("  pktfab run");
        eprintln!();
        eprintln!("Then run `pktfab monitor` again.");
        return Ok(());
    }

    RUNNING.store(true, Ordering::SeqCst);
    unsafe { libc::signal(libc::SIGINT, handle_sigint as *const () as libc::sighandler_t) };

    println!(
        "{}",
        color::bold("PKTFAB MONITOR  —  Ctrl-C to close  (fabric keeps running)")
    );
    println!();

    let mut lines_drawn = 0usize;
    let mut prev: Option<serde_json::Value> = None;

    while RUNNING.load(Ordering::SeqCst) {
        let entry = read_last_entry(&config.metrics_log);

        if lines_drawn > 0 {
            print!("\x1b[{}A\x1b[0J", lines_drawn);
        }

        lines_drawn = match entry {
            Some(ref e) => draw_dashboard(e, prev.as_ref(), interval_secs),
            None => {
                println!("Waiting for first snapshot...");
                1
            }
        };
        std::io::stdout().flush().ok();
        prev = entry;

        let mut waited = 0u64;
        while waited < interval_secs && RUNNING.load(Ordering::SeqCst) {
            std::thread::sleep(std::time::Duration::from_secs(1));
            waited += 1;
        }
    }

    println!();
    println!("View closed.  The fabric is still running in the background.");
    Ok(())
}

fn read_last_entry(path: &str) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(path).ok()?;
    let line = content.lines().filter(|l| !l.is_empty()).last()?;
    serde_json::from_str(line).ok()
}

fn fmt_ts(secs: i64) -> String {
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(|d| d.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "—".into())
}

fn rate(cur: u64, prev_entry: Option<&serde_json::Value>, path: &[&str], interval: u64) -> String {
    let Some(p) = prev_entry else { return "—".into() };
    let mut v = p;
    for key in path {
        v = &v[*key];
    }
    match v.as_u64() {
        Some(old) if interval > 0 => format!("{:.0}/s", cur.saturating_sub(old) as f64 / interval as f64),
        _ => "—".into(),
    }
}

fn draw_dashboard(
    entry: &serde_json::Value,
    prev: Option<&serde_json::Value>,
    interval: u64,
) -> usize {
    const W: usize = 90;
    let mut out: Vec<String> = Vec::new();

    let ts = entry["ts"].as_u64().unwrap_or(0) as i64;
    let started_at = entry["started_at"].as_u64().unwrap_or(0) as i64;
    let uptime = (ts - started_at).max(0) as u64;
    let uptime_str = format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60);

    out.push(color::bold(&"=".repeat(W)));
    out.push(color::bold_cyan(&format!(
        "{:^W$}",
        format!("  PKTFAB FABRIC  {}  ", fmt_ts(ts))
    )));
    out.push(color::bold(&"=".repeat(W)));
    out.push(color::dim(&format!(
        "  Started: {}   Uptime: {}",
        fmt_ts(started_at),
        uptime_str
    )));
    out.push(String::new());

    // Global counters
    let g = &entry["fabric"]["global"];
    let recv = g["recv"].as_u64().unwrap_or(0);
    let lost = g["lost"].as_u64().unwrap_or(0);
    out.push(color::bold(&format!(
        "{:<10}  {:>12}  {:>9}  {:>9}  {:>9}  {:>9}  {:>9}",
        "GLOBAL", "RECV", "RATE", "LOST", "KERN", "FRWD", "DISC",
    )));
    let row = format!(
        "{:<10}  {:>12}  {:>9}  {:>9}  {:>9}  {:>9}  {:>9}",
        "",
        recv,
        rate(recv, prev, &["fabric", "global", "recv"], interval),
        lost,
        g["kern"].as_u64().unwrap_or(0),
        g["frwd"].as_u64().unwrap_or(0),
        g["disc"].as_u64().unwrap_or(0),
    );
    out.push(if lost > 0 { color::yellow(&row) } else { row });
    out.push(String::new());

    // Per-group table
    out.push(color::bold(&format!(
        "{:<8}  {:>12}  {:>10}  {:>9}  {:>9}",
        "GROUP", "RECV", "DROP", "FRWD", "KERN",
    )));
    out.push(color::dim(&"-".repeat(W)));
    if let Some(groups) = entry["fabric"]["groups"].as_array() {
        if groups.is_empty() {
            out.push(color::dim("  no groups in use"));
        }
        for grp in groups {
            let drop = grp["stats"]["drop"].as_u64().unwrap_or(0);
            let row = format!(
                "{:<8}  {:>12}  {:>10}  {:>9}  {:>9}",
                grp["gid"].as_u64().unwrap_or(0),
                grp["stats"]["recv"].as_u64().unwrap_or(0),
                drop,
                grp["stats"]["frwd"].as_u64().unwrap_or(0),
                grp["stats"]["kern"].as_u64().unwrap_or(0),
            );
            out.push(if drop > 0 { color::yellow(&row) } else { color::green(&row) });
        }
    }
    out.push(String::new());

    // Taps
    out.push(color::bold(&format!(
        "{:<20}  {:>12}  {:>9}  {:>12}",
        "TAP", "FRAMES", "RATE", "BYTES",
    )));
    out.push(color::dim(&"-".repeat(W)));
    if let Some(taps) = entry["taps"].as_array() {
        for (i, t) in taps.iter().enumerate() {
            let frames = t["frames"].as_u64().unwrap_or(0);
            out.push(format!(
                "{:<20}  {:>12}  {:>9}  {:>12}",
                t["name"].as_str().unwrap_or("?"),
                frames,
                {
                    // Rates need positional lookup into the previous taps array.
                    match prev.and_then(|p| p["taps"].as_array()).and_then(|a| a.get(i)) {
                        Some(pt) => {
                            let old = pt["frames"].as_u64().unwrap_or(0);
                            if interval > 0 {
                                format!("{:.0}/s", frames.saturating_sub(old) as f64 / interval as f64)
                            } else {
                                "—".into()
                            }
                        }
                        None => "—".into(),
                    }
                },
                t["bytes"].as_u64().unwrap_or(0),
            ));
        }
    }
    out.push(String::new());

    // Pool line
    let pool = &entry["fabric"]["pool"];
    let pool_alloc = pool["pool_alloc"].as_u64().unwrap_or(0);
    let os_alloc = pool["os_alloc"].as_u64().unwrap_or(0);
    let hit = if pool_alloc + os_alloc > 0 {
        format!("{:.0}%", pool_alloc as f64 / (pool_alloc + os_alloc) as f64 * 100.0)
    } else {
        "—".into()
    };
    out.push(color::dim(&format!(
        "  pool: recycled={}  fresh={}  hit={}    lost frames indicate slow taps or GC pressure",
        pool_alloc, os_alloc, hit
    )));

    let count = out.len();
    for line in out {
        println!("{}", line);
    }
    count
}
