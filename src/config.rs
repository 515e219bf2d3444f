//! `fabric.toml` configuration for pktfab.

use anyhow::{Context, Result};
use pktfab_core::{FabricParams, Policy};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level fabric configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Engine/core parameters; every field has a sensible default.
    #[serde(default)]
    pub fabric: FabricParams,

    /// Number of receive engines (one per thread). 0 = one per CPU.
    #[serde(default)]
    pub engines: usize,

    /// Optional CPU cores to pin engine threads to, in engine order.
    #[serde(default)]
    pub pin_cores: Vec<usize>,

    /// Where `run` appends JSONL metrics snapshots; `monitor` tails this.
    #[serde(default = "AppConfig::default_metrics_log")]
    pub metrics_log: String,

    #[serde(default)]
    pub sources: Vec<SourceEntry>,

    #[serde(default)]
    pub taps: Vec<TapEntry>,

    /// Group → device bindings installed at startup.
    #[serde(default)]
    pub bindings: Vec<BindingEntry>,
}

impl AppConfig {
    fn default_metrics_log() -> String {
        "/var/log/pktfab.jsonl".into()
    }
}

/// One packet source: a UDP listener acting as a capture device.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceEntry {
    /// Human-readable name shown in the dashboard.
    pub name: String,
    /// Listen address, e.g. "0.0.0.0:7000".
    pub listen: String,
    /// Device index this source presents to the fabric.
    pub ifindex: i32,
    /// Hardware queue this source presents; also picks the engine
    /// (`queue % engines`).
    #[serde(default)]
    pub queue: u16,
}

/// One consumer tap: a socket joined to a group, drained by its own thread.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TapEntry {
    pub name: String,
    /// Group id to join.
    pub group: usize,
    /// Traffic classes to join; default class 0.
    #[serde(default = "TapEntry::default_classes")]
    pub classes: Vec<usize>,
    #[serde(default = "TapEntry::default_policy")]
    pub policy: Policy,
    /// Per-tap capture length; omit to use the fabric default.
    pub caplen: Option<usize>,
}

impl TapEntry {
    fn default_classes() -> Vec<usize> {
        vec![0]
    }

    fn default_policy() -> Policy {
        Policy::Shared
    }

    pub fn class_mask(&self) -> u64 {
        self.classes.iter().fold(0u64, |m, &c| m | (1u64 << (c & 63)))
    }
}

/// Attach a group to a `(device, queue)` pair; queue -1 means every queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BindingEntry {
    pub group: usize,
    pub ifindex: i32,
    #[serde(default = "BindingEntry::default_queue")]
    pub queue: i32,
}

impl BindingEntry {
    fn default_queue() -> i32 {
        pktfab_core::ANY
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let cfg: Self = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(cfg)
    }

    /// A ready-to-run single-engine capture setup.
    pub fn default_example() -> Self {
        Self {
            fabric: FabricParams {
                max_queue_slots: 8192,
                ..Default::default()
            },
            engines: 2,
            pin_cores: Vec::new(),
            metrics_log: Self::default_metrics_log(),
            sources: vec![
                SourceEntry {
                    name: "udp-7000".into(),
                    listen: "0.0.0.0:7000".into(),
                    ifindex: 1,
                    queue: 0,
                },
                SourceEntry {
                    name: "udp-7001".into(),
                    listen: "0.0.0.0:7001".into(),
                    ifindex: 1,
                    queue: 1,
                },
            ],
            taps: vec![TapEntry {
                name: "all-frames".into(),
                group: 0,
                classes: vec![0],
                policy: Policy::Shared,
                caplen: None,
            }],
            bindings: vec![BindingEntry {
                group: 0,
                ifindex: 1,
                queue: pktfab_core::ANY,
            }],
        }
    }
}
