//! Fabric parameters: the module-parameter surface, validated at init.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FabricError, Result};
use crate::gc::BATCH_CAP;
use crate::pool::POOL_MAX_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricParams {
    /// Enable driver-level direct intake.
    pub direct_capture: bool,
    /// Capture ingress frames on the protocol hook.
    pub capture_incoming: bool,
    /// Capture locally originated frames on the protocol hook.
    pub capture_outgoing: bool,
    /// Default per-socket capture length (bytes).
    pub cap_len: usize,
    /// Maximum transmit length (bytes).
    pub max_len: usize,
    /// Socket delivery queue capacity (slots).
    pub max_queue_slots: usize,
    /// GC flush threshold; in `(0, BATCH_CAP]`.
    pub batch_len: usize,
    /// Per-CPU frame pool capacity.
    pub pool_size: usize,
    /// Auto-strip 802.1Q tags on intake.
    pub vl_untag: bool,
    /// Reclamation wait after filter/program replacement.
    pub grace_period_ms: u64,
}

impl Default for FabricParams {
    fn default() -> Self {
        Self {
            direct_capture: false,
            capture_incoming: true,
            capture_outgoing: false,
            cap_len: 1514,
            max_len: 1514,
            max_queue_slots: 226_144,
            batch_len: BATCH_CAP,
            pool_size: 1024,
            vl_untag: false,
            grace_period_ms: 100,
        }
    }
}

impl FabricParams {
    pub fn validate(&self) -> Result<()> {
        if self.batch_len == 0 || self.batch_len > BATCH_CAP {
            return Err(FabricError::BadConfig("batch_len out of range"));
        }
        if self.pool_size > POOL_MAX_SIZE {
            return Err(FabricError::BadConfig("pool_size exceeds cap"));
        }
        if self.cap_len == 0 {
            return Err(FabricError::BadConfig("cap_len must be positive"));
        }
        if self.max_len == 0 {
            return Err(FabricError::BadConfig("max_len must be positive"));
        }
        if self.max_queue_slots == 0 {
            return Err(FabricError::BadConfig("max_queue_slots must be positive"));
        }
        Ok(())
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        FabricParams::default().validate().unwrap();
    }

    #[test]
    fn test_batch_len_range() {
        let mut p = FabricParams::default();
        p.batch_len = 0;
        assert!(p.validate().is_err());
        p.batch_len = BATCH_CAP + 1;
        assert!(p.validate().is_err());
        p.batch_len = 1;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_pool_size_cap() {
        let mut p = FabricParams::default();
        p.pool_size = POOL_MAX_SIZE + 1;
        assert!(p.validate().is_err());
        p.pool_size = 0;
        assert!(p.validate().is_ok(), "a zero pool just disables recycling");
    }
}
