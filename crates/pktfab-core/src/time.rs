//! Monotonic nanosecond clock for frame timestamps and rate gates.

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[cfg(target_os = "linux")]
mod imp {
    use std::mem::MaybeUninit;

    /// `CLOCK_MONOTONIC_RAW`: free of NTP slew, a cheap vDSO read.
    pub(super) fn ns() -> u64 {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: clock_gettime fills the timespec on success; the failure
        // path (impossible for a valid clock id) is handled without reading
        // uninitialized memory.
        let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, ts.as_mut_ptr()) };
        if rc != 0 {
            return 0;
        }
        let ts = unsafe { ts.assume_init() };
        ts.tv_sec as u64 * super::NANOS_PER_SEC + ts.tv_nsec as u64
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::sync::OnceLock;
    use std::time::Instant;

    /// Elapsed time since the first call; monotonic is all the engine needs.
    pub(super) fn ns() -> u64 {
        static ORIGIN: OnceLock<Instant> = OnceLock::new();
        ORIGIN.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }
}

/// Nanoseconds on a monotonic clock. The absolute origin is unspecified;
/// only differences are meaningful.
#[inline(always)]
pub fn now_ns() -> u64 {
    imp::ns()
}
