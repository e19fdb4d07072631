//! Clock domains and clock sources.
//!
//! Every time field on a job is tagged with the clock that produced it. The
//! wall clock can be wrong right after boot; elapsed boot time is always
//! monotonic but restarts from zero on reboot.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;

/// A point in time expressed in one of the two clock domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScheduleTime {
    /// Milliseconds since the Unix epoch, read from the wall clock.
    WallClock(i64),
    /// Milliseconds since boot.
    ElapsedBoot(i64),
}

impl ScheduleTime {
    /// A time that has always already passed: "ready now".
    pub const IMMEDIATE: ScheduleTime = ScheduleTime::ElapsedBoot(0);

    /// Raw millisecond value, whatever the domain.
    pub fn millis(&self) -> i64 {
        match *self {
            ScheduleTime::WallClock(ms) | ScheduleTime::ElapsedBoot(ms) => ms,
        }
    }

    /// Whether this time has been reached according to `now`.
    pub fn has_passed(&self, now: &ClockReading) -> bool {
        match *self {
            ScheduleTime::WallClock(ms) => ms <= now.wall_ms,
            ScheduleTime::ElapsedBoot(ms) => ms <= now.elapsed_ms,
        }
    }
}

/// Both clocks read at a single instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    /// Wall clock, ms since the Unix epoch.
    pub wall_ms: i64,
    /// Elapsed boot time, ms.
    pub elapsed_ms: i64,
    /// Whether the wall clock is believed to be correct.
    pub wall_trusted: bool,
}

/// Source of clock readings injected into the store.
pub trait Clock: Send + Sync {
    /// Read both clocks at one instant.
    fn reading(&self) -> ClockReading;
}

/// The host clocks.
#[derive(Debug, Clone)]
pub struct SystemClock {
    wall_clock_floor_ms: i64,
}

impl SystemClock {
    /// Treat wall-clock readings before `wall_clock_floor_ms` as untrusted.
    pub fn new(wall_clock_floor_ms: i64) -> Self {
        Self {
            wall_clock_floor_ms,
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn elapsed_ms() -> i64 {
        use nix::time::{ClockId, clock_gettime};

        match clock_gettime(ClockId::CLOCK_BOOTTIME) {
            #[allow(clippy::unnecessary_cast)]
            Ok(ts) => ts.tv_sec() as i64 * 1000 + ts.tv_nsec() as i64 / 1_000_000,
            Err(_) => process_elapsed_ms(),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn elapsed_ms() -> i64 {
        process_elapsed_ms()
    }
}

// Monotonic fallback anchored at first use; only meaningful within one process.
fn process_elapsed_ms() -> i64 {
    static START: once_cell::sync::Lazy<std::time::Instant> =
        once_cell::sync::Lazy::new(std::time::Instant::now);
    START.elapsed().as_millis() as i64
}

impl Clock for SystemClock {
    fn reading(&self) -> ClockReading {
        let wall_ms = Utc::now().timestamp_millis();
        ClockReading {
            wall_ms,
            elapsed_ms: Self::elapsed_ms(),
            wall_trusted: wall_ms >= self.wall_clock_floor_ms,
        }
    }
}

/// A clock whose readings are set by hand.
#[derive(Debug)]
pub struct ManualClock {
    wall_ms: AtomicI64,
    elapsed_ms: AtomicI64,
    wall_trusted: AtomicBool,
}

impl ManualClock {
    pub fn new(wall_ms: i64, elapsed_ms: i64, wall_trusted: bool) -> Self {
        Self {
            wall_ms: AtomicI64::new(wall_ms),
            elapsed_ms: AtomicI64::new(elapsed_ms),
            wall_trusted: AtomicBool::new(wall_trusted),
        }
    }

    /// Move both clocks forward by `ms`.
    pub fn advance(&self, ms: i64) {
        self.wall_ms.fetch_add(ms, Ordering::SeqCst);
        self.elapsed_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Simulate a reboot: elapsed time restarts at `elapsed_ms`.
    pub fn reboot(&self, elapsed_ms: i64) {
        self.elapsed_ms.store(elapsed_ms, Ordering::SeqCst);
    }

    pub fn set_wall(&self, wall_ms: i64) {
        self.wall_ms.store(wall_ms, Ordering::SeqCst);
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.wall_trusted.store(trusted, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn reading(&self) -> ClockReading {
        ClockReading {
            wall_ms: self.wall_ms.load(Ordering::SeqCst),
            elapsed_ms: self.elapsed_ms.load(Ordering::SeqCst),
            wall_trusted: self.wall_trusted.load(Ordering::SeqCst),
        }
    }
}
