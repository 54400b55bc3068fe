//! Raw/cooked time representation and the platform clock back-end contract.
//!
//! The engine in [`crate::discipline`] owns the slew state machine; a
//! `PlatformClock` implementation owns the kernel syscall surface. This
//! mirrors the vtable the original driver used for Linux/BSD/Solaris/SunOS
//! back-ends, collapsed here to the two variants worth carrying in-process:
//! a `GenericClock` that models the kernel purely in memory (used on non-Linux
//! targets and in tests) and a `LinuxClock` driving `clock_adjtime`.

use crate::error::DaemonError;
use std::time::{SystemTime, UNIX_EPOCH};

/// A point in time as (seconds, microseconds past the epoch).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instant {
    pub secs: i64,
    pub micros: i64,
}

impl Instant {
    pub const ZERO: Instant = Instant { secs: 0, micros: 0 };

    pub fn from_secs_f64(t: f64) -> Self {
        let secs = t.floor();
        let micros = ((t - secs) * 1_000_000.0).round();
        Instant {
            secs: secs as i64,
            micros: micros as i64,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.micros as f64 / 1_000_000.0
    }

    /// `self - other`, in seconds.
    pub fn diff_secs(&self, other: &Instant) -> f64 {
        self.as_secs_f64() - other.as_secs_f64()
    }

    pub fn add_secs(&self, delta: f64) -> Instant {
        Instant::from_secs_f64(self.as_secs_f64() + delta)
    }
}

/// Reads the host's raw wall-clock time, uncorrected by this process's own
/// discipline state (the kernel may itself be slewing it via `adjtimex`).
pub fn read_raw_time() -> Instant {
    #[cfg(target_os = "linux")]
    {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        Instant {
            secs: ts.tv_sec as i64,
            micros: (ts.tv_nsec / 1000) as i64,
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Instant {
            secs: now.as_secs() as i64,
            micros: now.subsec_micros() as i64,
        }
    }
}

/// Platform back-end contract: read/set the kernel frequency, apply a step,
/// and (optionally) report synchronisation/leap state to the kernel.
pub trait PlatformClock: Send {
    fn read_frequency(&self) -> Result<f64, DaemonError>;
    /// Installs `ppm` and returns the value the kernel actually rounded to.
    fn set_frequency(&mut self, ppm: f64) -> Result<f64, DaemonError>;
    fn apply_step_offset(&mut self, _secs: f64) -> Result<(), DaemonError> {
        Ok(())
    }
    fn set_sync_status(&mut self, _synchronised: bool) {}
    fn set_leap(&mut self, _leap: i8) {}
    /// Maximum |frequency offset| the back-end can install, in ppm.
    fn max_freq(&self) -> f64;
    /// Settling delay after a frequency change before it's fully in effect.
    fn max_freq_change_delay(&self) -> f64;
}

/// In-process model of a kernel frequency register. Used on targets without
/// `adjtimex` and as the default in tests, where a real kernel call would be
/// both unavailable and undesirable.
pub struct GenericClock {
    freq_ppm: f64,
}

impl GenericClock {
    pub fn new() -> Self {
        Self { freq_ppm: 0.0 }
    }
}

impl Default for GenericClock {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformClock for GenericClock {
    fn read_frequency(&self) -> Result<f64, DaemonError> {
        Ok(self.freq_ppm)
    }

    fn set_frequency(&mut self, ppm: f64) -> Result<f64, DaemonError> {
        // A real kernel rounds to its tick resolution; model that as a
        // rounding to the nearest 1e-3 ppm so callers exercise the
        // "installed value may differ from requested" path.
        let installed = (ppm * 1000.0).round() / 1000.0;
        self.freq_ppm = installed;
        Ok(installed)
    }

    fn max_freq(&self) -> f64 {
        500_000.0
    }

    fn max_freq_change_delay(&self) -> f64 {
        0.01
    }
}

#[cfg(target_os = "linux")]
pub struct LinuxClock {
    last_freq_ppm: f64,
}

#[cfg(target_os = "linux")]
impl LinuxClock {
    pub fn new() -> Self {
        Self { last_freq_ppm: 0.0 }
    }
}

#[cfg(target_os = "linux")]
impl Default for LinuxClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl PlatformClock for LinuxClock {
    fn read_frequency(&self) -> Result<f64, DaemonError> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::clock_adjtime(libc::CLOCK_REALTIME, &mut tx) };
        if ret < 0 {
            return Err(DaemonError::Kernel(std::io::Error::last_os_error()));
        }
        // tx.freq is a scaled fixed-point value in units of 2^-16 ppm.
        Ok(tx.freq as f64 / 65536.0)
    }

    fn set_frequency(&mut self, ppm: f64) -> Result<f64, DaemonError> {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_FREQUENCY;
        tx.freq = (ppm * 65536.0).round() as i64 as libc::c_long;
        let ret = unsafe { libc::clock_adjtime(libc::CLOCK_REALTIME, &mut tx) };
        if ret < 0 {
            return Err(DaemonError::Kernel(std::io::Error::last_os_error()));
        }
        let installed = tx.freq as f64 / 65536.0;
        self.last_freq_ppm = installed;
        Ok(installed)
    }

    fn apply_step_offset(&mut self, secs: f64) -> Result<(), DaemonError> {
        let now = read_raw_time();
        let target = now.add_secs(secs);
        let ts = libc::timespec {
            tv_sec: target.secs as libc::time_t,
            tv_nsec: (target.micros * 1000) as libc::c_long,
        };
        let ret = unsafe { libc::clock_settime(libc::CLOCK_REALTIME, &ts) };
        if ret < 0 {
            return Err(DaemonError::Kernel(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn set_sync_status(&mut self, synchronised: bool) {
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        tx.modes = libc::ADJ_STATUS;
        tx.status = if synchronised {
            0
        } else {
            libc::STA_UNSYNC
        };
        unsafe {
            libc::clock_adjtime(libc::CLOCK_REALTIME, &mut tx);
        }
    }

    fn max_freq(&self) -> f64 {
        500_000.0
    }

    fn max_freq_change_delay(&self) -> f64 {
        0.01
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_round_trips_through_f64() {
        let i = Instant::from_secs_f64(1_700_000_000.5);
        assert_eq!(i.secs, 1_700_000_000);
        assert_eq!(i.micros, 500_000);
        assert!((i.as_secs_f64() - 1_700_000_000.5).abs() < 1e-6);
    }

    #[test]
    fn diff_secs_is_signed() {
        let a = Instant::from_secs_f64(10.0);
        let b = Instant::from_secs_f64(3.0);
        assert!((a.diff_secs(&b) - 7.0).abs() < 1e-9);
        assert!((b.diff_secs(&a) + 7.0).abs() < 1e-9);
    }

    #[test]
    fn generic_clock_rounds_installed_frequency() {
        let mut clk = GenericClock::new();
        let installed = clk.set_frequency(1.23456).unwrap();
        assert!((installed - 1.235).abs() < 1e-9);
        assert!((clk.read_frequency().unwrap() - installed).abs() < 1e-9);
    }
}
