//! Reference-clock pipeline: per-driver sample/pulse intake, median-filter
//! emission, and PPS alignment against a locking reference.
//!
//! Grounded on `refclock.c`'s `RCL_AddRefclock`/`RCL_AddSample`/`RCL_AddPulse`
//! and the driver dispatch it performs by name (SHM/SOCK/PPS/PHC). The
//! function-pointer driver vtable becomes the `RefclockDriver` trait, one
//! implementation per variant, the same "closed set of variants behind a
//! trait" shape this codebase already uses for `SourceConfig`/`TxSource`.

pub mod filter;
pub mod params;

pub use filter::{FilterOutput, MedianFilter, Sample};
pub use params::RefclockParams;

use crate::clock::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeapStatus {
    Normal,
    InsertSecond,
    DeleteSecond,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    Accepted,
    Rejected(&'static str),
}

/// One raw reading off a driver, before cooking or dispersion accounting.
#[derive(Debug, Clone, Copy)]
pub struct RawSample {
    pub raw_time: Instant,
    pub offset: f64,
    pub leap: LeapStatus,
}

/// Capability interface a refclock driver implements; owns the
/// hardware-specific read path, nothing about filtering or scheduling.
pub trait RefclockDriver: Send {
    fn name(&self) -> &'static str;
    fn poll(&mut self) -> Option<RawSample>;
}

/// Shared-memory refclock (e.g. gpsd's SHM segments).
pub struct ShmDriver {
    pub segment: i32,
}
impl RefclockDriver for ShmDriver {
    fn name(&self) -> &'static str {
        "SHM"
    }
    fn poll(&mut self) -> Option<RawSample> {
        None
    }
}

/// UNIX-domain socket refclock (e.g. a local GPS daemon speaking the SOCK protocol).
pub struct SockDriver {
    pub path: String,
}
impl RefclockDriver for SockDriver {
    fn name(&self) -> &'static str {
        "SOCK"
    }
    fn poll(&mut self) -> Option<RawSample> {
        None
    }
}

/// Pulse-per-second device; the pulse path goes through `intake_pulse`
/// rather than `poll`, so `poll` here only ever returns ancillary samples
/// (e.g. a serial NMEA sentence tagging which second is about to tick).
pub struct PpsDriver {
    pub device: String,
}
impl RefclockDriver for PpsDriver {
    fn name(&self) -> &'static str {
        "PPS"
    }
    fn poll(&mut self) -> Option<RawSample> {
        None
    }
}

/// Hardware PTP clock (PHC) read via its character device.
pub struct PhcDriver {
    pub device: String,
}
impl RefclockDriver for PhcDriver {
    fn name(&self) -> &'static str {
        "PHC"
    }
    fn poll(&mut self) -> Option<RawSample> {
        None
    }
}

/// A configured reference clock: driver, filter, and the fields
/// `refclock.c`'s `RCL_Instance_Record` carries.
pub struct RefclockInstance {
    pub driver: Box<dyn RefclockDriver>,
    pub params: RefclockParams,
    pub poll: i32,
    pub driver_poll: i32,
    pub ref_id: [u8; 4],
    pub lock_ref: Option<String>,
    pub offset: f64,
    pub delay: f64,
    pub precision: f64,
    pub pps_rate: f64,
    pub pps_active: bool,
    pub leap: LeapStatus,
    pub filter: MedianFilter,
    driver_poll_count: u32,
}

impl RefclockInstance {
    pub fn new(
        driver: Box<dyn RefclockDriver>,
        params: RefclockParams,
        poll: i32,
        driver_poll: i32,
        ref_id: [u8; 4],
        precision: f64,
        max_var: f64,
    ) -> Self {
        assert!(driver_poll <= poll, "driver poll exponent must be <= poll exponent");
        let filter_length = 1usize << (poll - driver_poll).max(0);
        Self {
            driver,
            params,
            poll,
            driver_poll,
            ref_id,
            lock_ref: None,
            offset: 0.0,
            delay: 0.0,
            precision,
            pps_rate: 0.0,
            pps_active: false,
            leap: LeapStatus::Normal,
            filter: MedianFilter::new(filter_length, max_var),
            driver_poll_count: 0,
        }
    }

    /// Call on every driver-poll tick; returns a filtered sample only once
    /// every `2^(poll - driver_poll)` ticks, per the spec's emission cadence.
    pub fn driver_poll_tick(&mut self) -> Option<FilterOutput> {
        self.driver_poll_count += 1;
        let interval = 1u32 << (self.poll - self.driver_poll).max(0);
        if self.driver_poll_count % interval != 0 {
            return None;
        }
        self.filter.get_sample()
    }

    /// Ingests a cooked sample (future/age/finiteness already validated by
    /// the caller via `validate_sample_timing`), adding the instance's
    /// fixed precision to the reported dispersion.
    pub fn add_sample(&mut self, raw_time: Instant, cooked_offset: f64, dispersion: f64) {
        self.filter.add_sample(Sample {
            instant: raw_time,
            offset: cooked_offset,
            dispersion: dispersion + self.precision,
        });
    }

    pub fn on_slew(&mut self, delta_secs: f64, offset_delta: f64) {
        self.filter.slew_samples(delta_secs, offset_delta);
    }

    pub fn on_unknown_step(&mut self) {
        self.filter.clear();
    }
}

/// Reject if the sample is from the future, older than `2^(poll+1)`
/// seconds, or the offset isn't finite.
pub fn validate_sample_timing(raw_time: Instant, now: Instant, offset: f64, poll: i32) -> SampleOutcome {
    if !offset.is_finite() {
        return SampleOutcome::Rejected("non-finite offset");
    }
    let age = now.diff_secs(&raw_time);
    if age < 0.0 {
        return SampleOutcome::Rejected("sample timestamp is in the future");
    }
    let max_age = 2f64.powi(poll + 1);
    if age > max_age {
        return SampleOutcome::Rejected("sample aged out");
    }
    SampleOutcome::Accepted
}

/// A pulse reading plus the state needed to lock or free-run its alignment.
pub struct PulseIntake<'a> {
    pub rate: f64,
    pub lock_reference: Option<&'a Sample>,
    pub lock_dispersion: f64,
    pub system_synchronised: bool,
    pub system_root_distance: f64,
}

/// Aligns and validates a PPS pulse per the spec's lock-reference rules,
/// returning the (already whole-period-aligned) offset to feed the filter.
pub fn intake_pulse(intake: &PulseIntake, pulse_time: Instant, mut offset: f64) -> Result<f64, SampleOutcome> {
    let rate = intake.rate;
    let half_period = 0.5 / rate;
    offset = normalize_into_half_open(offset, half_period);

    if let Some(reference) = intake.lock_reference {
        let age = pulse_time.diff_secs(&reference.instant);
        if age < 0.0 || age >= 2.0 / rate {
            return Err(SampleOutcome::Rejected("lock reference sample too old"));
        }
        let shift = ((reference.offset - offset) * rate).round() / rate;
        let aligned = offset + shift;
        let residual = (reference.offset - aligned).abs();
        if residual + intake.lock_dispersion + reference.dispersion >= 0.2 / rate {
            return Err(SampleOutcome::Rejected("pulse alignment residual too large"));
        }
        Ok(aligned)
    } else {
        if !intake.system_synchronised || intake.system_root_distance >= 0.5 / rate {
            return Err(SampleOutcome::Rejected("system not synchronised for free-running PPS"));
        }
        Ok(offset)
    }
}

/// Normalises `offset` into `[-half_period, half_period)`; exactly
/// `half_period` wraps to `-half_period` (half-open interval).
fn normalize_into_half_open(mut offset: f64, half_period: f64) -> f64 {
    let period = 2.0 * half_period;
    offset = offset.rem_euclid(period);
    if offset >= half_period {
        offset -= period;
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pps_boundary_wraps_to_negative_half_open() {
        let half_period = 0.5; // rate = 1.0
        let wrapped = normalize_into_half_open(0.5, half_period);
        assert!((wrapped + 0.5).abs() < 1e-12);
    }

    #[test]
    fn future_sample_rejected() {
        let now = Instant::from_secs_f64(100.0);
        let future = Instant::from_secs_f64(101.0);
        assert_eq!(
            validate_sample_timing(future, now, 0.0, 6),
            SampleOutcome::Rejected("sample timestamp is in the future")
        );
    }

    #[test]
    fn aged_out_sample_rejected() {
        let now = Instant::from_secs_f64(1000.0);
        let old = Instant::from_secs_f64(0.0);
        assert_eq!(
            validate_sample_timing(old, now, 0.0, 4),
            SampleOutcome::Rejected("sample aged out")
        );
    }

    #[test]
    fn non_finite_offset_rejected() {
        let now = Instant::from_secs_f64(10.0);
        assert_eq!(
            validate_sample_timing(now, now, f64::NAN, 6),
            SampleOutcome::Rejected("non-finite offset")
        );
    }

    #[test]
    fn pulse_locks_to_reference_within_whole_periods() {
        let rate = 1.0;
        let reference = Sample {
            instant: Instant::from_secs_f64(100.0001),
            offset: 0.010,
            dispersion: 1e-6,
        };
        let intake = PulseIntake {
            rate,
            lock_reference: Some(&reference),
            lock_dispersion: 1e-6,
            system_synchronised: true,
            system_root_distance: 0.0,
        };
        // Pulse at T+0.0001 with "second=0.9999" means its raw offset is
        // -0.0001 (i.e. 0.9999 of the way into the previous second).
        let aligned = intake_pulse(&intake, Instant::from_secs_f64(100.0001), -0.0001).unwrap();
        assert!((aligned - 0.010).abs() < 0.2 / rate);
    }

    #[test]
    fn pulse_without_lock_requires_sync() {
        let intake = PulseIntake {
            rate: 1.0,
            lock_reference: None,
            lock_dispersion: 0.0,
            system_synchronised: false,
            system_root_distance: 0.0,
        };
        assert!(intake_pulse(&intake, Instant::from_secs_f64(0.0), 0.0).is_err());
    }
}
