//! Time smoother: a three-segment piecewise-polynomial shaper hiding large
//! offset/frequency corrections from downstream observers.
//!
//! A direct port of `smooth.c`'s `update_stages`/`get_offset_freq`/
//! `update_smoothing` state machine onto owned state instead of file-scope
//! statics.

use crate::clock::Instant;
use crate::discipline::StepListener;

const UNLOCK_SKEW_WANDER_RATIO: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, Default)]
struct Stage {
    wander: f64,
    length: f64,
}

pub struct TimeSmoother {
    enabled: bool,
    locked: bool,
    max_freq: f64,
    max_wander: f64,
    smooth_offset: f64,
    smooth_freq: f64,
    last_update: Instant,
    stages: [Stage; 3],
}

impl TimeSmoother {
    /// `max_freq_ppm`/`max_wander_ppm_per_sec` of `<= 0.0` disables smoothing
    /// entirely, matching the original's `SMT_Initialise` gate.
    pub fn new(max_freq_ppm: f64, max_wander_ppm_per_sec: f64, now: Instant) -> Self {
        let enabled = max_freq_ppm > 0.0 && max_wander_ppm_per_sec > 0.0;
        Self {
            enabled,
            locked: enabled,
            max_freq: max_freq_ppm * 1e-6,
            max_wander: max_wander_ppm_per_sec * 1e-6,
            smooth_offset: 0.0,
            smooth_freq: 0.0,
            last_update: now,
            stages: [Stage::default(); 3],
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Walks the three segments from `last_update` to `now`, returning the
    /// residual (offset, freq) still to be smoothed out.
    fn offset_freq_at(&self, now: Instant) -> (f64, f64) {
        let mut elapsed = now.diff_secs(&self.last_update);
        let mut offset = self.smooth_offset;
        let mut freq = self.smooth_freq;

        for stage in &self.stages {
            if elapsed <= 0.0 {
                break;
            }
            let length = stage.length.min(elapsed);
            offset -= length * (2.0 * freq + stage.wander * length) / 2.0;
            freq += stage.wander * length;
            elapsed -= length;
        }
        if elapsed > 0.0 {
            offset -= elapsed * freq;
        }
        (offset, freq)
    }

    pub fn get_offset(&self, now: Instant) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        self.offset_freq_at(now).0
    }

    /// Recomputes the three-stage schedule so that `∫freq dt` over the
    /// total duration equals `smooth_offset`, bounded by `max_freq` and
    /// `max_wander`. See module docs for the derivation.
    fn update_stages(&mut self) {
        let s1 = self.smooth_offset / self.max_wander;
        let s2 = self.smooth_freq * self.smooth_freq / (2.0 * self.max_wander * self.max_wander);

        let mut l1 = 0.0;
        let mut l3 = 0.0;
        let mut chosen_dir = 1.0;

        for dir in [-1.0f64, 1.0] {
            let s = dir * s1 + s2;
            if s >= 0.0 {
                let candidate_l3 = s.sqrt();
                let candidate_l1 = candidate_l3 - dir * self.smooth_freq / self.max_wander;
                if candidate_l1 >= 0.0 {
                    l1 = candidate_l1;
                    l3 = candidate_l3;
                    chosen_dir = dir;
                    break;
                }
            }
        }

        let mut l2 = 0.0;
        let peak = chosen_dir * self.smooth_freq + l1 * self.max_wander;
        let overshoot = peak - self.max_freq;
        if overshoot > 0.0 {
            let mut lc = overshoot / self.max_wander;
            let plateau_freq = if lc > l1 {
                lc = l1;
                chosen_dir * self.smooth_freq
            } else {
                self.max_freq
            };
            l2 = lc * (2.0 + overshoot / plateau_freq);
            l1 -= lc;
            l3 -= lc;
        }

        self.stages = [
            Stage {
                wander: chosen_dir * self.max_wander,
                length: l1,
            },
            Stage {
                wander: 0.0,
                length: l2,
            },
            Stage {
                wander: -chosen_dir * self.max_wander,
                length: l3,
            },
        ];
    }

    /// Feeds a newly-accrued (offset, freq) pair into the accumulators and
    /// rebuilds the schedule. Discarded entirely while `locked` — i.e.
    /// until `skew/max_wander` drops below the unlock ratio.
    pub fn update(&mut self, now: Instant, offset: f64, freq: f64, skew: f64) {
        if !self.enabled {
            return;
        }
        if self.locked {
            if skew / self.max_wander < UNLOCK_SKEW_WANDER_RATIO {
                tracing::info!("time smoothing activated");
                self.locked = false;
            }
            return;
        }

        let (residual_offset, residual_freq) = self.offset_freq_at(now);
        self.smooth_offset = residual_offset + offset;
        self.smooth_freq = (residual_freq - freq) / (1.0 - freq);
        self.last_update = now;

        self.update_stages();
    }

    pub fn on_step(&mut self, step_secs: f64) {
        self.last_update = self.last_update.add_secs(step_secs);
    }

    pub fn reset(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        self.locked = true;
        self.smooth_offset = 0.0;
        self.smooth_freq = 0.0;
        self.last_update = now;
    }
}

impl StepListener for TimeSmoother {
    fn notify_step(&mut self, step_secs: f64, known: bool) {
        if known {
            self.on_step(step_secs);
        } else {
            self.reset(self.last_update.add_secs(step_secs));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integrate_numerically(smoother: &TimeSmoother, start: Instant, total_secs: f64, steps: usize) -> (f64, f64) {
        let dt = total_secs / steps as f64;
        let mut integral = 0.0;
        let mut peak_freq = 0.0f64;
        for i in 0..steps {
            let t = start.add_secs(i as f64 * dt);
            let (_, freq) = smoother.offset_freq_at(t);
            integral += freq * dt;
            peak_freq = peak_freq.max(freq.abs());
        }
        (integral, peak_freq)
    }

    #[test]
    fn disabled_without_positive_bounds() {
        let s = TimeSmoother::new(0.0, 1.0, Instant::ZERO);
        assert!(!s.is_enabled());
        assert_eq!(s.get_offset(Instant::ZERO), 0.0);
    }

    #[test]
    fn schedule_integral_matches_injected_offset_within_bounds() {
        let now = Instant::ZERO;
        let mut s = TimeSmoother::new(100.0, 1.0, now);
        s.locked = false; // bypass the lock gate for this unit-level check
        s.update(now, 1.0, 0.0, 0.0);

        let (integral, peak_freq_abs) = integrate_numerically(&s, now, 50.0, 500_000);
        // ∫freq dt over the schedule's duration should recover the 1s
        // offset that was smoothed out, to within numerical tolerance.
        assert!((integral - 1.0).abs() < 1e-3, "integral={integral}");
        assert!(peak_freq_abs <= 100.0 * 1e-6 + 1e-9);
    }

    #[test]
    fn locked_state_discards_updates_until_skew_small() {
        let now = Instant::ZERO;
        let mut s = TimeSmoother::new(100.0, 1.0, now);
        assert!(s.locked);
        s.update(now, 5.0, 0.0, 1.0); // skew/max_wander = 1e6 / 1 >> 10000, stays locked
        assert_eq!(s.smooth_offset, 0.0);
        s.update(now, 5.0, 0.0, 1e-9); // tiny skew unlocks
        assert!(!s.locked);
    }
}
