//! Median/regression filter over a refclock's raw samples.
//!
//! Grounded on `refclock.c`'s `MedianFilter`/`filter_select_samples`/
//! `filter_get_sample`: a fixed-size ring buffer, dispersion-based outlier
//! rejection, a weighted linear regression (or mean/stddev for small `n`),
//! and an exponentially-weighted long-term variance estimate used to shrink
//! the reported dispersion when the short-term sample looks noisier than
//! the clock's established behaviour.

use crate::clock::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub instant: Instant,
    pub offset: f64,
    pub dispersion: f64,
}

/// Degrees-of-freedom cap for the long-term variance estimator; past this
/// the EWMA treats each new observation as contributing a fixed, small
/// weight rather than letting `dof` grow without bound.
const MAX_AVG_VAR_DOF: f64 = 50.0;

pub struct MedianFilter {
    length: usize,
    samples: Vec<Option<Sample>>,
    next_slot: usize,
    used: usize,
    last_slot: usize,
    avg_var: f64,
    avg_var_dof: f64,
    max_var: f64,
}

pub struct FilterOutput {
    pub offset: f64,
    pub dispersion: f64,
}

impl MedianFilter {
    pub fn new(length: usize, max_var: f64) -> Self {
        let length = length.max(1);
        Self {
            length,
            samples: vec![None; length],
            next_slot: 0,
            used: 0,
            last_slot: 0,
            avg_var: 0.0,
            avg_var_dof: 0.0,
            max_var,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn add_sample(&mut self, sample: Sample) {
        self.last_slot = self.next_slot;
        self.samples[self.next_slot] = Some(sample);
        self.next_slot = (self.next_slot + 1) % self.length;
        self.used = (self.used + 1).min(self.length);
    }

    pub fn clear(&mut self) {
        self.samples.iter_mut().for_each(|s| *s = None);
        self.used = 0;
        self.next_slot = 0;
    }

    /// Shifts every stored sample's instant by `delta_secs` and its offset by
    /// `-offset_delta`, as required when the local clock slews or steps.
    pub fn slew_samples(&mut self, delta_secs: f64, offset_delta: f64) {
        for slot in self.samples.iter_mut().flatten() {
            slot.instant = slot.instant.add_secs(delta_secs);
            slot.offset -= offset_delta;
        }
    }

    pub fn add_dispersion(&mut self, extra: f64) {
        for slot in self.samples.iter_mut().flatten() {
            slot.dispersion += extra;
        }
    }

    fn qualifying_indices(&self) -> Vec<usize> {
        let indices: Vec<usize> = (0..self.length).filter(|i| self.samples[*i].is_some()).collect();
        let min_disp = indices
            .iter()
            .map(|&i| self.samples[i].unwrap().dispersion)
            .fold(f64::INFINITY, f64::min);
        let threshold = min_disp * 1.5;
        let selected: Vec<usize> = indices
            .iter()
            .copied()
            .filter(|&i| self.samples[i].unwrap().dispersion <= threshold)
            .collect();
        if selected.len() < 4 {
            indices
        } else {
            selected
        }
    }

    /// Runs the filter: minimum fill of 4 (or a full buffer shorter than 4),
    /// dispersion-based selection, trimmed-mean-by-offset, then a fit.
    /// Returns `None` if the fill requirement isn't met or the fitted
    /// variance exceeds `max_var`.
    pub fn get_sample(&mut self) -> Option<FilterOutput> {
        let min_fill = if self.length < 4 { self.length } else { 4 };
        if self.used < min_fill {
            return None;
        }

        let mut selected = self.qualifying_indices();
        selected.sort_by(|&a, &b| {
            self.samples[a]
                .unwrap()
                .offset
                .partial_cmp(&self.samples[b].unwrap().offset)
                .unwrap()
        });

        let n = selected.len();
        let trim = n / 5; // drop outer 20% on each side
        let (from, to) = if n.saturating_sub(2 * trim) < 1 {
            (0, n)
        } else {
            (trim, n - trim)
        };
        let trimmed = &selected[from..to];

        let latest = self.samples[self.last_slot].expect("last_slot always populated once used>0");

        let (offset, variance, dof) = if trimmed.len() >= 4 {
            self.weighted_regression(trimmed, latest.instant)
        } else if trimmed.len() >= 2 {
            self.mean_and_variance(trimmed)
        } else {
            let s = self.samples[trimmed[0]].unwrap();
            (s.offset, s.dispersion * s.dispersion, 0.0)
        };

        if variance > self.max_var {
            return None;
        }

        let avg_disp = trimmed
            .iter()
            .map(|&i| self.samples[i].unwrap().dispersion)
            .sum::<f64>()
            / trimmed.len() as f64;

        let prev_avg_var = self.avg_var;
        let prev_avg_var_dof = self.avg_var_dof;
        self.update_long_term_variance(variance, dof);

        let mut dispersion = variance.sqrt();
        if dof > 0.0 && prev_avg_var_dof > 0.0 {
            let chi2_coef = chi2_coef(dof);
            if variance * dof / chi2_coef < prev_avg_var && variance > 1e-300 {
                dispersion = (prev_avg_var).sqrt() * dispersion / variance.sqrt();
            }
        }

        if dispersion < avg_disp {
            dispersion = avg_disp;
        }

        self.clear();
        Some(FilterOutput { offset, dispersion })
    }

    fn mean_and_variance(&self, indices: &[usize]) -> (f64, f64, f64) {
        let n = indices.len() as f64;
        let mean = indices
            .iter()
            .map(|&i| self.samples[i].unwrap().offset)
            .sum::<f64>()
            / n;
        let var = indices
            .iter()
            .map(|&i| {
                let d = self.samples[i].unwrap().offset - mean;
                d * d
            })
            .sum::<f64>()
            / (n - 1.0);
        (mean, var, n - 1.0)
    }

    /// Weighted linear regression of offset against elapsed time (seconds
    /// before `reference`), weight = 1/dispersion^2. Returns the intercept
    /// at `reference` (i.e. the offset "now"), its variance, and dof = n-2.
    fn weighted_regression(&self, indices: &[usize], reference: Instant) -> (f64, f64, f64) {
        let n = indices.len() as f64;
        let pts: Vec<(f64, f64, f64)> = indices
            .iter()
            .map(|&i| {
                let s = self.samples[i].unwrap();
                let x = s.instant.diff_secs(&reference);
                let w = 1.0 / (s.dispersion * s.dispersion).max(1e-18);
                (x, s.offset, w)
            })
            .collect();

        let sw: f64 = pts.iter().map(|(_, _, w)| w).sum();
        let swx: f64 = pts.iter().map(|(x, _, w)| x * w).sum();
        let swy: f64 = pts.iter().map(|(_, y, w)| y * w).sum();
        let swxx: f64 = pts.iter().map(|(x, _, w)| x * x * w).sum();
        let swxy: f64 = pts.iter().map(|(x, y, w)| x * y * w).sum();

        let denom = sw * swxx - swx * swx;
        let (slope, intercept) = if denom.abs() < 1e-300 {
            (0.0, swy / sw)
        } else {
            let slope = (sw * swxy - swx * swy) / denom;
            let intercept = (swy - slope * swx) / sw;
            (slope, intercept)
        };

        let residual_var: f64 = pts
            .iter()
            .map(|(x, y, w)| {
                let pred = intercept + slope * x;
                w * (y - pred) * (y - pred)
            })
            .sum::<f64>()
            / sw
            * n
            / (n - 2.0).max(1.0);

        (intercept, residual_var, (n - 2.0).max(1.0))
    }

    fn update_long_term_variance(&mut self, variance: f64, dof: f64) {
        let total_dof = (self.avg_var_dof + dof).min(MAX_AVG_VAR_DOF);
        if self.avg_var_dof <= 0.0 {
            self.avg_var = variance;
        } else {
            self.avg_var = (self.avg_var * self.avg_var_dof + variance * dof) / total_dof.max(dof.max(1.0));
        }
        self.avg_var_dof = total_dof;
    }
}

/// Approximation of the original's `RGR_GetChi2Coef` lookup: the expected
/// value of a chi-squared distribution with `dof` degrees of freedom,
/// normalised so `variance * dof / coef` compares the sample variance
/// against the long-run mean on equal footing.
fn chi2_coef(dof: f64) -> f64 {
    dof.max(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Instant;

    fn s(t: f64, offset: f64, disp: f64) -> Sample {
        Sample {
            instant: Instant::from_secs_f64(t),
            offset,
            dispersion: disp,
        }
    }

    #[test]
    fn requires_minimum_fill() {
        let mut f = MedianFilter::new(8, 1.0);
        f.add_sample(s(0.0, 0.0, 1e-6));
        f.add_sample(s(1.0, 0.0, 1e-6));
        assert!(f.get_sample().is_none());
    }

    #[test]
    fn outlier_dispersion_excluded_from_fit() {
        let mut f = MedianFilter::new(11, 1.0);
        for i in 0..10 {
            f.add_sample(s(i as f64, 0.001 * i as f64, (i + 1) as f64 * 1e-6));
        }
        f.add_sample(s(10.0, 0.5, 1e-3));
        let out = f.get_sample().expect("enough samples");
        // The gross outlier at offset 0.5 should not drag the fitted offset
        // anywhere near it.
        assert!(out.offset.abs() < 0.05);
    }

    #[test]
    fn emitted_dispersion_floors_at_average_sample_dispersion() {
        let mut f = MedianFilter::new(6, 10.0);
        for i in 0..6 {
            f.add_sample(s(i as f64, 0.0, 2e-6));
        }
        let out = f.get_sample().unwrap();
        assert!(out.dispersion >= 2e-6 - 1e-12);
    }

    #[test]
    fn clears_after_emission() {
        let mut f = MedianFilter::new(4, 10.0);
        for i in 0..4 {
            f.add_sample(s(i as f64, 0.0, 1e-6));
        }
        assert!(f.get_sample().is_some());
        assert_eq!(f.used(), 0);
    }
}
