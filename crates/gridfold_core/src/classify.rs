//! Envelope-based labelling of transient trajectories.
//!
//! The post-perturbation span is trimmed by a settling fraction, the remaining
//! window is split in two halves, and the peak deviation from equilibrium in
//! the late half is compared with the early half. The label is evidence to set
//! beside the eigenvalue verdict, not a replacement for it.

use crate::stability::StabilityReport;
use crate::transient::{Trajectory, TransientRun};
use anyhow::{anyhow, bail, Result};
use num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryClass {
    /// Envelope grows beyond the tolerance band.
    Divergent,
    /// Envelope shrinks below the tolerance band.
    Decaying,
    /// Envelope neither grows nor shrinks: a candidate limit cycle.
    BoundedOscillatory,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Share of the post-perturbation span skipped before measuring.
    pub settle_fraction: f64,
    /// Half-width of the band around an envelope ratio of one.
    pub growth_tolerance: f64,
    /// Any deviation beyond this is divergent outright.
    pub divergence_limit: Option<f64>,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            settle_fraction: 0.2,
            growth_tolerance: 0.3,
            divergence_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub class: TrajectoryClass,
    /// Peak deviation in the early half of the window.
    pub early_envelope: f64,
    /// Peak deviation in the late half of the window.
    pub late_envelope: f64,
}

impl Classification {
    pub fn envelope_ratio(&self) -> f64 {
        self.late_envelope / self.early_envelope
    }
}

/// Labels `trajectory` around `equilibrium`, measuring from `start_time` on.
pub fn classify(
    trajectory: &Trajectory,
    equilibrium: f64,
    start_time: f64,
    settings: &ClassifierSettings,
) -> Result<Classification> {
    if !(0.0..1.0).contains(&settings.settle_fraction) {
        bail!("settle_fraction must lie in [0, 1).");
    }
    if !(settings.growth_tolerance > 0.0 && settings.growth_tolerance < 1.0) {
        bail!("growth_tolerance must lie in (0, 1).");
    }
    let end_time = trajectory
        .samples
        .last()
        .map(|s| s.time)
        .ok_or_else(|| anyhow!("Trajectory '{}' is empty.", trajectory.name))?;
    if end_time <= start_time {
        bail!(
            "Trajectory '{}' ends at t = {} before the window opens at t = {}.",
            trajectory.name,
            end_time,
            start_time
        );
    }

    let window_start = start_time + settings.settle_fraction * (end_time - start_time);
    let midpoint = 0.5 * (window_start + end_time);

    let mut early = 0.0f64;
    let mut late = 0.0f64;
    let mut seen = 0usize;
    for sample in trajectory.samples.iter().filter(|s| s.time >= window_start) {
        let deviation = (sample.value - equilibrium).abs();
        if !deviation.is_finite() {
            return Ok(Classification {
                class: TrajectoryClass::Divergent,
                early_envelope: early,
                late_envelope: f64::INFINITY,
            });
        }
        if sample.time < midpoint {
            early = early.max(deviation);
        } else {
            late = late.max(deviation);
        }
        seen += 1;
    }
    if seen == 0 {
        bail!("Trajectory '{}' has no samples after settling.", trajectory.name);
    }

    let beyond_limit = settings
        .divergence_limit
        .is_some_and(|limit| early.max(late) > limit);
    let band = settings.growth_tolerance;
    let class = if beyond_limit {
        TrajectoryClass::Divergent
    } else if early <= 0.0 {
        if late <= 0.0 {
            TrajectoryClass::Decaying
        } else {
            TrajectoryClass::Divergent
        }
    } else {
        let ratio = late / early;
        if ratio > 1.0 + band {
            TrajectoryClass::Divergent
        } else if ratio < 1.0 - band {
            TrajectoryClass::Decaying
        } else {
            TrajectoryClass::BoundedOscillatory
        }
    };

    Ok(Classification {
        class,
        early_envelope: early,
        late_envelope: late,
    })
}

/// Dominant oscillation frequency (Hz) of the samples at or after `start_time`.
///
/// The window is resampled onto a uniform power-of-two grid, its mean is
/// removed, and the largest non-DC FFT bin is reported. `None` for windows too
/// short or too flat to carry an oscillation.
pub fn dominant_frequency(trajectory: &Trajectory, start_time: f64) -> Option<f64> {
    let window: Vec<_> = trajectory
        .samples
        .iter()
        .filter(|s| s.time >= start_time)
        .collect();
    if window.len() < 8 {
        return None;
    }
    let t0 = window[0].time;
    let duration = window[window.len() - 1].time - t0;
    if duration <= 0.0 {
        return None;
    }

    let n = window.len().next_power_of_two().clamp(64, 1 << 14);
    let dt = duration / n as f64;
    let mut resampled = Vec::with_capacity(n);
    let mut cursor = 0usize;
    for k in 0..n {
        let t = t0 + k as f64 * dt;
        while cursor + 2 < window.len() && window[cursor + 1].time < t {
            cursor += 1;
        }
        let (a, b) = (window[cursor], window[cursor + 1]);
        let span = b.time - a.time;
        let weight = if span > 0.0 { ((t - a.time) / span).clamp(0.0, 1.0) } else { 0.0 };
        resampled.push(a.value + weight * (b.value - a.value));
    }
    let mean = resampled.iter().sum::<f64>() / n as f64;
    let mut buffer: Vec<Complex<f64>> = resampled
        .iter()
        .map(|v| Complex::new(v - mean, 0.0))
        .collect();
    if buffer.iter().all(|c| c.re.abs() < f64::EPSILON) {
        return None;
    }

    FftPlanner::<f64>::new()
        .plan_fft_forward(n)
        .process(&mut buffer);

    let peak = (1..n / 2).max_by(|&i, &j| buffer[i].norm().total_cmp(&buffer[j].norm()))?;
    Some(peak as f64 / (n as f64 * dt))
}

/// What the linearization predicts for a small disturbance.
pub fn linear_prediction(report: &StabilityReport) -> TrajectoryClass {
    if report.stable {
        TrajectoryClass::Decaying
    } else {
        TrajectoryClass::Divergent
    }
}

/// Nonlinear evidence for one state of a run, set beside the linear verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub state: String,
    pub classification: Classification,
    pub dominant_frequency_hz: Option<f64>,
    pub linear_prediction: Option<TrajectoryClass>,
    /// Frequency of the dominant eigenvalue, for comparison.
    pub linear_frequency_hz: Option<f64>,
}

impl Assessment {
    /// Whether the run and the eigenvalues tell the same story.
    pub fn agrees_with_linear(&self) -> Option<bool> {
        self.linear_prediction
            .map(|predicted| predicted == self.classification.class)
    }
}

/// Classifies `state` in `run`, measuring from the perturbation onward.
pub fn assess(
    run: &TransientRun,
    state: &str,
    equilibrium: f64,
    report: Option<&StabilityReport>,
    settings: &ClassifierSettings,
) -> Result<Assessment> {
    let trajectory = run
        .trajectories
        .get(state)
        .ok_or_else(|| anyhow!("Run has no trajectory for '{}'.", state))?;
    let start_time = run.perturbation.as_ref().map_or(0.0, |p| p.time);
    let classification = classify(trajectory, equilibrium, start_time, settings)?;
    let window_start = start_time
        + settings.settle_fraction * (run.stats.final_time.max(start_time) - start_time);

    Ok(Assessment {
        state: state.to_string(),
        classification,
        dominant_frequency_hz: dominant_frequency(trajectory, window_start),
        linear_prediction: report.map(linear_prediction),
        linear_frequency_hz: report.and_then(|r| r.dominant()).map(|e| e.frequency_hz()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stability::EigenSpectrum;
    use crate::transient::TrajectorySample;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn sampled(growth: f64, horizon: f64) -> Trajectory {
        let samples = (0..=2000)
            .map(|k| {
                let time = horizon * k as f64 / 2000.0;
                TrajectorySample {
                    time,
                    value: 1.0 + 0.01 * (growth * time).exp() * (2.0 * PI * time).sin(),
                }
            })
            .collect();
        Trajectory {
            name: "x".into(),
            samples,
        }
    }

    fn label(growth: f64) -> TrajectoryClass {
        classify(&sampled(growth, 20.0), 1.0, 0.0, &ClassifierSettings::default())
            .expect("valid window")
            .class
    }

    #[test]
    fn labels_growth_decay_and_persistence() {
        assert_eq!(label(0.1), TrajectoryClass::Divergent);
        assert_eq!(label(-0.1), TrajectoryClass::Decaying);
        assert_eq!(label(0.0), TrajectoryClass::BoundedOscillatory);
        assert_eq!(label(0.005), TrajectoryClass::BoundedOscillatory);
    }

    #[test]
    fn non_finite_samples_are_divergent() {
        let mut trajectory = sampled(0.0, 20.0);
        trajectory.samples.last_mut().unwrap().value = f64::NAN;
        let result = classify(&trajectory, 1.0, 0.0, &ClassifierSettings::default()).unwrap();
        assert_eq!(result.class, TrajectoryClass::Divergent);
    }

    #[test]
    fn absolute_limit_overrides_the_ratio() {
        let settings = ClassifierSettings {
            divergence_limit: Some(0.005),
            ..ClassifierSettings::default()
        };
        let result = classify(&sampled(0.0, 20.0), 1.0, 0.0, &settings).unwrap();
        assert_eq!(result.class, TrajectoryClass::Divergent);
    }

    #[test]
    fn window_must_follow_the_perturbation() {
        let err = classify(&sampled(0.0, 5.0), 1.0, 6.0, &ClassifierSettings::default());
        assert!(err.is_err());
    }

    #[test]
    fn finds_the_oscillation_frequency() {
        let frequency = dominant_frequency(&sampled(0.0, 20.0), 4.0).expect("oscillating window");
        assert_abs_diff_eq!(frequency, 1.0, epsilon = 0.1);

        let flat = Trajectory {
            name: "flat".into(),
            samples: (0..100)
                .map(|k| TrajectorySample {
                    time: k as f64,
                    value: 2.0,
                })
                .collect(),
        };
        assert_eq!(dominant_frequency(&flat, 0.0), None);
    }

    #[test]
    fn linear_prediction_follows_the_verdict() {
        let unstable = StabilityReport::from_spectrum(
            EigenSpectrum::from_values([Complex::new(0.01, 12.0), Complex::new(0.01, -12.0)]),
            vec!["a".into(), "b".into()],
        );
        assert_eq!(linear_prediction(&unstable), TrajectoryClass::Divergent);
    }
}
