//! Implicit integration of semi-explicit index-1 DAEs.
//!
//! A [`DaeStepper`] advances `(x, y)` by one step, solving the discretized
//! differential equations together with `g(x, y) = 0` by Newton's method.
//! [`AdaptiveIntegrator`] wraps a stepper with step-doubling error control and
//! an optional state-offset event.

use crate::autodiff::{dae_jacobians, Dual};
use crate::cancel::CancelToken;
use crate::error::IntegrationFailureReason;
use crate::traits::DaeSystem;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use web_time::Instant;

/// Times closer than this are treated as equal.
const TIME_EPSILON: f64 = 1e-12;

/// Newton stops once its update is this small.
const NEGLIGIBLE_UPDATE: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplicitMethod {
    /// Second order, A-stable, no numerical damping.
    Trapezoidal,
    /// First order, L-stable.
    BackwardEuler,
}

impl ImplicitMethod {
    pub fn stepper(self, settings: &IntegratorSettings) -> ThetaStepper {
        let theta = match self {
            ImplicitMethod::Trapezoidal => 0.5,
            ImplicitMethod::BackwardEuler => 1.0,
        };
        ThetaStepper {
            theta,
            order: match self {
                ImplicitMethod::Trapezoidal => 2,
                ImplicitMethod::BackwardEuler => 1,
            },
            newton_tolerance: settings.newton_tolerance,
            max_newton_iterations: settings.max_newton_iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntegratorSettings {
    pub method: ImplicitMethod,
    pub atol: f64,
    pub rtol: f64,
    pub initial_step: f64,
    pub max_step: f64,
    pub min_step: f64,
    /// Step attempts, accepted or not.
    pub max_steps: usize,
    pub newton_tolerance: f64,
    pub max_newton_iterations: usize,
    /// Wall-clock budget per run in seconds.
    pub time_budget: Option<f64>,
}

impl Default for IntegratorSettings {
    fn default() -> Self {
        Self {
            method: ImplicitMethod::Trapezoidal,
            atol: 1e-6,
            rtol: 1e-6,
            initial_step: 1e-3,
            max_step: 0.05,
            min_step: 1e-9,
            max_steps: 200_000,
            newton_tolerance: 1e-10,
            max_newton_iterations: 12,
            time_budget: None,
        }
    }
}

impl IntegratorSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.atol > 0.0 && self.rtol >= 0.0) {
            return Err("tolerances must be positive".into());
        }
        if !(self.min_step > 0.0
            && self.min_step <= self.initial_step
            && self.initial_step <= self.max_step)
        {
            return Err("need 0 < min_step <= initial_step <= max_step".into());
        }
        if self.max_steps == 0 || self.max_newton_iterations == 0 {
            return Err("step and Newton iteration limits must be positive".into());
        }
        if !(self.newton_tolerance > 0.0) {
            return Err("newton_tolerance must be positive".into());
        }
        Ok(())
    }
}

/// One-step implicit method.
pub trait DaeStepper {
    /// Order of accuracy, used by the error estimate.
    fn order(&self) -> u32;

    /// Advances `(x, y)` by `h`; `None` when the corrector fails.
    fn step<S>(&mut self, system: &S, x: &[f64], y: &[f64], h: f64) -> Option<(Vec<f64>, Vec<f64>)>
    where
        S: DaeSystem<f64> + DaeSystem<Dual>;
}

/// `x₁ = x₀ + h·((1 − θ)·f(x₀, y₀) + θ·f(x₁, y₁))`, `g(x₁, y₁) = 0`.
#[derive(Debug, Clone)]
pub struct ThetaStepper {
    theta: f64,
    order: u32,
    newton_tolerance: f64,
    max_newton_iterations: usize,
}

fn max_abs(values: impl IntoIterator<Item = f64>) -> f64 {
    values.into_iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}

impl DaeStepper for ThetaStepper {
    fn order(&self) -> u32 {
        self.order
    }

    fn step<S>(&mut self, system: &S, x: &[f64], y: &[f64], h: f64) -> Option<(Vec<f64>, Vec<f64>)>
    where
        S: DaeSystem<f64> + DaeSystem<Dual>,
    {
        let n = x.len();
        let m = y.len();
        let explicit_weight = h * (1.0 - self.theta);
        let implicit_weight = h * self.theta;

        let mut f0 = vec![0.0; n];
        DaeSystem::<f64>::differential(system, x, y, &mut f0);

        let mut x1 = x.to_vec();
        let mut y1 = y.to_vec();
        let mut f1 = vec![0.0; n];
        let mut g1 = vec![0.0; m];
        let mut residual = DVector::zeros(n + m);

        for _ in 0..self.max_newton_iterations {
            DaeSystem::<f64>::differential(system, &x1, &y1, &mut f1);
            DaeSystem::<f64>::algebraic(system, &x1, &y1, &mut g1);
            for i in 0..n {
                residual[i] = x1[i] - x[i] - explicit_weight * f0[i] - implicit_weight * f1[i];
            }
            for i in 0..m {
                residual[n + i] = g1[i];
            }
            let norm = max_abs(residual.iter().copied());
            if !norm.is_finite() {
                return None;
            }
            if norm <= self.newton_tolerance {
                return Some((x1, y1));
            }

            let jac = dae_jacobians(system, &x1, &y1);
            let mut matrix = DMatrix::zeros(n + m, n + m);
            for i in 0..n {
                for j in 0..n {
                    matrix[(i, j)] = -implicit_weight * jac.fx[(i, j)];
                }
                matrix[(i, i)] += 1.0;
                for j in 0..m {
                    matrix[(i, n + j)] = -implicit_weight * jac.fy[(i, j)];
                }
            }
            for i in 0..m {
                for j in 0..n {
                    matrix[(n + i, j)] = jac.gx[(i, j)];
                }
                for j in 0..m {
                    matrix[(n + i, n + j)] = jac.gy[(i, j)];
                }
            }

            let delta = matrix.lu().solve(&residual)?;
            for i in 0..n {
                x1[i] -= delta[i];
            }
            for i in 0..m {
                y1[i] -= delta[n + i];
            }
            let update = max_abs(delta.iter().copied());
            if !update.is_finite() {
                return None;
            }
            if update <= NEGLIGIBLE_UPDATE {
                return Some((x1, y1));
            }
        }
        None
    }
}

/// Restores `g(x, y) = 0` for fixed `x`, starting from `y`.
pub fn solve_algebraic<S>(
    system: &S,
    x: &[f64],
    y: &[f64],
    tolerance: f64,
    max_iterations: usize,
) -> Option<Vec<f64>>
where
    S: DaeSystem<f64> + DaeSystem<Dual>,
{
    let m = y.len();
    let mut y = y.to_vec();
    let mut g = vec![0.0; m];
    for _ in 0..max_iterations {
        DaeSystem::<f64>::algebraic(system, x, &y, &mut g);
        let norm = max_abs(g.iter().copied());
        if !norm.is_finite() {
            return None;
        }
        if norm <= tolerance {
            return Some(y);
        }
        let jac = dae_jacobians(system, x, &y);
        let delta = jac.gy.lu().solve(&DVector::from_column_slice(&g))?;
        for i in 0..m {
            y[i] -= delta[i];
        }
    }
    None
}

/// Adds `offset` to differential state `index` once the clock reaches `time`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateOffsetEvent {
    pub time: f64,
    pub index: usize,
    pub offset: f64,
}

/// Where a run stopped short of its horizon.
#[derive(Debug, Clone)]
pub struct Stalled {
    pub reason: IntegrationFailureReason,
    pub time: f64,
    pub step_size: f64,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub accepted: usize,
    pub rejected: usize,
    pub final_time: f64,
    pub cancelled: bool,
}

pub struct AdaptiveIntegrator<'a> {
    settings: IntegratorSettings,
    event: Option<StateOffsetEvent>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> AdaptiveIntegrator<'a> {
    pub fn new(settings: IntegratorSettings) -> Self {
        Self {
            settings,
            event: None,
            cancel: None,
        }
    }

    pub fn with_event(mut self, event: StateOffsetEvent) -> Self {
        self.event = Some(event);
        self
    }

    pub fn with_cancel(mut self, cancel: &'a CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Integrates from `(x0, y0)` at t = 0 to `t_end`.
    ///
    /// `observe` sees the initial point, every accepted step, and the state
    /// right after the event is applied.
    pub fn integrate<S, F>(
        &self,
        system: &S,
        x0: &[f64],
        y0: &[f64],
        t_end: f64,
        mut observe: F,
    ) -> Result<IntegrationStats, Stalled>
    where
        S: DaeSystem<f64> + DaeSystem<Dual>,
        F: FnMut(f64, &[f64], &[f64]),
    {
        let settings = &self.settings;
        let mut stepper = settings.method.stepper(settings);
        let exponent = -1.0 / (stepper.order() as f64 + 1.0);
        let error_divisor = 2f64.powi(stepper.order() as i32) - 1.0;
        let started = Instant::now();

        let mut t = 0.0;
        let mut x = x0.to_vec();
        let mut y = y0.to_vec();
        let mut h = settings.initial_step;
        let mut pending = self.event;
        let mut stats = IntegrationStats {
            accepted: 0,
            rejected: 0,
            final_time: 0.0,
            cancelled: false,
        };
        let mut attempts = 0usize;

        let stalled = |reason, t, h, x: &[f64], y: &[f64]| Stalled {
            reason,
            time: t,
            step_size: h,
            x: x.to_vec(),
            y: y.to_vec(),
        };

        observe(t, &x, &y);

        while t < t_end - TIME_EPSILON {
            if self.cancel.is_some_and(|c| c.is_cancelled()) {
                debug!(t, "integration cancelled");
                stats.cancelled = true;
                break;
            }
            if attempts >= settings.max_steps {
                return Err(stalled(
                    IntegrationFailureReason::StepLimit(settings.max_steps),
                    t,
                    h,
                    &x,
                    &y,
                ));
            }
            if let Some(budget) = settings.time_budget {
                if started.elapsed().as_secs_f64() >= budget {
                    return Err(stalled(IntegrationFailureReason::Timeout, t, h, &x, &y));
                }
            }
            attempts += 1;

            h = h.min(settings.max_step).min(t_end - t);
            let mut lands_on_event = false;
            if let Some(event) = pending {
                if t + h >= event.time - TIME_EPSILON {
                    h = event.time - t;
                    lands_on_event = true;
                }
                if h <= TIME_EPSILON {
                    x[event.index] += event.offset;
                    y = solve_algebraic(
                        system,
                        &x,
                        &y,
                        settings.newton_tolerance,
                        settings.max_newton_iterations,
                    )
                    .ok_or_else(|| {
                        stalled(IntegrationFailureReason::Reinitialization, t, h, &x, &y)
                    })?;
                    debug!(t, index = event.index, offset = event.offset, "state offset applied");
                    pending = None;
                    h = settings.initial_step;
                    observe(t, &x, &y);
                    continue;
                }
            }

            let full = stepper.step(system, &x, &y, h);
            let halves = full.as_ref().and_then(|_| {
                let (xm, ym) = stepper.step(system, &x, &y, h / 2.0)?;
                stepper.step(system, &xm, &ym, h / 2.0)
            });
            let (Some((x_full, _)), Some((x_half, y_half))) = (full, halves) else {
                stats.rejected += 1;
                h /= 4.0;
                trace!(t, h, "corrector failed, step reduced");
                if h < settings.min_step {
                    return Err(stalled(IntegrationFailureReason::StepSizeUnderflow, t, h, &x, &y));
                }
                continue;
            };

            let error = x_full
                .iter()
                .zip(&x_half)
                .map(|(a, b)| {
                    (a - b).abs() / error_divisor
                        / (settings.atol + settings.rtol * a.abs().max(b.abs()))
                })
                .fold(0.0f64, f64::max);

            if error <= 1.0 {
                t = match (lands_on_event, pending) {
                    (true, Some(event)) => event.time,
                    _ => t + h,
                };
                x = x_half;
                y = y_half;
                stats.accepted += 1;
                observe(t, &x, &y);
                let factor = if error == 0.0 {
                    5.0
                } else {
                    (0.9 * error.powf(exponent)).clamp(0.2, 5.0)
                };
                h *= factor;
            } else {
                stats.rejected += 1;
                h *= (0.9 * error.powf(exponent)).max(0.2);
                debug!(t, h, error, "step rejected");
                if h < settings.min_step {
                    return Err(stalled(IntegrationFailureReason::StepSizeUnderflow, t, h, &x, &y));
                }
            }
        }

        stats.final_time = t;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Scalar;
    use approx::assert_abs_diff_eq;

    /// `ẋ = −y`, `0 = y − k·x` so `x(t) = x₀·e^{−kt}`.
    struct Decay {
        k: f64,
    }

    impl<T: Scalar> DaeSystem<T> for Decay {
        fn state_dimension(&self) -> usize {
            1
        }
        fn algebraic_dimension(&self) -> usize {
            1
        }
        fn differential(&self, _x: &[T], y: &[T], out: &mut [T]) {
            out[0] = -y[0];
        }
        fn algebraic(&self, x: &[T], y: &[T], out: &mut [T]) {
            out[0] = y[0] - T::from_f64(self.k).unwrap() * x[0];
        }
    }

    /// Undamped oscillator with an algebraic copy of the position.
    struct Oscillator;

    impl<T: Scalar> DaeSystem<T> for Oscillator {
        fn state_dimension(&self) -> usize {
            2
        }
        fn algebraic_dimension(&self) -> usize {
            1
        }
        fn differential(&self, x: &[T], y: &[T], out: &mut [T]) {
            out[0] = x[1];
            out[1] = -y[0];
        }
        fn algebraic(&self, x: &[T], y: &[T], out: &mut [T]) {
            out[0] = y[0] - x[0];
        }
    }

    #[test]
    fn trapezoidal_tracks_exponential_decay() {
        let system = Decay { k: 2.0 };
        let settings = IntegratorSettings::default();
        let mut last = (0.0, 0.0, 0.0);
        let stats = AdaptiveIntegrator::new(settings)
            .integrate(&system, &[1.0], &[2.0], 3.0, |t, x, y| last = (t, x[0], y[0]))
            .expect("smooth problem integrates");

        assert!(!stats.cancelled);
        assert_abs_diff_eq!(last.0, 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(last.1, (-6.0f64).exp(), epsilon = 5e-5);
        assert_abs_diff_eq!(last.2, 2.0 * last.1, epsilon = 1e-9);
    }

    #[test]
    fn backward_euler_also_converges() {
        let system = Decay { k: 1.0 };
        let settings = IntegratorSettings {
            method: ImplicitMethod::BackwardEuler,
            ..IntegratorSettings::default()
        };
        let mut last = 0.0;
        AdaptiveIntegrator::new(settings)
            .integrate(&system, &[1.0], &[1.0], 1.0, |_, x, _| last = x[0])
            .expect("integrates");
        assert_abs_diff_eq!(last, (-1.0f64).exp(), epsilon = 1e-3);
    }

    #[test]
    fn event_lands_exactly_and_reinitializes() {
        let event = StateOffsetEvent {
            time: 0.5,
            index: 0,
            offset: 0.25,
        };
        let mut samples = Vec::new();
        AdaptiveIntegrator::new(IntegratorSettings::default())
            .with_event(event)
            .integrate(&Oscillator, &[0.0, 0.0], &[0.0], 1.0, |t, x, y| {
                samples.push((t, x[0], y[0]))
            })
            .expect("integrates");

        let at_event: Vec<_> = samples.iter().filter(|s| s.0 == 0.5).collect();
        assert_eq!(at_event.len(), 2, "one sample before and one after the offset");
        assert_eq!(at_event[1].1, 0.25);
        assert_abs_diff_eq!(at_event[1].2, 0.25, epsilon = 1e-10);

        let (t, x, _) = samples[samples.len() - 1];
        assert_abs_diff_eq!(t, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(x, 0.25 * (0.5f64).cos(), epsilon = 1e-4);
    }

    #[test]
    fn step_limit_is_reported() {
        let settings = IntegratorSettings {
            max_steps: 3,
            ..IntegratorSettings::default()
        };
        let err = AdaptiveIntegrator::new(settings)
            .integrate(&Decay { k: 1.0 }, &[1.0], &[1.0], 10.0, |_, _, _| {})
            .expect_err("three attempts cannot cover the horizon");
        assert_eq!(err.reason, IntegrationFailureReason::StepLimit(3));
        assert!(err.time > 0.0);
    }

    #[test]
    fn cancelled_run_returns_early() {
        let token = CancelToken::new();
        token.cancel();
        let mut count = 0;
        let stats = AdaptiveIntegrator::new(IntegratorSettings::default())
            .with_cancel(&token)
            .integrate(&Decay { k: 1.0 }, &[1.0], &[1.0], 10.0, |_, _, _| count += 1)
            .expect("cancellation is not a failure");
        assert!(stats.cancelled);
        assert_eq!(count, 1);
        assert_eq!(stats.final_time, 0.0);
    }

    #[test]
    fn validates_settings() {
        let settings = IntegratorSettings {
            min_step: 1.0,
            ..IntegratorSettings::default()
        };
        assert!(settings.validate().is_err());
        assert!(IntegratorSettings::default().validate().is_ok());
    }
}
