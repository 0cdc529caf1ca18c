//! Polar Newton-Raphson power flow.
//!
//! Unknowns are the angle of every non-slack bus followed by the magnitude of
//! every PQ bus. The mismatch is written once, generically over [`Scalar`];
//! its Jacobian comes from dual-number evaluation rather than hand-coded
//! partial derivatives.

use crate::autodiff::Dual;
use crate::error::{NonConvergence, NonConvergenceReason};
use crate::network::{BusKind, NetworkState};
use crate::traits::{cast, PowerFlowSolution, PowerFlowSolver, Scalar};
use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::trace;
use web_time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerFlowSettings {
    pub max_iterations: usize,
    /// Infinity norm of the power mismatch (pu).
    pub tolerance: f64,
    /// Wall-clock budget per solve in seconds.
    pub time_budget: Option<f64>,
}

impl Default for PowerFlowSettings {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            tolerance: 1e-9,
            time_budget: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewtonRaphson {
    pub settings: PowerFlowSettings,
}

impl NewtonRaphson {
    pub fn new(settings: PowerFlowSettings) -> Self {
        Self { settings }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.settings.tolerance = tolerance;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.settings.max_iterations = max_iterations;
        self
    }
}

/// Index bookkeeping between buses and the unknown vector.
struct Layout {
    /// Buses whose angle is unknown, in bus order.
    angle_buses: Vec<usize>,
    /// Buses whose magnitude is unknown, in bus order.
    magnitude_buses: Vec<usize>,
}

impl Layout {
    fn new(network: &NetworkState) -> Self {
        let buses = network.buses();
        Self {
            angle_buses: (0..buses.len())
                .filter(|&i| buses[i].kind != BusKind::Slack)
                .collect(),
            magnitude_buses: (0..buses.len())
                .filter(|&i| buses[i].kind == BusKind::Pq)
                .collect(),
        }
    }

    fn len(&self) -> usize {
        self.angle_buses.len() + self.magnitude_buses.len()
    }

    fn pack(&self, network: &NetworkState) -> Vec<f64> {
        let buses = network.buses();
        self.angle_buses
            .iter()
            .map(|&i| buses[i].va)
            .chain(self.magnitude_buses.iter().map(|&i| buses[i].vm))
            .collect()
    }

    fn unpack<T: Scalar>(&self, network: &NetworkState, z: &[T]) -> (Vec<T>, Vec<T>) {
        let buses = network.buses();
        let mut vm: Vec<T> = buses.iter().map(|b| cast(b.vm)).collect();
        let mut va: Vec<T> = buses.iter().map(|b| cast(b.va)).collect();
        for (k, &i) in self.angle_buses.iter().enumerate() {
            va[i] = z[k];
        }
        let offset = self.angle_buses.len();
        for (k, &i) in self.magnitude_buses.iter().enumerate() {
            vm[i] = z[offset + k];
        }
        (vm, va)
    }
}

/// Injected complex power at every bus for the given voltages.
fn injections<T: Scalar>(ybus: &CsrMatrix<Complex<f64>>, vm: &[T], va: &[T]) -> Vec<(T, T)> {
    let mut out = Vec::with_capacity(vm.len());
    for (i, row) in ybus.row_iter().enumerate() {
        let (mut p, mut q) = (T::zero(), T::zero());
        for (&j, y) in row.col_indices().iter().zip(row.values()) {
            let (g, b) = (cast::<T>(y.re), cast::<T>(y.im));
            let (sin, cos) = (va[i] - va[j]).sin_cos();
            p = p + vm[j] * (g * cos + b * sin);
            q = q + vm[j] * (g * sin - b * cos);
        }
        out.push((vm[i] * p, vm[i] * q));
    }
    out
}

fn mismatch<T: Scalar>(
    layout: &Layout,
    network: &NetworkState,
    ybus: &CsrMatrix<Complex<f64>>,
    scheduled: &[(f64, f64)],
    z: &[T],
    out: &mut [T],
) {
    let (vm, va) = layout.unpack(network, z);
    let computed = injections(ybus, &vm, &va);
    for (k, &i) in layout.angle_buses.iter().enumerate() {
        out[k] = computed[i].0 - cast(scheduled[i].0);
    }
    let offset = layout.angle_buses.len();
    for (k, &i) in layout.magnitude_buses.iter().enumerate() {
        out[offset + k] = computed[i].1 - cast(scheduled[i].1);
    }
}

fn infinity_norm(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}

impl PowerFlowSolver for NewtonRaphson {
    fn solve(&self, network: &NetworkState) -> Result<PowerFlowSolution, NonConvergence> {
        let settings = &self.settings;
        let started = Instant::now();
        let layout = Layout::new(network);
        let ybus = network.admittance_matrix();
        let scheduled: Vec<(f64, f64)> = (0..network.buses().len())
            .map(|i| network.scheduled_injection(i))
            .collect();

        let dim = layout.len();
        let mut z = layout.pack(network);
        let mut residual = vec![0.0; dim];
        let mut dual_z = vec![Dual::constant(0.0); dim];
        let mut dual_out = vec![Dual::constant(0.0); dim];
        let mut iterations = 0usize;

        let fail = |reason, iterations, mismatch| NonConvergence {
            reason,
            iterations,
            mismatch,
        };

        loop {
            mismatch(&layout, network, &ybus, &scheduled, &z, &mut residual);
            let norm = infinity_norm(&residual);
            trace!(iterations, mismatch = norm, "newton-raphson iterate");
            if !norm.is_finite() {
                return Err(fail(NonConvergenceReason::Diverged, iterations, norm));
            }
            if norm <= settings.tolerance {
                break;
            }
            if iterations >= settings.max_iterations {
                return Err(fail(NonConvergenceReason::IterationLimit, iterations, norm));
            }
            if let Some(budget) = settings.time_budget {
                if started.elapsed().as_secs_f64() >= budget {
                    return Err(fail(NonConvergenceReason::Timeout, iterations, norm));
                }
            }

            let mut jacobian = DMatrix::zeros(dim, dim);
            for j in 0..dim {
                for i in 0..dim {
                    dual_z[i] = Dual::new(z[i], if i == j { 1.0 } else { 0.0 });
                }
                mismatch(&layout, network, &ybus, &scheduled, &dual_z, &mut dual_out);
                for i in 0..dim {
                    jacobian[(i, j)] = dual_out[i].eps;
                }
            }

            let rhs = DVector::from_column_slice(&residual);
            let Some(delta) = jacobian.lu().solve(&rhs) else {
                return Err(fail(NonConvergenceReason::SingularJacobian, iterations, norm));
            };
            for i in 0..dim {
                z[i] -= delta[i];
            }
            iterations += 1;
        }

        let final_mismatch = infinity_norm(&residual);
        let mut solved = network.clone();
        let (vm, va) = layout.unpack::<f64>(network, &z);
        let computed = injections(&ybus, &vm, &va);
        for (i, bus) in solved.buses_mut().iter_mut().enumerate() {
            bus.vm = vm[i];
            bus.va = va[i];
            bus.p_inj = computed[i].0;
            bus.q_inj = computed[i].1;
        }
        dispatch_generation(&mut solved);

        Ok(PowerFlowSolution {
            network: solved,
            iterations,
            mismatch: final_mismatch,
        })
    }
}

/// Writes the power slack and PV buses actually supply back onto their generators.
///
/// The first generator at a bus takes whatever the others' setpoints leave.
fn dispatch_generation(network: &mut NetworkState) {
    let count = network.buses().len();
    for i in 0..count {
        let bus = &network.buses()[i];
        if bus.kind == BusKind::Pq {
            continue;
        }
        let id = bus.id.clone();
        let (p_inj, q_inj) = (bus.p_inj, bus.q_inj);
        let (p_load, q_load) = network.load_at(i);
        let free_p = bus.kind == BusKind::Slack;

        let mut at_bus = network
            .generators_mut()
            .iter_mut()
            .filter(|g| g.bus == id)
            .collect::<Vec<_>>();
        let Some((first, rest)) = at_bus.split_first_mut() else {
            continue;
        };
        let other_p: f64 = rest.iter().map(|g| g.p).sum();
        let other_q: f64 = rest.iter().map(|g| g.q).sum();
        if free_p {
            first.p = p_inj + p_load - other_p;
        }
        first.q = q_inj + q_load - other_q;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Bus, Generator, Line, LoadSpec};
    use approx::assert_abs_diff_eq;

    const X: f64 = 0.425;

    fn radial(p: f64, q: f64) -> NetworkState {
        NetworkState::new(
            vec![
                Bus::new("grid", BusKind::Slack, 1.0, 0.0),
                Bus::new("load", BusKind::Pq, 1.0, 0.0),
            ],
            vec![Line {
                id: "tie".into(),
                from: "grid".into(),
                to: "load".into(),
                r: 0.0,
                x: X,
                b: 0.0,
            }],
            vec![LoadSpec {
                id: "load".into(),
                bus: "load".into(),
                p,
                q,
            }],
            vec![Generator {
                id: "infeed".into(),
                bus: "grid".into(),
                p: 0.0,
                q: 0.0,
            }],
        )
        .expect("valid network")
    }

    /// Upper-branch voltage of a lossless radial feeder from an ideal source.
    fn closed_form(p: f64, q: f64) -> (f64, f64) {
        let a = 1.0 - 2.0 * q * X;
        let v2 = (a + (a * a - 4.0 * X * X * (p * p + q * q)).sqrt()) / 2.0;
        let v = v2.sqrt();
        (v, -(p * X / v).asin())
    }

    #[test]
    fn matches_radial_closed_form() {
        let network = radial(0.8, 0.2);
        let solution = NewtonRaphson::default()
            .solve(&network)
            .expect("converges below the nose");
        let bus = solution.network.bus("load").expect("load bus");
        let (v, theta) = closed_form(0.8, 0.2);
        assert_abs_diff_eq!(bus.vm, v, epsilon = 1e-8);
        assert_abs_diff_eq!(bus.va, theta, epsilon = 1e-8);
        assert_abs_diff_eq!(bus.p_inj, -0.8, epsilon = 1e-8);

        let infeed = solution.network.generator("infeed").expect("slack generator");
        assert_abs_diff_eq!(infeed.p, 0.8, epsilon = 1e-8);
        assert!(infeed.q > 0.2, "slack must also cover line losses, got {}", infeed.q);
    }

    #[test]
    fn reports_non_convergence_past_the_nose() {
        let network = radial(1.0 / (2.0 * X) + 0.05, 0.0);
        let err = NewtonRaphson::default()
            .solve(&network)
            .expect_err("no solution beyond maximum transfer");
        assert!(err.iterations > 0);
    }

    #[test]
    fn exhausted_time_budget_is_reported() {
        let solver = NewtonRaphson::new(PowerFlowSettings {
            time_budget: Some(0.0),
            ..PowerFlowSettings::default()
        });
        let err = solver.solve(&radial(0.8, 0.2)).expect_err("zero budget");
        assert_eq!(err.reason, NonConvergenceReason::Timeout);
        assert_eq!(err.iterations, 0);
        assert!(err.mismatch > 0.0);
    }

    #[test]
    fn solving_twice_is_deterministic() {
        let network = radial(1.1, 0.0);
        let solver = NewtonRaphson::default();
        let a = solver.solve(&network).expect("first solve");
        let b = solver.solve(&network).expect("second solve");
        assert_eq!(a.network, b.network);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn iteration_limit_is_reported() {
        let network = radial(1.0, 0.0);
        let err = NewtonRaphson::default()
            .with_max_iterations(1)
            .solve(&network)
            .expect_err("one iteration is not enough from a flat start");
        assert_eq!(err.reason, NonConvergenceReason::IterationLimit);
    }
}
