//! Network-plus-machine differential-algebraic model.
//!
//! Each machine is a one-axis (flux-decay) synchronous machine with a swing
//! equation and a single-time-constant exciter whose output is clamped to its
//! ceiling limits. The slack bus is an infinite bus held at its power-flow
//! voltage; every other bus contributes its voltage magnitude and angle as
//! algebraic variables, constrained by the bus power balance.
//!
//! Differential states are named `"<machine>.delta"`, `"<machine>.omega"`,
//! `"<machine>.e_q"` and `"<machine>.e_fd"`; algebraic variables are named
//! `"<bus>.vm"` and `"<bus>.va"`.

use crate::error::{BuildFailure, BuildFailureReason};
use crate::network::{BusKind, NetworkState};
use crate::traits::{cast, DaeSystem, Scalar};
use nalgebra_sparse::CsrMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

/// Per-machine state suffixes in storage order.
pub const MACHINE_STATES: [&str; 4] = ["delta", "omega", "e_q", "e_fd"];

const DELTA: usize = 0;
const OMEGA: usize = 1;
const E_Q: usize = 2;
const E_FD: usize = 3;

/// Tolerance on the network equations at the assembled equilibrium.
const CONSISTENCY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExciterSpec {
    /// Regulator gain.
    pub ka: f64,
    /// Regulator time constant (s).
    pub ta: f64,
    pub efd_min: f64,
    pub efd_max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    pub id: String,
    /// Generator in the network whose power-flow output the machine takes over.
    pub generator: String,
    pub xd: f64,
    pub xd_prime: f64,
    /// d-axis open-circuit transient time constant (s).
    pub td0_prime: f64,
    /// Inertia constant (s).
    pub h: f64,
    /// Damping (pu power per pu speed deviation).
    pub d: f64,
    /// Synchronous speed (rad/s).
    pub omega_s: f64,
    pub exciter: ExciterSpec,
}

impl MachineSpec {
    fn validate(&self) -> Result<(), BuildFailure> {
        let e = &self.exciter;
        let checks = [
            ("xd_prime", self.xd_prime > 0.0),
            ("xd", self.xd >= self.xd_prime),
            ("td0_prime", self.td0_prime > 0.0),
            ("h", self.h > 0.0),
            ("d", self.d >= 0.0),
            ("omega_s", self.omega_s > 0.0),
            ("exciter.ka", e.ka > 0.0),
            ("exciter.ta", e.ta > 0.0),
            ("exciter limits", e.efd_min < e.efd_max),
        ];
        for (name, ok) in checks {
            if !ok {
                return Err(BuildFailure::at(
                    self.id.clone(),
                    BuildFailureReason::InvalidParameter(name.to_string()),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicModelSpec {
    pub machines: Vec<MachineSpec>,
}

impl DynamicModelSpec {
    pub fn machine(&self, id: &str) -> Option<&MachineSpec> {
        self.machines.iter().find(|m| m.id == id)
    }

    pub fn machine_mut(&mut self, id: &str) -> Option<&mut MachineSpec> {
        self.machines.iter_mut().find(|m| m.id == id)
    }
}

/// A machine bound to its bus with setpoints fixed by the operating point.
#[derive(Debug, Clone)]
struct Machine {
    spec: MachineSpec,
    bus: usize,
    pm: f64,
    vref: f64,
}

/// The DAE assembled at one operating point.
///
/// Immutable once built; clone it to hand an independent copy to another worker.
#[derive(Debug, Clone)]
pub struct DynamicModel {
    ybus: CsrMatrix<Complex<f64>>,
    slack_voltage: (f64, f64),
    /// Algebraic slot of each bus, `None` for the slack.
    algebraic_slot: Vec<Option<usize>>,
    /// Constant-power demand net of non-machine generation, per bus.
    fixed_demand: Vec<(f64, f64)>,
    machines: Vec<Machine>,
    state_names: Vec<String>,
    algebraic_names: Vec<String>,
    x0: Vec<f64>,
    y0: Vec<f64>,
}

impl DynamicModel {
    /// Assembles the model around a converged power-flow solution.
    pub fn build(network: &NetworkState, spec: &DynamicModelSpec) -> Result<Self, BuildFailure> {
        if spec.machines.is_empty() {
            return Err(BuildFailure::new(BuildFailureReason::NoMachines));
        }

        let buses = network.buses();
        let slack = network.slack_index();
        let mut algebraic_slot = vec![None; buses.len()];
        let mut algebraic_names = Vec::new();
        let mut y0 = Vec::new();
        let mut next = 0;
        for (i, bus) in buses.iter().enumerate() {
            if bus.kind == BusKind::Slack {
                continue;
            }
            algebraic_slot[i] = Some(next);
            next += 1;
            algebraic_names.push(format!("{}.vm", bus.id));
            algebraic_names.push(format!("{}.va", bus.id));
            y0.push(bus.vm);
            y0.push(bus.va);
        }

        let mut fixed_demand: Vec<(f64, f64)> =
            (0..buses.len()).map(|i| network.load_at(i)).collect();
        for generator in network.generators() {
            if spec.machines.iter().any(|m| m.generator == generator.id) {
                continue;
            }
            if let Some(i) = network.bus_index(&generator.bus) {
                fixed_demand[i].0 -= generator.p;
                fixed_demand[i].1 -= generator.q;
            }
        }

        let mut machines = Vec::with_capacity(spec.machines.len());
        let mut state_names = Vec::with_capacity(4 * spec.machines.len());
        let mut x0 = Vec::with_capacity(4 * spec.machines.len());
        for machine in &spec.machines {
            machine.validate()?;
            let generator = network.generator(&machine.generator).ok_or_else(|| {
                BuildFailure::at(
                    machine.id.clone(),
                    BuildFailureReason::UnknownGenerator(machine.generator.clone()),
                )
            })?;
            let bus = network.bus_index(&generator.bus).ok_or_else(|| {
                BuildFailure::at(
                    machine.id.clone(),
                    BuildFailureReason::UnknownGenerator(machine.generator.clone()),
                )
            })?;
            if bus == slack {
                return Err(BuildFailure::at(
                    machine.id.clone(),
                    BuildFailureReason::MachineAtSlack,
                ));
            }

            let voltage = buses[bus].phasor();
            let injected = Complex::new(generator.p, generator.q);
            let current = (injected / voltage).conj();
            let emf = voltage + Complex::new(0.0, machine.xd_prime) * current;
            let delta = emf.arg();
            let e_q = emf.norm();
            let i_d = (e_q - buses[bus].vm * (delta - buses[bus].va).cos()) / machine.xd_prime;
            let e_fd = e_q + (machine.xd - machine.xd_prime) * i_d;
            let exciter = &machine.exciter;
            if !(exciter.efd_min..=exciter.efd_max).contains(&e_fd) {
                return Err(BuildFailure::at(
                    machine.id.clone(),
                    BuildFailureReason::InvalidParameter(format!(
                        "field voltage {:.4} outside exciter limits",
                        e_fd
                    )),
                ));
            }
            let vref = buses[bus].vm + e_fd / exciter.ka;

            for suffix in MACHINE_STATES {
                state_names.push(format!("{}.{}", machine.id, suffix));
            }
            x0.extend_from_slice(&[delta, 0.0, e_q, e_fd]);
            machines.push(Machine {
                spec: machine.clone(),
                bus,
                pm: generator.p,
                vref,
            });
        }

        let model = Self {
            ybus: network.admittance_matrix(),
            slack_voltage: (buses[slack].vm, buses[slack].va),
            algebraic_slot,
            fixed_demand,
            machines,
            state_names,
            algebraic_names,
            x0,
            y0,
        };

        if let Some(name) = model.non_finite_entry() {
            return Err(BuildFailure::at(name, BuildFailureReason::NonFinite("initial state".into())));
        }
        let mut residual = vec![0.0; model.algebraic_names.len()];
        model.algebraic(&model.x0, &model.y0, &mut residual);
        let worst = residual.iter().fold(0.0f64, |acc, r| acc.max(r.abs()));
        if !(worst <= CONSISTENCY_TOLERANCE) {
            return Err(BuildFailure::new(BuildFailureReason::UnsolvedOperatingPoint(worst)));
        }

        Ok(model)
    }

    fn non_finite_entry(&self) -> Option<String> {
        self.state_names
            .iter()
            .zip(&self.x0)
            .chain(self.algebraic_names.iter().zip(&self.y0))
            .find(|(_, v)| !v.is_finite())
            .map(|(name, _)| name.clone())
    }

    pub fn state_names(&self) -> &[String] {
        &self.state_names
    }

    pub fn algebraic_names(&self) -> &[String] {
        &self.algebraic_names
    }

    pub fn state_index(&self, name: &str) -> Option<usize> {
        self.state_names.iter().position(|n| n == name)
    }

    pub fn algebraic_index(&self, name: &str) -> Option<usize> {
        self.algebraic_names.iter().position(|n| n == name)
    }

    /// Equilibrium differential state.
    pub fn initial_state(&self) -> &[f64] {
        &self.x0
    }

    /// Equilibrium algebraic state.
    pub fn initial_algebraic(&self) -> &[f64] {
        &self.y0
    }

    /// Equilibrium value of a differential or algebraic variable.
    pub fn equilibrium_value(&self, name: &str) -> Option<f64> {
        self.state_index(name)
            .map(|i| self.x0[i])
            .or_else(|| self.algebraic_index(name).map(|i| self.y0[i]))
    }

    /// Bus voltages in bus order, the slack taken from its fixed phasor.
    fn bus_voltages<T: Scalar>(&self, y: &[T]) -> (Vec<T>, Vec<T>) {
        let n = self.algebraic_slot.len();
        let mut vm = vec![cast::<T>(self.slack_voltage.0); n];
        let mut va = vec![cast::<T>(self.slack_voltage.1); n];
        for (bus, slot) in self.algebraic_slot.iter().enumerate() {
            if let Some(k) = slot {
                vm[bus] = y[2 * k];
                va[bus] = y[2 * k + 1];
            }
        }
        (vm, va)
    }
}

/// Electrical output of a one-axis machine behind X'd.
struct Terminal<T> {
    p: T,
    q: T,
    i_d: T,
}

fn terminal<T: Scalar>(e_q: T, delta: T, vm: T, va: T, xd_prime: T) -> Terminal<T> {
    let (sin, cos) = (delta - va).sin_cos();
    Terminal {
        p: e_q * vm * sin / xd_prime,
        q: (e_q * vm * cos - vm * vm) / xd_prime,
        i_d: (e_q - vm * cos) / xd_prime,
    }
}

fn clamp<T: Scalar>(value: T, lo: T, hi: T) -> T {
    if value < lo {
        lo
    } else if value > hi {
        hi
    } else {
        value
    }
}

impl<T: Scalar> DaeSystem<T> for DynamicModel {
    fn state_dimension(&self) -> usize {
        self.x0.len()
    }

    fn algebraic_dimension(&self) -> usize {
        self.y0.len()
    }

    fn differential(&self, x: &[T], y: &[T], out: &mut [T]) {
        let (vm, va) = self.bus_voltages(y);
        let two = cast::<T>(2.0);
        for (k, machine) in self.machines.iter().enumerate() {
            let spec = &machine.spec;
            let s = &x[4 * k..4 * k + 4];
            let out = &mut out[4 * k..4 * k + 4];
            let e = terminal(s[E_Q], s[DELTA], vm[machine.bus], va[machine.bus], cast(spec.xd_prime));

            out[DELTA] = cast::<T>(spec.omega_s) * s[OMEGA];
            out[OMEGA] = (cast::<T>(machine.pm) - e.p - cast::<T>(spec.d) * s[OMEGA])
                / (two * cast(spec.h));
            out[E_Q] = (s[E_FD] - s[E_Q] - cast::<T>(spec.xd - spec.xd_prime) * e.i_d)
                / cast(spec.td0_prime);

            let exciter = &spec.exciter;
            let regulated = clamp(
                cast::<T>(exciter.ka) * (cast::<T>(machine.vref) - vm[machine.bus]),
                cast(exciter.efd_min),
                cast(exciter.efd_max),
            );
            out[E_FD] = (regulated - s[E_FD]) / cast(exciter.ta);
        }
    }

    fn algebraic(&self, x: &[T], y: &[T], out: &mut [T]) {
        let (vm, va) = self.bus_voltages(y);

        for (bus, slot) in self.algebraic_slot.iter().enumerate() {
            let Some(k) = slot else { continue };
            let (p_fixed, q_fixed) = self.fixed_demand[bus];
            out[2 * k] = -cast::<T>(p_fixed);
            out[2 * k + 1] = -cast::<T>(q_fixed);
        }

        for (k, machine) in self.machines.iter().enumerate() {
            let Some(slot) = self.algebraic_slot[machine.bus] else {
                continue;
            };
            let s = &x[4 * k..4 * k + 4];
            let e = terminal(
                s[E_Q],
                s[DELTA],
                vm[machine.bus],
                va[machine.bus],
                cast(machine.spec.xd_prime),
            );
            out[2 * slot] = out[2 * slot] + e.p;
            out[2 * slot + 1] = out[2 * slot + 1] + e.q;
        }

        for (i, row) in self.ybus.row_iter().enumerate() {
            let Some(k) = self.algebraic_slot[i] else {
                continue;
            };
            let (mut p, mut q) = (T::zero(), T::zero());
            for (&j, y) in row.col_indices().iter().zip(row.values()) {
                let (g, b) = (cast::<T>(y.re), cast::<T>(y.im));
                let (sin, cos) = (va[i] - va[j]).sin_cos();
                p = p + vm[j] * (g * cos + b * sin);
                q = q + vm[j] * (g * sin - b * cos);
            }
            out[2 * k] = out[2 * k] - vm[i] * p;
            out[2 * k + 1] = out[2 * k + 1] - vm[i] * q;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_flow::NewtonRaphson;
    use crate::reference;
    use crate::traits::PowerFlowSolver;
    use approx::assert_abs_diff_eq;

    fn solved_at(p: f64) -> NetworkState {
        let mut network = reference::network();
        network
            .set_load_power(reference::LOAD, p, 0.0)
            .expect("reference load");
        NewtonRaphson::default()
            .solve(&network)
            .expect("reference case converges")
            .network
    }

    #[test]
    fn equilibrium_is_a_rest_point() {
        let model = DynamicModel::build(&solved_at(0.9), &reference::dynamics()).expect("builds");
        let x = model.initial_state().to_vec();
        let y = model.initial_algebraic().to_vec();

        let mut f = vec![0.0; x.len()];
        let mut g = vec![0.0; y.len()];
        model.differential(&x, &y, &mut f);
        model.algebraic(&x, &y, &mut g);

        for (name, value) in model.state_names().iter().zip(&f) {
            assert!(value.abs() < 1e-8, "d{}/dt = {} at equilibrium", name, value);
        }
        for value in g {
            assert!(value.abs() < 1e-8, "network residual {}", value);
        }
    }

    #[test]
    fn unloaded_condenser_floats_at_bus_voltage() {
        let model = DynamicModel::build(&solved_at(0.0), &reference::dynamics()).expect("builds");
        assert_abs_diff_eq!(model.equilibrium_value("sc.e_q").unwrap(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.equilibrium_value("sc.e_fd").unwrap(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.equilibrium_value("load.vm").unwrap(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn states_are_addressed_by_name() {
        let model = DynamicModel::build(&solved_at(0.3), &reference::dynamics()).expect("builds");
        assert_eq!(
            model.state_names(),
            &["sc.delta", "sc.omega", "sc.e_q", "sc.e_fd"]
        );
        assert_eq!(model.state_index("sc.e_q"), Some(2));
        assert_eq!(model.algebraic_names(), &["load.vm", "load.va"]);
        assert_eq!(model.state_index("load.vm"), None);
    }

    #[test]
    fn rejects_unsolved_operating_point() {
        let mut network = reference::network();
        network
            .set_load_power(reference::LOAD, 0.8, 0.0)
            .expect("reference load");
        let err = DynamicModel::build(&network, &reference::dynamics())
            .expect_err("flat start is not an operating point at p = 0.8");
        assert!(matches!(err.reason, BuildFailureReason::UnsolvedOperatingPoint(_)));
    }

    #[test]
    fn rejects_machine_at_slack_and_bad_parameters() {
        let network = solved_at(0.2);
        let mut spec = reference::dynamics();
        spec.machines[0].generator = reference::INFEED.to_string();
        let err = DynamicModel::build(&network, &spec).expect_err("slack machine");
        assert_eq!(err.reason, BuildFailureReason::MachineAtSlack);

        let mut spec = reference::dynamics();
        spec.machines[0].h = 0.0;
        let err = DynamicModel::build(&network, &spec).expect_err("zero inertia");
        assert_eq!(err.component.as_deref(), Some("sc"));
    }
}
