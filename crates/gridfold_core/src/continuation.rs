//! Single-parameter load sweep ("continuation power flow").
//!
//! The sweep walks a monotone sequence of load levels, warm-starting each
//! power flow from the previous converged point. The first level the solver
//! cannot reach ends the sweep: that is how the fold (voltage collapse) is
//! located. No bisection of the critical point is attempted.
//!
//! Each sweep owns its working network. Nothing is shared between sweeps, so
//! independent sweeps can run on separate threads.

use crate::cancel::CancelToken;
use crate::error::NonConvergence;
use crate::model::DynamicModelSpec;
use crate::network::{LoadSpec, NetworkState};
use crate::stability::{analyze, StabilityReport};
use crate::traits::PowerFlowSolver;
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// One converged point of the PV curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PvSample {
    /// Active power of the swept load (pu).
    pub load: f64,
    /// Voltage magnitude at the monitored bus (pu).
    pub voltage: f64,
    /// Small-signal verdict; absent when not analyzed or not buildable.
    pub stable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SweepStop {
    /// Every parameter value converged.
    Completed,
    /// The power flow failed at `parameter`.
    Collapsed {
        parameter: f64,
        last_feasible: Option<f64>,
        error: NonConvergence,
    },
    /// Stopped by the caller before `next_parameter` was attempted.
    Cancelled { next_parameter: Option<f64> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepSettings {
    /// Lagging power factor tying reactive to active load, in (0, 1].
    pub power_factor: f64,
    /// Bus whose voltage is recorded; defaults to the load's bus.
    pub monitored_bus: Option<String>,
    /// Run the small-signal analyzer at every converged point.
    pub analyze_stability: bool,
    /// Keep the full report of every analyzed point.
    pub keep_reports: bool,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self {
            power_factor: 1.0,
            monitored_bus: None,
            analyze_stability: true,
            keep_reports: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzedPoint {
    pub load: f64,
    pub report: StabilityReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    pub samples: Vec<PvSample>,
    pub stop: SweepStop,
    /// Last converged operating point, if any.
    pub last_converged: Option<NetworkState>,
    pub solver_calls: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<AnalyzedPoint>,
}

impl SweepResult {
    /// Highest-load sample reached, whichever way the sweep ran.
    pub fn nose(&self) -> Option<&PvSample> {
        self.samples
            .iter()
            .max_by(|a, b| a.load.total_cmp(&b.load))
    }

    /// First adjacent pair whose verdict goes from stable to unstable.
    pub fn stability_boundary(&self) -> Option<(&PvSample, &PvSample)> {
        self.samples
            .windows(2)
            .find(|pair| pair[0].stable == Some(true) && pair[1].stable == Some(false))
            .map(|pair| (&pair[0], &pair[1]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepProgress {
    pub done: bool,
    pub completed_points: usize,
    pub total_points: usize,
    pub last_sample: Option<PvSample>,
}

/// A sweep that advances a batch of points at a time.
pub struct SweepRunner<S> {
    solver: S,
    dynamics: Option<DynamicModelSpec>,
    settings: SweepSettings,
    load: String,
    monitored_bus: String,
    parameters: Vec<f64>,
    next: usize,
    network: NetworkState,
    last_converged: Option<NetworkState>,
    samples: Vec<PvSample>,
    reports: Vec<AnalyzedPoint>,
    solver_calls: usize,
    stop: Option<SweepStop>,
    cancel: Option<CancelToken>,
}

impl<S: PowerFlowSolver> SweepRunner<S> {
    pub fn new(
        solver: S,
        network: NetworkState,
        load: &str,
        parameters: Vec<f64>,
        settings: SweepSettings,
        dynamics: Option<DynamicModelSpec>,
    ) -> Result<Self> {
        let load_spec = network
            .load(load)
            .ok_or_else(|| anyhow!("Unknown load '{}'.", load))?;
        if !(settings.power_factor > 0.0 && settings.power_factor <= 1.0) {
            bail!(
                "power_factor must lie in (0, 1], got {}.",
                settings.power_factor
            );
        }
        let monitored_bus = settings
            .monitored_bus
            .clone()
            .unwrap_or_else(|| load_spec.bus.clone());
        if network.bus(&monitored_bus).is_none() {
            bail!("Unknown monitored bus '{}'.", monitored_bus);
        }
        if let Some(bad) = parameters.iter().find(|p| !p.is_finite()) {
            bail!("Parameter values must be finite, got {}.", bad);
        }
        let rising = parameters.windows(2).all(|w| w[0] <= w[1]);
        let falling = parameters.windows(2).all(|w| w[0] >= w[1]);
        if !(rising || falling) {
            bail!("Parameter values must be monotone.");
        }

        Ok(Self {
            solver,
            dynamics,
            settings,
            load: load.to_string(),
            monitored_bus,
            parameters,
            next: 0,
            network,
            last_converged: None,
            samples: Vec::new(),
            reports: Vec::new(),
            solver_calls: 0,
            stop: None,
            cancel: None,
        })
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn is_done(&self) -> bool {
        self.stop.is_some()
    }

    pub fn progress(&self) -> SweepProgress {
        SweepProgress {
            done: self.is_done(),
            completed_points: self.samples.len(),
            total_points: self.parameters.len(),
            last_sample: self.samples.last().copied(),
        }
    }

    /// Attempts up to `batch` further parameter values.
    pub fn run_steps(&mut self, batch: usize) -> Result<SweepProgress> {
        for _ in 0..batch {
            if self.is_done() {
                break;
            }
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                self.stop = Some(SweepStop::Cancelled {
                    next_parameter: self.parameters.get(self.next).copied(),
                });
                info!(points = self.samples.len(), "sweep cancelled");
                break;
            }
            self.step()?;
        }
        Ok(self.progress())
    }

    fn step(&mut self) -> Result<()> {
        let Some(&p) = self.parameters.get(self.next) else {
            self.stop = Some(SweepStop::Completed);
            info!(points = self.samples.len(), "sweep completed");
            return Ok(());
        };
        self.next += 1;

        let q = LoadSpec::reactive_for(p, self.settings.power_factor);
        self.network.set_load_power(&self.load, p, q)?;
        self.solver_calls += 1;

        let solution = match self.solver.solve(&self.network) {
            Ok(solution) => solution,
            Err(error) => {
                let last_feasible = self.samples.last().map(|s| s.load);
                info!(parameter = p, ?last_feasible, %error, "sweep stopped at collapse");
                self.stop = Some(SweepStop::Collapsed {
                    parameter: p,
                    last_feasible,
                    error,
                });
                return Ok(());
            }
        };

        self.network = solution.network;
        let voltage = self
            .network
            .bus(&self.monitored_bus)
            .map(|b| b.vm)
            .ok_or_else(|| anyhow!("Monitored bus '{}' vanished.", self.monitored_bus))?;

        let stable = match (&self.dynamics, self.settings.analyze_stability) {
            (Some(spec), true) => match analyze(&self.network, spec) {
                Ok(report) => {
                    let stable = report.stable;
                    if self.settings.keep_reports {
                        self.reports.push(AnalyzedPoint { load: p, report });
                    }
                    Some(stable)
                }
                Err(failure) => {
                    warn!(parameter = p, %failure, "no stability verdict for this point");
                    None
                }
            },
            _ => None,
        };

        debug!(
            parameter = p,
            voltage,
            ?stable,
            iterations = solution.iterations,
            "sweep point converged"
        );
        self.samples.push(PvSample {
            load: p,
            voltage,
            stable,
        });
        self.last_converged = Some(self.network.clone());
        if self.next == self.parameters.len() {
            self.stop = Some(SweepStop::Completed);
            info!(points = self.samples.len(), "sweep completed");
        }
        Ok(())
    }

    /// Ends the sweep; an unfinished one reports itself as cancelled.
    pub fn finish(self) -> SweepResult {
        let stop = self.stop.unwrap_or(SweepStop::Cancelled {
            next_parameter: self.parameters.get(self.next).copied(),
        });
        SweepResult {
            samples: self.samples,
            stop,
            last_converged: self.last_converged,
            solver_calls: self.solver_calls,
            reports: self.reports,
        }
    }
}

/// Builder over [`SweepRunner`] for sweeps run to the end in one call.
pub struct Sweep<'a, S> {
    solver: S,
    load: &'a str,
    settings: SweepSettings,
    dynamics: Option<&'a DynamicModelSpec>,
    cancel: Option<CancelToken>,
}

impl<'a, S: PowerFlowSolver> Sweep<'a, S> {
    pub fn new(solver: S, load: &'a str) -> Self {
        Self {
            solver,
            load,
            settings: SweepSettings::default(),
            dynamics: None,
            cancel: None,
        }
    }

    pub fn with_settings(mut self, settings: SweepSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_power_factor(mut self, power_factor: f64) -> Self {
        self.settings.power_factor = power_factor;
        self
    }

    pub fn with_stability(mut self, dynamics: &'a DynamicModelSpec) -> Self {
        self.dynamics = Some(dynamics);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn run(self, network: NetworkState, parameters: &[f64]) -> Result<SweepResult> {
        let mut runner = SweepRunner::new(
            self.solver,
            network,
            self.load,
            parameters.to_vec(),
            self.settings,
            self.dynamics.cloned(),
        )?;
        if let Some(cancel) = self.cancel {
            runner = runner.with_cancel(cancel);
        }
        while !runner.is_done() {
            runner.run_steps(1)?;
        }
        Ok(runner.finish())
    }
}

/// Sweeps `load` through `parameters` without stability analysis.
pub fn run_sweep<S: PowerFlowSolver>(
    solver: S,
    network: NetworkState,
    load: &str,
    parameters: &[f64],
    power_factor: f64,
) -> Result<SweepResult> {
    Sweep::new(solver, load)
        .with_power_factor(power_factor)
        .run(network, parameters)
}

/// `count` evenly spaced values from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, count: usize) -> Vec<f64> {
    match count {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (end - start) / (count - 1) as f64;
            (0..count)
                .map(|i| if i == count - 1 { end } else { start + step * i as f64 })
                .collect()
        }
    }
}
