//! Perturbation-driven transient runs.
//!
//! A run starts at the model's equilibrium, optionally offsets one named
//! differential state at a given time, and integrates the nonlinear DAE to the
//! horizon. Every accepted step is recorded for every differential and
//! algebraic variable.

use crate::cancel::CancelToken;
use crate::error::{IntegrationFailure, IntegrationFailureReason};
use crate::model::{DynamicModel, DynamicModelSpec};
use crate::network::NetworkState;
use crate::solvers::{
    AdaptiveIntegrator, IntegrationStats, IntegratorSettings, Stalled, StateOffsetEvent,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Displacement of one differential state away from equilibrium.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerturbationSpec {
    pub time: f64,
    /// State name, e.g. `"sc.e_q"`.
    pub state: String,
    pub offset: f64,
}

impl PerturbationSpec {
    pub fn new(time: f64, state: impl Into<String>, offset: f64) -> Self {
        Self {
            time,
            state: state.into(),
            offset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySample {
    pub time: f64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub name: String,
    pub samples: Vec<TrajectorySample>,
}

impl Trajectory {
    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.time)
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.value)
    }

    pub fn final_value(&self) -> Option<f64> {
        self.samples.last().map(|s| s.value)
    }

    /// Largest `|value − equilibrium|` over the whole run.
    pub fn peak_deviation(&self, equilibrium: f64) -> f64 {
        self.values()
            .map(|v| (v - equilibrium).abs())
            .fold(0.0, f64::max)
    }
}

/// Trajectories in model order: differential states, then algebraic variables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrajectorySet {
    trajectories: Vec<Trajectory>,
}

impl TrajectorySet {
    fn with_names<'a>(names: impl Iterator<Item = &'a String>) -> Self {
        Self {
            trajectories: names
                .map(|name| Trajectory {
                    name: name.clone(),
                    samples: Vec::new(),
                })
                .collect(),
        }
    }

    fn record(&mut self, time: f64, values: impl Iterator<Item = f64>) {
        for (trajectory, value) in self.trajectories.iter_mut().zip(values) {
            trajectory.samples.push(TrajectorySample { time, value });
        }
    }

    pub fn get(&self, name: &str) -> Option<&Trajectory> {
        self.trajectories.iter().find(|t| t.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> {
        self.trajectories.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.trajectories.iter().map(|t| t.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransientRun {
    pub trajectories: TrajectorySet,
    pub stats: IntegrationStats,
    pub perturbation: Option<PerturbationSpec>,
    pub horizon: f64,
}

impl TransientRun {
    /// False when the run was cancelled before the horizon.
    pub fn completed(&self) -> bool {
        !self.stats.cancelled
    }
}

/// Builds the model at `network` and runs it.
pub fn simulate(
    network: &NetworkState,
    spec: &DynamicModelSpec,
    horizon: f64,
    perturbation: Option<&PerturbationSpec>,
    settings: &IntegratorSettings,
) -> Result<TransientRun, IntegrationFailure> {
    let model = DynamicModel::build(network, spec)?;
    simulate_model(&model, horizon, perturbation, settings, None)
}

pub fn simulate_model(
    model: &DynamicModel,
    horizon: f64,
    perturbation: Option<&PerturbationSpec>,
    settings: &IntegratorSettings,
    cancel: Option<&CancelToken>,
) -> Result<TransientRun, IntegrationFailure> {
    let invalid = |message: String| {
        IntegrationFailure::before_start(IntegrationFailureReason::InvalidRequest(message))
    };
    if !(horizon.is_finite() && horizon > 0.0) {
        return Err(invalid(format!("horizon must be positive, got {}", horizon)));
    }
    settings.validate().map_err(invalid)?;

    let mut integrator = AdaptiveIntegrator::new(*settings);
    if let Some(cancel) = cancel {
        integrator = integrator.with_cancel(cancel);
    }
    if let Some(p) = perturbation {
        let index = model.state_index(&p.state).ok_or_else(|| {
            IntegrationFailure::before_start(IntegrationFailureReason::UnknownState(p.state.clone()))
        })?;
        if !(0.0..horizon).contains(&p.time) || !p.offset.is_finite() {
            return Err(invalid(format!(
                "perturbation at t = {} with offset {} does not fit in [0, {})",
                p.time, p.offset, horizon
            )));
        }
        integrator = integrator.with_event(StateOffsetEvent {
            time: p.time,
            index,
            offset: p.offset,
        });
    }

    let mut trajectories =
        TrajectorySet::with_names(model.state_names().iter().chain(model.algebraic_names()));
    let stats = integrator
        .integrate(
            model,
            model.initial_state(),
            model.initial_algebraic(),
            horizon,
            |t, x, y| trajectories.record(t, x.iter().chain(y).copied()),
        )
        .map_err(|stalled| named_failure(model, stalled))?;

    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        final_time = stats.final_time,
        cancelled = stats.cancelled,
        "transient run finished"
    );

    Ok(TransientRun {
        trajectories,
        stats,
        perturbation: perturbation.cloned(),
        horizon,
    })
}

fn named_failure(model: &DynamicModel, stalled: Stalled) -> IntegrationFailure {
    let state = model
        .state_names()
        .iter()
        .zip(&stalled.x)
        .chain(model.algebraic_names().iter().zip(&stalled.y))
        .map(|(name, value)| (name.clone(), *value))
        .collect();
    IntegrationFailure {
        time: stalled.time,
        step_size: stalled.step_size,
        reason: stalled.reason,
        state,
    }
}

/// Independent runs of one model, one per perturbation.
///
/// Each worker integrates its own clone of the model.
#[cfg(feature = "parallel")]
pub fn simulate_batch(
    model: &DynamicModel,
    horizon: f64,
    perturbations: &[PerturbationSpec],
    settings: &IntegratorSettings,
) -> Vec<Result<TransientRun, IntegrationFailure>> {
    use rayon::prelude::*;
    perturbations
        .par_iter()
        .map(|p| {
            let model = model.clone();
            simulate_model(&model, horizon, Some(p), settings, None)
        })
        .collect()
}

/// Independent runs of one model, one per perturbation.
#[cfg(not(feature = "parallel"))]
pub fn simulate_batch(
    model: &DynamicModel,
    horizon: f64,
    perturbations: &[PerturbationSpec],
    settings: &IntegratorSettings,
) -> Vec<Result<TransientRun, IntegrationFailure>> {
    perturbations
        .iter()
        .map(|p| simulate_model(model, horizon, Some(p), settings, None))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_flow::NewtonRaphson;
    use crate::reference;
    use crate::traits::PowerFlowSolver;
    use approx::assert_abs_diff_eq;

    fn model_at(p: f64) -> DynamicModel {
        let mut network = reference::network();
        network
            .set_load_power(reference::LOAD, p, 0.0)
            .expect("reference load");
        let solved = NewtonRaphson::default()
            .solve(&network)
            .expect("converges")
            .network;
        DynamicModel::build(&solved, &reference::dynamics()).expect("builds")
    }

    #[test]
    fn unperturbed_run_stays_at_equilibrium() {
        let model = model_at(0.5);
        let run = simulate_model(&model, 2.0, None, &IntegratorSettings::default(), None)
            .expect("integrates");
        let e_q = run.trajectories.get(reference::EMF_STATE).expect("emf trajectory");
        let eq = model.equilibrium_value(reference::EMF_STATE).unwrap();
        assert!(e_q.peak_deviation(eq) < 1e-8, "drifted by {}", e_q.peak_deviation(eq));
        assert_abs_diff_eq!(e_q.samples.last().unwrap().time, 2.0, epsilon = 1e-12);
        assert_eq!(run.trajectories.len(), 6);
        assert!(run.completed());
    }

    #[test]
    fn offset_is_applied_by_name() {
        let model = model_at(0.5);
        let kick = PerturbationSpec::new(0.2, reference::EMF_STATE, 0.01);
        let run = simulate_model(&model, 0.5, Some(&kick), &IntegratorSettings::default(), None)
            .expect("integrates");
        let e_q = run.trajectories.get(reference::EMF_STATE).unwrap();
        let eq = model.equilibrium_value(reference::EMF_STATE).unwrap();
        let after = e_q
            .samples
            .iter()
            .filter(|s| s.time == 0.2)
            .last()
            .expect("sample at the event");
        assert_abs_diff_eq!(after.value - eq, 0.01, epsilon = 1e-9);
    }

    #[test]
    fn unknown_state_is_rejected() {
        let model = model_at(0.5);
        let kick = PerturbationSpec::new(0.2, "sc.flux", 0.01);
        let err = simulate_model(&model, 1.0, Some(&kick), &IntegratorSettings::default(), None)
            .expect_err("no such state");
        assert_eq!(err.reason, IntegrationFailureReason::UnknownState("sc.flux".into()));
    }

    #[test]
    fn perturbation_outside_horizon_is_rejected() {
        let model = model_at(0.5);
        let kick = PerturbationSpec::new(5.0, reference::EMF_STATE, 0.01);
        let err = simulate_model(&model, 1.0, Some(&kick), &IntegratorSettings::default(), None)
            .expect_err("event after the horizon");
        assert!(matches!(err.reason, IntegrationFailureReason::InvalidRequest(_)));
    }

    #[test]
    fn perturbation_at_the_horizon_is_rejected() {
        let model = model_at(0.5);
        let kick = PerturbationSpec::new(1.0, reference::EMF_STATE, 0.05);
        let err = simulate_model(&model, 1.0, Some(&kick), &IntegratorSettings::default(), None)
            .expect_err("no time left to apply the offset");
        assert!(matches!(err.reason, IntegrationFailureReason::InvalidRequest(_)));

        let early = PerturbationSpec::new(0.99, reference::EMF_STATE, 0.05);
        let run = simulate_model(&model, 1.0, Some(&early), &IntegratorSettings::default(), None)
            .expect("offset lands before the horizon");
        let eq = model.equilibrium_value(reference::EMF_STATE).unwrap();
        let e_q = run.trajectories.get(reference::EMF_STATE).unwrap();
        assert!(e_q.peak_deviation(eq) > 0.04);
    }

    #[test]
    fn exhausted_time_budget_is_a_failure() {
        let model = model_at(0.5);
        let settings = IntegratorSettings {
            time_budget: Some(0.0),
            ..IntegratorSettings::default()
        };
        let err = simulate_model(&model, 1.0, None, &settings, None)
            .expect_err("zero budget");
        assert_eq!(err.reason, IntegrationFailureReason::Timeout);
        assert_eq!(err.time, 0.0);
        assert!(err.state.iter().any(|(name, _)| name == reference::EMF_STATE));
    }

    #[test]
    fn failure_carries_named_state() {
        let model = model_at(0.5);
        let kick = PerturbationSpec::new(0.0, reference::EMF_STATE, 0.05);
        let settings = IntegratorSettings {
            max_newton_iterations: 1,
            newton_tolerance: 1e-300,
            ..IntegratorSettings::default()
        };
        let err = simulate_model(&model, 1.0, Some(&kick), &settings, None)
            .expect_err("one Newton iteration at an absurd tolerance never converges");
        assert!(err.state.iter().any(|(name, _)| name == "load.vm"));
    }

    #[test]
    fn cancelled_run_keeps_partial_trajectories() {
        let model = model_at(0.5);
        let token = CancelToken::new();
        token.cancel();
        let run = simulate_model(&model, 5.0, None, &IntegratorSettings::default(), Some(&token))
            .expect("cancellation is not a failure");
        assert!(!run.completed());
        assert_eq!(run.trajectories.get("sc.delta").unwrap().samples.len(), 1);
    }

    #[test]
    fn batch_runs_are_independent() {
        let model = model_at(0.6);
        let kicks = vec![
            PerturbationSpec::new(0.1, reference::EMF_STATE, 0.01),
            PerturbationSpec::new(0.1, reference::EMF_STATE, -0.01),
        ];
        let runs = simulate_batch(&model, 0.5, &kicks, &IntegratorSettings::default());
        assert_eq!(runs.len(), 2);
        for (run, kick) in runs.iter().zip(&kicks) {
            let run = run.as_ref().expect("integrates");
            assert_eq!(run.perturbation.as_ref(), Some(kick));
        }
        let finals: Vec<f64> = runs
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .filter_map(|r| r.trajectories.get(reference::EMF_STATE))
            .filter_map(Trajectory::final_value)
            .collect();
        assert_eq!(finals.len(), 2);
        assert!(finals[0] != finals[1], "opposite kicks gave identical runs");
    }
}
