//! One-shot analyses on a loaded case.

use crate::{js_error, serialize};
use anyhow::{anyhow, Context};
use gridfold_core::classify::{assess, Assessment};
use gridfold_core::model::DynamicModel;
use gridfold_core::network::LoadSpec;
use gridfold_core::transient::{simulate_model, TransientRun};
use gridfold_core::{
    analyze, NetworkState, NewtonRaphson, PerturbationSpec, PowerFlowSolver, StudyCase,
    StudyConfig,
};
use js_sys::Float64Array;
use serde::Serialize;
use wasm_bindgen::prelude::*;

#[wasm_bindgen]
pub struct WasmStudy {
    case: StudyCase,
    config: StudyConfig,
}

#[derive(Serialize)]
struct SimulationOutcome {
    run: TransientRun,
    assessment: Assessment,
}

impl WasmStudy {
    pub(crate) fn case(&self) -> &StudyCase {
        &self.case
    }

    pub(crate) fn config(&self) -> &StudyConfig {
        &self.config
    }

    fn operating_point(&self, load: f64) -> anyhow::Result<NetworkState> {
        let mut network = self.case.network.clone();
        let q = LoadSpec::reactive_for(load, self.config.sweep.power_factor);
        network.set_load_power(&self.case.swept_load, load, q)?;
        let solution = NewtonRaphson::new(self.config.power_flow)
            .solve(&network)
            .map_err(|e| anyhow!("No operating point at load {}: {}", load, e))?;
        Ok(solution.network)
    }

    fn run(
        &self,
        load: f64,
        perturbation: &PerturbationSpec,
        horizon: f64,
    ) -> anyhow::Result<SimulationOutcome> {
        let network = self.operating_point(load)?;
        let model = DynamicModel::build(&network, &self.case.dynamics)?;
        let report = analyze(&network, &self.case.dynamics).ok();
        let run = simulate_model(
            &model,
            horizon,
            Some(perturbation),
            &self.config.integrator,
            None,
        )?;
        let equilibrium = model
            .equilibrium_value(&perturbation.state)
            .ok_or_else(|| anyhow!("Unknown state '{}'.", perturbation.state))?;
        let assessment = assess(
            &run,
            &perturbation.state,
            equilibrium,
            report.as_ref(),
            &self.config.classifier,
        )?;
        Ok(SimulationOutcome { run, assessment })
    }
}

#[wasm_bindgen]
impl WasmStudy {
    /// Loads a case and optional settings, both as JSON text.
    #[wasm_bindgen(constructor)]
    pub fn new(case_json: &str, config_json: Option<String>) -> Result<WasmStudy, JsValue> {
        console_error_panic_hook::set_once();
        let case = StudyCase::from_json_str(case_json).map_err(js_error)?;
        let config = match config_json {
            Some(text) => StudyConfig::from_json_str(&text).map_err(js_error)?,
            None => StudyConfig::default(),
        };
        Ok(WasmStudy { case, config })
    }

    /// The bundled two-bus condenser case with default settings.
    pub fn reference() -> WasmStudy {
        console_error_panic_hook::set_once();
        WasmStudy {
            case: StudyCase::reference(),
            config: StudyConfig::default(),
        }
    }

    pub fn case_json(&self) -> Result<String, JsValue> {
        serde_json::to_string(&self.case)
            .context("Failed to encode case")
            .map_err(js_error)
    }

    /// Eigenvalue report at the given load level.
    pub fn analyze(&self, load: f64) -> Result<JsValue, JsValue> {
        let network = self.operating_point(load).map_err(js_error)?;
        let report = analyze(&network, &self.case.dynamics)
            .map_err(|e| JsValue::from_str(&format!("Model build failed: {}", e)))?;
        serialize(&report)
    }

    /// Perturbs `state` by `offset` at `time` and labels the response.
    pub fn simulate(
        &self,
        load: f64,
        state: &str,
        time: f64,
        offset: f64,
        horizon: f64,
    ) -> Result<JsValue, JsValue> {
        let kick = PerturbationSpec::new(time, state, offset);
        let outcome = self.run(load, &kick, horizon).map_err(js_error)?;
        serialize(&outcome)
    }

    /// Sample times and values of one variable, for plotting.
    pub fn trajectory(
        &self,
        load: f64,
        state: &str,
        time: f64,
        offset: f64,
        horizon: f64,
        variable: &str,
    ) -> Result<js_sys::Array, JsValue> {
        let kick = PerturbationSpec::new(time, state, offset);
        let outcome = self.run(load, &kick, horizon).map_err(js_error)?;
        let trajectory = outcome
            .run
            .trajectories
            .get(variable)
            .ok_or_else(|| JsValue::from_str(&format!("Unknown variable: {}", variable)))?;
        let times: Vec<f64> = trajectory.times().collect();
        let values: Vec<f64> = trajectory.values().collect();
        let pair = js_sys::Array::new();
        pair.push(&Float64Array::from(times.as_slice()));
        pair.push(&Float64Array::from(values.as_slice()));
        Ok(pair)
    }
}

#[cfg(all(test, target_arch = "wasm32"))]
mod tests {
    use super::*;
    use gridfold_core::reference;
    use wasm_bindgen_test::wasm_bindgen_test;

    #[wasm_bindgen_test]
    fn reference_case_round_trips() {
        let study = WasmStudy::reference();
        let text = study.case_json().expect("encodes");
        assert!(WasmStudy::new(&text, None).is_ok());
        assert!(WasmStudy::new("{}", None).is_err());
    }

    #[wasm_bindgen_test]
    fn analysis_at_light_load_is_stable() {
        let study = WasmStudy::reference();
        let report = study.analyze(0.2).expect("report");
        let stable = js_sys::Reflect::get(&report, &JsValue::from_str("stable")).unwrap();
        assert_eq!(stable.as_bool(), Some(true));
    }

    #[wasm_bindgen_test]
    fn trajectory_arrays_match() {
        let study = WasmStudy::reference();
        let pair = study
            .trajectory(0.6, reference::EMF_STATE, 0.1, 0.01, 0.5, reference::EMF_STATE)
            .expect("runs");
        let times = Float64Array::from(pair.get(0));
        let values = Float64Array::from(pair.get(1));
        assert_eq!(times.length(), values.length());
        assert!(times.length() > 2);
    }

    #[wasm_bindgen_test]
    fn unknown_state_is_an_error() {
        let study = WasmStudy::reference();
        assert!(study.simulate(0.6, "sc.nope", 0.1, 0.01, 0.5).is_err());
    }
}
