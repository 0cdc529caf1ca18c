//! Stepped load sweep runner.

use crate::{js_error, serialize, WasmStudy};
use gridfold_core::continuation::{linspace, SweepRunner};
use gridfold_core::NewtonRaphson;
use wasm_bindgen::prelude::*;

/// WASM-exported load sweep.
/// Runs a batch of load levels per call so the caller can report progress.
#[wasm_bindgen]
pub struct WasmSweepRunner {
    runner: Option<SweepRunner<NewtonRaphson>>,
}

#[wasm_bindgen]
impl WasmSweepRunner {
    /// Sweeps the study's load over `points` evenly spaced levels in `[start, end]`.
    #[wasm_bindgen(constructor)]
    pub fn new(
        study: &WasmStudy,
        start: f64,
        end: f64,
        points: u32,
        with_stability: bool,
    ) -> Result<WasmSweepRunner, JsValue> {
        console_error_panic_hook::set_once();

        if end < start {
            return Err(JsValue::from_str("Sweep end must not precede its start."));
        }
        let case = study.case();
        let config = study.config();
        let mut settings = config.sweep.clone();
        settings.analyze_stability = with_stability;

        let runner = SweepRunner::new(
            NewtonRaphson::new(config.power_flow),
            case.network.clone(),
            &case.swept_load,
            linspace(start, end, points as usize),
            settings,
            with_stability.then(|| case.dynamics.clone()),
        )
        .map_err(js_error)?;

        Ok(WasmSweepRunner {
            runner: Some(runner),
        })
    }

    pub fn is_done(&self) -> bool {
        self.runner.as_ref().map_or(true, |runner| runner.is_done())
    }

    /// Run a batch of sweep points and return progress.
    pub fn run_steps(&mut self, batch_size: u32) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_mut()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        let progress = runner
            .run_steps(batch_size as usize)
            .map_err(|e| JsValue::from_str(&format!("Sweep step failed: {:#}", e)))?;

        serialize(&progress)
    }

    pub fn get_progress(&self) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .as_ref()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        serialize(&runner.progress())
    }

    /// Consume the runner and return the PV curve with its stop reason.
    pub fn get_result(&mut self) -> Result<JsValue, JsValue> {
        let runner = self
            .runner
            .take()
            .ok_or_else(|| JsValue::from_str("Runner not initialized"))?;

        serialize(&runner.finish())
    }
}
