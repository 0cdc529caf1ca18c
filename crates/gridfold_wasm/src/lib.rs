//! Browser bindings for gridfold studies.
//!
//! A [`WasmStudy`] holds one case plus its settings and answers one-shot
//! requests; [`WasmSweepRunner`] walks a load sweep a batch at a time so the
//! page can report progress.

mod study;
mod sweep_runner;

pub use study::WasmStudy;
pub use sweep_runner::WasmSweepRunner;

use serde::Serialize;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

pub(crate) fn serialize<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    to_value(value).map_err(|e| JsValue::from_str(&format!("Serialization error: {}", e)))
}

pub(crate) fn js_error(err: anyhow::Error) -> JsValue {
    JsValue::from_str(&format!("{:#}", err))
}

#[cfg(test)]
mod tests {
    use super::WasmStudy;
    use gridfold_core::StudyCase;

    #[test]
    fn reference_study_exports_its_case() {
        let study = WasmStudy::reference();
        let text = study.case_json().expect("encodes");
        assert_eq!(
            StudyCase::from_json_str(&text).expect("decodes"),
            StudyCase::reference()
        );
        assert!(WasmStudy::new(&text, None).is_ok());
    }
}
