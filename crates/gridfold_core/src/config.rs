//! Study inputs read from JSON.
//!
//! A *case* describes the system (network plus machine data); a *config*
//! carries the numerical settings. Every config field may be omitted.

use crate::classify::ClassifierSettings;
use crate::continuation::SweepSettings;
use crate::model::DynamicModelSpec;
use crate::network::NetworkState;
use crate::power_flow::PowerFlowSettings;
use crate::reference;
use crate::solvers::IntegratorSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyConfig {
    pub power_flow: PowerFlowSettings,
    pub sweep: SweepSettings,
    pub integrator: IntegratorSettings,
    pub classifier: ClassifierSettings,
}

impl StudyConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse study config")
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("In {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyCase {
    pub network: NetworkState,
    #[serde(default)]
    pub dynamics: DynamicModelSpec,
    /// Load driven by sweeps.
    pub swept_load: String,
}

impl StudyCase {
    /// The two-bus condenser system shipped with the crate.
    pub fn reference() -> Self {
        Self {
            network: reference::network(),
            dynamics: reference::dynamics(),
            swept_load: reference::LOAD.to_string(),
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let case: StudyCase = serde_json::from_str(text).context("Failed to parse study case")?;
        if case.network.load(&case.swept_load).is_none() {
            anyhow::bail!("Swept load '{}' is not in the network.", case.swept_load);
        }
        Ok(case)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read case {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("In {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solvers::ImplicitMethod;

    #[test]
    fn missing_fields_take_defaults() {
        let config = StudyConfig::from_json_str(
            r#"{ "integrator": { "method": "backward_euler" }, "sweep": { "power_factor": 0.9 } }"#,
        )
        .unwrap();
        assert_eq!(config.integrator.method, ImplicitMethod::BackwardEuler);
        assert_eq!(config.integrator.rtol, IntegratorSettings::default().rtol);
        assert_eq!(config.sweep.power_factor, 0.9);
        assert_eq!(config.classifier, ClassifierSettings::default());
        assert_eq!(StudyConfig::from_json_str("{}").unwrap(), StudyConfig::default());
    }

    #[test]
    fn reference_case_survives_json() {
        let case = StudyCase::reference();
        let text = serde_json::to_string(&case).unwrap();
        assert_eq!(StudyCase::from_json_str(&text).unwrap(), case);
    }

    #[test]
    fn rejects_unknown_swept_load() {
        let mut case = serde_json::to_value(StudyCase::reference()).unwrap();
        case["swept_load"] = "missing".into();
        assert!(StudyCase::from_json_str(&case.to_string()).is_err());
    }

    #[test]
    fn invalid_network_is_reported() {
        let mut case = serde_json::to_value(StudyCase::reference()).unwrap();
        case["network"]["lines"][0]["x"] = 0.0.into();
        assert!(StudyCase::from_json_str(&case.to_string()).is_err());
    }
}
