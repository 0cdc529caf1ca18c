//! Small-signal stability of an operating point.
//!
//! The DAE linearization
//!
//! ```text
//! [ Δẋ ]   [ fx  fy ] [ Δx ]
//! [ 0  ] = [ gx  gy ] [ Δy ]
//! ```
//!
//! is reduced to `Δẋ = (fx − fy·gy⁻¹·gx)·Δx`, which needs `gy` invertible at
//! the point. The verdict depends only on the set of eigenvalues, never on
//! their order or on reporting annotations.

use crate::autodiff::{dae_jacobians, DaeJacobians};
use crate::error::{BuildFailure, BuildFailureReason};
use crate::model::{DynamicModel, DynamicModelSpec};
use crate::network::NetworkState;
use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndexedEigenvalue {
    /// 1-based position in decomposition order.
    pub index: usize,
    pub value: Complex<f64>,
}

impl IndexedEigenvalue {
    /// `−σ / |λ|`; 1 for a zero eigenvalue.
    pub fn damping_ratio(&self) -> f64 {
        let magnitude = self.value.norm();
        if magnitude == 0.0 {
            1.0
        } else {
            -self.value.re / magnitude
        }
    }

    pub fn frequency_hz(&self) -> f64 {
        self.value.im.abs() / (2.0 * std::f64::consts::PI)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EigenSpectrum {
    eigenvalues: Vec<IndexedEigenvalue>,
}

impl EigenSpectrum {
    /// Tags eigenvalues 1..=n in the given order.
    pub fn from_values(values: impl IntoIterator<Item = Complex<f64>>) -> Self {
        Self {
            eigenvalues: values
                .into_iter()
                .enumerate()
                .map(|(i, value)| IndexedEigenvalue {
                    index: i + 1,
                    value,
                })
                .collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IndexedEigenvalue> {
        self.eigenvalues.iter()
    }

    pub fn len(&self) -> usize {
        self.eigenvalues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.eigenvalues.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&IndexedEigenvalue> {
        self.eigenvalues.iter().find(|e| e.index == index)
    }

    /// Stable iff every real part is strictly negative.
    pub fn is_stable(&self) -> bool {
        self.eigenvalues.iter().all(|e| e.value.re < 0.0)
    }

    /// Eigenvalue with the largest real part.
    pub fn dominant(&self) -> Option<&IndexedEigenvalue> {
        self.eigenvalues
            .iter()
            .max_by(|a, b| a.value.re.total_cmp(&b.value.re))
    }

    /// Copy ordered by descending real part; indices are kept.
    pub fn sorted_by_real_part(&self) -> Self {
        let mut eigenvalues = self.eigenvalues.clone();
        eigenvalues.sort_by(|a, b| b.value.re.total_cmp(&a.value.re));
        Self { eigenvalues }
    }
}

/// A reporting-layer note attached to one eigenvalue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EigenAnnotation {
    pub index: usize,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub stable: bool,
    pub spectrum: EigenSpectrum,
    pub state_names: Vec<String>,
    /// Eigenvalues a reader chose to set aside. Never consulted by `stable`.
    #[serde(default)]
    pub ignored: Vec<EigenAnnotation>,
}

impl StabilityReport {
    pub fn from_spectrum(spectrum: EigenSpectrum, state_names: Vec<String>) -> Self {
        Self {
            stable: spectrum.is_stable(),
            spectrum,
            state_names,
            ignored: Vec::new(),
        }
    }

    pub fn dominant(&self) -> Option<&IndexedEigenvalue> {
        self.spectrum.dominant()
    }

    /// Largest real part in the spectrum.
    pub fn spectral_abscissa(&self) -> Option<f64> {
        self.dominant().map(|e| e.value.re)
    }

    /// Marks eigenvalue `index` as set aside for presentation.
    pub fn ignore(mut self, index: usize, note: impl Into<String>) -> Self {
        self.ignored.retain(|a| a.index != index);
        self.ignored.push(EigenAnnotation {
            index,
            note: note.into(),
        });
        self
    }

    /// Spectrum minus the eigenvalues set aside.
    pub fn reported_eigenvalues(&self) -> impl Iterator<Item = &IndexedEigenvalue> {
        self.spectrum
            .iter()
            .filter(move |e| !self.ignored.iter().any(|a| a.index == e.index))
    }
}

/// `fx − fy·gy⁻¹·gx`.
pub fn reduced_state_matrix(jacobians: &DaeJacobians) -> Result<DMatrix<f64>, BuildFailure> {
    let blocks = [
        ("fx", &jacobians.fx),
        ("fy", &jacobians.fy),
        ("gx", &jacobians.gx),
        ("gy", &jacobians.gy),
    ];
    for (name, block) in blocks {
        if block.iter().any(|v| !v.is_finite()) {
            return Err(BuildFailure::new(BuildFailureReason::NonFinite(
                name.to_string(),
            )));
        }
    }

    if jacobians.gy.nrows() == 0 {
        return Ok(jacobians.fx.clone());
    }

    let lu = jacobians.gy.clone().lu();
    if !lu.is_invertible() {
        return Err(BuildFailure::new(
            BuildFailureReason::SingularAlgebraicJacobian,
        ));
    }
    let elimination = lu
        .solve(&jacobians.gx)
        .ok_or_else(|| BuildFailure::new(BuildFailureReason::SingularAlgebraicJacobian))?;
    let reduced = &jacobians.fx - &jacobians.fy * elimination;

    if reduced.iter().any(|v| !v.is_finite()) {
        return Err(BuildFailure::new(BuildFailureReason::NonFinite(
            "reduced state matrix".to_string(),
        )));
    }
    Ok(reduced)
}

/// Builds the model at `network` and classifies its equilibrium.
pub fn analyze(
    network: &NetworkState,
    spec: &DynamicModelSpec,
) -> Result<StabilityReport, BuildFailure> {
    let model = DynamicModel::build(network, spec)?;
    analyze_model(&model)
}

pub fn analyze_model(model: &DynamicModel) -> Result<StabilityReport, BuildFailure> {
    let jacobians = dae_jacobians(model, model.initial_state(), model.initial_algebraic());
    let reduced = reduced_state_matrix(&jacobians)?;
    let eigenvalues = reduced.complex_eigenvalues();
    if eigenvalues.iter().any(|v| !(v.re.is_finite() && v.im.is_finite())) {
        return Err(BuildFailure::new(BuildFailureReason::Eigen));
    }
    Ok(StabilityReport::from_spectrum(
        EigenSpectrum::from_values(eigenvalues.iter().copied()),
        model.state_names().to_vec(),
    ))
}

/// Independent analyses, one per operating point.
#[cfg(feature = "parallel")]
pub fn analyze_many(
    points: &[NetworkState],
    spec: &DynamicModelSpec,
) -> Vec<Result<StabilityReport, BuildFailure>> {
    use rayon::prelude::*;
    points.par_iter().map(|network| analyze(network, spec)).collect()
}

/// Independent analyses, one per operating point.
#[cfg(not(feature = "parallel"))]
pub fn analyze_many(
    points: &[NetworkState],
    spec: &DynamicModelSpec,
) -> Vec<Result<StabilityReport, BuildFailure>> {
    points.iter().map(|network| analyze(network, spec)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power_flow::NewtonRaphson;
    use crate::reference;
    use crate::traits::PowerFlowSolver;
    use approx::assert_abs_diff_eq;

    fn jacobians(fx: &[f64], fy: &[f64], gx: &[f64], gy: &[f64]) -> DaeJacobians {
        DaeJacobians {
            fx: DMatrix::from_row_slice(2, 2, fx),
            fy: DMatrix::from_row_slice(2, 1, fy),
            gx: DMatrix::from_row_slice(1, 2, gx),
            gy: DMatrix::from_row_slice(1, 1, gy),
        }
    }

    #[test]
    fn eliminates_algebraic_variables() {
        let jac = jacobians(&[0.0, 1.0, -1.0, 0.0], &[0.0, 2.0], &[1.0, 0.0], &[4.0]);
        let reduced = reduced_state_matrix(&jac).expect("gy invertible");
        let expected = DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.5, 0.0]);
        assert_abs_diff_eq!(reduced, expected, epsilon = 1e-14);
    }

    #[test]
    fn singular_gy_is_a_build_failure() {
        let jac = jacobians(&[0.0, 1.0, -1.0, 0.0], &[0.0, 2.0], &[1.0, 0.0], &[0.0]);
        let err = reduced_state_matrix(&jac).expect_err("gy = 0");
        assert_eq!(err.reason, BuildFailureReason::SingularAlgebraicJacobian);
    }

    #[test]
    fn non_finite_entry_is_a_build_failure() {
        let jac = jacobians(&[f64::NAN, 1.0, -1.0, 0.0], &[0.0, 2.0], &[1.0, 0.0], &[1.0]);
        let err = reduced_state_matrix(&jac).expect_err("NaN in fx");
        assert_eq!(err.reason, BuildFailureReason::NonFinite("fx".into()));
    }

    #[test]
    fn verdict_ignores_eigenvalue_order() {
        let values = vec![
            Complex::new(-0.5, 3.0),
            Complex::new(-0.5, -3.0),
            Complex::new(0.01, 0.0),
            Complex::new(-20.0, 0.0),
        ];
        let forward = EigenSpectrum::from_values(values.clone());
        let backward = EigenSpectrum::from_values(values.into_iter().rev());
        assert!(!forward.is_stable());
        assert_eq!(forward.is_stable(), backward.is_stable());
        assert_eq!(forward.is_stable(), forward.sorted_by_real_part().is_stable());
        assert_eq!(forward.sorted_by_real_part().iter().next().map(|e| e.index), Some(3));
    }

    #[test]
    fn zero_real_part_is_not_stable() {
        let spectrum = EigenSpectrum::from_values([Complex::new(0.0, 1.0), Complex::new(-1.0, 0.0)]);
        assert!(!spectrum.is_stable());
    }

    #[test]
    fn ignoring_an_eigenvalue_leaves_the_verdict_alone() {
        let spectrum = EigenSpectrum::from_values([Complex::new(0.0, 0.0), Complex::new(-1.0, 0.0)]);
        let report = StabilityReport::from_spectrum(spectrum, vec!["a".into(), "b".into()])
            .ignore(1, "reference angle");
        assert!(!report.stable);
        let shown: Vec<usize> = report.reported_eigenvalues().map(|e| e.index).collect();
        assert_eq!(shown, vec![2]);
    }

    fn solved_at(p: f64) -> NetworkState {
        let mut network = reference::network();
        network
            .set_load_power(reference::LOAD, p, 0.0)
            .expect("reference load");
        NewtonRaphson::default()
            .solve(&network)
            .expect("below the nose")
            .network
    }

    #[test]
    fn batch_analysis_matches_point_by_point() {
        let spec = reference::dynamics();
        let points: Vec<NetworkState> = [0.0, 0.6, 1.168922]
            .iter()
            .map(|&p| solved_at(p))
            .collect();
        let batch = analyze_many(&points, &spec);
        assert_eq!(batch.len(), points.len());
        for (network, result) in points.iter().zip(&batch) {
            assert_eq!(result, &analyze(network, &spec));
        }
        let verdicts: Vec<bool> = batch
            .iter()
            .map(|r| r.as_ref().expect("builds").stable)
            .collect();
        assert_eq!(verdicts, vec![true, true, false]);

        let failures = analyze_many(&points[..1], &DynamicModelSpec::default());
        assert_eq!(
            failures[0].as_ref().expect_err("no machines").reason,
            BuildFailureReason::NoMachines
        );
        assert!(analyze_many(&[], &spec).is_empty());
    }

    #[test]
    fn damping_ratio_and_frequency() {
        let mode = IndexedEigenvalue {
            index: 1,
            value: Complex::new(-0.3, 4.0),
        };
        assert_abs_diff_eq!(mode.damping_ratio(), 0.3 / (0.09f64 + 16.0).sqrt(), epsilon = 1e-14);
        assert_abs_diff_eq!(mode.frequency_hz(), 4.0 / (2.0 * std::f64::consts::PI), epsilon = 1e-14);
    }
}
