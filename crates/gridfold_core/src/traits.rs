use crate::error::NonConvergence;
use crate::network::NetworkState;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in model evaluation.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Lifts a model constant into the evaluation scalar.
pub(crate) fn cast<T: Scalar>(value: f64) -> T {
    T::from_f64(value).unwrap_or_else(T::nan)
}

/// A semi-explicit differential-algebraic system
///
/// ```text
/// dx/dt = f(x, y)
///     0 = g(x, y)
/// ```
///
/// Implementations are generic over the scalar so the same equations serve
/// plain evaluation (`f64`) and Jacobian assembly (`Dual`).
pub trait DaeSystem<T: Scalar> {
    /// Number of differential states `x`.
    fn state_dimension(&self) -> usize;

    /// Number of algebraic variables `y`, equal to the number of constraints.
    fn algebraic_dimension(&self) -> usize;

    /// Writes f(x, y) into `out`.
    fn differential(&self, x: &[T], y: &[T], out: &mut [T]);

    /// Writes g(x, y) into `out`.
    fn algebraic(&self, x: &[T], y: &[T], out: &mut [T]);
}

/// Steady-state network solver.
///
/// Must be deterministic for identical inputs and must report numerical
/// trouble as [`NonConvergence`] instead of panicking: the continuation
/// driver uses that outcome as its collapse signal.
pub trait PowerFlowSolver {
    fn solve(&self, network: &NetworkState) -> Result<PowerFlowSolution, NonConvergence>;
}

impl<S: PowerFlowSolver + ?Sized> PowerFlowSolver for &S {
    fn solve(&self, network: &NetworkState) -> Result<PowerFlowSolution, NonConvergence> {
        (**self).solve(network)
    }
}

/// A converged operating point together with solver diagnostics.
#[derive(Debug, Clone)]
pub struct PowerFlowSolution {
    pub network: NetworkState,
    pub iterations: usize,
    pub mismatch: f64,
}
