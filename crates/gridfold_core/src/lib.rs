/// The `gridfold_core` crate locates voltage collapse and loss of small-signal
/// stability in a power system, and checks the linear verdict with nonlinear
/// time-domain runs.
///
/// Key components:
/// - **Network / Power flow**: `NetworkState` and a Newton-Raphson `PowerFlowSolver`.
/// - **Continuation**: load sweeps that stop at the first unsolvable point (the nose).
/// - **Model / Stability**: the machine DAE at an operating point and its reduced-state eigenvalues.
/// - **Transient / Classify**: perturbation runs on an implicit adaptive integrator, labelled by envelope growth.
/// - **Autodiff**: `Dual` numbers used for every Jacobian.
pub mod autodiff;
pub mod cancel;
pub mod classify;
pub mod config;
pub mod continuation;
pub mod error;
pub mod model;
pub mod network;
pub mod power_flow;
pub mod reference;
pub mod solvers;
pub mod stability;
pub mod traits;
pub mod transient;

pub use cancel::CancelToken;
pub use classify::{assess, classify, Assessment, Classification, ClassifierSettings, TrajectoryClass};
pub use config::{StudyCase, StudyConfig};
pub use continuation::{run_sweep, PvSample, Sweep, SweepResult, SweepRunner, SweepSettings, SweepStop};
pub use error::{BuildFailure, IntegrationFailure, NonConvergence};
pub use model::{DynamicModel, DynamicModelSpec};
pub use network::NetworkState;
pub use power_flow::{NewtonRaphson, PowerFlowSettings};
pub use solvers::IntegratorSettings;
pub use stability::{analyze, StabilityReport};
pub use traits::PowerFlowSolver;
pub use transient::{simulate, PerturbationSpec, TransientRun};
