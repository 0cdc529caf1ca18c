//! gridfold: load sweeps, eigenvalue checks and transient runs from the shell.
//!
//! Results are written to stdout as JSON; logs go to stderr.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gridfold_core::classify::{assess, Assessment};
use gridfold_core::continuation::{linspace, Sweep};
use gridfold_core::model::DynamicModel;
use gridfold_core::network::LoadSpec;
use gridfold_core::reference;
use gridfold_core::transient::{simulate_model, TransientRun};
use gridfold_core::{
    analyze, NetworkState, NewtonRaphson, PerturbationSpec, PowerFlowSolver, StudyCase,
    StudyConfig,
};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Case file (network and machines, JSON); the bundled two-bus case if omitted
    #[arg(long, global = true)]
    case: Option<PathBuf>,

    /// Settings file (JSON); defaults for anything missing
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trace the PV curve of the swept load up to the first unsolvable level
    Sweep {
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long)]
        end: f64,
        /// Number of evenly spaced load levels, both ends included
        #[arg(long, default_value_t = 41)]
        points: usize,
        /// Skip the eigenvalue check at each point
        #[arg(long)]
        no_stability: bool,
    },
    /// Eigenvalues of the linearized model at one load level
    Analyze {
        #[arg(long)]
        load: f64,
    },
    /// Perturb one state at one load level and label the response
    Simulate {
        #[arg(long)]
        load: f64,
        /// Differential state to offset
        #[arg(long, default_value = reference::EMF_STATE)]
        state: String,
        #[arg(long, default_value_t = 1.0)]
        time: f64,
        #[arg(long, allow_hyphen_values = true)]
        offset: f64,
        #[arg(long, default_value_t = 10.0)]
        horizon: f64,
        /// Include every recorded trajectory in the output
        #[arg(long)]
        trajectories: bool,
    },
}

#[derive(Serialize)]
struct SimulationOutput {
    assessment: Assessment,
    accepted_steps: usize,
    rejected_steps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    run: Option<TransientRun>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let case = match &cli.case {
        Some(path) => StudyCase::load(path)?,
        None => StudyCase::reference(),
    };
    let config = match &cli.config {
        Some(path) => StudyConfig::load(path)?,
        None => StudyConfig::default(),
    };

    let output = run(&cli.command, &case, &config)?;
    println!("{}", output);
    Ok(())
}

fn run(command: &Commands, case: &StudyCase, config: &StudyConfig) -> Result<String> {
    let json = match command {
        Commands::Sweep {
            start,
            end,
            points,
            no_stability,
        } => {
            if end < start {
                return Err(anyhow!("--end must not be below --start"));
            }
            let mut settings = config.sweep.clone();
            settings.analyze_stability = !no_stability;
            let mut sweep = Sweep::new(NewtonRaphson::new(config.power_flow), &case.swept_load)
                .with_settings(settings);
            if !no_stability {
                sweep = sweep.with_stability(&case.dynamics);
            }
            let result = sweep.run(case.network.clone(), &linspace(*start, *end, *points))?;
            info!(
                points = result.samples.len(),
                nose = ?result.nose().map(|s| s.load),
                "sweep finished"
            );
            serde_json::to_string_pretty(&result)?
        }
        Commands::Analyze { load } => {
            let network = operating_point(case, config, *load)?;
            let report = analyze(&network, &case.dynamics)?;
            serde_json::to_string_pretty(&report)?
        }
        Commands::Simulate {
            load,
            state,
            time,
            offset,
            horizon,
            trajectories,
        } => {
            let network = operating_point(case, config, *load)?;
            let model = DynamicModel::build(&network, &case.dynamics)?;
            let report = analyze(&network, &case.dynamics).ok();
            let kick = PerturbationSpec::new(*time, state.clone(), *offset);
            let run = simulate_model(&model, *horizon, Some(&kick), &config.integrator, None)?;
            let equilibrium = model
                .equilibrium_value(state)
                .ok_or_else(|| anyhow!("Unknown state '{}'.", state))?;
            let assessment = assess(&run, state, equilibrium, report.as_ref(), &config.classifier)?;
            info!(class = ?assessment.classification.class, "transient labelled");
            let output = SimulationOutput {
                assessment,
                accepted_steps: run.stats.accepted,
                rejected_steps: run.stats.rejected,
                run: trajectories.then_some(run),
            };
            serde_json::to_string_pretty(&output)?
        }
    };
    Ok(json)
}

fn operating_point(case: &StudyCase, config: &StudyConfig, load: f64) -> Result<NetworkState> {
    let mut network = case.network.clone();
    let q = LoadSpec::reactive_for(load, config.sweep.power_factor);
    network.set_load_power(&case.swept_load, load, q)?;
    let solution = NewtonRaphson::new(config.power_flow)
        .solve(&network)
        .with_context(|| format!("No operating point at load {}", load))?;
    Ok(solution.network)
}
