//! Two-bus, single-machine reference system.
//!
//! An infinite bus feeds a constant-power load over a lossless tie line. A
//! synchronous condenser with a fast, high-gain exciter holds the load bus
//! voltage. The power-flow nose sits at `1 / (2·X)`; shortly before it the
//! electromechanical mode crosses into the right half plane.

use crate::model::{DynamicModelSpec, ExciterSpec, MachineSpec};
use crate::network::{Bus, BusKind, Generator, Line, LoadSpec, NetworkState};

pub const GRID_BUS: &str = "grid";
pub const LOAD_BUS: &str = "load";
pub const LOAD: &str = "load";
pub const INFEED: &str = "infeed";
pub const CONDENSER: &str = "sc";

/// Tie-line reactance (pu).
pub const TIE_REACTANCE: f64 = 0.425;

/// Transient EMF state of the condenser.
pub const EMF_STATE: &str = "sc.e_q";

/// Unloaded network with a flat voltage profile.
pub fn network() -> NetworkState {
    let buses = vec![
        Bus::new(GRID_BUS, BusKind::Slack, 1.0, 0.0),
        Bus::new(LOAD_BUS, BusKind::Pq, 1.0, 0.0),
    ];
    let lines = vec![Line {
        id: "tie".into(),
        from: GRID_BUS.into(),
        to: LOAD_BUS.into(),
        r: 0.0,
        x: TIE_REACTANCE,
        b: 0.0,
    }];
    let loads = vec![LoadSpec {
        id: LOAD.into(),
        bus: LOAD_BUS.into(),
        p: 0.0,
        q: 0.0,
    }];
    let generators = vec![
        Generator {
            id: INFEED.into(),
            bus: GRID_BUS.into(),
            p: 0.0,
            q: 0.0,
        },
        Generator {
            id: CONDENSER.into(),
            bus: LOAD_BUS.into(),
            p: 0.0,
            q: 0.0,
        },
    ];
    // The literal above satisfies every topology check.
    match NetworkState::new(buses, lines, loads, generators) {
        Ok(network) => network,
        Err(err) => unreachable!("reference network is invalid: {err}"),
    }
}

pub fn dynamics() -> DynamicModelSpec {
    DynamicModelSpec {
        machines: vec![MachineSpec {
            id: CONDENSER.into(),
            generator: CONDENSER.into(),
            xd: 1.0,
            xd_prime: 0.25,
            td0_prime: 8.0,
            h: 1.0,
            d: 1.88,
            omega_s: 2.0 * std::f64::consts::PI * 60.0,
            exciter: ExciterSpec {
                ka: 400.0,
                ta: 0.02,
                efd_min: 0.0,
                efd_max: 3.0,
            },
        }],
    }
}

/// Maximum transferable active power at unity power factor.
pub fn nose_power() -> f64 {
    1.0 / (2.0 * TIE_REACTANCE)
}
