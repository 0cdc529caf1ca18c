//! Network description and operating point.
//!
//! A [`NetworkState`] is both the topology handed in by a loader and the
//! operating point a power flow writes back. Every bus appears exactly once;
//! construction and deserialization both go through the same validation.

use anyhow::{anyhow, bail, Result};
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// Fixed voltage magnitude and angle; absorbs the power balance.
    Slack,
    /// Fixed active injection and voltage magnitude.
    Pv,
    /// Fixed active and reactive injection.
    Pq,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bus {
    pub id: String,
    pub kind: BusKind,
    /// Voltage magnitude (pu). Setpoint for slack and PV buses.
    pub vm: f64,
    /// Voltage angle (rad).
    #[serde(default)]
    pub va: f64,
    /// Net active injection computed by the last power flow (pu).
    #[serde(default)]
    pub p_inj: f64,
    /// Net reactive injection computed by the last power flow (pu).
    #[serde(default)]
    pub q_inj: f64,
}

impl Bus {
    pub fn new(id: impl Into<String>, kind: BusKind, vm: f64, va: f64) -> Self {
        Self {
            id: id.into(),
            kind,
            vm,
            va,
            p_inj: 0.0,
            q_inj: 0.0,
        }
    }

    pub fn phasor(&self) -> Complex<f64> {
        Complex::from_polar(self.vm, self.va)
    }
}

/// Pi-model branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub r: f64,
    pub x: f64,
    /// Total line charging susceptance, split evenly between both ends.
    #[serde(default)]
    pub b: f64,
}

impl Line {
    pub fn series_admittance(&self) -> Complex<f64> {
        Complex::new(self.r, self.x).inv()
    }
}

/// Constant-power load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSpec {
    pub id: String,
    pub bus: String,
    pub p: f64,
    #[serde(default)]
    pub q: f64,
}

impl LoadSpec {
    /// Reactive power tied to `p` by a lagging power factor in (0, 1].
    pub fn reactive_for(p: f64, power_factor: f64) -> f64 {
        p * power_factor.acos().tan()
    }
}

/// Generation at a bus.
///
/// `p` is a setpoint at PV and PQ buses; `q` is a setpoint at PQ buses only.
/// The power flow writes back whatever the slack and PV buses had to supply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generator {
    pub id: String,
    pub bus: String,
    #[serde(default)]
    pub p: f64,
    #[serde(default)]
    pub q: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNetwork {
    buses: Vec<Bus>,
    #[serde(default)]
    lines: Vec<Line>,
    #[serde(default)]
    loads: Vec<LoadSpec>,
    #[serde(default)]
    generators: Vec<Generator>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNetwork", into = "RawNetwork")]
pub struct NetworkState {
    buses: Vec<Bus>,
    lines: Vec<Line>,
    loads: Vec<LoadSpec>,
    generators: Vec<Generator>,
}

impl TryFrom<RawNetwork> for NetworkState {
    type Error = anyhow::Error;

    fn try_from(raw: RawNetwork) -> Result<Self> {
        NetworkState::new(raw.buses, raw.lines, raw.loads, raw.generators)
    }
}

impl From<NetworkState> for RawNetwork {
    fn from(network: NetworkState) -> Self {
        RawNetwork {
            buses: network.buses,
            lines: network.lines,
            loads: network.loads,
            generators: network.generators,
        }
    }
}

impl NetworkState {
    pub fn new(
        buses: Vec<Bus>,
        lines: Vec<Line>,
        loads: Vec<LoadSpec>,
        generators: Vec<Generator>,
    ) -> Result<Self> {
        let mut bus_ids = HashSet::new();
        for bus in &buses {
            if !bus_ids.insert(bus.id.as_str()) {
                bail!("Duplicate bus id '{}'.", bus.id);
            }
            if !(bus.vm.is_finite() && bus.vm > 0.0) || !bus.va.is_finite() {
                bail!("Bus '{}' has an invalid voltage ({}, {}).", bus.id, bus.vm, bus.va);
            }
        }
        let slack_count = buses.iter().filter(|b| b.kind == BusKind::Slack).count();
        if slack_count != 1 {
            bail!("Network needs exactly one slack bus, found {}.", slack_count);
        }

        let mut line_ids = HashSet::new();
        for line in &lines {
            if !line_ids.insert(line.id.as_str()) {
                bail!("Duplicate line id '{}'.", line.id);
            }
            for end in [&line.from, &line.to] {
                if !bus_ids.contains(end.as_str()) {
                    bail!("Line '{}' references unknown bus '{}'.", line.id, end);
                }
            }
            if line.from == line.to {
                bail!("Line '{}' connects bus '{}' to itself.", line.id, line.from);
            }
            if line.r == 0.0 && line.x == 0.0 {
                bail!("Line '{}' has zero impedance.", line.id);
            }
        }

        let mut load_ids = HashSet::new();
        for load in &loads {
            if !load_ids.insert(load.id.as_str()) {
                bail!("Duplicate load id '{}'.", load.id);
            }
            if !bus_ids.contains(load.bus.as_str()) {
                bail!("Load '{}' references unknown bus '{}'.", load.id, load.bus);
            }
        }

        let mut generator_ids = HashSet::new();
        for generator in &generators {
            if !generator_ids.insert(generator.id.as_str()) {
                bail!("Duplicate generator id '{}'.", generator.id);
            }
            if !bus_ids.contains(generator.bus.as_str()) {
                bail!(
                    "Generator '{}' references unknown bus '{}'.",
                    generator.id,
                    generator.bus
                );
            }
        }

        Ok(Self {
            buses,
            lines,
            loads,
            generators,
        })
    }

    pub fn buses(&self) -> &[Bus] {
        &self.buses
    }

    pub fn lines(&self) -> &[Line] {
        &self.lines
    }

    pub fn loads(&self) -> &[LoadSpec] {
        &self.loads
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    pub fn bus_index(&self, id: &str) -> Option<usize> {
        self.buses.iter().position(|b| b.id == id)
    }

    pub fn bus(&self, id: &str) -> Option<&Bus> {
        self.buses.iter().find(|b| b.id == id)
    }

    pub fn load(&self, id: &str) -> Option<&LoadSpec> {
        self.loads.iter().find(|l| l.id == id)
    }

    pub fn generator(&self, id: &str) -> Option<&Generator> {
        self.generators.iter().find(|g| g.id == id)
    }

    pub fn slack_index(&self) -> usize {
        // Validated at construction.
        self.buses
            .iter()
            .position(|b| b.kind == BusKind::Slack)
            .unwrap_or(0)
    }

    pub fn set_load_power(&mut self, id: &str, p: f64, q: f64) -> Result<()> {
        let load = self
            .loads
            .iter_mut()
            .find(|l| l.id == id)
            .ok_or_else(|| anyhow!("Unknown load '{}'.", id))?;
        load.p = p;
        load.q = q;
        Ok(())
    }

    pub fn set_generator_power(&mut self, id: &str, p: f64) -> Result<()> {
        let generator = self
            .generators
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| anyhow!("Unknown generator '{}'.", id))?;
        generator.p = p;
        Ok(())
    }

    pub fn set_voltage(&mut self, bus: &str, vm: f64, va: f64) -> Result<()> {
        if !(vm.is_finite() && vm > 0.0) || !va.is_finite() {
            bail!("Invalid voltage ({}, {}) for bus '{}'.", vm, va, bus);
        }
        let entry = self
            .buses
            .iter_mut()
            .find(|b| b.id == bus)
            .ok_or_else(|| anyhow!("Unknown bus '{}'.", bus))?;
        entry.vm = vm;
        entry.va = va;
        Ok(())
    }

    pub(crate) fn buses_mut(&mut self) -> &mut [Bus] {
        &mut self.buses
    }

    pub(crate) fn generators_mut(&mut self) -> &mut [Generator] {
        &mut self.generators
    }

    /// Scheduled generation minus load at bus `index`.
    pub fn scheduled_injection(&self, index: usize) -> (f64, f64) {
        let id = &self.buses[index].id;
        let (mut p, mut q) = (0.0, 0.0);
        for generator in self.generators.iter().filter(|g| &g.bus == id) {
            p += generator.p;
            q += generator.q;
        }
        for load in self.loads.iter().filter(|l| &l.bus == id) {
            p -= load.p;
            q -= load.q;
        }
        (p, q)
    }

    /// Total constant-power load at bus `index`.
    pub fn load_at(&self, index: usize) -> (f64, f64) {
        let id = &self.buses[index].id;
        self.loads
            .iter()
            .filter(|l| &l.bus == id)
            .fold((0.0, 0.0), |(p, q), l| (p + l.p, q + l.q))
    }

    /// Bus admittance matrix in bus order.
    pub fn admittance_matrix(&self) -> CsrMatrix<Complex<f64>> {
        let n = self.buses.len();
        let mut coo = CooMatrix::new(n, n);
        for line in &self.lines {
            // Endpoints were validated at construction.
            let (Some(i), Some(j)) = (self.bus_index(&line.from), self.bus_index(&line.to)) else {
                continue;
            };
            let y = line.series_admittance();
            let shunt = Complex::new(0.0, line.b / 2.0);
            coo.push(i, i, y + shunt);
            coo.push(j, j, y + shunt);
            coo.push(i, j, -y);
            coo.push(j, i, -y);
        }
        CsrMatrix::from(&coo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bus() -> NetworkState {
        NetworkState::new(
            vec![
                Bus::new("a", BusKind::Slack, 1.0, 0.0),
                Bus::new("b", BusKind::Pq, 1.0, 0.0),
            ],
            vec![Line {
                id: "ab".into(),
                from: "a".into(),
                to: "b".into(),
                r: 0.0,
                x: 0.5,
                b: 0.1,
            }],
            vec![LoadSpec {
                id: "l".into(),
                bus: "b".into(),
                p: 0.2,
                q: 0.1,
            }],
            Vec::new(),
        )
        .expect("valid network")
    }

    #[test]
    fn rejects_second_slack_and_dangling_line() {
        let buses = vec![
            Bus::new("a", BusKind::Slack, 1.0, 0.0),
            Bus::new("b", BusKind::Slack, 1.0, 0.0),
        ];
        assert!(NetworkState::new(buses, vec![], vec![], vec![]).is_err());

        let buses = vec![Bus::new("a", BusKind::Slack, 1.0, 0.0)];
        let lines = vec![Line {
            id: "x".into(),
            from: "a".into(),
            to: "missing".into(),
            r: 0.0,
            x: 0.1,
            b: 0.0,
        }];
        let err = NetworkState::new(buses, lines, vec![], vec![]).unwrap_err();
        assert!(err.to_string().contains("missing"), "unexpected error: {}", err);
    }

    #[test]
    fn setters_address_components_by_id() {
        let mut network = two_bus();
        network.set_load_power("l", 0.7, 0.3).expect("known load");
        assert_eq!(network.load("l").map(|l| (l.p, l.q)), Some((0.7, 0.3)));
        assert!(network.set_load_power("nope", 1.0, 0.0).is_err());

        network.set_voltage("b", 0.95, -0.1).expect("known bus");
        let bus = network.bus("b").expect("bus b");
        assert_eq!((bus.vm, bus.va), (0.95, -0.1));
        assert!(network.set_voltage("b", -1.0, 0.0).is_err());
    }

    #[test]
    fn admittance_matrix_includes_charging() {
        let ybus = two_bus().admittance_matrix();
        let dense = nalgebra_sparse::convert::serial::convert_csr_dense(&ybus);
        assert!((dense[(0, 0)].im - (-2.0 + 0.05)).abs() < 1e-12);
        assert!((dense[(0, 1)].im - 2.0).abs() < 1e-12);
    }

    #[test]
    fn json_round_trip_revalidates() {
        let json = r#"{"buses":[{"id":"a","kind":"slack","vm":1.0},{"id":"a","kind":"pq","vm":1.0}]}"#;
        assert!(serde_json::from_str::<NetworkState>(json).is_err());
    }

    #[test]
    fn reactive_power_from_power_factor() {
        assert_eq!(LoadSpec::reactive_for(1.0, 1.0), 0.0);
        assert!((LoadSpec::reactive_for(0.8, 0.8) - 0.6).abs() < 1e-12);
    }
}
