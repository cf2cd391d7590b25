//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Per-phase backward/forward sweep over the radial tree."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Each pass draws constant-power currents at the previous pass voltages,
//! accumulates them towards the source, corrects every cable resistance for
//! its operating temperature and then propagates voltages outward. Devices are
//! evaluated where they sit and their output voltage feeds their subtree, so
//! passes repeat until voltages and regulator coefficients settle.
use indexmap::IndexMap;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    allocation::{allocate_node, NodeAllocation, PhaseSplit},
    compensator::{self, phasor_sum, CompensatorResult},
    devices::DeviceSet,
    errors::{CalcEngineError, Result},
    model::{Network, PhaseVector},
    options::{Scenario, SimulationOptions},
    regulator::{self, RegulatorResult},
    thermal,
    topology::TopologyIndex,
};

/// Lower bound on the voltage used to turn power into current, as a fraction
/// of the nominal phase voltage.
const VOLTAGE_FLOOR_RATIO: f64 = 0.1;
/// A pinned split this close to even does not count as declared imbalance.
const DECLARED_IMBALANCE_TOLERANCE_PCT: f64 = 0.5;
const COEFFICIENT_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Converged,
    NonConverged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Convergence {
    pub status: ConvergenceStatus,
    pub iterations: usize,
    /// Largest phase voltage change between the last two passes.
    pub max_voltage_change_v: f64,
}

impl Convergence {
    pub fn is_converged(&self) -> bool {
        self.status == ConvergenceStatus::Converged
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeResult {
    pub node_id: Uuid,
    /// Phase voltages seen by the node's consumers, after any device installed there.
    pub voltages_v: PhaseVector,
    pub deviation_pct: PhaseVector,
    pub compliant: bool,
    pub neutral_current_a: f64,
    pub load_kva: PhaseVector,
    pub production_kva: PhaseVector,
    pub load_split: PhaseSplit,
    pub production_split: PhaseSplit,
    pub path_length_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CableResult {
    pub cable_id: Uuid,
    /// Upstream end of the cable.
    pub from: Uuid,
    pub to: Uuid,
    /// Signed phase currents, positive when flowing away from the source.
    pub currents_a: PhaseVector,
    pub neutral_current_a: f64,
    pub voltage_drop_v: PhaseVector,
    pub resistance_phase_ohm: f64,
    pub resistance_neutral_ohm: f64,
    pub thermal_factor: f64,
    pub loss_w: f64,
    pub loading_pct: f64,
}

impl CableResult {
    pub fn max_current_a(&self) -> f64 {
        self.currents_a.abs().max()
    }
}

/// Virtual busbar at the transformer secondary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusbarSummary {
    pub voltage_v: PhaseVector,
    pub currents_a: PhaseVector,
    pub neutral_current_a: f64,
    pub apparent_power_kva: PhaseVector,
    pub total_kva: f64,
    pub transformer_loading_pct: f64,
    pub transformer_overloaded: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CalculationResult {
    pub scenario: Scenario,
    pub nominal_voltage_v: f64,
    /// Lower and upper voltage-quality limits used for `compliant`.
    pub voltage_band_v: (f64, f64),
    /// Reachable nodes in topology order.
    pub nodes: Vec<NodeResult>,
    pub cables: Vec<CableResult>,
    pub busbar: BusbarSummary,
    pub total_losses_w: f64,
    pub convergence: Convergence,
    pub unreachable_nodes: Vec<Uuid>,
    pub regulators: Vec<RegulatorResult>,
    pub compensators: Vec<CompensatorResult>,
}

impl CalculationResult {
    pub fn node(&self, id: Uuid) -> Option<&NodeResult> {
        self.nodes.iter().find(|n| n.node_id == id)
    }

    pub fn cable(&self, id: Uuid) -> Option<&CableResult> {
        self.cables.iter().find(|c| c.cable_id == id)
    }

    pub fn non_compliant_nodes(&self) -> impl Iterator<Item = &NodeResult> {
        self.nodes.iter().filter(|n| !n.compliant)
    }

    pub fn max_neutral_current_a(&self) -> f64 {
        self.nodes
            .iter()
            .map(|n| n.neutral_current_a)
            .fold(0.0, f64::max)
    }
}

/// Net apparent power drawn by a node per phase; negative values inject.
pub fn net_demand_kva(allocation: &NodeAllocation, scenario: Scenario) -> PhaseVector {
    match scenario {
        Scenario::Consumption => allocation.load_kva,
        Scenario::Mixed => allocation.load_kva - allocation.production_kva,
        Scenario::Production => -allocation.production_kva,
    }
}

/// Inputs that stay fixed across passes.
struct SolveContext<'a> {
    topology: &'a TopologyIndex,
    devices: &'a DeviceSet,
    options: &'a SimulationOptions,
    nominal_v: f64,
    demand: IndexMap<Uuid, PhaseVector>,
    regulators_at: IndexMap<Uuid, Vec<usize>>,
    compensators_at: IndexMap<Uuid, Vec<usize>>,
    regulator_downstream: Vec<(f64, f64)>,
    declared_imbalance: Vec<bool>,
}

/// Output of one backward/forward sweep.
struct Pass {
    voltages: IndexMap<Uuid, PhaseVector>,
    currents: IndexMap<Uuid, PhaseVector>,
    neutral: IndexMap<Uuid, Complex64>,
    thermal_factors: IndexMap<Uuid, f64>,
    regulators: Vec<Option<RegulatorResult>>,
    compensators: Vec<Option<CompensatorResult>>,
}

impl Pass {
    fn regulator_coefficients(&self) -> Vec<Option<PhaseVector>> {
        self.regulators
            .iter()
            .map(|r| r.as_ref().map(|r| r.coefficients_pct))
            .collect()
    }
}

/// Solves the network for the given devices and options.
///
/// Refuses networks whose reachable part contains a loop. Every other
/// irregularity ends up inside the returned result.
pub fn solve(
    network: &Network,
    topology: &TopologyIndex,
    devices: &DeviceSet,
    options: &SimulationOptions,
) -> Result<CalculationResult> {
    options.validate()?;
    if let Some(cable) = topology.loop_cables().first() {
        return Err(CalcEngineError::CyclicNetwork(*cable));
    }
    let allocations = allocate(network, topology, options);
    let ctx = build_context(network, topology, devices, options, &allocations);

    let mut voltages: IndexMap<Uuid, PhaseVector> = topology
        .order()
        .iter()
        .map(|id| (*id, PhaseVector::repeat(options.source_voltage_v())))
        .collect();
    let mut coefficients: Vec<Option<PhaseVector>> = vec![None; devices.regulators.len()];
    let mut iterations = 0;

    let (pass, convergence) = loop {
        iterations += 1;
        let pass = sweep(&ctx, &voltages);
        let change = max_voltage_change(&voltages, &pass.voltages);
        let next_coefficients = pass.regulator_coefficients();
        let settled = coefficients_settled(&coefficients, &next_coefficients);
        debug!(
            iteration = iterations,
            max_voltage_change_v = change,
            regulators_settled = settled,
            "load-flow pass"
        );
        voltages.clone_from(&pass.voltages);
        coefficients = next_coefficients;

        if change < options.solver.tolerance_v && settled {
            break (
                pass,
                Convergence {
                    status: ConvergenceStatus::Converged,
                    iterations,
                    max_voltage_change_v: change,
                },
            );
        }
        if iterations >= options.solver.max_iterations {
            warn!(
                iterations,
                max_voltage_change_v = change,
                "load flow did not converge, returning last pass"
            );
            break (
                pass,
                Convergence {
                    status: ConvergenceStatus::NonConverged,
                    iterations,
                    max_voltage_change_v: change,
                },
            );
        }
    };

    let result = assemble(&ctx, &allocations, pass, convergence);
    info!(
        scenario = ?result.scenario,
        nodes = result.nodes.len(),
        losses_w = result.total_losses_w,
        converged = result.convergence.is_converged(),
        iterations = result.convergence.iterations,
        "load flow completed"
    );
    Ok(result)
}

fn allocate(
    network: &Network,
    topology: &TopologyIndex,
    options: &SimulationOptions,
) -> IndexMap<Uuid, NodeAllocation> {
    let clients = network.clients_by_node();
    let nodes = network.node_map();
    topology
        .order()
        .iter()
        .filter_map(|id| {
            let node = nodes.get(id)?;
            let attached = clients.get(id).map(Vec::as_slice).unwrap_or(&[]);
            Some((*id, allocate_node(node, attached, options)))
        })
        .collect()
}

fn build_context<'a>(
    network: &Network,
    topology: &'a TopologyIndex,
    devices: &'a DeviceSet,
    options: &'a SimulationOptions,
    allocations: &IndexMap<Uuid, NodeAllocation>,
) -> SolveContext<'a> {
    let demand = allocations
        .iter()
        .map(|(id, allocation)| (*id, net_demand_kva(allocation, options.scenario)))
        .collect();

    let mut regulators_at: IndexMap<Uuid, Vec<usize>> = IndexMap::new();
    let regulator_downstream = devices
        .regulators
        .iter()
        .enumerate()
        .map(|(idx, config)| {
            regulators_at.entry(config.node_id).or_default().push(idx);
            topology
                .downstream(config.node_id)
                .iter()
                .filter_map(|id| allocations.get(id))
                .fold((0.0, 0.0), |(load, production), a| {
                    (load + a.total_load_kva(), production + a.total_production_kva())
                })
        })
        .collect();

    let mut compensators_at: IndexMap<Uuid, Vec<usize>> = IndexMap::new();
    let declared_imbalance = devices
        .compensators
        .iter()
        .enumerate()
        .map(|(idx, config)| {
            compensators_at.entry(config.node_id).or_default().push(idx);
            network
                .find_node(config.node_id)
                .and_then(|node| node.phase_override)
                .is_some_and(|split| !split.is_balanced(DECLARED_IMBALANCE_TOLERANCE_PCT))
        })
        .collect();

    SolveContext {
        topology,
        devices,
        options,
        nominal_v: options.nominal_phase_voltage_v(),
        demand,
        regulators_at,
        compensators_at,
        regulator_downstream,
        declared_imbalance,
    }
}

fn sweep(ctx: &SolveContext<'_>, voltages: &IndexMap<Uuid, PhaseVector>) -> Pass {
    let topology = ctx.topology;
    let options = ctx.options;
    let floor = VOLTAGE_FLOOR_RATIO * ctx.nominal_v;
    let source_v = PhaseVector::repeat(options.source_voltage_v());

    // Backward: node draw at the previous voltages, folded towards the source.
    let mut currents: IndexMap<Uuid, PhaseVector> = topology
        .order()
        .iter()
        .map(|id| {
            let demand = ctx.demand.get(id).copied().unwrap_or_else(PhaseVector::zeros);
            let v = voltages.get(id).copied().unwrap_or(source_v);
            let current = demand.zip_map(&v, |s, v| s * 1000.0 / v.max(floor));
            (*id, current)
        })
        .collect();
    for id in topology.order().iter().rev() {
        if let Some(parent) = topology.parent(*id) {
            let carried = currents.get(id).copied().unwrap_or_else(PhaseVector::zeros);
            if let Some(total) = currents.get_mut(&parent) {
                *total += carried;
            }
        }
    }

    let mut neutral: IndexMap<Uuid, Complex64> = currents
        .iter()
        .map(|(id, current)| {
            let phasor = if options.voltage_system.has_neutral() {
                phasor_sum(current)
            } else {
                Complex64::new(0.0, 0.0)
            };
            (*id, phasor)
        })
        .collect();

    // Compensators deepest first, so each one sees the neutral current left
    // by the devices below it.
    let mut compensator_inflow: Vec<Complex64> =
        vec![Complex64::new(0.0, 0.0); ctx.devices.compensators.len()];
    for id in topology.order().iter().rev() {
        for &idx in ctx.compensators_at.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            let incoming = neutral.get(id).copied().unwrap_or_default();
            compensator_inflow[idx] = incoming;
            let before = incoming.norm();
            let taken = compensator::absorption(
                &ctx.devices.compensators[idx],
                before,
                options.voltage_system,
            );
            if taken.absorbed_a <= 0.0 {
                continue;
            }
            let absorbed = incoming * (taken.absorbed_a / before);
            let mut cursor = Some(*id);
            while let Some(node) = cursor {
                if let Some(phasor) = neutral.get_mut(&node) {
                    *phasor -= absorbed;
                }
                cursor = topology.parent(node);
            }
        }
    }

    let thermal_factors: IndexMap<Uuid, f64> = topology
        .branches()
        .map(|branch| {
            let carried = currents
                .get(&branch.child)
                .map(|c| c.abs().max())
                .unwrap_or(0.0);
            let factor = thermal::correction_factor(
                options.season,
                branch.installation,
                branch.material,
                carried,
                branch.ampacity_a,
            );
            (branch.child, factor)
        })
        .collect();

    // Forward: propagate voltages and apply devices where they sit.
    let mut regulators: Vec<Option<RegulatorResult>> = vec![None; ctx.devices.regulators.len()];
    let mut compensators: Vec<Option<CompensatorResult>> =
        vec![None; ctx.devices.compensators.len()];
    let mut next: IndexMap<Uuid, PhaseVector> = IndexMap::with_capacity(topology.order().len());
    for id in topology.order() {
        let mut v = match topology.parent_branch(*id) {
            None => source_v,
            Some(branch) => {
                let upstream = next.get(&branch.parent).copied().unwrap_or(source_v);
                let factor = thermal_factors.get(id).copied().unwrap_or(1.0);
                let carried = currents.get(id).copied().unwrap_or_else(PhaseVector::zeros);
                upstream - carried * (branch.r_phase_ohm * factor)
            }
        };

        for &idx in ctx.regulators_at.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            let (load, production) = ctx.regulator_downstream[idx];
            let result = regulator::evaluate(
                &ctx.devices.regulators[idx],
                v,
                ctx.nominal_v,
                load,
                production,
            );
            v = result.output_v;
            regulators[idx] = Some(result);
        }
        for &idx in ctx.compensators_at.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            let result = compensator::evaluate(
                &ctx.devices.compensators[idx],
                v,
                compensator_inflow[idx],
                options.voltage_system,
                ctx.declared_imbalance[idx],
            );
            v = result.voltages_after_v;
            compensators[idx] = Some(result);
        }

        next.insert(*id, v);
    }

    Pass {
        voltages: next,
        currents,
        neutral,
        thermal_factors,
        regulators,
        compensators,
    }
}

fn max_voltage_change(
    previous: &IndexMap<Uuid, PhaseVector>,
    current: &IndexMap<Uuid, PhaseVector>,
) -> f64 {
    current
        .iter()
        .map(|(id, v)| match previous.get(id) {
            Some(p) => (v - p).abs().max(),
            None => f64::INFINITY,
        })
        .fold(0.0, f64::max)
}

fn coefficients_settled(previous: &[Option<PhaseVector>], current: &[Option<PhaseVector>]) -> bool {
    previous.iter().zip(current).all(|(p, c)| match (p, c) {
        (Some(p), Some(c)) => (p - c).abs().max() <= COEFFICIENT_EPSILON,
        (None, None) => true,
        _ => false,
    })
}

fn assemble(
    ctx: &SolveContext<'_>,
    allocations: &IndexMap<Uuid, NodeAllocation>,
    pass: Pass,
    convergence: Convergence,
) -> CalculationResult {
    let topology = ctx.topology;
    let options = ctx.options;
    let (band_low, band_high) = options.voltage_band_v();
    let four_wire = options.voltage_system.has_neutral();

    let nodes = topology
        .order()
        .iter()
        .filter_map(|id| {
            let allocation = allocations.get(id)?;
            let voltages_v = pass.voltages.get(id).copied()?;
            Some(NodeResult {
                node_id: *id,
                voltages_v,
                deviation_pct: voltages_v.map(|v| (v - ctx.nominal_v) / ctx.nominal_v * 100.0),
                compliant: voltages_v.iter().all(|v| (band_low..=band_high).contains(v)),
                neutral_current_a: pass.neutral.get(id).map(|n| n.norm()).unwrap_or(0.0),
                load_kva: allocation.load_kva,
                production_kva: allocation.production_kva,
                load_split: allocation.load_split,
                production_split: allocation.production_split,
                path_length_m: topology.path_length(*id).unwrap_or(0.0),
            })
        })
        .collect();

    let cables: Vec<CableResult> = topology
        .branches()
        .map(|branch| {
            let currents_a = pass
                .currents
                .get(&branch.child)
                .copied()
                .unwrap_or_else(PhaseVector::zeros);
            let factor = pass.thermal_factors.get(&branch.child).copied().unwrap_or(1.0);
            let resistance_phase_ohm = branch.r_phase_ohm * factor;
            let resistance_neutral_ohm = branch.r_neutral_ohm * factor;
            let neutral_current_a = if four_wire {
                pass.neutral.get(&branch.child).map(|n| n.norm()).unwrap_or(0.0)
            } else {
                0.0
            };
            let loss_w = currents_a.map(|i| i * i).sum() * resistance_phase_ohm
                + neutral_current_a * neutral_current_a * resistance_neutral_ohm;
            let max_current = currents_a.abs().max();
            CableResult {
                cable_id: branch.cable_id,
                from: branch.parent,
                to: branch.child,
                currents_a,
                neutral_current_a,
                voltage_drop_v: currents_a * resistance_phase_ohm,
                resistance_phase_ohm,
                resistance_neutral_ohm,
                thermal_factor: factor,
                loss_w,
                loading_pct: if branch.ampacity_a > 0.0 {
                    max_current / branch.ampacity_a * 100.0
                } else {
                    0.0
                },
            }
        })
        .collect();
    let total_losses_w = cables.iter().map(|c| c.loss_w).sum();

    let source = topology.source();
    let voltage_v = pass
        .voltages
        .get(&source)
        .copied()
        .unwrap_or_else(|| PhaseVector::repeat(options.source_voltage_v()));
    let currents_a = pass
        .currents
        .get(&source)
        .copied()
        .unwrap_or_else(PhaseVector::zeros);
    let apparent_power_kva = voltage_v.component_mul(&currents_a) / 1000.0;
    let total_kva = apparent_power_kva.sum();
    let transformer_loading_pct = if options.source.transformer_kva > 0.0 {
        total_kva.abs() / options.source.transformer_kva * 100.0
    } else {
        0.0
    };
    let busbar = BusbarSummary {
        voltage_v,
        currents_a,
        neutral_current_a: pass.neutral.get(&source).map(|n| n.norm()).unwrap_or(0.0),
        apparent_power_kva,
        total_kva,
        transformer_loading_pct,
        transformer_overloaded: transformer_loading_pct > 100.0,
    };
    if busbar.transformer_overloaded {
        warn!(
            loading_pct = busbar.transformer_loading_pct,
            "transformer loading above rating"
        );
    }

    let regulators = pass
        .regulators
        .into_iter()
        .zip(&ctx.devices.regulators)
        .map(|(result, config)| result.unwrap_or_else(|| RegulatorResult::unreachable(config)))
        .collect();
    let compensators = pass
        .compensators
        .into_iter()
        .zip(&ctx.devices.compensators)
        .map(|(result, config)| {
            result.unwrap_or_else(|| {
                CompensatorResult::unreachable(config, options.voltage_system)
            })
        })
        .collect();

    CalculationResult {
        scenario: options.scenario,
        nominal_voltage_v: ctx.nominal_v,
        voltage_band_v: (band_low, band_high),
        nodes,
        cables,
        busbar,
        total_losses_w,
        convergence,
        unreachable_nodes: topology.unreachable().to_vec(),
        regulators,
        compensators,
    }
}
