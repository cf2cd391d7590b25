//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Cable loading and voltage drop checks on a solved network."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::{load_flow::CalculationResult, model::Network, options::SimulationOptions};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CableIssue {
    pub cable_id: Uuid,
    pub cable_name: String,
    pub reasons: Vec<String>,
    pub max_current_a: f64,
    pub ampacity_a: f64,
    pub voltage_drop_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CableCheckReport {
    pub undersized: Vec<CableIssue>,
}

impl CableCheckReport {
    pub fn is_ok(&self) -> bool {
        self.undersized.is_empty()
    }
}

/// Flags cables whose current exceeds ampacity or whose own voltage drop
/// exceeds `options.cable_drop_limit_pct` of the nominal phase voltage.
pub fn check_cables(
    network: &Network,
    result: &CalculationResult,
    options: &SimulationOptions,
) -> CableCheckReport {
    let nominal = result.nominal_voltage_v;
    let mut undersized = Vec::new();

    for cable in &result.cables {
        let Some(declared) = network.find_cable(cable.cable_id) else {
            continue;
        };
        let ampacity_a = network
            .cable_type(&declared.cable_type)
            .map(|t| t.ampacity_a)
            .unwrap_or(0.0);
        let current = cable.max_current_a();
        let drop_percent = if nominal > 0.0 {
            cable.voltage_drop_v.abs().max() / nominal * 100.0
        } else {
            0.0
        };

        let mut reasons = Vec::new();
        if ampacity_a > 0.0 && current > ampacity_a {
            reasons.push(format!(
                "Current {:.1} A exceeds ampacity {:.1} A",
                current, ampacity_a
            ));
        }
        if drop_percent > options.cable_drop_limit_pct {
            reasons.push(format!(
                "Voltage drop {:.2}% exceeds limit {:.2}%",
                drop_percent, options.cable_drop_limit_pct
            ));
        }

        if !reasons.is_empty() {
            warn!(
                cable = %cable.cable_id,
                name = %declared.name,
                reasons = %reasons.join(", "),
                "cable undersized"
            );
            undersized.push(CableIssue {
                cable_id: cable.cable_id,
                cable_name: declared.name.clone(),
                reasons,
                max_current_a: current,
                ampacity_a,
                voltage_drop_percent: drop_percent,
            });
        }
    }

    CableCheckReport { undersized }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::DeviceSet,
        load_flow::solve,
        model::{
            Cable, CableMaterial, CableType, Client, ConnectionType, InstallationMethod, Node,
            Phase, PhaseConnection,
        },
        topology::TopologyIndex,
    };

    fn network(kva: f64, ampacity_a: f64) -> Network {
        let mk = |is_source| Node {
            id: Uuid::new_v4(),
            name: String::new(),
            position: None,
            is_source,
            manual_loads: Vec::new(),
            manual_productions: Vec::new(),
            connection: ConnectionType::SinglePhase,
            phase: None,
            phase_override: None,
        };
        let (source, load) = (mk(true), mk(false));
        Network {
            version: None,
            cables: vec![Cable {
                id: Uuid::new_v4(),
                name: "feeder".into(),
                from: source.id,
                to: load.id,
                cable_type: "CU16".into(),
                length_m: Some(100.0),
                path: Vec::new(),
                installation: InstallationMethod::Aerial,
            }],
            clients: vec![Client {
                id: Uuid::new_v4(),
                name: String::new(),
                node_id: load.id,
                contracted_kva: kva,
                production_kva: 0.0,
                connection: ConnectionType::SinglePhase,
                phase: Some(PhaseConnection::Phase(Phase::C)),
            }],
            nodes: vec![source, load],
            cable_types: vec![CableType {
                id: "CU16".into(),
                r_phase_ohm_per_km: 1.15,
                r_neutral_ohm_per_km: 1.15,
                material: CableMaterial::Copper,
                ampacity_a,
            }],
        }
    }

    fn check(network: &Network) -> CableCheckReport {
        let options = SimulationOptions::default();
        let topology = TopologyIndex::build(network).unwrap();
        let result = solve(network, &topology, &DeviceSet::default(), &options).unwrap();
        check_cables(network, &result, &options)
    }

    #[test]
    fn lightly_loaded_cable_passes() {
        assert!(check(&network(2.0, 100.0)).is_ok());
    }

    #[test]
    fn overloaded_cable_lists_both_reasons() {
        let report = check(&network(24.0, 60.0));
        assert_eq!(report.undersized.len(), 1);
        let issue = &report.undersized[0];
        assert_eq!(issue.cable_name, "feeder");
        assert_eq!(issue.reasons.len(), 2);
        assert!(issue.max_current_a > 60.0);
        assert!(issue.voltage_drop_percent > 3.0);
    }
}
