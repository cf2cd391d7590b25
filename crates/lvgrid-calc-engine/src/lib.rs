//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Low-voltage radial network calculation engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
pub mod allocation;
pub mod cable_check;
pub mod compensator;
pub mod devices;
pub mod errors;
pub mod load_flow;
pub mod model;
pub mod options;
pub mod placement;
pub mod regulator;
pub mod thermal;
pub mod topology;

use tracing::info;

use crate::{
    cable_check::{check_cables, CableCheckReport},
    devices::DeviceSet,
    load_flow::{solve, CalculationResult},
    model::Network,
    options::SimulationOptions,
    topology::TopologyIndex,
};

pub use errors::{CalcEngineError, Result};
pub use model::PhaseVector;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CalcSummary {
    pub network_version: Option<String>,
    pub load_flow: CalculationResult,
    pub cable_check: CableCheckReport,
}

/// Indexes the network, solves it and checks every cable.
pub fn analyze_network(
    network: &Network,
    devices: &DeviceSet,
    options: &SimulationOptions,
) -> Result<CalcSummary> {
    info!("Indexing network topology...");
    let topology = TopologyIndex::build(network)?;
    analyze_with_topology(network, &topology, devices, options)
}

/// Same as [`analyze_network`] for callers that already hold the topology,
/// e.g. to run placement searches on the same index afterwards.
pub fn analyze_with_topology(
    network: &Network,
    topology: &TopologyIndex,
    devices: &DeviceSet,
    options: &SimulationOptions,
) -> Result<CalcSummary> {
    info!("Running load-flow analysis...");
    let load_flow = solve(network, topology, devices, options)?;

    info!("Running cable validation checks...");
    let cable_check = check_cables(network, &load_flow, options);

    Ok(CalcSummary {
        network_version: network.version.clone(),
        load_flow,
        cable_check,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Cable, CableMaterial, CableType, Client, ConnectionType, InstallationMethod, Node,
        PowerItem,
    };
    use uuid::Uuid;

    fn node(name: &str, is_source: bool) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: name.into(),
            position: None,
            is_source,
            manual_loads: Vec::new(),
            manual_productions: Vec::new(),
            connection: ConnectionType::ThreePhaseFourWire,
            phase: None,
            phase_override: None,
        }
    }

    #[test]
    fn analyze_network_pipeline() {
        let source = node("Transformer", true);
        let mut cabinet = node("Cabinet", false);
        cabinet.manual_loads.push(PowerItem {
            label: "street lighting".into(),
            kva: 3.0,
        });
        let house = node("House", false);

        let network = Network {
            version: Some("test-1".to_string()),
            cables: vec![
                Cable {
                    id: Uuid::new_v4(),
                    name: "Feeder".into(),
                    from: source.id,
                    to: cabinet.id,
                    cable_type: "AL150".into(),
                    length_m: Some(120.0),
                    path: Vec::new(),
                    installation: InstallationMethod::Underground,
                },
                Cable {
                    id: Uuid::new_v4(),
                    name: "Drop".into(),
                    from: cabinet.id,
                    to: house.id,
                    cable_type: "AL150".into(),
                    length_m: Some(40.0),
                    path: Vec::new(),
                    installation: InstallationMethod::Aerial,
                },
            ],
            clients: vec![Client {
                id: Uuid::new_v4(),
                name: "House 1".into(),
                node_id: house.id,
                contracted_kva: 12.0,
                production_kva: 6.0,
                connection: ConnectionType::SinglePhase,
                phase: None,
            }],
            nodes: vec![source, cabinet, house],
            cable_types: vec![CableType {
                id: "AL150".into(),
                r_phase_ohm_per_km: 0.206,
                r_neutral_ohm_per_km: 0.206,
                material: CableMaterial::Aluminium,
                ampacity_a: 270.0,
            }],
        };

        let summary =
            analyze_network(&network, &DeviceSet::default(), &SimulationOptions::default())
                .unwrap();

        assert_eq!(summary.network_version.as_deref(), Some("test-1"));
        assert_eq!(summary.load_flow.nodes.len(), 3);
        assert!(summary.load_flow.convergence.is_converged());
        assert!(summary.load_flow.total_losses_w > 0.0);
        assert!(summary.cable_check.is_ok());
        // Unassigned single-phase clients sit on phase A.
        let house = &summary.load_flow.nodes[2];
        assert!(house.voltages_v[0] < house.voltages_v[1]);
    }

    #[test]
    fn missing_source_is_refused() {
        let network = Network {
            nodes: vec![node("orphan", false)],
            ..Network::default()
        };
        let err = analyze_network(&network, &DeviceSet::default(), &SimulationOptions::default())
            .unwrap_err();
        assert_eq!(err, CalcEngineError::MissingSource);
    }
}
