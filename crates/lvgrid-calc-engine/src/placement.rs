//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Placement search for neutral compensators and step regulators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Both searches score every reachable non-source node against a baseline
//! calculation and return the full ranking. Ties are broken by distance from
//! the source and then by topology order, so rankings are reproducible.
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::{
    load_flow::{CalculationResult, NodeResult},
    model::Network,
    topology::TopologyIndex,
};

/// Impedance floor used when dividing by upstream phase impedance.
const MIN_SCORE_IMPEDANCE_OHM: f64 = 1e-3;

fn default_compensator_min_window() -> f64 {
    0.2
}

fn default_compensator_max_window() -> f64 {
    1.0
}

fn default_compensator_max_distance_m() -> f64 {
    2000.0
}

fn default_min_neutral_current_a() -> f64 {
    5.0
}

fn default_regulator_min_window() -> f64 {
    0.3
}

fn default_regulator_max_window() -> f64 {
    0.7
}

fn default_max_spread_v() -> f64 {
    10.0
}

fn default_regulator_max_distance_m() -> f64 {
    500.0
}

fn default_estimated_boost_pct() -> f64 {
    7.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoPlacementReason {
    NetworkTooSmall,
    NoImbalanceDetected,
    AllNodesCompliant,
    NoCandidateInWindow,
}

impl std::fmt::Display for NoPlacementReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            NoPlacementReason::NetworkTooSmall => "network has no reachable node besides the source",
            NoPlacementReason::NoImbalanceDetected => "no node carries a significant neutral current",
            NoPlacementReason::AllNodesCompliant => "every node is already within the voltage band",
            NoPlacementReason::NoCandidateInWindow => "no node satisfies the search criteria",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub node_id: Uuid,
    pub node_name: String,
    pub score: f64,
    pub distance_m: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementReport<C> {
    /// Best candidate first.
    pub candidates: Vec<C>,
    pub recommendation: Option<Recommendation>,
    pub no_result: Option<NoPlacementReason>,
}

impl<C> PlacementReport<C> {
    fn empty(reason: NoPlacementReason) -> Self {
        Self {
            candidates: Vec::new(),
            recommendation: None,
            no_result: Some(reason),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensatorSearchCriteria {
    #[serde(default = "default_compensator_min_window")]
    pub min_normalized_impedance: f64,
    #[serde(default = "default_compensator_max_window")]
    pub max_normalized_impedance: f64,
    #[serde(default = "default_compensator_max_distance_m")]
    pub max_distance_m: f64,
    #[serde(default = "default_min_neutral_current_a")]
    pub min_neutral_current_a: f64,
}

impl Default for CompensatorSearchCriteria {
    fn default() -> Self {
        Self {
            min_normalized_impedance: default_compensator_min_window(),
            max_normalized_impedance: default_compensator_max_window(),
            max_distance_m: default_compensator_max_distance_m(),
            min_neutral_current_a: default_min_neutral_current_a(),
        }
    }
}

/// How regulator sites are scored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegulatorSiteStrategy {
    /// Low phase imbalance at a mid-feeder impedance; spread times impedance, minimised.
    ImbalanceImpedance,
    /// Share of out-of-band downstream nodes a boost would recover, maximised.
    #[default]
    DownstreamCompliance,
}

impl std::str::FromStr for RegulatorSiteStrategy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().replace('-', "_").as_str() {
            "imbalance_impedance" | "impedance" => Ok(Self::ImbalanceImpedance),
            "downstream_compliance" | "compliance" => Ok(Self::DownstreamCompliance),
            other => Err(format!("unknown regulator site strategy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegulatorSearchCriteria {
    #[serde(default)]
    pub strategy: RegulatorSiteStrategy,
    #[serde(default = "default_regulator_min_window")]
    pub min_normalized_impedance: f64,
    #[serde(default = "default_regulator_max_window")]
    pub max_normalized_impedance: f64,
    #[serde(default = "default_max_spread_v")]
    pub max_spread_v: f64,
    /// Distance cap applied by [`RegulatorSiteStrategy::DownstreamCompliance`].
    #[serde(default = "default_regulator_max_distance_m")]
    pub max_distance_m: f64,
    #[serde(default = "default_estimated_boost_pct")]
    pub estimated_boost_pct: f64,
}

impl Default for RegulatorSearchCriteria {
    fn default() -> Self {
        Self {
            strategy: RegulatorSiteStrategy::default(),
            min_normalized_impedance: default_regulator_min_window(),
            max_normalized_impedance: default_regulator_max_window(),
            max_spread_v: default_max_spread_v(),
            max_distance_m: default_regulator_max_distance_m(),
            estimated_boost_pct: default_estimated_boost_pct(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensatorCandidate {
    pub node_id: Uuid,
    pub score: f64,
    pub neutral_current_a: f64,
    pub upstream_phase_impedance_ohm: f64,
    pub normalized_impedance: f64,
    pub distance_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulatorCandidate {
    pub node_id: Uuid,
    pub strategy: RegulatorSiteStrategy,
    pub score: f64,
    pub voltage_spread_v: f64,
    pub upstream_phase_impedance_ohm: f64,
    pub normalized_impedance: f64,
    pub distance_m: f64,
    pub out_of_band_downstream: usize,
    pub recovered_downstream: usize,
}

/// Node facts shared by both searches.
struct Site<'a> {
    result: &'a NodeResult,
    position: usize,
    impedance_ohm: f64,
    normalized: f64,
    distance_m: f64,
}

fn sites<'a>(topology: &TopologyIndex, baseline: &'a CalculationResult) -> Vec<Site<'a>> {
    let max_impedance = topology.max_upstream_phase_impedance();
    baseline
        .nodes
        .iter()
        .filter(|n| n.node_id != topology.source())
        .filter_map(|result| {
            let position = topology.position(result.node_id)?;
            let impedance_ohm = topology.upstream_impedance(result.node_id)?.phase_ohm;
            Some(Site {
                result,
                position,
                impedance_ohm,
                normalized: if max_impedance > 0.0 {
                    impedance_ohm / max_impedance
                } else {
                    0.0
                },
                distance_m: topology.path_length(result.node_id).unwrap_or(0.0),
            })
        })
        .collect()
}

fn in_window(value: f64, min: f64, max: f64) -> bool {
    value >= min && value <= max
}

/// Sorts by score, then distance, then topology order.
fn rank<C>(candidates: &mut [(C, f64, f64, usize)], descending: bool) {
    candidates.sort_by(|a, b| {
        let by_score = if descending {
            b.1.total_cmp(&a.1)
        } else {
            a.1.total_cmp(&b.1)
        };
        by_score
            .then_with(|| a.2.total_cmp(&b.2))
            .then_with(|| a.3.cmp(&b.3))
    });
}

fn node_name(network: &Network, id: Uuid) -> String {
    network
        .find_node(id)
        .map(|n| n.name.clone())
        .unwrap_or_default()
}

/// Ranks nodes for a neutral compensator by neutral current over upstream impedance.
pub fn find_compensator_sites(
    network: &Network,
    topology: &TopologyIndex,
    baseline: &CalculationResult,
    criteria: &CompensatorSearchCriteria,
) -> PlacementReport<CompensatorCandidate> {
    let sites = sites(topology, baseline);
    if sites.is_empty() {
        return PlacementReport::empty(NoPlacementReason::NetworkTooSmall);
    }
    if sites
        .iter()
        .all(|s| s.result.neutral_current_a < criteria.min_neutral_current_a)
    {
        return PlacementReport::empty(NoPlacementReason::NoImbalanceDetected);
    }

    let mut ranked: Vec<(CompensatorCandidate, f64, f64, usize)> = sites
        .iter()
        .filter(|s| {
            in_window(
                s.normalized,
                criteria.min_normalized_impedance,
                criteria.max_normalized_impedance,
            ) && s.distance_m <= criteria.max_distance_m
                && s.result.neutral_current_a >= criteria.min_neutral_current_a
        })
        .map(|s| {
            let score = s.result.neutral_current_a / s.impedance_ohm.max(MIN_SCORE_IMPEDANCE_OHM);
            let candidate = CompensatorCandidate {
                node_id: s.result.node_id,
                score,
                neutral_current_a: s.result.neutral_current_a,
                upstream_phase_impedance_ohm: s.impedance_ohm,
                normalized_impedance: s.normalized,
                distance_m: s.distance_m,
            };
            (candidate, score, s.distance_m, s.position)
        })
        .collect();
    rank(&mut ranked, true);
    let candidates: Vec<CompensatorCandidate> = ranked.into_iter().map(|(c, ..)| c).collect();

    info!(candidates = candidates.len(), "compensator placement scored");
    let Some(best) = candidates.first() else {
        return PlacementReport::empty(NoPlacementReason::NoCandidateInWindow);
    };
    let recommendation = Recommendation {
        node_id: best.node_id,
        node_name: node_name(network, best.node_id),
        score: best.score,
        distance_m: best.distance_m,
        rationale: format!(
            "neutral current {:.1} A behind {:.3} Ω upstream phase impedance",
            best.neutral_current_a, best.upstream_phase_impedance_ohm
        ),
    };
    PlacementReport {
        candidates,
        recommendation: Some(recommendation),
        no_result: None,
    }
}

/// Ranks nodes for a step regulator with the strategy named in `criteria`.
pub fn find_regulator_sites(
    network: &Network,
    topology: &TopologyIndex,
    baseline: &CalculationResult,
    criteria: &RegulatorSearchCriteria,
) -> PlacementReport<RegulatorCandidate> {
    let sites = sites(topology, baseline);
    if sites.is_empty() {
        return PlacementReport::empty(NoPlacementReason::NetworkTooSmall);
    }
    if baseline.non_compliant_nodes().next().is_none() {
        return PlacementReport::empty(NoPlacementReason::AllNodesCompliant);
    }

    let (mut ranked, descending) = match criteria.strategy {
        RegulatorSiteStrategy::ImbalanceImpedance => (imbalance_candidates(&sites, criteria), false),
        RegulatorSiteStrategy::DownstreamCompliance => (
            compliance_candidates(&sites, topology, baseline, criteria),
            true,
        ),
    };
    rank(&mut ranked, descending);
    let candidates: Vec<RegulatorCandidate> = ranked.into_iter().map(|(c, ..)| c).collect();

    info!(
        strategy = ?criteria.strategy,
        candidates = candidates.len(),
        "regulator placement scored"
    );
    let Some(best) = candidates.first() else {
        return PlacementReport::empty(NoPlacementReason::NoCandidateInWindow);
    };
    let rationale = match criteria.strategy {
        RegulatorSiteStrategy::ImbalanceImpedance => format!(
            "phase spread {:.1} V at {:.0} % of the largest upstream impedance",
            best.voltage_spread_v,
            best.normalized_impedance * 100.0
        ),
        RegulatorSiteStrategy::DownstreamCompliance => format!(
            "recovers {} of {} out-of-band downstream nodes",
            best.recovered_downstream, best.out_of_band_downstream
        ),
    };
    let recommendation = Recommendation {
        node_id: best.node_id,
        node_name: node_name(network, best.node_id),
        score: best.score,
        distance_m: best.distance_m,
        rationale,
    };
    PlacementReport {
        candidates,
        recommendation: Some(recommendation),
        no_result: None,
    }
}

fn spread(result: &NodeResult) -> f64 {
    result.voltages_v.max() - result.voltages_v.min()
}

fn imbalance_candidates(
    sites: &[Site<'_>],
    criteria: &RegulatorSearchCriteria,
) -> Vec<(RegulatorCandidate, f64, f64, usize)> {
    sites
        .iter()
        .filter(|s| {
            in_window(
                s.normalized,
                criteria.min_normalized_impedance,
                criteria.max_normalized_impedance,
            ) && spread(s.result) <= criteria.max_spread_v
        })
        .map(|s| {
            let spread_v = spread(s.result);
            let score = spread_v * s.impedance_ohm;
            let candidate = RegulatorCandidate {
                node_id: s.result.node_id,
                strategy: RegulatorSiteStrategy::ImbalanceImpedance,
                score,
                voltage_spread_v: spread_v,
                upstream_phase_impedance_ohm: s.impedance_ohm,
                normalized_impedance: s.normalized,
                distance_m: s.distance_m,
                out_of_band_downstream: 0,
                recovered_downstream: 0,
            };
            (candidate, score, s.distance_m, s.position)
        })
        .collect()
}

fn compliance_candidates(
    sites: &[Site<'_>],
    topology: &TopologyIndex,
    baseline: &CalculationResult,
    criteria: &RegulatorSearchCriteria,
) -> Vec<(RegulatorCandidate, f64, f64, usize)> {
    let (low, high) = baseline.voltage_band_v;
    let boost = criteria.estimated_boost_pct.max(0.0) / 100.0;

    sites
        .iter()
        .filter(|s| s.distance_m <= criteria.max_distance_m)
        .filter_map(|s| {
            let mut out_of_band = 0;
            let mut recovered = 0;
            for id in topology.downstream(s.result.node_id) {
                let Some(node) = baseline.node(id) else {
                    continue;
                };
                if node.compliant {
                    continue;
                }
                out_of_band += 1;
                let shifted = node.voltages_v.map(|v| {
                    if v < low {
                        v * (1.0 + boost)
                    } else if v > high {
                        v * (1.0 - boost)
                    } else {
                        v
                    }
                });
                if shifted.iter().all(|v| in_window(*v, low, high)) {
                    recovered += 1;
                }
            }
            if out_of_band == 0 {
                return None;
            }
            let score = recovered as f64 / out_of_band as f64 * 100.0;
            let candidate = RegulatorCandidate {
                node_id: s.result.node_id,
                strategy: RegulatorSiteStrategy::DownstreamCompliance,
                score,
                voltage_spread_v: spread(s.result),
                upstream_phase_impedance_ohm: s.impedance_ohm,
                normalized_impedance: s.normalized,
                distance_m: s.distance_m,
                out_of_band_downstream: out_of_band,
                recovered_downstream: recovered,
            };
            Some((candidate, score, s.distance_m, s.position))
        })
        .collect()
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
        options::SimulationOptions,
    };

    fn node(name: &str, is_source: bool) -> Node {
        Node {
            id: Uuid::new_v4(),
            name: name.into(),
            position: None,
            is_source,
            manual_loads: Vec::new(),
            manual_productions: Vec::new(),
            connection: ConnectionType::SinglePhase,
            phase: None,
            phase_override: None,
        }
    }

    fn client(node_id: Uuid, kva: f64, connection: ConnectionType, phase: Option<Phase>) -> Client {
        Client {
            id: Uuid::new_v4(),
            name: String::new(),
            node_id,
            contracted_kva: kva,
            production_kva: 0.0,
            connection,
            phase: phase.map(PhaseConnection::Phase),
        }
    }

    /// A source feeding `segments` nodes in a chain, 100 m apart.
    fn feeder(segments: usize, r_ohm_per_km: f64) -> (Network, Vec<Uuid>) {
        let mut nodes = vec![node("source", true)];
        for i in 0..segments {
            nodes.push(node(&format!("n{}", i + 1), false));
        }
        let ids: Vec<Uuid> = nodes.iter().map(|n| n.id).collect();
        let cables = ids
            .windows(2)
            .map(|pair| Cable {
                id: Uuid::new_v4(),
                name: String::new(),
                from: pair[0],
                to: pair[1],
                cable_type: "T".into(),
                length_m: Some(100.0),
                path: Vec::new(),
                installation: InstallationMethod::Underground,
            })
            .collect();
        let network = Network {
            version: None,
            nodes,
            cables,
            cable_types: vec![CableType {
                id: "T".into(),
                r_phase_ohm_per_km: r_ohm_per_km,
                r_neutral_ohm_per_km: r_ohm_per_km,
                material: CableMaterial::Unknown,
                ampacity_a: 200.0,
            }],
            clients: Vec::new(),
        };
        (network, ids)
    }

    fn baseline(network: &Network) -> (TopologyIndex, CalculationResult) {
        let topology = TopologyIndex::build(network).unwrap();
        let result = solve(
            network,
            &topology,
            &DeviceSet::default(),
            &SimulationOptions::default(),
        )
        .unwrap();
        (topology, result)
    }

    #[test]
    fn balanced_network_yields_no_compensator_site() {
        let (mut network, ids) = feeder(2, 0.5);
        network
            .clients
            .push(client(ids[2], 30.0, ConnectionType::ThreePhaseFourWire, None));
        let (topology, result) = baseline(&network);
        let report = find_compensator_sites(
            &network,
            &topology,
            &result,
            &CompensatorSearchCriteria::default(),
        );
        assert!(report.is_empty());
        assert!(report.recommendation.is_none());
        assert_eq!(report.no_result, Some(NoPlacementReason::NoImbalanceDetected));
    }

    #[test]
    fn compensator_ranking_favours_current_over_impedance() {
        let (mut network, ids) = feeder(2, 0.5);
        network
            .clients
            .push(client(ids[2], 10.0, ConnectionType::SinglePhase, Some(Phase::A)));
        let (topology, result) = baseline(&network);

        let report = find_compensator_sites(
            &network,
            &topology,
            &result,
            &CompensatorSearchCriteria::default(),
        );
        let order: Vec<Uuid> = report.candidates.iter().map(|c| c.node_id).collect();
        assert_eq!(order, vec![ids[1], ids[2]]);
        assert_eq!(report.recommendation.as_ref().unwrap().node_name, "n1");

        let narrow = CompensatorSearchCriteria {
            min_normalized_impedance: 0.6,
            ..CompensatorSearchCriteria::default()
        };
        let report = find_compensator_sites(&network, &topology, &result, &narrow);
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].node_id, ids[2]);
    }

    #[test]
    fn compliance_strategy_prefers_closest_full_recovery() {
        let (mut network, ids) = feeder(2, 3.0);
        network
            .clients
            .push(client(ids[2], 30.0, ConnectionType::ThreePhaseFourWire, None));
        let (topology, result) = baseline(&network);
        assert!(!result.node(ids[2]).unwrap().compliant);

        let report = find_regulator_sites(
            &network,
            &topology,
            &result,
            &RegulatorSearchCriteria::default(),
        );
        assert_eq!(report.candidates.len(), 2);
        assert_eq!(report.candidates[0].node_id, ids[1]);
        assert_eq!(report.candidates[0].score, 100.0);
        assert_eq!(report.candidates[0].recovered_downstream, 1);
        assert_eq!(report.recommendation.unwrap().node_id, ids[1]);
    }

    #[test]
    fn impedance_strategy_keeps_mid_feeder_nodes() {
        let (mut network, ids) = feeder(3, 3.0);
        network
            .clients
            .push(client(ids[3], 30.0, ConnectionType::ThreePhaseFourWire, None));
        network
            .clients
            .push(client(ids[2], 1.0, ConnectionType::SinglePhase, Some(Phase::A)));
        let (topology, result) = baseline(&network);

        let criteria = RegulatorSearchCriteria {
            strategy: RegulatorSiteStrategy::ImbalanceImpedance,
            ..RegulatorSearchCriteria::default()
        };
        let report = find_regulator_sites(&network, &topology, &result, &criteria);
        let order: Vec<Uuid> = report.candidates.iter().map(|c| c.node_id).collect();
        assert_eq!(order, vec![ids[1], ids[2]]);
        assert!(report.candidates[0].score <= report.candidates[1].score);
    }

    #[test]
    fn compliant_network_needs_no_regulator() {
        let (mut network, ids) = feeder(2, 0.5);
        network
            .clients
            .push(client(ids[2], 3.0, ConnectionType::SinglePhase, Some(Phase::B)));
        let (topology, result) = baseline(&network);
        let report = find_regulator_sites(
            &network,
            &topology,
            &result,
            &RegulatorSearchCriteria::default(),
        );
        assert_eq!(report.no_result, Some(NoPlacementReason::AllNodesCompliant));
    }

    #[test]
    fn lone_source_is_too_small() {
        let (network, _) = feeder(0, 0.5);
        let (topology, result) = baseline(&network);
        let report = find_compensator_sites(
            &network,
            &topology,
            &result,
            &CompensatorSearchCriteria::default(),
        );
        assert_eq!(report.no_result, Some(NoPlacementReason::NetworkTooSmall));
    }

    #[test]
    fn strategy_parses_from_cli_names() {
        assert_eq!(
            "imbalance-impedance".parse::<RegulatorSiteStrategy>().unwrap(),
            RegulatorSiteStrategy::ImbalanceImpedance
        );
        assert_eq!(
            "compliance".parse::<RegulatorSiteStrategy>().unwrap(),
            RegulatorSiteStrategy::DownstreamCompliance
        );
        assert!("nearest".parse::<RegulatorSiteStrategy>().is_err());
    }
}
