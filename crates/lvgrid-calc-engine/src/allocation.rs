//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Distribution of node load and production across phases."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::{
    model::{Client, ConnectionType, Node, Phase, PhaseConnection, PhaseVector},
    options::SimulationOptions,
};

const WEIGHT_EPSILON: f64 = 1e-12;

/// Which consumers feed the computed split.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Only single-phase consumers shape the split.
    MonoOnly,
    /// Every consumer counts, polyphase ones spread evenly.
    #[default]
    AllClients,
}

/// Percentage of a node total carried by each phase. Always sums to 100.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PhaseSplit {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Default for PhaseSplit {
    fn default() -> Self {
        Self::EVEN
    }
}

impl PhaseSplit {
    pub const EVEN: PhaseSplit = PhaseSplit {
        a: 33.33,
        b: 33.33,
        c: 33.34,
    };

    /// Normalises arbitrary non-negative weights into percentages.
    pub fn from_weights(weights: PhaseVector) -> Self {
        let weights = weights.map(|w| if w.is_finite() { w.max(0.0) } else { 0.0 });
        let total = weights.sum();
        if total <= WEIGHT_EPSILON {
            return Self::EVEN;
        }
        let a = weights[0] / total * 100.0;
        let b = weights[1] / total * 100.0;
        Self { a, b, c: 100.0 - a - b }
    }

    pub fn get(&self, phase: Phase) -> f64 {
        match phase {
            Phase::A => self.a,
            Phase::B => self.b,
            Phase::C => self.c,
        }
    }

    pub fn total(&self) -> f64 {
        self.a + self.b + self.c
    }

    pub fn as_vector(&self) -> PhaseVector {
        PhaseVector::new(self.a, self.b, self.c)
    }

    /// True when no phase departs from a third by more than `tolerance_pct`.
    pub fn is_balanced(&self, tolerance_pct: f64) -> bool {
        let third = 100.0 / 3.0;
        Phase::ALL
            .iter()
            .all(|p| (self.get(*p) - third).abs() <= tolerance_pct)
    }

    /// Rescales a hand-entered split that does not add up to 100.
    pub fn normalized(&self) -> Self {
        Self::from_weights(self.as_vector())
    }

    /// Splits `total` into absolute per-phase values.
    pub fn distribute(&self, total: f64) -> PhaseVector {
        self.as_vector() * (total / 100.0)
    }

    /// Pins `phase` to `pct` and spreads the remainder over the two other
    /// phases in their current ratio, or evenly when both are zero.
    pub fn with_adjusted(&self, phase: Phase, pct: f64) -> Self {
        let pinned = if pct.is_finite() { pct.clamp(0.0, 100.0) } else { 0.0 };
        let remaining = 100.0 - pinned;
        let others: Vec<Phase> = Phase::ALL.into_iter().filter(|p| *p != phase).collect();
        let first = self.get(others[0]).max(0.0);
        let second = self.get(others[1]).max(0.0);
        let (first_share, second_share) = if first + second <= WEIGHT_EPSILON {
            (remaining / 2.0, remaining / 2.0)
        } else {
            let share = remaining * first / (first + second);
            (share, remaining - share)
        };

        let mut values = PhaseVector::zeros();
        values[phase.index()] = pinned;
        values[others[0].index()] = first_share;
        values[others[1].index()] = second_share;
        Self {
            a: values[0],
            b: values[1],
            c: values[2],
        }
    }
}

/// Per-phase weight of a single consumer.
pub fn phase_contribution(
    value: f64,
    connection: ConnectionType,
    phase: Option<PhaseConnection>,
) -> PhaseVector {
    let mut weights = PhaseVector::zeros();
    match connection {
        ConnectionType::SinglePhase => match phase {
            Some(PhaseConnection::Between(p, q)) if p != q => {
                let share = value / 3f64.sqrt();
                weights[p.index()] += share;
                weights[q.index()] += share;
            }
            Some(PhaseConnection::Between(p, _)) | Some(PhaseConnection::Phase(p)) => {
                weights[p.index()] = value;
            }
            None => weights[Phase::A.index()] = value,
        },
        ConnectionType::ThreePhaseThreeWire | ConnectionType::ThreePhaseFourWire => {
            weights.fill(value / 3.0);
        }
    }
    weights
}

/// Consumer entry feeding a split: a client or the node's own manual items.
#[derive(Debug, Clone, Copy)]
pub struct Contributor {
    pub load_kva: f64,
    pub production_kva: f64,
    pub connection: ConnectionType,
    pub phase: Option<PhaseConnection>,
}

impl From<&Client> for Contributor {
    fn from(client: &Client) -> Self {
        Self {
            load_kva: client.contracted_kva.max(0.0),
            production_kva: client.production_kva.max(0.0),
            connection: client.connection,
            phase: client.phase,
        }
    }
}

impl Contributor {
    pub fn for_node_items(node: &Node) -> Self {
        Self {
            load_kva: node.manual_load_kva().max(0.0),
            production_kva: node.manual_production_kva().max(0.0),
            connection: node.connection,
            phase: node.phase,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Quantity {
    Load,
    Production,
}

fn compute_split(
    contributors: &[Contributor],
    policy: AllocationPolicy,
    quantity: Quantity,
) -> PhaseSplit {
    let weights = contributors
        .iter()
        .filter(|c| match policy {
            AllocationPolicy::MonoOnly => c.connection.is_single_phase(),
            AllocationPolicy::AllClients => true,
        })
        .map(|c| {
            let value = match quantity {
                Quantity::Load => c.load_kva,
                Quantity::Production => c.production_kva,
            };
            phase_contribution(value, c.connection, c.phase)
        })
        .fold(PhaseVector::zeros(), |acc, w| acc + w);
    PhaseSplit::from_weights(weights)
}

/// Load split from the chosen population.
pub fn load_split(contributors: &[Contributor], policy: AllocationPolicy) -> PhaseSplit {
    compute_split(contributors, policy, Quantity::Load)
}

/// Production split from the chosen population.
pub fn production_split(contributors: &[Contributor], policy: AllocationPolicy) -> PhaseSplit {
    compute_split(contributors, policy, Quantity::Production)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeAllocation {
    pub load_split: PhaseSplit,
    pub production_split: PhaseSplit,
    /// Diversified load per phase in kVA.
    pub load_kva: PhaseVector,
    /// Simulated production per phase in kVA.
    pub production_kva: PhaseVector,
}

impl NodeAllocation {
    pub fn total_load_kva(&self) -> f64 {
        self.load_kva.sum()
    }

    pub fn total_production_kva(&self) -> f64 {
        self.production_kva.sum()
    }
}

/// Allocates the node's manual items and attached clients across phases.
///
/// A node override wins over the global manual split, which wins over the
/// split computed from the consumer population.
pub fn allocate_node(node: &Node, clients: &[&Client], options: &SimulationOptions) -> NodeAllocation {
    let mut contributors: Vec<Contributor> = Vec::with_capacity(clients.len() + 1);
    contributors.push(Contributor::for_node_items(node));
    contributors.extend(clients.iter().map(|c| Contributor::from(*c)));

    let pinned = node
        .phase_override
        .or(options.allocation.manual_split)
        .map(|split| split.normalized());
    let policy = options.allocation.policy;
    let load = pinned.unwrap_or_else(|| load_split(&contributors, policy));
    let production = pinned.unwrap_or_else(|| production_split(&contributors, policy));

    let total_load: f64 = contributors.iter().map(|c| c.load_kva).sum();
    let total_production: f64 = contributors.iter().map(|c| c.production_kva).sum();

    NodeAllocation {
        load_split: load,
        production_split: production,
        load_kva: load.distribute(total_load * options.load_diversity()),
        production_kva: production.distribute(total_production * options.production_multiplier()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node() -> Node {
        Node {
            id: Uuid::new_v4(),
            name: "n".into(),
            position: None,
            is_source: false,
            manual_loads: Vec::new(),
            manual_productions: Vec::new(),
            connection: ConnectionType::SinglePhase,
            phase: None,
            phase_override: None,
        }
    }

    fn client(kva: f64, connection: ConnectionType, phase: Option<PhaseConnection>) -> Client {
        Client {
            id: Uuid::new_v4(),
            name: "c".into(),
            node_id: Uuid::nil(),
            contracted_kva: kva,
            production_kva: 0.0,
            connection,
            phase,
        }
    }

    fn assert_sums_to_100(split: &PhaseSplit) {
        assert!((split.total() - 100.0).abs() < 1e-9, "{:?}", split);
    }

    #[test]
    fn zero_weights_give_conventional_even_split() {
        let split = PhaseSplit::from_weights(PhaseVector::zeros());
        assert_eq!(split, PhaseSplit::EVEN);
        assert_sums_to_100(&split);
    }

    #[test]
    fn coupled_client_uses_root_three() {
        let weights = phase_contribution(
            9.0,
            ConnectionType::SinglePhase,
            Some(PhaseConnection::Between(Phase::A, Phase::C)),
        );
        assert!((weights[0] - 9.0 / 3f64.sqrt()).abs() < 1e-12);
        assert_eq!(weights[1], 0.0);
        assert!((weights[2] - 9.0 / 3f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn polyphase_client_is_balanced() {
        let weights = phase_contribution(12.0, ConnectionType::ThreePhaseFourWire, None);
        assert_eq!(weights, PhaseVector::new(4.0, 4.0, 4.0));
    }

    #[test]
    fn mono_only_ignores_polyphase_population() {
        let contributors = vec![
            Contributor::from(&client(6.0, ConnectionType::SinglePhase, Some(PhaseConnection::Phase(Phase::B)))),
            Contributor::from(&client(36.0, ConnectionType::ThreePhaseFourWire, None)),
        ];
        let mono = load_split(&contributors, AllocationPolicy::MonoOnly);
        assert_eq!(mono.b, 100.0);
        let all = load_split(&contributors, AllocationPolicy::AllClients);
        assert!((all.b - (6.0 + 12.0) / 42.0 * 100.0).abs() < 1e-9);
        assert_sums_to_100(&all);
    }

    #[test]
    fn adjusting_one_phase_preserves_ratio_of_others() {
        let split = PhaseSplit { a: 50.0, b: 30.0, c: 20.0 };
        let adjusted = split.with_adjusted(Phase::A, 60.0);
        assert_eq!(adjusted.a, 60.0);
        assert!((adjusted.b - 24.0).abs() < 1e-9);
        assert!((adjusted.c - 16.0).abs() < 1e-9);
        assert_sums_to_100(&adjusted);
    }

    #[test]
    fn adjusting_with_empty_others_splits_evenly() {
        let split = PhaseSplit { a: 100.0, b: 0.0, c: 0.0 };
        let adjusted = split.with_adjusted(Phase::A, 40.0);
        assert_eq!(adjusted.b, 30.0);
        assert_eq!(adjusted.c, 30.0);
    }

    #[test]
    fn node_override_beats_computed_split() {
        let mut n = node();
        n.phase_override = Some(PhaseSplit { a: 2.0, b: 1.0, c: 1.0 });
        let c = client(10.0, ConnectionType::SinglePhase, Some(PhaseConnection::Phase(Phase::C)));
        let allocation = allocate_node(&n, &[&c], &SimulationOptions::default());
        assert_eq!(allocation.load_split.a, 50.0);
        assert!((allocation.load_kva[0] - 5.0).abs() < 1e-9);
        assert!((allocation.total_load_kva() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn diversity_scales_absolute_values() {
        let n = node();
        let c = client(10.0, ConnectionType::SinglePhase, Some(PhaseConnection::Phase(Phase::A)));
        let options = SimulationOptions {
            load_diversity_pct: 30.0,
            ..SimulationOptions::default()
        };
        let allocation = allocate_node(&n, &[&c], &options);
        assert!((allocation.load_kva[0] - 3.0).abs() < 1e-9);
        assert_eq!(allocation.load_kva[1], 0.0);
        assert_eq!(allocation.production_split, PhaseSplit::EVEN);
        assert_eq!(allocation.total_production_kva(), 0.0);
    }
}
