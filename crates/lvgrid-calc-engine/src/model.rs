//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Network snapshot consumed by the calculation engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use indexmap::IndexMap;
use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-phase quantity ordered A, B, C.
pub type PhaseVector = Vector3<f64>;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Network {
    #[serde(default)]
    pub version: Option<String>,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub cables: Vec<Cable>,
    #[serde(default)]
    pub cable_types: Vec<CableType>,
    #[serde(default)]
    pub clients: Vec<Client>,
}

impl Network {
    pub fn node_map(&self) -> IndexMap<Uuid, &Node> {
        self.nodes.iter().map(|n| (n.id, n)).collect()
    }

    pub fn find_node(&self, id: Uuid) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_cable(&self, id: Uuid) -> Option<&Cable> {
        self.cables.iter().find(|c| c.id == id)
    }

    pub fn cable_type(&self, id: &str) -> Option<&CableType> {
        self.cable_types.iter().find(|t| t.id == id)
    }

    pub fn source_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_source)
    }

    /// Clients grouped by the node they are attached to, in input order.
    pub fn clients_by_node(&self) -> IndexMap<Uuid, Vec<&Client>> {
        let mut grouped: IndexMap<Uuid, Vec<&Client>> = IndexMap::new();
        for client in &self.clients {
            grouped.entry(client.node_id).or_default().push(client);
        }
        grouped
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    /// Great-circle distance on a spherical earth (haversine).
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        let phi1 = self.lat.to_radians();
        let phi2 = other.lat.to_radians();
        let d_phi = (other.lat - self.lat).to_radians();
        let d_lambda = (other.lon - self.lon).to_radians();
        let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub position: Option<GeoPoint>,
    #[serde(default)]
    pub is_source: bool,
    #[serde(default)]
    pub manual_loads: Vec<PowerItem>,
    #[serde(default)]
    pub manual_productions: Vec<PowerItem>,
    #[serde(default)]
    pub connection: ConnectionType,
    #[serde(default)]
    pub phase: Option<PhaseConnection>,
    #[serde(default)]
    pub phase_override: Option<crate::allocation::PhaseSplit>,
}

impl Node {
    pub fn manual_load_kva(&self) -> f64 {
        self.manual_loads.iter().map(|item| item.kva).sum()
    }

    pub fn manual_production_kva(&self) -> f64 {
        self.manual_productions.iter().map(|item| item.kva).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerItem {
    #[serde(default)]
    pub label: String,
    pub kva: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cable {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub from: Uuid,
    pub to: Uuid,
    pub cable_type: String,
    #[serde(default)]
    pub length_m: Option<f64>,
    #[serde(default)]
    pub path: Vec<GeoPoint>,
    #[serde(default)]
    pub installation: InstallationMethod,
}

impl Cable {
    /// Explicit length when present, otherwise the length of the drawn polyline.
    pub fn length_m(&self) -> f64 {
        match self.length_m {
            Some(length) => length.max(0.0),
            None => self
                .path
                .windows(2)
                .map(|pair| pair[0].distance_m(&pair[1]))
                .sum(),
        }
    }

    pub fn has_length(&self) -> bool {
        self.length_m.is_some() || self.path.len() >= 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CableType {
    pub id: String,
    pub r_phase_ohm_per_km: f64,
    pub r_neutral_ohm_per_km: f64,
    pub material: CableMaterial,
    pub ampacity_a: f64,
}

impl CableType {
    pub fn phase_resistance_ohm(&self, length_m: f64) -> f64 {
        self.r_phase_ohm_per_km.max(0.0) * length_m / 1000.0
    }

    pub fn neutral_resistance_ohm(&self, length_m: f64) -> f64 {
        self.r_neutral_ohm_per_km.max(0.0) * length_m / 1000.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CableMaterial {
    Copper,
    Aluminium,
    Almelec,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstallationMethod {
    #[default]
    Underground,
    Aerial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    #[serde(default)]
    pub name: String,
    pub node_id: Uuid,
    #[serde(default)]
    pub contracted_kva: f64,
    #[serde(default)]
    pub production_kva: f64,
    #[serde(default)]
    pub connection: ConnectionType,
    #[serde(default)]
    pub phase: Option<PhaseConnection>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    SinglePhase,
    ThreePhaseThreeWire,
    ThreePhaseFourWire,
}

impl ConnectionType {
    pub fn is_single_phase(&self) -> bool {
        matches!(self, ConnectionType::SinglePhase)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    A,
    B,
    C,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::A, Phase::B, Phase::C];

    pub fn index(self) -> usize {
        match self {
            Phase::A => 0,
            Phase::B => 1,
            Phase::C => 2,
        }
    }

    /// Nominal phasor angle in radians (A leads, B lags by 120°, C by 240°).
    pub fn angle(self) -> f64 {
        match self {
            Phase::A => 0.0,
            Phase::B => -2.0 * std::f64::consts::FRAC_PI_3,
            Phase::C => 2.0 * std::f64::consts::FRAC_PI_3,
        }
    }
}

/// How a single-phase consumer is wired.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PhaseConnection {
    Phase(Phase),
    Between(Phase, Phase),
}
