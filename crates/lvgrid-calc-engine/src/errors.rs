//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Error taxonomy for the low-voltage calculation engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, CalcEngineError>;

/// Conditions under which the engine refuses to produce a numeric result.
///
/// Unreachable nodes, non-convergence and device misconfiguration are not
/// errors; they are reported inside the calculation result.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalcEngineError {
    #[error("network has no source node")]
    MissingSource,
    #[error("network declares {} source nodes, exactly one is required", .0.len())]
    MultipleSources(Vec<Uuid>),
    #[error("cable {cable} references node {node} which is not part of the network")]
    UnknownNode { cable: Uuid, node: Uuid },
    #[error("cable {cable} references unknown cable type '{cable_type}'")]
    UnknownCableType { cable: Uuid, cable_type: String },
    #[error("cable {0} closes a loop; only radial networks can be solved")]
    CyclicNetwork(Uuid),
    #[error("invalid simulation options: {0}")]
    InvalidOptions(String),
}
