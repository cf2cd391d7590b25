//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Caller-owned regulation device configuration."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::{compensator::NeutralCompensatorConfig, regulator::StepRegulatorConfig};

/// Device settings persisted by the caller between calculations.
///
/// Computed values never live here; each solve returns fresh
/// [`crate::regulator::RegulatorResult`] and
/// [`crate::compensator::CompensatorResult`] values instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceSet {
    #[serde(default)]
    pub regulators: Vec<StepRegulatorConfig>,
    #[serde(default)]
    pub compensators: Vec<NeutralCompensatorConfig>,
}

impl DeviceSet {
    pub fn is_empty(&self) -> bool {
        self.regulators.is_empty() && self.compensators.is_empty()
    }
}

/// Advisory conditions reported alongside a device result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAdvisory {
    NodeUnreachable,
    InvalidThresholds,
    PowerLimitReached,
    ThreeWireSupply,
    NoImbalance,
    ImpedanceClamped,
    PowerLimited,
}
