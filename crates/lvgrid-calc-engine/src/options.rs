//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation options supplied by the caller for each calculation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::{
    allocation::{AllocationPolicy, PhaseSplit},
    errors::{CalcEngineError, Result},
    thermal::Season,
};

fn default_transformer_kva() -> f64 {
    160.0
}

fn default_diversity_pct() -> f64 {
    100.0
}

fn default_production_factor() -> f64 {
    1.0
}

fn default_voltage_band_pct() -> f64 {
    10.0
}

fn default_cable_drop_limit_pct() -> f64 {
    3.0
}

fn default_max_iterations() -> usize {
    50
}

fn default_tolerance_v() -> f64 {
    1e-4
}

/// Which side of supply and demand is active during a solve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    #[default]
    Consumption,
    Mixed,
    Production,
}

impl std::str::FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "consumption" => Ok(Scenario::Consumption),
            "mixed" => Ok(Scenario::Mixed),
            "production" => Ok(Scenario::Production),
            other => Err(format!("unknown scenario: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum VoltageSystem {
    /// 230 V phase to neutral, neutral conductor distributed.
    #[default]
    FourWire400,
    /// 230 V phase to phase, no neutral.
    ThreeWire230,
}

impl VoltageSystem {
    pub fn line_voltage_v(&self) -> f64 {
        match self {
            VoltageSystem::FourWire400 => 400.0,
            VoltageSystem::ThreeWire230 => 230.0,
        }
    }

    /// Equivalent star voltage used as the per-phase reference.
    pub fn phase_voltage_v(&self) -> f64 {
        match self {
            VoltageSystem::FourWire400 => 230.0,
            VoltageSystem::ThreeWire230 => 230.0 / 3f64.sqrt(),
        }
    }

    pub fn has_neutral(&self) -> bool {
        matches!(self, VoltageSystem::FourWire400)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Busbar voltage per phase, expressed like [`VoltageSystem::phase_voltage_v`].
    /// Unset means the nominal phase voltage of the chosen system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage_v: Option<f64>,
    #[serde(default = "default_transformer_kva")]
    pub transformer_kva: f64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            voltage_v: None,
            transformer_kva: default_transformer_kva(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AllocationOptions {
    #[serde(default)]
    pub policy: AllocationPolicy,
    /// Pinned split applied to every node without its own override.
    #[serde(default)]
    pub manual_split: Option<PhaseSplit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_tolerance_v")]
    pub tolerance_v: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tolerance_v: default_tolerance_v(),
        }
    }
}

/// Everything the caller decides per calculation besides the network itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationOptions {
    #[serde(default)]
    pub scenario: Scenario,
    #[serde(default)]
    pub season: Season,
    #[serde(default)]
    pub voltage_system: VoltageSystem,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default = "default_diversity_pct")]
    pub load_diversity_pct: f64,
    #[serde(default = "default_diversity_pct")]
    pub production_diversity_pct: f64,
    #[serde(default = "default_production_factor")]
    pub production_factor: f64,
    #[serde(default)]
    pub allocation: AllocationOptions,
    #[serde(default = "default_voltage_band_pct")]
    pub voltage_band_pct: f64,
    #[serde(default = "default_cable_drop_limit_pct")]
    pub cable_drop_limit_pct: f64,
    #[serde(default)]
    pub solver: SolverSettings,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            scenario: Scenario::default(),
            season: Season::default(),
            voltage_system: VoltageSystem::default(),
            source: SourceConfig::default(),
            load_diversity_pct: default_diversity_pct(),
            production_diversity_pct: default_diversity_pct(),
            production_factor: default_production_factor(),
            allocation: AllocationOptions::default(),
            voltage_band_pct: default_voltage_band_pct(),
            cable_drop_limit_pct: default_cable_drop_limit_pct(),
            solver: SolverSettings::default(),
        }
    }
}

impl SimulationOptions {
    pub fn validate(&self) -> Result<()> {
        if self.load_diversity_pct < 0.0 || self.production_diversity_pct < 0.0 {
            return Err(invalid("diversity percentages cannot be negative"));
        }
        if !(0.0..=1.0).contains(&self.production_factor) {
            return Err(invalid("production factor must lie within 0..=1"));
        }
        if !(self.voltage_band_pct > 0.0) {
            return Err(invalid("voltage band must be positive"));
        }
        if let Some(voltage) = self.source.voltage_v {
            let (low, high) = self.voltage_band_v();
            if !(low..=high).contains(&voltage) {
                return Err(invalid(&format!(
                    "source voltage {voltage} V lies outside the {low:.1}..{high:.1} V band of {:?}",
                    self.voltage_system
                )));
            }
        }
        if self.solver.max_iterations == 0 {
            return Err(invalid("solver needs at least one iteration"));
        }
        if !(self.solver.tolerance_v > 0.0) {
            return Err(invalid("solver tolerance must be positive"));
        }
        Ok(())
    }

    pub fn nominal_phase_voltage_v(&self) -> f64 {
        self.voltage_system.phase_voltage_v()
    }

    /// Busbar phase voltage, falling back to the nominal one.
    pub fn source_voltage_v(&self) -> f64 {
        self.source
            .voltage_v
            .unwrap_or_else(|| self.nominal_phase_voltage_v())
    }

    pub fn load_diversity(&self) -> f64 {
        self.load_diversity_pct / 100.0
    }

    /// Multiplier turning installed production into simulated production.
    pub fn production_multiplier(&self) -> f64 {
        self.production_diversity_pct / 100.0 * self.production_factor
    }

    /// Voltage-quality band around the nominal phase voltage.
    pub fn voltage_band_v(&self) -> (f64, f64) {
        let nominal = self.nominal_phase_voltage_v();
        let half = nominal * self.voltage_band_pct / 100.0;
        (nominal - half, nominal + half)
    }
}

fn invalid(reason: &str) -> CalcEngineError {
    CalcEngineError::InvalidOptions(reason.to_owned())
}
