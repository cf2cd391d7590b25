//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Step voltage regulator model and operating state machine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The regulator compares each phase's input voltage deviation against four
//! ordered thresholds and applies the percentage of the band it falls into.
//!
//! Boundary rule: a deviation exactly on a threshold belongs to the band on
//! the side away from the deadband, so `d == low` boosts with the `low`
//! coefficient and `d == high` bucks with the `high` coefficient.
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    devices::DeviceAdvisory,
    model::{Phase, PhaseVector},
};

fn default_enabled() -> bool {
    true
}

fn default_max_kva() -> f64 {
    85.0
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RegulatorState {
    #[default]
    Inactive,
    Active,
    Fault,
    Maintenance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RegulatorEvent {
    Enable,
    Disable,
    FaultRaised,
    FaultCleared,
    MaintenanceStarted,
    MaintenanceEnded,
}

/// Fault and maintenance flags raised by the caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RegulatorSignals {
    #[serde(default)]
    pub fault: bool,
    #[serde(default)]
    pub maintenance: bool,
}

impl RegulatorState {
    /// Fault outranks maintenance, which outranks the enabled flag.
    pub fn from_signals(enabled: bool, signals: RegulatorSignals) -> Self {
        if signals.fault {
            RegulatorState::Fault
        } else if signals.maintenance {
            RegulatorState::Maintenance
        } else if enabled {
            RegulatorState::Active
        } else {
            RegulatorState::Inactive
        }
    }

    /// Applies one event. Clearing a fault or ending maintenance returns to
    /// `Inactive`; the caller re-enables explicitly.
    ///
    /// Callers that keep a device between solves feed events through
    /// [`StepRegulatorConfig::apply_event`] rather than editing the flags.
    pub fn transition(self, event: RegulatorEvent) -> Self {
        use RegulatorEvent::*;
        use RegulatorState::*;
        match (self, event) {
            (_, FaultRaised) => Fault,
            (Fault, FaultCleared) => Inactive,
            (Fault, _) => Fault,
            (_, MaintenanceStarted) => Maintenance,
            (Maintenance, MaintenanceEnded) => Inactive,
            (Maintenance, _) => Maintenance,
            (_, Enable) => Active,
            (_, Disable) => Inactive,
            (state, FaultCleared) | (state, MaintenanceEnded) => state,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RegulatorState::Active)
    }
}

/// Thresholds in volts of deviation from nominal phase voltage.
///
/// Valid only when `deep_low < low < 0 < high < deep_high`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RegulatorThresholds {
    pub deep_low: f64,
    pub low: f64,
    pub high: f64,
    pub deep_high: f64,
}

impl Default for RegulatorThresholds {
    fn default() -> Self {
        Self {
            deep_low: -16.0,
            low: -8.0,
            high: 8.0,
            deep_high: 16.0,
        }
    }
}

impl RegulatorThresholds {
    pub fn is_ordered(&self) -> bool {
        self.deep_low < self.low && self.low < 0.0 && 0.0 < self.high && self.high < self.deep_high
    }
}

/// Percentage applied in each threshold band.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RegulatorCoefficients {
    pub deep_low: f64,
    pub low: f64,
    pub high: f64,
    pub deep_high: f64,
}

impl Default for RegulatorCoefficients {
    fn default() -> Self {
        Self {
            deep_low: 7.0,
            low: 3.5,
            high: -3.5,
            deep_high: -7.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RegulatorMode {
    #[default]
    Automatic,
    Manual { coefficients_pct: [f64; 3] },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRegulatorConfig {
    pub id: Uuid,
    pub node_id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub signals: RegulatorSignals,
    #[serde(default)]
    pub mode: RegulatorMode,
    #[serde(default)]
    pub thresholds: RegulatorThresholds,
    #[serde(default)]
    pub coefficients: RegulatorCoefficients,
    #[serde(default = "default_max_kva")]
    pub max_load_kva: f64,
    #[serde(default = "default_max_kva")]
    pub max_production_kva: f64,
}

impl StepRegulatorConfig {
    pub fn new(id: Uuid, node_id: Uuid) -> Self {
        Self {
            id,
            node_id,
            enabled: true,
            signals: RegulatorSignals::default(),
            mode: RegulatorMode::default(),
            thresholds: RegulatorThresholds::default(),
            coefficients: RegulatorCoefficients::default(),
            max_load_kva: default_max_kva(),
            max_production_kva: default_max_kva(),
        }
    }

    pub fn state(&self) -> RegulatorState {
        RegulatorState::from_signals(self.enabled, self.signals)
    }

    /// Moves the device to the state reached by `event` and rewrites the
    /// flags so the next solve reads that state back.
    pub fn apply_event(&mut self, event: RegulatorEvent) -> RegulatorState {
        let next = self.state().transition(event);
        self.enabled = next == RegulatorState::Active;
        self.signals = RegulatorSignals {
            fault: next == RegulatorState::Fault,
            maintenance: next == RegulatorState::Maintenance,
        };
        next
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegulatorResult {
    pub device_id: Uuid,
    pub node_id: Uuid,
    pub state: RegulatorState,
    pub input_v: PhaseVector,
    pub output_v: PhaseVector,
    pub coefficients_pct: PhaseVector,
    pub downstream_load_kva: f64,
    pub downstream_production_kva: f64,
    pub power_limit_reached: bool,
    pub advisories: Vec<DeviceAdvisory>,
}

impl RegulatorResult {
    /// Result for a device whose node cannot be reached from the source.
    pub fn unreachable(config: &StepRegulatorConfig) -> Self {
        Self {
            device_id: config.id,
            node_id: config.node_id,
            state: config.state(),
            input_v: PhaseVector::zeros(),
            output_v: PhaseVector::zeros(),
            coefficients_pct: PhaseVector::zeros(),
            downstream_load_kva: 0.0,
            downstream_production_kva: 0.0,
            power_limit_reached: false,
            advisories: vec![DeviceAdvisory::NodeUnreachable],
        }
    }
}

/// Band selection for a single deviation, see the module docs for the boundary rule.
pub fn select_coefficient(
    deviation_v: f64,
    thresholds: &RegulatorThresholds,
    coefficients: &RegulatorCoefficients,
) -> f64 {
    if deviation_v <= thresholds.deep_low {
        coefficients.deep_low
    } else if deviation_v <= thresholds.low {
        coefficients.low
    } else if deviation_v < thresholds.high {
        0.0
    } else if deviation_v < thresholds.deep_high {
        coefficients.high
    } else {
        coefficients.deep_high
    }
}

pub fn apply_coefficient(input_v: f64, coefficient_pct: f64) -> f64 {
    input_v * (1.0 + coefficient_pct / 100.0)
}

/// Per-phase coefficients the device applies for the measured input voltages.
pub fn coefficients_for(
    config: &StepRegulatorConfig,
    input_v: &PhaseVector,
    nominal_v: f64,
) -> PhaseVector {
    if !config.state().is_active() {
        return PhaseVector::zeros();
    }
    match config.mode {
        RegulatorMode::Manual { coefficients_pct } => PhaseVector::from(coefficients_pct),
        RegulatorMode::Automatic => {
            if !config.thresholds.is_ordered() {
                return PhaseVector::zeros();
            }
            let mut coefficients = PhaseVector::zeros();
            for phase in Phase::ALL {
                let deviation = input_v[phase.index()] - nominal_v;
                coefficients[phase.index()] =
                    select_coefficient(deviation, &config.thresholds, &config.coefficients);
            }
            coefficients
        }
    }
}

/// Evaluates the device for one set of input voltages.
pub fn evaluate(
    config: &StepRegulatorConfig,
    input_v: PhaseVector,
    nominal_v: f64,
    downstream_load_kva: f64,
    downstream_production_kva: f64,
) -> RegulatorResult {
    let state = config.state();
    let coefficients = coefficients_for(config, &input_v, nominal_v);
    let output_v = input_v.zip_map(&coefficients, apply_coefficient);

    let power_limit_reached = downstream_load_kva > config.max_load_kva
        || downstream_production_kva > config.max_production_kva;
    let mut advisories = Vec::new();
    if matches!(config.mode, RegulatorMode::Automatic) && !config.thresholds.is_ordered() {
        advisories.push(DeviceAdvisory::InvalidThresholds);
    }
    if power_limit_reached {
        advisories.push(DeviceAdvisory::PowerLimitReached);
    }

    RegulatorResult {
        device_id: config.id,
        node_id: config.node_id,
        state,
        input_v,
        output_v,
        coefficients_pct: coefficients,
        downstream_load_kva,
        downstream_production_kva,
        power_limit_reached,
        advisories,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StepRegulatorConfig {
        StepRegulatorConfig::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn bands_follow_ordered_scale() {
        let t = RegulatorThresholds::default();
        let c = RegulatorCoefficients::default();
        assert_eq!(select_coefficient(-30.0, &t, &c), 7.0);
        assert_eq!(select_coefficient(-10.0, &t, &c), 3.5);
        assert_eq!(select_coefficient(0.0, &t, &c), 0.0);
        assert_eq!(select_coefficient(10.0, &t, &c), -3.5);
        assert_eq!(select_coefficient(30.0, &t, &c), -7.0);
    }

    #[test]
    fn boundaries_belong_to_the_outer_band() {
        let t = RegulatorThresholds::default();
        let c = RegulatorCoefficients::default();
        assert_eq!(select_coefficient(-16.0, &t, &c), 7.0);
        assert_eq!(select_coefficient(-8.0, &t, &c), 3.5);
        assert_eq!(select_coefficient(8.0, &t, &c), -3.5);
        assert_eq!(select_coefficient(16.0, &t, &c), -7.0);
        assert_eq!(select_coefficient(-7.999, &t, &c), 0.0);
        assert_eq!(select_coefficient(7.999, &t, &c), 0.0);
    }

    #[test]
    fn input_exactly_on_threshold_boosts() {
        let cfg = config();
        let input = PhaseVector::new(222.0, 230.0, 246.0);
        let result = evaluate(&cfg, input, 230.0, 10.0, 0.0);
        assert_eq!(result.coefficients_pct, PhaseVector::new(3.5, 0.0, -7.0));
        assert!((result.output_v[0] - 222.0 * 1.035).abs() < 1e-9);
        assert_eq!(result.output_v[1], 230.0);
    }

    #[test]
    fn disabled_regulator_applies_nothing() {
        let mut cfg = config();
        cfg.enabled = false;
        let input = PhaseVector::new(200.0, 205.0, 260.0);
        let result = evaluate(&cfg, input, 230.0, 0.0, 0.0);
        assert_eq!(result.state, RegulatorState::Inactive);
        assert_eq!(result.coefficients_pct, PhaseVector::zeros());
        assert_eq!(result.output_v, input);
    }

    #[test]
    fn fault_signal_overrides_enabled_flag() {
        let mut cfg = config();
        cfg.signals.fault = true;
        assert_eq!(cfg.state(), RegulatorState::Fault);
        let result = evaluate(&cfg, PhaseVector::repeat(200.0), 230.0, 0.0, 0.0);
        assert_eq!(result.coefficients_pct, PhaseVector::zeros());
    }

    #[test]
    fn transitions() {
        use RegulatorEvent::*;
        let state = RegulatorState::Inactive.transition(Enable);
        assert_eq!(state, RegulatorState::Active);
        let state = state.transition(MaintenanceStarted);
        assert_eq!(state, RegulatorState::Maintenance);
        assert_eq!(state.transition(Enable), RegulatorState::Maintenance);
        let state = state.transition(FaultRaised);
        assert_eq!(state, RegulatorState::Fault);
        assert_eq!(state.transition(MaintenanceEnded), RegulatorState::Fault);
        assert_eq!(state.transition(FaultCleared), RegulatorState::Inactive);
        assert_eq!(
            RegulatorState::Active.transition(FaultCleared),
            RegulatorState::Active
        );
    }

    #[test]
    fn events_rewrite_the_flags_read_by_the_solver() {
        let mut cfg = config();
        assert_eq!(cfg.apply_event(RegulatorEvent::MaintenanceStarted), RegulatorState::Maintenance);
        assert!(cfg.signals.maintenance);
        assert_eq!(cfg.apply_event(RegulatorEvent::Enable), RegulatorState::Maintenance);
        assert_eq!(cfg.apply_event(RegulatorEvent::MaintenanceEnded), RegulatorState::Inactive);
        assert!(!cfg.enabled);
        assert_eq!(cfg.signals, RegulatorSignals::default());
        assert_eq!(cfg.apply_event(RegulatorEvent::Enable), RegulatorState::Active);
        assert_eq!(cfg.state(), RegulatorState::Active);
    }

    #[test]
    fn power_limit_is_advisory_only() {
        let cfg = config();
        let input = PhaseVector::repeat(210.0);
        let result = evaluate(&cfg, input, 230.0, 120.0, 0.0);
        assert!(result.power_limit_reached);
        assert!(result.advisories.contains(&DeviceAdvisory::PowerLimitReached));
        assert!((result.output_v[0] - 210.0 * 1.07).abs() < 1e-9);
    }

    #[test]
    fn misordered_thresholds_yield_zero_with_advisory() {
        let mut cfg = config();
        cfg.thresholds.low = 4.0;
        let result = evaluate(&cfg, PhaseVector::repeat(200.0), 230.0, 0.0, 0.0);
        assert_eq!(result.coefficients_pct, PhaseVector::zeros());
        assert!(result.advisories.contains(&DeviceAdvisory::InvalidThresholds));
    }

    #[test]
    fn manual_mode_ignores_voltage() {
        let mut cfg = config();
        cfg.mode = RegulatorMode::Manual {
            coefficients_pct: [2.0, 0.0, -2.0],
        };
        let result = evaluate(&cfg, PhaseVector::repeat(230.0), 230.0, 0.0, 0.0);
        assert_eq!(result.coefficients_pct, PhaseVector::new(2.0, 0.0, -2.0));
    }
}
