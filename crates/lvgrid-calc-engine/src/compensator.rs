//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Neutral current compensator model."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    devices::DeviceAdvisory,
    model::{Phase, PhaseVector},
    options::VoltageSystem,
};

/// Impedances below this floor give non-physical compensation magnitudes.
pub const MIN_COMPENSATOR_IMPEDANCE_OHM: f64 = 0.15;
const CURRENT_EPSILON_A: f64 = 1e-9;

fn default_enabled() -> bool {
    true
}

fn default_max_power_kva() -> f64 {
    30.0
}

fn default_tolerance_a() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NeutralCompensatorConfig {
    pub id: Uuid,
    pub node_id: Uuid,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_power_kva")]
    pub max_power_kva: f64,
    /// Residual neutral current the device leaves untouched.
    #[serde(default = "default_tolerance_a")]
    pub tolerance_a: f64,
    pub phase_impedance_ohm: f64,
    pub neutral_impedance_ohm: f64,
}

impl NeutralCompensatorConfig {
    pub fn new(id: Uuid, node_id: Uuid, phase_impedance_ohm: f64, neutral_impedance_ohm: f64) -> Self {
        Self {
            id,
            node_id,
            enabled: true,
            max_power_kva: default_max_power_kva(),
            tolerance_a: default_tolerance_a(),
            phase_impedance_ohm,
            neutral_impedance_ohm,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompensatorResult {
    pub device_id: Uuid,
    pub node_id: Uuid,
    pub enabled: bool,
    pub neutral_current_before_a: f64,
    pub neutral_current_after_a: f64,
    pub absorbed_current_a: f64,
    pub max_current_a: f64,
    pub power_limited: bool,
    pub impedance_clamped: bool,
    pub voltages_before_v: PhaseVector,
    pub voltages_after_v: PhaseVector,
    pub advisories: Vec<DeviceAdvisory>,
}

impl CompensatorResult {
    /// Result for a device whose node cannot be reached from the source.
    pub fn unreachable(config: &NeutralCompensatorConfig, voltage_system: VoltageSystem) -> Self {
        Self {
            device_id: config.id,
            node_id: config.node_id,
            enabled: config.enabled,
            neutral_current_before_a: 0.0,
            neutral_current_after_a: 0.0,
            absorbed_current_a: 0.0,
            max_current_a: max_current_a(config.max_power_kva, voltage_system.line_voltage_v()),
            power_limited: false,
            impedance_clamped: false,
            voltages_before_v: PhaseVector::zeros(),
            voltages_after_v: PhaseVector::zeros(),
            advisories: vec![DeviceAdvisory::NodeUnreachable],
        }
    }
}

/// Current ceiling derived from the rated power and line voltage.
pub fn max_current_a(max_power_kva: f64, line_voltage_v: f64) -> f64 {
    if line_voltage_v <= 0.0 {
        return 0.0;
    }
    max_power_kva.max(0.0) * 1000.0 / (3f64.sqrt() * line_voltage_v)
}

/// Phasor sum of the three phase quantities at their nominal angles.
pub fn phasor_sum(values: &PhaseVector) -> Complex64 {
    Phase::ALL
        .iter()
        .map(|p| Complex64::from_polar(values[p.index()], p.angle()))
        .sum()
}

/// Zero-sequence component of three phase voltage magnitudes.
pub fn zero_sequence_voltage(voltages: &PhaseVector) -> Complex64 {
    phasor_sum(voltages) / 3.0
}

fn clamp_impedance(value: f64) -> (f64, bool) {
    if value.is_finite() && value >= MIN_COMPENSATOR_IMPEDANCE_OHM {
        (value, false)
    } else {
        (MIN_COMPENSATOR_IMPEDANCE_OHM, true)
    }
}

/// Preconditions the caller is expected to verify before installing a compensator.
pub fn check_eligibility(
    voltage_system: VoltageSystem,
    neutral_current_a: f64,
    tolerance_a: f64,
    declared_imbalance: bool,
) -> Vec<DeviceAdvisory> {
    let mut advisories = Vec::new();
    if !voltage_system.has_neutral() {
        advisories.push(DeviceAdvisory::ThreeWireSupply);
    }
    if neutral_current_a <= tolerance_a && !declared_imbalance {
        advisories.push(DeviceAdvisory::NoImbalance);
    }
    advisories
}

/// Neutral current a device takes up, before any voltage is considered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Absorption {
    pub absorbed_a: f64,
    pub max_current_a: f64,
    pub power_limited: bool,
    pub impedance_clamped: bool,
}

/// Share of `neutral_current_a` diverted into the device, `Zn / (Zn + Zph / 3)`,
/// capped by the rated current.
pub fn absorption(
    config: &NeutralCompensatorConfig,
    neutral_current_a: f64,
    voltage_system: VoltageSystem,
) -> Absorption {
    let (z_phase, phase_clamped) = clamp_impedance(config.phase_impedance_ohm);
    let (z_neutral, neutral_clamped) = clamp_impedance(config.neutral_impedance_ohm);
    let max_current = max_current_a(config.max_power_kva, voltage_system.line_voltage_v());

    let diverted = if !config.enabled || neutral_current_a <= config.tolerance_a.max(0.0) {
        0.0
    } else {
        neutral_current_a * z_neutral / (z_neutral + z_phase / 3.0)
    };
    Absorption {
        absorbed_a: diverted.min(max_current).max(0.0),
        max_current_a: max_current,
        power_limited: diverted > max_current,
        impedance_clamped: phase_clamped || neutral_clamped,
    }
}

/// Computes the absorbed neutral current and the rebalanced phase voltages.
pub fn evaluate(
    config: &NeutralCompensatorConfig,
    voltages_before_v: PhaseVector,
    neutral_current: Complex64,
    voltage_system: VoltageSystem,
    declared_imbalance: bool,
) -> CompensatorResult {
    let before = neutral_current.norm();
    let Absorption {
        absorbed_a: absorbed,
        max_current_a: max_current,
        power_limited,
        impedance_clamped,
    } = absorption(config, before, voltage_system);
    let ratio = if before > CURRENT_EPSILON_A {
        absorbed / before
    } else {
        0.0
    };

    let v0 = zero_sequence_voltage(&voltages_before_v);
    let mut voltages_after_v = voltages_before_v;
    if ratio > 0.0 {
        for phase in Phase::ALL {
            let i = phase.index();
            let phasor = Complex64::from_polar(voltages_before_v[i], phase.angle());
            voltages_after_v[i] = (phasor - v0 * ratio).norm();
        }
    }

    let mut advisories =
        check_eligibility(voltage_system, before, config.tolerance_a, declared_imbalance);
    if impedance_clamped {
        advisories.push(DeviceAdvisory::ImpedanceClamped);
    }
    if power_limited {
        advisories.push(DeviceAdvisory::PowerLimited);
    }

    CompensatorResult {
        device_id: config.id,
        node_id: config.node_id,
        enabled: config.enabled,
        neutral_current_before_a: before,
        neutral_current_after_a: before - absorbed,
        absorbed_current_a: absorbed,
        max_current_a: max_current,
        power_limited,
        impedance_clamped,
        voltages_before_v,
        voltages_after_v,
        advisories,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NeutralCompensatorConfig {
        NeutralCompensatorConfig::new(Uuid::new_v4(), Uuid::new_v4(), 0.3, 0.6)
    }

    #[test]
    fn balanced_phasors_cancel() {
        let sum = phasor_sum(&PhaseVector::repeat(40.0));
        assert!(sum.norm() < 1e-9);
        let unbalanced = phasor_sum(&PhaseVector::new(40.0, 0.0, 0.0));
        assert!((unbalanced.norm() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn absorbs_share_set_by_impedances() {
        let cfg = config();
        let voltages = PhaseVector::new(215.0, 228.0, 230.0);
        let result = evaluate(
            &cfg,
            voltages,
            Complex64::new(20.0, 0.0),
            VoltageSystem::FourWire400,
            false,
        );
        let expected = 20.0 * 0.6 / (0.6 + 0.1);
        assert!((result.absorbed_current_a - expected).abs() < 1e-9);
        assert!(result.neutral_current_after_a < result.neutral_current_before_a);
        assert!(!result.power_limited);
        assert!(result.advisories.is_empty());
        let spread_before = voltages.max() - voltages.min();
        let spread_after = result.voltages_after_v.max() - result.voltages_after_v.min();
        assert!(spread_after < spread_before);
    }

    #[test]
    fn absorption_matches_evaluated_device() {
        let cfg = config();
        let taken = absorption(&cfg, 20.0, VoltageSystem::FourWire400);
        let result = evaluate(
            &cfg,
            PhaseVector::repeat(230.0),
            Complex64::new(0.0, 20.0),
            VoltageSystem::FourWire400,
            false,
        );
        assert_eq!(taken.absorbed_a, result.absorbed_current_a);
        assert_eq!(taken.power_limited, result.power_limited);
    }

    #[test]
    fn rated_power_caps_absorption() {
        let mut cfg = config();
        cfg.max_power_kva = 5.0;
        let result = evaluate(
            &cfg,
            PhaseVector::new(210.0, 230.0, 232.0),
            Complex64::new(60.0, 0.0),
            VoltageSystem::FourWire400,
            false,
        );
        let cap = 5000.0 / (3f64.sqrt() * 400.0);
        assert!((result.absorbed_current_a - cap).abs() < 1e-9);
        assert!(result.power_limited);
        assert!(result.advisories.contains(&DeviceAdvisory::PowerLimited));
    }

    #[test]
    fn low_impedances_are_clamped_and_flagged() {
        let mut cfg = config();
        cfg.phase_impedance_ohm = 0.01;
        cfg.neutral_impedance_ohm = 0.0;
        let result = evaluate(
            &cfg,
            PhaseVector::repeat(230.0),
            Complex64::new(10.0, 0.0),
            VoltageSystem::FourWire400,
            false,
        );
        assert!(result.impedance_clamped);
        let expected = 10.0 * 0.15 / (0.15 + 0.05);
        assert!((result.absorbed_current_a - expected).abs() < 1e-9);
    }

    #[test]
    fn below_tolerance_nothing_is_absorbed() {
        let cfg = config();
        let voltages = PhaseVector::new(229.0, 230.0, 230.0);
        let result = evaluate(
            &cfg,
            voltages,
            Complex64::new(0.5, 0.0),
            VoltageSystem::FourWire400,
            false,
        );
        assert_eq!(result.absorbed_current_a, 0.0);
        assert_eq!(result.voltages_after_v, voltages);
        assert!(result.advisories.contains(&DeviceAdvisory::NoImbalance));
    }

    #[test]
    fn three_wire_supply_is_flagged_but_computed() {
        let cfg = config();
        let result = evaluate(
            &cfg,
            PhaseVector::new(120.0, 133.0, 133.0),
            Complex64::new(12.0, 0.0),
            VoltageSystem::ThreeWire230,
            true,
        );
        assert!(result.advisories.contains(&DeviceAdvisory::ThreeWireSupply));
        assert!(result.absorbed_current_a > 0.0);
    }

    #[test]
    fn disabled_device_leaves_network_untouched() {
        let mut cfg = config();
        cfg.enabled = false;
        let voltages = PhaseVector::new(210.0, 230.0, 232.0);
        let result = evaluate(
            &cfg,
            voltages,
            Complex64::new(30.0, 0.0),
            VoltageSystem::FourWire400,
            false,
        );
        assert_eq!(result.absorbed_current_a, 0.0);
        assert_eq!(result.neutral_current_after_a, result.neutral_current_before_a);
        assert_eq!(result.voltages_after_v, voltages);
    }
}
