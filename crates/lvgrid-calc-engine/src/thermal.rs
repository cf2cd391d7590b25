//! ---
//! ems_section: "08-energy-models-optimization"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Operating-temperature correction of conductor resistance."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Conductor resistance is catalogued at 20 °C. The operating temperature is
//! the ambient temperature for the installation method and season plus a
//! load-heating term growing with the square of the current ratio.
use serde::{Deserialize, Serialize};

use crate::model::{CableMaterial, InstallationMethod};

pub const REFERENCE_TEMPERATURE_C: f64 = 20.0;
/// Conductor temperature rise above ambient when carrying its rated current.
pub const RATED_TEMPERATURE_RISE_K: f64 = 50.0;
/// Overload extrapolation stops at twice the rated current.
pub const MAX_CURRENT_RATIO: f64 = 2.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Season {
    #[default]
    Summer,
    Winter,
}

impl std::str::FromStr for Season {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summer" => Ok(Season::Summer),
            "winter" => Ok(Season::Winter),
            other => Err(format!("unknown season: {}", other)),
        }
    }
}

pub fn ambient_temperature_c(season: Season, installation: InstallationMethod) -> f64 {
    match (installation, season) {
        (InstallationMethod::Aerial, Season::Summer) => 35.0,
        (InstallationMethod::Aerial, Season::Winter) => 10.0,
        (InstallationMethod::Underground, Season::Summer) => 20.0,
        (InstallationMethod::Underground, Season::Winter) => 10.0,
    }
}

/// Temperature coefficient of resistance per kelvin, if catalogued.
pub fn temperature_coefficient(material: CableMaterial) -> Option<f64> {
    match material {
        CableMaterial::Copper => Some(0.00393),
        CableMaterial::Aluminium => Some(0.00403),
        CableMaterial::Almelec => Some(0.0036),
        CableMaterial::Unknown => None,
    }
}

pub fn conductor_temperature_c(
    season: Season,
    installation: InstallationMethod,
    current_a: f64,
    rated_current_a: f64,
) -> f64 {
    let ratio = if rated_current_a > 0.0 {
        (current_a.abs() / rated_current_a).min(MAX_CURRENT_RATIO)
    } else {
        0.0
    };
    ambient_temperature_c(season, installation) + RATED_TEMPERATURE_RISE_K * ratio * ratio
}

/// Multiplicative factor applied to the 20 °C resistance.
pub fn correction_factor(
    season: Season,
    installation: InstallationMethod,
    material: CableMaterial,
    current_a: f64,
    rated_current_a: f64,
) -> f64 {
    match temperature_coefficient(material) {
        Some(alpha) => {
            let temperature = conductor_temperature_c(season, installation, current_a, rated_current_a);
            factor_at(alpha, temperature)
        }
        None => 1.0,
    }
}

pub fn factor_at(alpha: f64, temperature_c: f64) -> f64 {
    1.0 + alpha * (temperature_c - REFERENCE_TEMPERATURE_C)
}
