//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "test"
//! ems_scope: "code"
//! ems_description: "Configuration parsing and discovery tests."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::env;
use std::fs;

use lvgrid_calc_engine::{
    options::{Scenario, VoltageSystem},
    placement::RegulatorSiteStrategy,
    thermal::Season,
};
use lvgrid_common::{AppConfig, LogFormat};

#[test]
fn empty_config_uses_engine_defaults() {
    let config: AppConfig = "".parse().unwrap();
    assert_eq!(config.calculation.scenario, Scenario::Consumption);
    assert_eq!(config.calculation.source.voltage_v, None);
    assert_eq!(config.calculation.source_voltage_v(), 230.0);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert_eq!(
        config.placement.regulator.strategy,
        RegulatorSiteStrategy::DownstreamCompliance
    );
    assert_eq!(config.reports.directory.to_str(), Some("target/reports"));
}

#[test]
fn sections_override_defaults() {
    let config: AppConfig = r#"
        [logging]
        format = "pretty"
        file_prefix = "study"

        [calculation]
        scenario = "mixed"
        season = "winter"
        voltage_system = "three_wire230"
        load_diversity_pct = 80.0

        [calculation.source]
        voltage_v = 135.0

        [placement.regulator]
        strategy = "imbalance_impedance"
        max_spread_v = 6.0

        [reports]
        directory = "out"
    "#
    .parse()
    .unwrap();

    assert_eq!(config.logging.format, LogFormat::Pretty);
    assert_eq!(config.logging.file_prefix.as_deref(), Some("study"));
    assert_eq!(config.calculation.scenario, Scenario::Mixed);
    assert_eq!(config.calculation.season, Season::Winter);
    assert_eq!(config.calculation.voltage_system, VoltageSystem::ThreeWire230);
    assert_eq!(config.calculation.load_diversity_pct, 80.0);
    assert_eq!(config.calculation.source.voltage_v, Some(135.0));
    assert_eq!(config.calculation.source.transformer_kva, 160.0);
    assert_eq!(
        config.placement.regulator.strategy,
        RegulatorSiteStrategy::ImbalanceImpedance
    );
    assert_eq!(config.placement.regulator.max_spread_v, 6.0);
    assert_eq!(config.reports.directory.to_str(), Some("out"));
}

#[test]
fn invalid_calculation_section_is_rejected() {
    let err = "[calculation]\nproduction_factor = 2.0\n"
        .parse::<AppConfig>()
        .expect_err("production factor above one");
    assert!(format!("{err:#}").contains("production factor"));
}

#[test]
fn inverted_placement_window_is_rejected() {
    let err = r#"
        [placement.compensator]
        min_normalized_impedance = 0.9
        max_normalized_impedance = 0.1
    "#
    .parse::<AppConfig>()
    .expect_err("inverted window");
    assert!(err.to_string().contains("compensator impedance window"));
}

#[test]
fn discovery_prefers_env_override_then_candidates() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("missing.toml");
    let second = dir.path().join("lvgrid.toml");
    fs::write(&second, "[calculation]\nscenario = \"production\"\n").unwrap();

    env::remove_var(AppConfig::ENV_CONFIG_PATH);
    let loaded = AppConfig::load_with_source(&[&first, &second]).unwrap();
    assert_eq!(loaded.source, second);
    assert_eq!(loaded.config.calculation.scenario, Scenario::Production);

    let overridden = dir.path().join("override.toml");
    fs::write(&overridden, "[calculation]\nseason = \"winter\"\n").unwrap();
    env::set_var(AppConfig::ENV_CONFIG_PATH, &overridden);
    let loaded = AppConfig::load_with_source(&[&second]).unwrap();
    env::remove_var(AppConfig::ENV_CONFIG_PATH);
    assert_eq!(loaded.source, overridden);
    assert_eq!(loaded.config.calculation.season, Season::Winter);

    let err = AppConfig::load(&[&first]).expect_err("nothing to load");
    assert!(err.to_string().contains("no configuration files found"));
}
