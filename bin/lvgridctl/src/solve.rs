//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Load flow and cable check commands."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{bail, Result};
use clap::Args;
use lvgrid_calc_engine::{
    analyze_with_topology,
    cable_check::CableCheckReport,
    compensator::CompensatorResult,
    load_flow::{solve, CalculationResult},
    model::Network,
    regulator::RegulatorResult,
    topology::TopologyIndex,
};
use lvgrid_common::AppConfig;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::project::{Study, StudyArgs};
use crate::report::{ReportKind, ReportWriter};

#[derive(Debug, Args)]
pub struct SolveArgs {
    #[command(flatten)]
    pub study: StudyArgs,
}

#[derive(Debug, Args)]
pub struct CheckCablesArgs {
    #[command(flatten)]
    pub study: StudyArgs,
    /// Exit with an error when at least one cable is flagged.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub fail_on_issues: bool,
}

#[derive(Debug, Serialize)]
struct DeviceReport<'a> {
    regulators: &'a [RegulatorResult],
    compensators: &'a [CompensatorResult],
}

pub fn run_solve(args: &SolveArgs, config: &AppConfig) -> Result<()> {
    let study = args.study.prepare(config)?;
    let network = &study.project.network;
    let topology = TopologyIndex::build(network)?;
    let result = solve(network, &topology, &study.project.devices, &study.options)?;

    let writer = ReportWriter::for_study(&study);
    let (path, json) = writer.write(ReportKind::LoadFlow, &result)?;
    if !study.project.devices.is_empty() {
        writer.write(
            ReportKind::Devices,
            &DeviceReport {
                regulators: &result.regulators,
                compensators: &result.compensators,
            },
        )?;
    }

    if study.json {
        println!("{json}");
    } else {
        print_load_flow(network, &result);
        println!("Report: {}", path.display());
    }
    Ok(())
}

pub fn run_check_cables(args: &CheckCablesArgs, config: &AppConfig) -> Result<()> {
    let study = args.study.prepare(config)?;
    let network = &study.project.network;
    let topology = TopologyIndex::build(network)?;
    let summary =
        analyze_with_topology(network, &topology, &study.project.devices, &study.options)?;

    let writer = ReportWriter::for_study(&study);
    writer.write(ReportKind::LoadFlow, &summary.load_flow)?;
    let (path, json) = writer.write(ReportKind::CableCheck, &summary.cable_check)?;

    if study.json {
        println!("{json}");
    } else {
        print_cable_check(&summary.cable_check, &study);
        println!("Report: {}", path.display());
    }

    if args.fail_on_issues && !summary.cable_check.is_ok() {
        bail!(
            "{} cable(s) exceed their ampacity or voltage drop limit",
            summary.cable_check.undersized.len()
        );
    }
    Ok(())
}

pub(crate) fn node_label(network: &Network, id: Uuid) -> String {
    network
        .find_node(id)
        .filter(|node| !node.name.is_empty())
        .map(|node| node.name.clone())
        .unwrap_or_else(|| id.to_string())
}

fn print_load_flow(network: &Network, result: &CalculationResult) {
    let convergence = &result.convergence;
    if convergence.is_converged() {
        println!(
            "Scenario {:?}: converged after {} iteration(s)",
            result.scenario, convergence.iterations
        );
    } else {
        warn!(
            iterations = convergence.iterations,
            max_change_v = convergence.max_voltage_change_v,
            "load flow did not converge"
        );
        println!(
            "Scenario {:?}: NOT converged after {} iteration(s), last change {:.4} V",
            result.scenario, convergence.iterations, convergence.max_voltage_change_v
        );
    }

    let busbar = &result.busbar;
    println!(
        "Busbar: {:.1} kVA, transformer loading {:.1}%{}",
        busbar.total_kva,
        busbar.transformer_loading_pct,
        if busbar.transformer_overloaded {
            " (OVERLOADED)"
        } else {
            ""
        }
    );

    let (low, high) = result.voltage_band_v;
    let (min_v, max_v) = result
        .nodes
        .iter()
        .flat_map(|node| node.voltages_v.iter().copied())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
            (lo.min(v), hi.max(v))
        });
    if result.nodes.is_empty() {
        println!("No node solved");
    } else {
        println!(
            "Voltages: {:.2} V .. {:.2} V (band {:.2} V .. {:.2} V)",
            min_v, max_v, low, high
        );
    }
    println!(
        "Losses: {:.1} W, max neutral current {:.1} A",
        result.total_losses_w,
        result.max_neutral_current_a()
    );

    let out_of_band: Vec<String> = result
        .non_compliant_nodes()
        .map(|node| {
            format!(
                "{} [{:.1} / {:.1} / {:.1} V]",
                node_label(network, node.node_id),
                node.voltages_v[0],
                node.voltages_v[1],
                node.voltages_v[2]
            )
        })
        .collect();
    if out_of_band.is_empty() {
        println!("All nodes within band");
    } else {
        println!("Out of band nodes ({}):", out_of_band.len());
        for line in out_of_band {
            println!("  {line}");
        }
    }
    if !result.unreachable_nodes.is_empty() {
        println!(
            "Unreachable nodes: {}",
            result
                .unreachable_nodes
                .iter()
                .map(|id| node_label(network, *id))
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    for regulator in &result.regulators {
        println!(
            "Regulator at {}: {:?}, coefficients {:+.1} / {:+.1} / {:+.1} %",
            node_label(network, regulator.node_id),
            regulator.state,
            regulator.coefficients_pct[0],
            regulator.coefficients_pct[1],
            regulator.coefficients_pct[2]
        );
    }
    for compensator in &result.compensators {
        println!(
            "Compensator at {}: neutral {:.1} A -> {:.1} A",
            node_label(network, compensator.node_id),
            compensator.neutral_current_before_a,
            compensator.neutral_current_after_a
        );
    }
}

fn print_cable_check(report: &CableCheckReport, study: &Study) {
    if report.is_ok() {
        println!(
            "All {} cable(s) within ampacity and {:.1}% drop limit",
            study.project.network.cables.len(),
            study.options.cable_drop_limit_pct
        );
        return;
    }
    println!("Undersized cables ({}):", report.undersized.len());
    for issue in &report.undersized {
        let name = if issue.cable_name.is_empty() {
            issue.cable_id.to_string()
        } else {
            issue.cable_name.clone()
        };
        println!("  {}: {}", name, issue.reasons.join("; "));
    }
}
