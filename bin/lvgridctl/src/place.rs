//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Placement search commands for compensators and regulators."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::Result;
use clap::{Args, Subcommand};
use lvgrid_calc_engine::{
    load_flow::solve,
    placement::{
        find_compensator_sites, find_regulator_sites, PlacementReport, RegulatorSiteStrategy,
    },
    topology::TopologyIndex,
};
use lvgrid_common::AppConfig;
use tracing::info;

use crate::project::StudyArgs;
use crate::report::{ReportKind, ReportWriter};
use crate::solve::node_label;

/// Number of candidates echoed in the text summary.
const SHOWN_CANDIDATES: usize = 5;

#[derive(Debug, Subcommand)]
pub enum PlaceCommand {
    /// Rank nodes for a neutral current compensator.
    Compensator(CompensatorArgs),
    /// Rank nodes for a step voltage regulator.
    Regulator(RegulatorArgs),
}

#[derive(Debug, Args)]
pub struct CompensatorArgs {
    #[command(flatten)]
    pub study: StudyArgs,
}

#[derive(Debug, Args)]
pub struct RegulatorArgs {
    #[command(flatten)]
    pub study: StudyArgs,
    /// Scoring strategy (downstream-compliance, imbalance-impedance).
    #[arg(long)]
    pub strategy: Option<RegulatorSiteStrategy>,
}

pub fn run(command: PlaceCommand, config: &AppConfig) -> Result<()> {
    match command {
        PlaceCommand::Compensator(args) => run_compensator(&args, config),
        PlaceCommand::Regulator(args) => run_regulator(&args, config),
    }
}

fn run_compensator(args: &CompensatorArgs, config: &AppConfig) -> Result<()> {
    let study = args.study.prepare(config)?;
    let network = &study.project.network;
    let topology = TopologyIndex::build(network)?;
    let baseline = solve(network, &topology, &study.project.devices, &study.options)?;
    let report = find_compensator_sites(
        network,
        &topology,
        &baseline,
        &config.placement.compensator,
    );
    info!(candidates = report.candidates.len(), "compensator search finished");

    let (path, json) =
        ReportWriter::for_study(&study).write(ReportKind::CompensatorPlacement, &report)?;
    if study.json {
        println!("{json}");
        return Ok(());
    }
    print_report("compensator", &report, |candidate| {
        format!(
            "{}: score {:.2}, neutral {:.1} A, normalized impedance {:.2}, {:.0} m",
            node_label(network, candidate.node_id),
            candidate.score,
            candidate.neutral_current_a,
            candidate.normalized_impedance,
            candidate.distance_m
        )
    });
    println!("Report: {}", path.display());
    Ok(())
}

fn run_regulator(args: &RegulatorArgs, config: &AppConfig) -> Result<()> {
    let study = args.study.prepare(config)?;
    let network = &study.project.network;
    let topology = TopologyIndex::build(network)?;
    let baseline = solve(network, &topology, &study.project.devices, &study.options)?;
    let mut criteria = config.placement.regulator.clone();
    if let Some(strategy) = args.strategy {
        criteria.strategy = strategy;
    }
    let report = find_regulator_sites(network, &topology, &baseline, &criteria);
    info!(
        strategy = ?criteria.strategy,
        candidates = report.candidates.len(),
        "regulator search finished"
    );

    let (path, json) =
        ReportWriter::for_study(&study).write(ReportKind::RegulatorPlacement, &report)?;
    if study.json {
        println!("{json}");
        return Ok(());
    }
    print_report("regulator", &report, |candidate| match criteria.strategy {
        RegulatorSiteStrategy::DownstreamCompliance => format!(
            "{}: recovers {}/{} out-of-band node(s), {:.0} m",
            node_label(network, candidate.node_id),
            candidate.recovered_downstream,
            candidate.out_of_band_downstream,
            candidate.distance_m
        ),
        RegulatorSiteStrategy::ImbalanceImpedance => format!(
            "{}: score {:.2}, spread {:.1} V, normalized impedance {:.2}",
            node_label(network, candidate.node_id),
            candidate.score,
            candidate.voltage_spread_v,
            candidate.normalized_impedance
        ),
    });
    println!("Report: {}", path.display());
    Ok(())
}

fn print_report<C>(
    device: &str,
    report: &PlacementReport<C>,
    describe: impl Fn(&C) -> String,
) {
    if let Some(reason) = report.no_result {
        println!("No {device} site proposed: {reason}");
        return;
    }
    if let Some(best) = &report.recommendation {
        println!("Recommended {device} site: {}", best.node_name);
        println!("  {}", best.rationale);
    }
    println!("Candidates ({}):", report.candidates.len());
    for candidate in report.candidates.iter().take(SHOWN_CANDIDATES) {
        println!("  {}", describe(candidate));
    }
}
