//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command line front-end for LV network studies."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use lvgrid_common::{init_tracing, AppConfig};

mod place;
mod project;
mod report;
mod solve;

const SERVICE_NAME: &str = "lvgridctl";

#[derive(Debug, Parser)]
#[command(
    author,
    disable_version_flag = true,
    about = "Load flow, cable checks and device placement for LV radial networks",
    long_about = None
)]
struct Cli {
    #[arg(
        short = 'V',
        long = "version",
        action = ArgAction::SetTrue,
        help = "Print version information and exit"
    )]
    version: bool,
    /// Configuration file (otherwise LVGRID_CONFIG, ./lvgrid.toml or configs/lvgrid.toml).
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Solve the load flow of a project and write the result report.
    Solve(solve::SolveArgs),
    /// Solve, then flag overloaded cables and excessive cable voltage drops.
    CheckCables(solve::CheckCablesArgs),
    #[command(subcommand, about = "Search candidate sites for regulation devices")]
    Place(place::PlaceCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!(
            "{} {} (engine {})",
            SERVICE_NAME,
            env!("CARGO_PKG_VERSION"),
            lvgrid_calc_engine::VERSION
        );
        return Ok(());
    }
    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let config = load_config(cli.config.as_deref())?;
    init_tracing(SERVICE_NAME, &config.logging)?;

    match command {
        Commands::Solve(args) => solve::run_solve(&args, &config),
        Commands::CheckCables(args) => solve::run_check_cables(&args, &config),
        Commands::Place(cmd) => place::run(cmd, &config),
    }
}

/// An explicit `--config` must exist; otherwise the usual locations are
/// tried and the built-in defaults apply when none is present.
fn load_config(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        return AppConfig::from_path(path);
    }
    let candidates = [
        PathBuf::from("lvgrid.toml"),
        PathBuf::from("configs/lvgrid.toml"),
    ];
    let env_set = std::env::var(AppConfig::ENV_CONFIG_PATH)
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if env_set || candidates.iter().any(|path| path.exists()) {
        AppConfig::load(&candidates)
    } else {
        Ok(AppConfig::default())
    }
}
