//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Project file loading and per-study option resolution."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use lvgrid_calc_engine::{
    devices::DeviceSet, model::Network, options::Scenario, options::SimulationOptions,
    thermal::Season,
};
use lvgrid_common::AppConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A study input: the network, the devices installed on it and optionally
/// the options it was saved with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectFile {
    #[serde(default)]
    pub name: Option<String>,
    pub network: Network,
    #[serde(default)]
    pub devices: DeviceSet,
    #[serde(default)]
    pub options: Option<SimulationOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProjectFormat {
    Json,
    Yaml,
}

impl ProjectFormat {
    /// Extension first, then content sniffing for files named otherwise.
    fn detect(path: &Path, contents: &str) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => ProjectFormat::Json,
            Some("yaml") | Some("yml") => ProjectFormat::Yaml,
            _ if contents.trim_start().starts_with('{') => ProjectFormat::Json,
            _ => ProjectFormat::Yaml,
        }
    }
}

impl ProjectFile {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read project file {}", path.display()))?;
        let format = ProjectFormat::detect(path, &contents);
        debug!(project = %path.display(), ?format, "parsing project");
        let project = match format {
            ProjectFormat::Json => serde_json::from_str::<ProjectFile>(&contents)
                .with_context(|| format!("failed to parse JSON project {}", path.display()))?,
            ProjectFormat::Yaml => serde_yaml::from_str::<ProjectFile>(&contents)
                .with_context(|| format!("failed to parse YAML project {}", path.display()))?,
        };
        Ok(project)
    }
}

/// Arguments shared by every study command.
#[derive(Debug, Args)]
pub struct StudyArgs {
    /// Project file (JSON or YAML) holding the network and its devices.
    #[arg(long, short = 'p', value_name = "FILE")]
    pub project: PathBuf,
    /// Override the scenario (consumption, mixed, production).
    #[arg(long)]
    pub scenario: Option<Scenario>,
    /// Override the season used for thermal correction (summer, winter).
    #[arg(long)]
    pub season: Option<Season>,
    /// Directory receiving the JSON reports (defaults to `[reports].directory`).
    #[arg(long, short = 'o', value_name = "DIR")]
    pub output: Option<PathBuf>,
    /// Print the report envelope to stdout instead of a text summary.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub json: bool,
}

/// Inputs resolved for one command run.
pub struct Study {
    pub project: ProjectFile,
    pub options: SimulationOptions,
    pub output: PathBuf,
    pub json: bool,
}

impl StudyArgs {
    /// Options come from the project when saved there, else from the
    /// configuration; command line flags win over both.
    pub fn prepare(&self, config: &AppConfig) -> Result<Study> {
        let project = ProjectFile::load(&self.project)?;
        let mut options = project
            .options
            .clone()
            .unwrap_or_else(|| config.calculation.clone());
        if let Some(scenario) = self.scenario {
            options.scenario = scenario;
        }
        if let Some(season) = self.season {
            options.season = season;
        }
        options
            .validate()
            .with_context(|| format!("invalid options for project {}", self.project.display()))?;

        info!(
            project = %self.project.display(),
            nodes = project.network.nodes.len(),
            cables = project.network.cables.len(),
            scenario = ?options.scenario,
            season = ?options.season,
            "project loaded"
        );

        Ok(Study {
            project,
            options,
            output: self
                .output
                .clone()
                .unwrap_or_else(|| config.reports.directory.clone()),
            json: self.json,
        })
    }
}
