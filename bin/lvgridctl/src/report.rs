//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "JSON report envelopes written by the CLI."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::project::Study;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    LoadFlow,
    CableCheck,
    Devices,
    CompensatorPlacement,
    RegulatorPlacement,
}

impl ReportKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            ReportKind::LoadFlow => "load_flow.json",
            ReportKind::CableCheck => "cable_check.json",
            ReportKind::Devices => "devices.json",
            ReportKind::CompensatorPlacement => "placement_compensator.json",
            ReportKind::RegulatorPlacement => "placement_regulator.json",
        }
    }

    pub fn schema(&self) -> &'static str {
        match self {
            ReportKind::LoadFlow => "lvgrid.load_flow.v1",
            ReportKind::CableCheck => "lvgrid.cable_check.v1",
            ReportKind::Devices => "lvgrid.devices.v1",
            ReportKind::CompensatorPlacement => "lvgrid.placement.compensator.v1",
            ReportKind::RegulatorPlacement => "lvgrid.placement.regulator.v1",
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<'a, T: Serialize> {
    schema: &'static str,
    generated_at: DateTime<Utc>,
    engine_version: &'static str,
    project: Option<&'a str>,
    network_version: Option<&'a str>,
    data: &'a T,
}

/// Writes one envelope per report kind into the study output directory.
pub struct ReportWriter<'a> {
    directory: &'a Path,
    project: Option<&'a str>,
    network_version: Option<&'a str>,
}

impl<'a> ReportWriter<'a> {
    pub fn for_study(study: &'a Study) -> Self {
        Self {
            directory: &study.output,
            project: study.project.name.as_deref(),
            network_version: study.project.network.version.as_deref(),
        }
    }

    /// Serialises `data` into its envelope, stores it and hands the JSON back.
    pub fn write<T: Serialize>(&self, kind: ReportKind, data: &T) -> Result<(PathBuf, String)> {
        let envelope = Envelope {
            schema: kind.schema(),
            generated_at: Utc::now(),
            engine_version: lvgrid_calc_engine::VERSION,
            project: self.project,
            network_version: self.network_version,
            data,
        };
        let json = serde_json::to_string_pretty(&envelope)?;
        fs::create_dir_all(self.directory).with_context(|| {
            format!("unable to create report directory {}", self.directory.display())
        })?;
        let path = self.directory.join(kind.file_name());
        fs::write(&path, &json)
            .with_context(|| format!("unable to write report {}", path.display()))?;
        info!(report = %path.display(), schema = kind.schema(), "report written");
        Ok((path, json))
    }
}
