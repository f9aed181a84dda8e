use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::cif::ReportStats;
use crate::config::{format_float, JobConfiguration};
use crate::propagation::PropagatedStats;

const RECORD_SEPARATOR: &str = "+++++++++++++++++++";

/// Everything one run appends to `results.txt`.
pub struct ResultsRecord<'a> {
    pub advanced: Option<&'a JobConfiguration>,
    pub reflection_stats: &'a [(String, String)],
    pub cell_stats: &'a [(String, String)],
    pub report: &'a ReportStats,
    pub residuals: &'a [(String, String)],
    pub propagated: &'a PropagatedStats,
    pub cycles: u32,
    pub elapsed_secs: f64,
    pub update_weight: bool,
    pub npd_count: usize,
}

fn entry(out: &mut String, key: &str, value: impl std::fmt::Display) {
    let _ = write!(out, "{}:{},", key, value);
}

fn py_bool(v: bool) -> &'static str {
    if v {
        "True"
    } else {
        "False"
    }
}

pub fn render(record: &ResultsRecord<'_>) -> String {
    let mut out = String::new();
    out.push_str("NoSpherA2_Dict:\n");
    if let Some(params) = record.advanced {
        for (key, value) in params.iter() {
            entry(&mut out, key.as_str(), value);
        }
    }

    out.push_str("\nStats-GetHklStat:\n");
    for (key, value) in record.reflection_stats {
        entry(&mut out, key, value);
    }
    out.push_str("\nCell-Stats:\n");
    for (key, value) in record.cell_stats {
        entry(&mut out, key, value);
    }
    out.push_str("\nCIF-stats:\n");
    for (key, value) in &record.report.fields {
        entry(&mut out, key, format_float(*value));
    }
    for (key, d) in &record.report.displacements {
        entry(&mut out, key, format!("({}, {})", format_float(d.value), d.esd));
    }

    out.push_str("\nrefine_dict:\n");
    for (key, value) in record.residuals {
        entry(&mut out, key, value);
    }
    let p = record.propagated;
    entry(&mut out, "R1_all", format_float(p.r1_all));
    entry(&mut out, "R1_gt", format_float(p.r1_gt));
    entry(&mut out, "wR2", format_float(p.wr2));
    entry(&mut out, "cycles", record.cycles);
    entry(&mut out, "time", format_float(record.elapsed_secs));

    out.push_str("\nbondlengths:\n");
    for bond in &p.bonds {
        entry(&mut out, &bond.label, format_float(bond.distance));
    }
    out.push_str("\nbonderrors:\n");
    for bond in &p.bonds {
        entry(&mut out, &bond.label, format_float(bond.esd));
    }
    let _ = write!(out, "\nWeight:{}", py_bool(record.update_weight));
    let _ = write!(out, "\nNr. NPD:{}", record.npd_count);
    let _ = write!(out, "\n{}\n", RECORD_SEPARATOR);
    out
}

pub fn append(path: &Path, record: &ResultsRecord<'_>) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(render(record).as_bytes())?;
    file.sync_all()?;
    Ok(())
}
